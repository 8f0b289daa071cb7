//! # Board Rasterization
//!
//! This module turns a [`LayoutPlan`] into an encoded raster image, and into
//! an ASCII preview for development on a desktop terminal.
//!
//! ## Drawing
//! Text is drawn with embedded-graphics mono fonts onto a canvas backed by an
//! `image` buffer. Fonts are bitmaps, so each tier's integer scale is applied
//! by a small adapter that paints every font pixel as a `scale x scale` block.
//!
//! ## Colour Models
//! - **Full colour**: white background, black text, red accent (live badge,
//!   "now" timers), encoded as 8-bit RGB PNG.
//! - **Bitonal**: accent collapses to black and the canvas is thresholded to
//!   two levels, encoded as 8-bit greyscale PNG holding only 0 and 255.
//!
//! PNG is lossless, so the written artifact decodes back to exactly the
//! canvas that was drawn.

use std::convert::Infallible;
use std::io::Cursor;

use embedded_graphics::{
    mono_font::MonoTextStyle,
    pixelcolor::Rgb888,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::{Baseline, Text},
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::config::ColorModel;
use crate::layout::{Anchor, BoardSpec, Ink, LayoutPlan, Placement};

/// Largest canvas the renderer will allocate
const MAX_PIXELS: u64 = 64 * 1024 * 1024;

/// Width of the ASCII preview
pub const ASCII_COLUMNS: usize = 48;

/// Errors that can occur while producing the image.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error("cannot allocate a {width}x{height} canvas")]
    Canvas { width: u32, height: u32 },

    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Losslessly encoded board.
#[derive(Clone, Debug)]
pub struct EncodedImage {
    /// PNG bytes
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub color: ColorModel,
}

#[derive(Clone, Copy, Debug)]
struct Palette {
    background: Rgb888,
    foreground: Rgb888,
    accent: Rgb888,
}

impl Palette {
    fn for_model(color: ColorModel) -> Self {
        match color {
            ColorModel::FullColor => Self {
                background: Rgb888::WHITE,
                foreground: Rgb888::BLACK,
                accent: Rgb888::new(200, 0, 0),
            },
            ColorModel::Bitonal => Self {
                background: Rgb888::WHITE,
                foreground: Rgb888::BLACK,
                accent: Rgb888::BLACK,
            },
        }
    }

    fn ink(&self, ink: Ink) -> Rgb888 {
        match ink {
            Ink::Foreground => self.foreground,
            Ink::Accent => self.accent,
        }
    }
}

/// Draw target over an RGB image buffer; out-of-bounds pixels are dropped.
struct Canvas {
    image: RgbImage,
}

impl Canvas {
    fn new(width: u32, height: u32, background: Rgb888) -> Result<Self, RenderError> {
        let pixels = u64::from(width) * u64::from(height);
        if pixels == 0 || pixels > MAX_PIXELS {
            return Err(RenderError::Canvas { width, height });
        }
        let fill = Rgb([background.r(), background.g(), background.b()]);
        Ok(Self {
            image: RgbImage::from_pixel(width, height, fill),
        })
    }
}

impl OriginDimensions for Canvas {
    fn size(&self) -> Size {
        Size::new(self.image.width(), self.image.height())
    }
}

impl DrawTarget for Canvas {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.image.dimensions();
        for Pixel(point, color) in pixels {
            if point.x < 0 || point.y < 0 {
                continue;
            }
            let (x, y) = (point.x as u32, point.y as u32);
            if x < width && y < height {
                self.image.put_pixel(x, y, Rgb([color.r(), color.g(), color.b()]));
            }
        }
        Ok(())
    }
}

/// Maps logical font pixels to `scale x scale` blocks at `origin`.
struct Scaled<'a, D> {
    target: &'a mut D,
    origin: Point,
    scale: u32,
}

impl<D: DrawTarget> Dimensions for Scaled<'_, D> {
    fn bounding_box(&self) -> Rectangle {
        let target = self.target.bounding_box();
        let scale = self.scale as i32;
        Rectangle::new(
            Point::new(
                (target.top_left.x - self.origin.x).div_euclid(scale),
                (target.top_left.y - self.origin.y).div_euclid(scale),
            ),
            Size::new(
                target.size.width / self.scale + 2,
                target.size.height / self.scale + 2,
            ),
        )
    }
}

impl<D: DrawTarget> DrawTarget for Scaled<'_, D> {
    type Color = D::Color;
    type Error = D::Error;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let block = Size::new_equal(self.scale);
        for Pixel(point, color) in pixels {
            let top_left = self.origin + point * self.scale as i32;
            self.target.fill_solid(&Rectangle::new(top_left, block), color)?;
        }
        Ok(())
    }
}

fn draw_placement(canvas: &mut Canvas, placement: &Placement, spec: &BoardSpec, palette: &Palette) {
    let font = spec.fonts.get(placement.tier);
    let width = font.text_width(&placement.text) as i32;
    let left = match placement.anchor {
        Anchor::Left => placement.origin.x,
        Anchor::Right => placement.origin.x - width,
        Anchor::Center => placement.origin.x - width / 2,
    };

    let style = MonoTextStyle::new(font.font, palette.ink(placement.ink));
    let mut scaled = Scaled {
        target: canvas,
        origin: Point::new(left, placement.origin.y),
        scale: font.scale,
    };
    Text::with_baseline(&placement.text, Point::zero(), style, Baseline::Alphabetic)
        .draw(&mut scaled)
        .ok();
}

/// Rasterize `plan` at `spec` dimensions and encode it as PNG.
pub fn render(plan: &LayoutPlan, spec: &BoardSpec) -> Result<EncodedImage, RenderError> {
    let palette = Palette::for_model(spec.color);
    let mut canvas = Canvas::new(spec.width, spec.height, palette.background)?;

    for rule in &plan.rules {
        Rectangle::new(
            Point::new(rule.left as i32, rule.top as i32),
            Size::new(rule.right.saturating_sub(rule.left), rule.thickness),
        )
        .into_styled(PrimitiveStyle::with_fill(palette.foreground))
        .draw(&mut canvas)
        .ok();
    }
    for placement in &plan.placements {
        draw_placement(&mut canvas, placement, spec, &palette);
    }

    // Bitonal boards are 8-bit greyscale holding only 0 and 255
    let image = match spec.color {
        ColorModel::FullColor => DynamicImage::ImageRgb8(canvas.image),
        ColorModel::Bitonal => DynamicImage::ImageLuma8(threshold(&canvas.image)),
    };
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    debug!(
        bytes = bytes.len(),
        width = spec.width,
        height = spec.height,
        color = ?spec.color,
        "board encoded"
    );

    Ok(EncodedImage {
        bytes,
        width: spec.width,
        height: spec.height,
        color: spec.color,
    })
}

fn threshold(rgb: &RgbImage) -> GrayImage {
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let Rgb([r, g, b]) = *rgb.get_pixel(x, y);
        let luma = (299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b)) / 1000;
        Luma([if luma < 128 { 0 } else { 255 }])
    })
}

/// Text lines approximating the board, one per band of overlapping runs.
pub fn ascii_lines(plan: &LayoutPlan, spec: &BoardSpec) -> Vec<String> {
    let mut runs: Vec<(Rectangle, &Placement)> = plan
        .placements
        .iter()
        .map(|p| (p.bounds(&spec.fonts), p))
        .collect();
    runs.sort_by_key(|(bounds, _)| bounds.top_left.y);

    let mut rules = plan.rules.iter().peekable();
    let mut lines = Vec::new();
    let mut next = 0;
    while next < runs.len() {
        let band = runs[next].0;
        let band_bottom = band.top_left.y + band.size.height as i32;
        while rules.next_if(|r| (r.top as i32) < band.top_left.y).is_some() {
            lines.push("-".repeat(ASCII_COLUMNS));
        }

        let mut line = vec![' '; ASCII_COLUMNS];
        while next < runs.len() && runs[next].0.top_left.y < band_bottom {
            put_text(&mut line, runs[next].1);
            next += 1;
        }
        lines.push(line.into_iter().collect::<String>().trim_end().to_string());
    }
    for _ in rules {
        lines.push("-".repeat(ASCII_COLUMNS));
    }
    lines
}

fn put_text(line: &mut [char], placement: &Placement) {
    let text: Vec<char> = placement.text.chars().take(line.len()).collect();
    let start = match placement.anchor {
        Anchor::Left => 0,
        Anchor::Right => line.len() - text.len(),
        Anchor::Center => (line.len() - text.len()) / 2,
    };
    line[start..start + text.len()].copy_from_slice(&text);
}

/// Print the ASCII preview to stdout.
pub fn draw_ascii(plan: &LayoutPlan, spec: &BoardSpec) {
    for line in ascii_lines(plan, spec) {
        println!("{line}");
    }
}
