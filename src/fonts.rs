//! # Font Tier Resolution
//!
//! The board uses three semantic font tiers (title, body, emphasis). Each tier
//! names an embedded-graphics mono font and an integer scale factor; the
//! bitmap is blown up by the scale so large panels stay legible without an
//! outline font renderer.
//!
//! Names are resolved once, when the board spec is built. A name that does not
//! exist in the configured glyph set resolves to the built-in 6x10 ASCII font
//! and the tier is marked degraded. Rendering never fails because of a font.

use embedded_graphics::mono_font::{ascii, iso_8859_1, iso_8859_5, MonoFont};
use tracing::warn;

use crate::config::{FontConfig, FontTiersConfig, GlyphSet};

/// Font used when a configured face cannot be resolved
pub static BUILTIN_FONT: &MonoFont<'static> = &ascii::FONT_6X10;

/// Semantic role of a text run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FontTier {
    /// Header
    Title,
    /// Route and direction
    Body,
    /// Countdown timer
    Emphasis,
}

/// A tier's font after resolution.
#[derive(Clone, Copy, Debug)]
pub struct ResolvedFont {
    pub font: &'static MonoFont<'static>,
    pub scale: u32,
    /// True when the configured face was not found
    pub degraded: bool,
}

impl ResolvedFont {
    /// Horizontal advance of one glyph, spacing included.
    pub fn advance(&self) -> u32 {
        (self.font.character_size.width + self.font.character_spacing) * self.scale
    }

    pub fn line_height(&self) -> u32 {
        self.font.character_size.height * self.scale
    }

    /// Distance from the top of a glyph cell to its baseline.
    pub fn baseline(&self) -> u32 {
        self.font.baseline * self.scale
    }

    /// Width of `text` in pixels; trailing spacing is not counted.
    pub fn text_width(&self, text: &str) -> u32 {
        let glyphs = text.chars().count() as u32;
        if glyphs == 0 {
            return 0;
        }
        glyphs * self.advance() - self.font.character_spacing * self.scale
    }

    /// How many glyphs fit in `width` pixels.
    pub fn glyphs_within(&self, width: u32) -> usize {
        let spacing = self.font.character_spacing * self.scale;
        ((width + spacing) / self.advance().max(1)) as usize
    }
}

/// All three tiers, resolved.
#[derive(Clone, Copy, Debug)]
pub struct FontTiers {
    pub title: ResolvedFont,
    pub body: ResolvedFont,
    pub emphasis: ResolvedFont,
}

impl FontTiers {
    pub fn resolve(config: &FontTiersConfig, glyphs: GlyphSet) -> Self {
        Self {
            title: resolve_font(&config.title, glyphs),
            body: resolve_font(&config.body, glyphs),
            emphasis: resolve_font(&config.emphasis, glyphs),
        }
    }

    pub fn get(&self, tier: FontTier) -> &ResolvedFont {
        match tier {
            FontTier::Title => &self.title,
            FontTier::Body => &self.body,
            FontTier::Emphasis => &self.emphasis,
        }
    }

    /// Tier with the shortest line; used for the footer.
    pub fn smallest_tier(&self) -> FontTier {
        [FontTier::Title, FontTier::Body, FontTier::Emphasis]
            .into_iter()
            .min_by_key(|tier| self.get(*tier).line_height())
            .unwrap_or(FontTier::Body)
    }
}

macro_rules! font_table {
    ($name:expr, $module:ident) => {
        match $name {
            "4x6" => Some(&$module::FONT_4X6),
            "5x7" => Some(&$module::FONT_5X7),
            "5x8" => Some(&$module::FONT_5X8),
            "6x9" => Some(&$module::FONT_6X9),
            "6x10" => Some(&$module::FONT_6X10),
            "6x12" => Some(&$module::FONT_6X12),
            "6x13" => Some(&$module::FONT_6X13),
            "6x13_bold" => Some(&$module::FONT_6X13_BOLD),
            "6x13_italic" => Some(&$module::FONT_6X13_ITALIC),
            "7x13" => Some(&$module::FONT_7X13),
            "7x13_bold" => Some(&$module::FONT_7X13_BOLD),
            "7x13_italic" => Some(&$module::FONT_7X13_ITALIC),
            "7x14" => Some(&$module::FONT_7X14),
            "7x14_bold" => Some(&$module::FONT_7X14_BOLD),
            "8x13" => Some(&$module::FONT_8X13),
            "8x13_bold" => Some(&$module::FONT_8X13_BOLD),
            "8x13_italic" => Some(&$module::FONT_8X13_ITALIC),
            "9x15" => Some(&$module::FONT_9X15),
            "9x15_bold" => Some(&$module::FONT_9X15_BOLD),
            "9x18" => Some(&$module::FONT_9X18),
            "9x18_bold" => Some(&$module::FONT_9X18_BOLD),
            "10x20" => Some(&$module::FONT_10X20),
            _ => None,
        }
    };
}

fn lookup(face: &str, glyphs: GlyphSet) -> Option<&'static MonoFont<'static>> {
    let face = face.trim().to_ascii_lowercase();
    match glyphs {
        GlyphSet::Ascii => font_table!(face.as_str(), ascii),
        GlyphSet::Latin1 => font_table!(face.as_str(), iso_8859_1),
        GlyphSet::Cyrillic => font_table!(face.as_str(), iso_8859_5),
    }
}

/// Resolve one tier, degrading to [`BUILTIN_FONT`] at scale 1 when the face is
/// unknown.
pub fn resolve_font(config: &FontConfig, glyphs: GlyphSet) -> ResolvedFont {
    match lookup(&config.face, glyphs) {
        Some(font) => ResolvedFont {
            font,
            scale: config.scale.max(1),
            degraded: false,
        },
        None => {
            warn!(face = %config.face, ?glyphs, "font face not available, using built-in 6x10");
            ResolvedFont {
                font: BUILTIN_FONT,
                scale: config.scale.max(1),
                degraded: true,
            }
        }
    }
}
