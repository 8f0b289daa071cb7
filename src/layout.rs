//! # Board Layout
//!
//! Places every text run of the board on a fixed canvas. Layout is a pure,
//! total function: the only clock it knows is the resolution time carried by
//! the [`Footer`], and any departure count (including zero) produces a plan.
//!
//! ## Canvas Regions
//! ```text
//! +-----------------------------------------+  margin top
//! |            Sant Cugat Centre       LIVE |  header band (title tier)
//! |-----------------------------------------|  rule
//! | S1  Barcelona                     3 min |  row 0
//! | S2  Sabadell                      7 min |  row 1
//! | ...                                     |  up to capacity
//! |              Updated 08:00              |  footer (smallest tier)
//! +-----------------------------------------+  margin bottom
//! ```
//!
//! ## Overflow Policy
//! - Rows beyond capacity are dropped, never wrapped.
//! - A row's timer is shown in full whenever it fits the content width; the
//!   direction label is shortened first, then the route if the row is still
//!   too narrow.
//! - The badge gives way to the title: it is dropped when the title could
//!   not keep a few glyphs beside it.
//! - No text run extends past the left or right margin.

use chrono::{DateTime, FixedOffset};
use embedded_graphics::geometry::{Point, Size};
use embedded_graphics::primitives::Rectangle;

use crate::config::{BoardConfig, ColorModel, LabelsConfig, Margins};
use crate::fonts::{FontTier, FontTiers, ResolvedFont};
use crate::Departure;

/// Marker appended to a shortened label
const ELLIPSIS: &str = ".";

/// Title glyphs the badge must leave room for, else the badge is dropped
const MIN_TITLE_GLYPHS: u32 = 3;

/// Render-time configuration, resolved once per run.
#[derive(Clone, Debug)]
pub struct BoardSpec {
    pub width: u32,
    pub height: u32,
    pub color: ColorModel,
    pub max_rows: usize,
    pub row_height: u32,
    pub margins: Margins,
    pub fonts: FontTiers,
    pub labels: RowLabels,
}

/// Strings the layout itself emits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowLabels {
    pub now_token: String,
    pub minutes_suffix: String,
    pub no_data: String,
}

impl BoardSpec {
    /// Resolve fonts and make sure a row is tall enough for its text.
    pub fn from_config(board: &BoardConfig, labels: &LabelsConfig) -> Self {
        let fonts = FontTiers::resolve(&board.fonts, board.glyphs);
        let row_height = board
            .row_height
            .max(fonts.body.line_height())
            .max(fonts.emphasis.line_height());
        Self {
            width: board.width,
            height: board.height,
            color: board.color,
            max_rows: board.max_rows,
            row_height,
            margins: board.margins,
            fonts,
            labels: RowLabels {
                now_token: labels.now_token.clone(),
                minutes_suffix: labels.minutes_suffix.clone(),
                no_data: labels.no_data.clone(),
            },
        }
    }

    fn content_left(&self) -> u32 {
        self.margins.left
    }

    fn content_right(&self) -> u32 {
        self.width.saturating_sub(self.margins.right)
    }

    fn content_width(&self) -> u32 {
        self.content_right().saturating_sub(self.content_left())
    }

    /// Gap between the header band, the rule, the rows and the footer.
    fn band_gap(&self) -> u32 {
        self.row_height / 4
    }
}

/// Board title plus the live/offline marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub title: String,
    pub badge: Option<String>,
}

/// Resolution timestamp shown at the bottom; also the layout's `now`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Footer {
    pub prefix: String,
    pub resolved_at: DateTime<FixedOffset>,
}

impl Footer {
    pub fn text(&self) -> String {
        let time = self.resolved_at.format("%H:%M");
        if self.prefix.is_empty() {
            time.to_string()
        } else {
            format!("{} {}", self.prefix, time)
        }
    }
}

/// Horizontal anchor of a text run; the origin x is the anchored edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Anchor {
    Left,
    Right,
    Center,
}

/// Logical colour; the renderer maps it onto the colour model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ink {
    Foreground,
    Accent,
}

/// One placed text run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub text: String,
    /// Anchor x and baseline y
    pub origin: Point,
    pub tier: FontTier,
    pub anchor: Anchor,
    pub ink: Ink,
    /// Departure row index, `None` for header, footer and no-data text
    pub row: Option<usize>,
}

impl Placement {
    /// Pixel box the text covers once drawn.
    pub fn bounds(&self, fonts: &FontTiers) -> Rectangle {
        let font = fonts.get(self.tier);
        let width = font.text_width(&self.text);
        let left = match self.anchor {
            Anchor::Left => self.origin.x,
            Anchor::Right => self.origin.x - width as i32,
            Anchor::Center => self.origin.x - (width / 2) as i32,
        };
        Rectangle::new(
            Point::new(left, self.origin.y - font.baseline() as i32),
            Size::new(width, font.line_height()),
        )
    }
}

/// Horizontal separator line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rule {
    pub top: u32,
    pub left: u32,
    pub right: u32,
    pub thickness: u32,
}

/// Ordered text runs and rules for one board.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayoutPlan {
    pub placements: Vec<Placement>,
    pub rules: Vec<Rule>,
}

impl LayoutPlan {
    /// Number of departure rows actually placed.
    pub fn row_count(&self) -> usize {
        self.placements
            .iter()
            .filter_map(|p| p.row)
            .max()
            .map_or(0, |last| last + 1)
    }

    pub fn row_texts(&self, row: usize) -> Vec<&str> {
        self.placements
            .iter()
            .filter(|p| p.row == Some(row))
            .map(|p| p.text.as_str())
            .collect()
    }
}

/// Countdown text: whole minutes rounded down, "now" within the current
/// minute or later.
pub fn countdown(arrival: DateTime<FixedOffset>, now: DateTime<FixedOffset>, labels: &RowLabels) -> String {
    let minutes = (arrival - now).num_seconds().div_euclid(60);
    if minutes <= 0 {
        labels.now_token.clone()
    } else if labels.minutes_suffix.is_empty() {
        minutes.to_string()
    } else {
        format!("{} {}", minutes, labels.minutes_suffix)
    }
}

/// Lay out the board.
pub fn layout(header: &Header, footer: &Footer, departures: &[Departure], spec: &BoardSpec) -> LayoutPlan {
    let mut plan = LayoutPlan::default();
    let fonts = &spec.fonts;
    let center_x = (spec.content_left() + spec.content_width() / 2) as i32;
    let gap = spec.band_gap();

    // Header band
    let header_top = spec.margins.top;
    let mut header_height = fonts.title.line_height();
    let mut badge_width = 0;
    let badge = header
        .badge
        .as_deref()
        .filter(|b| !b.is_empty())
        .filter(|b| badge_fits(b, &header.title, spec));
    if let Some(badge) = badge {
        let badge_font = &fonts.emphasis;
        header_height = header_height.max(badge_font.line_height());
        badge_width = badge_font.text_width(badge);
        let cell_top = header_top + (header_height - badge_font.line_height()) / 2;
        plan.placements.push(Placement {
            text: badge.to_string(),
            origin: Point::new(
                spec.content_right() as i32,
                (cell_top + badge_font.baseline()) as i32,
            ),
            tier: FontTier::Emphasis,
            anchor: Anchor::Right,
            ink: Ink::Accent,
            row: None,
        });
    }

    // Keep the title centred and clear of the badge on both sides
    let reserved = badge_reserve(badge_width, spec);
    let title = fit(&header.title, &fonts.title, spec.content_width().saturating_sub(reserved));
    if !title.is_empty() {
        let cell_top = header_top + (header_height - fonts.title.line_height()) / 2;
        plan.placements.insert(
            0,
            Placement {
                text: title,
                origin: Point::new(center_x, (cell_top + fonts.title.baseline()) as i32),
                tier: FontTier::Title,
                anchor: Anchor::Center,
                ink: Ink::Foreground,
                row: None,
            },
        );
    }

    let rule = Rule {
        top: header_top + header_height + gap,
        left: spec.content_left(),
        right: spec.content_right(),
        thickness: fonts.title.scale.max(2),
    };
    plan.rules.push(rule);

    // Footer, bottom-aligned at the bottom margin
    let footer_tier = fonts.smallest_tier();
    let footer_font = fonts.get(footer_tier);
    let footer_top = spec
        .height
        .saturating_sub(spec.margins.bottom)
        .saturating_sub(footer_font.line_height());
    let footer_text = fit(&footer.text(), footer_font, spec.content_width());
    plan.placements.push(Placement {
        text: footer_text,
        origin: Point::new(center_x, (footer_top + footer_font.baseline()) as i32),
        tier: footer_tier,
        anchor: Anchor::Center,
        ink: Ink::Foreground,
        row: None,
    });

    // Row region between the rule and the footer
    let rows_top = rule.top + rule.thickness + gap;
    let rows_bottom = footer_top.saturating_sub(gap);
    let available = rows_bottom.saturating_sub(rows_top);

    if departures.is_empty() {
        let font = &fonts.body;
        let text = fit(&spec.labels.no_data, font, spec.content_width());
        let cell_top = rows_top + available.saturating_sub(font.line_height()) / 2;
        plan.placements.push(Placement {
            text,
            origin: Point::new(center_x, (cell_top + font.baseline()) as i32),
            tier: FontTier::Body,
            anchor: Anchor::Center,
            ink: Ink::Foreground,
            row: None,
        });
        return plan;
    }

    let capacity = spec
        .max_rows
        .min((available / spec.row_height.max(1)) as usize);
    let now = footer.resolved_at;

    for (index, departure) in departures.iter().take(capacity).enumerate() {
        let row_top = rows_top + index as u32 * spec.row_height;

        let timer_font = &fonts.emphasis;
        let full_timer = countdown(departure.arrival_time, now, &spec.labels);
        let ink = if full_timer == spec.labels.now_token {
            Ink::Accent
        } else {
            Ink::Foreground
        };
        let timer = fit(&full_timer, timer_font, spec.content_width());
        if timer.is_empty() {
            continue;
        }
        let timer_width = timer_font.text_width(&timer);
        let timer_top = row_top + spec.row_height.saturating_sub(timer_font.line_height()) / 2;

        let body = &fonts.body;
        let room = spec
            .content_width()
            .saturating_sub(timer_width)
            .saturating_sub(body.advance());
        let label = row_label(departure, body, room);
        if !label.is_empty() {
            let body_top = row_top + spec.row_height.saturating_sub(body.line_height()) / 2;
            plan.placements.push(Placement {
                text: label,
                origin: Point::new(spec.content_left() as i32, (body_top + body.baseline()) as i32),
                tier: FontTier::Body,
                anchor: Anchor::Left,
                ink: Ink::Foreground,
                row: Some(index),
            });
        }
        plan.placements.push(Placement {
            text: timer,
            origin: Point::new(
                spec.content_right() as i32,
                (timer_top + timer_font.baseline()) as i32,
            ),
            tier: FontTier::Emphasis,
            anchor: Anchor::Right,
            ink,
            row: Some(index),
        });
    }

    plan
}

/// Width kept clear on each side of a centred title for a badge.
fn badge_reserve(badge_width: u32, spec: &BoardSpec) -> u32 {
    if badge_width == 0 {
        0
    } else {
        2 * (badge_width + spec.fonts.title.advance())
    }
}

/// Whether `badge` fits beside the title without crowding it out.
fn badge_fits(badge: &str, title: &str, spec: &BoardSpec) -> bool {
    let title_font = &spec.fonts.title;
    let reserved = badge_reserve(spec.fonts.emphasis.text_width(badge), spec);
    let wanted = title_font
        .text_width(title)
        .min(MIN_TITLE_GLYPHS * title_font.advance());
    reserved.saturating_add(wanted) <= spec.content_width()
}

/// `"{route}  {direction}"` shortened to `room` pixels, direction first.
fn row_label(departure: &Departure, font: &ResolvedFont, room: u32) -> String {
    let route = departure.route_label.as_str();
    let direction = departure.direction_label.as_str();
    let full = if direction.is_empty() {
        route.to_string()
    } else {
        format!("{route}  {direction}")
    };
    if font.text_width(&full) <= room {
        return full;
    }

    let budget = font.glyphs_within(room);
    let prefix = route.chars().count() + 2;
    // Keep at least one direction glyph plus the marker, else drop it
    if budget >= prefix + 1 + ELLIPSIS.len() {
        let keep = budget - prefix - ELLIPSIS.len();
        let short: String = direction.chars().take(keep).collect();
        format!("{route}  {}{ELLIPSIS}", short.trim_end())
    } else {
        fit(route, font, room)
    }
}

/// `text` cut to `room` pixels with a trailing marker when shortened.
fn fit(text: &str, font: &ResolvedFont, room: u32) -> String {
    if font.text_width(text) <= room {
        return text.to_string();
    }
    let budget = font.glyphs_within(room);
    if budget <= ELLIPSIS.len() {
        return text.chars().take(budget).collect();
    }
    let short: String = text.chars().take(budget - ELLIPSIS.len()).collect();
    format!("{}{ELLIPSIS}", short.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BoardConfig, LabelsConfig};
    use crate::SourceKind;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 14, 8, 0, 0)
            .unwrap()
    }

    fn spec() -> BoardSpec {
        BoardSpec::from_config(&BoardConfig::default(), &LabelsConfig::default())
    }

    fn header() -> Header {
        Header {
            title: "Sant Cugat Centre".to_string(),
            badge: Some("LIVE".to_string()),
        }
    }

    fn footer() -> Footer {
        Footer {
            prefix: "Updated".to_string(),
            resolved_at: now(),
        }
    }

    fn departure(route: &str, direction: &str, offset: Duration) -> Departure {
        Departure {
            route_label: route.to_string(),
            direction_label: direction.to_string(),
            arrival_time: now() + offset,
            source_kind: SourceKind::Realtime,
        }
    }

    #[test]
    fn countdown_floors_to_whole_minutes() {
        let labels = spec().labels;
        assert_eq!(countdown(now(), now(), &labels), "now");
        assert_eq!(countdown(now() + Duration::seconds(59), now(), &labels), "now");
        assert_eq!(countdown(now() + Duration::seconds(60), now(), &labels), "1 min");
        assert_eq!(countdown(now() + Duration::seconds(479), now(), &labels), "7 min");
        // Never negative
        assert_eq!(countdown(now() - Duration::seconds(30), now(), &labels), "now");
    }

    #[test]
    fn header_and_footer_placements() {
        let plan = layout(&header(), &footer(), &[], &spec());
        let title = &plan.placements[0];
        assert_eq!(title.text, "Sant Cugat Centre");
        assert_eq!(title.anchor, Anchor::Center);
        assert_eq!(title.origin.x, 1072 / 2);

        let badge = plan.placements.iter().find(|p| p.text == "LIVE").unwrap();
        assert_eq!(badge.anchor, Anchor::Right);
        assert_eq!(badge.ink, Ink::Accent);
        assert_eq!(badge.bounds(&spec().fonts).bottom_right().unwrap().x, 1072 - 50 - 1);

        assert!(plan.placements.iter().any(|p| p.text == "Updated 08:00"));
        assert_eq!(plan.rules.len(), 1);
    }

    #[test]
    fn empty_departures_show_no_data() {
        let plan = layout(&header(), &footer(), &[], &spec());
        assert_eq!(plan.row_count(), 0);
        let no_data = plan.placements.iter().find(|p| p.text == "No data").unwrap();
        assert_eq!(no_data.anchor, Anchor::Center);
        assert_eq!(no_data.row, None);
    }

    #[test]
    fn rows_follow_input_order() {
        let departures = vec![
            departure("S1", "Barcelona", Duration::seconds(20)),
            departure("S2", "Sabadell", Duration::minutes(7)),
        ];
        let plan = layout(&header(), &footer(), &departures, &spec());
        assert_eq!(plan.row_count(), 2);
        assert_eq!(plan.row_texts(0), vec!["S1  Barcelona", "now"]);
        assert_eq!(plan.row_texts(1), vec!["S2  Sabadell", "7 min"]);

        let now_timer = plan.placements.iter().find(|p| p.text == "now").unwrap();
        assert_eq!(now_timer.ink, Ink::Accent);
        assert_eq!(now_timer.tier, FontTier::Emphasis);
    }

    #[test]
    fn twelve_departures_fill_six_rows() {
        let departures: Vec<Departure> = (1..=12)
            .map(|m| departure("S1", "Terrassa", Duration::minutes(m * 3)))
            .collect();
        let plan = layout(&header(), &footer(), &departures, &spec());
        assert_eq!(plan.row_count(), 6);
        assert_eq!(plan.row_texts(5)[1], "18 min");
    }

    #[test]
    fn long_direction_is_shortened_and_timer_kept() {
        let departures = vec![departure(
            "S55",
            "Universitat Autònoma via Sant Quirze del Vallès",
            Duration::minutes(12),
        )];
        let spec = spec();
        let plan = layout(&header(), &footer(), &departures, &spec);
        let texts = plan.row_texts(0);
        assert_eq!(texts[1], "12 min");
        assert!(texts[0].starts_with("S55  Univ"));
        assert!(texts[0].ends_with('.'));

        let label = plan.placements.iter().find(|p| p.row == Some(0)).unwrap();
        let timer = plan.placements.iter().rfind(|p| p.row == Some(0)).unwrap();
        let label_box = label.bounds(&spec.fonts);
        let timer_box = timer.bounds(&spec.fonts);
        assert!(label_box.top_left.x >= 50);
        assert!(label_box.top_left.x + label_box.size.width as i32 <= timer_box.top_left.x);
        assert!(timer_box.top_left.x + timer_box.size.width as i32 <= 1072 - 50);
    }

    fn assert_within_margins(plan: &LayoutPlan, spec: &BoardSpec) {
        let left = spec.margins.left as i32;
        let right = (spec.width - spec.margins.right) as i32;
        for p in &plan.placements {
            let b = p.bounds(&spec.fonts);
            assert!(b.top_left.x >= left, "{:?} crosses left margin", p.text);
            assert!(b.top_left.x + b.size.width as i32 <= right, "{:?} crosses right margin", p.text);
        }
    }

    #[test]
    fn narrow_canvas_truncates_route_not_timer() {
        let mut board = BoardConfig::default();
        board.width = 400;
        let spec = BoardSpec::from_config(&board, &LabelsConfig::default());
        let departures = vec![departure("R4-EXPRESS", "Manresa", Duration::minutes(45))];
        let plan = layout(&header(), &footer(), &departures, &spec);
        let texts = plan.row_texts(0);
        assert_eq!(*texts.last().unwrap(), "45 min");
        assert_within_margins(&plan, &spec);
    }

    #[test]
    fn canvas_narrower_than_timer_keeps_everything_inside_margins() {
        let mut board = BoardConfig::default();
        board.width = 250;
        let spec = BoardSpec::from_config(&board, &LabelsConfig::default());
        assert!(spec.fonts.emphasis.text_width("45 min") > 150);

        let header = Header {
            title: "Sant Cugat Centre".to_string(),
            badge: Some("OFFLINE".to_string()),
        };
        let departures = vec![departure("S1", "Barcelona", Duration::minutes(45))];
        let plan = layout(&header, &footer(), &departures, &spec);

        assert_within_margins(&plan, &spec);
        assert!(!plan.placements.iter().any(|p| p.text == "OFFLINE"));
        let title = plan.placements.iter().find(|p| p.tier == FontTier::Title).unwrap();
        assert!(title.text.starts_with("Sa"));
        let timer = plan.row_texts(0);
        assert!(timer.last().unwrap().starts_with("45"));
    }

    #[test]
    fn badge_kept_while_title_has_room() {
        let mut board = BoardConfig::default();
        board.width = 700;
        let spec = BoardSpec::from_config(&board, &LabelsConfig::default());
        let plan = layout(&header(), &footer(), &[], &spec);
        assert!(plan.placements.iter().any(|p| p.text == "LIVE"));
        assert!(plan.placements.iter().any(|p| p.tier == FontTier::Title));
        assert_within_margins(&plan, &spec);
    }

    #[test]
    fn tiny_canvas_is_still_total() {
        let mut board = BoardConfig::default();
        board.width = 10;
        board.height = 10;
        let spec = BoardSpec::from_config(&board, &LabelsConfig::default());
        let departures = vec![departure("S1", "Barcelona", Duration::minutes(4))];
        let plan = layout(&header(), &footer(), &departures, &spec);
        assert_eq!(plan.row_count(), 0);
    }

    #[test]
    fn fit_marks_shortened_text() {
        let font = spec().fonts.body;
        let room = font.text_width("Barcelona");
        assert_eq!(fit("Barcelona", &font, room), "Barcelona");
        assert_eq!(fit("Barcelona Sants", &font, room), "Barcelon.");
    }
}
