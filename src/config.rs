//! # Configuration Management
//!
//! This module handles loading and parsing configuration from the
//! `board-config.toml` file. It provides a single place to configure the stop,
//! the feed sources and their priority order, the panel geometry, the fallback
//! headway model and the direction tables.
//!
//! Every section has a default so a partial file only needs to override what
//! differs. A missing or malformed file falls back to [`Config::default`]
//! rather than stopping the board from being drawn.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_PATH: &str = "board-config.toml";

/// Application configuration loaded from board-config.toml
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The single stop this board shows
    pub stop: StopConfig,
    /// Feed sources, in priority order
    pub sources: Vec<SourceConfig>,
    /// Retry and backoff for each source
    pub retry: RetryConfig,
    /// Departure window and count
    pub selection: SelectionConfig,
    /// Synthetic schedule used when all sources come up empty
    pub fallback: FallbackConfig,
    /// Per-route terminus labels
    pub directions: DirectionsConfig,
    /// Canvas geometry and fonts
    pub board: BoardConfig,
    /// User-visible strings
    pub labels: LabelsConfig,
    /// Where the image is written
    pub output: OutputConfig,
}

/// Stop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StopConfig {
    /// Station name, shown in the header and used for name lookups
    pub name: String,
    /// Stop id shared by sources that do not set their own
    pub stop_id: Option<String>,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            name: "Sant Cugat Centre".to_string(),
            stop_id: Some("70037".to_string()),
        }
    }
}

/// One feed source. The `kind` key selects the variant.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    GtfsRealtime(RealtimeSourceConfig),
    Json(JsonSourceConfig),
    StaticArchive(StaticArchiveSourceConfig),
}

/// GTFS-Realtime trip updates endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeSourceConfig {
    pub url: String,
    /// Overrides `[stop].stop_id` for this source's namespace
    #[serde(default)]
    pub stop_id: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Open-data records endpoint returning JSON
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonSourceConfig {
    pub url: String,
    #[serde(default)]
    pub stop_id: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Query parameters; `{stop_id}` in a value is replaced at fetch time
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default = "default_json_limit")]
    pub limit: u32,
    #[serde(default = "default_route_field")]
    pub route_field: String,
    #[serde(default = "default_arrival_field")]
    pub arrival_field: String,
    /// Structured 0/1 direction field, when the dataset has one
    #[serde(default)]
    pub direction_field: Option<String>,
    /// Free-text fields searched for terminus keywords
    #[serde(default)]
    pub text_fields: Vec<String>,
}

/// Zipped static timetable
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticArchiveSourceConfig {
    pub url: String,
    /// When unset the stop is resolved by name from stops.txt
    #[serde(default)]
    pub stop_id: Option<String>,
    #[serde(default = "default_archive_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_archive_timeout_secs() -> u64 {
    30
}

fn default_json_limit() -> u32 {
    100
}

fn default_route_field() -> String {
    "route_id".to_string()
}

fn default_arrival_field() -> String {
    "arrival_time".to_string()
}

/// Retry policy applied to every source
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per source, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles afterwards
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 4000,
        }
    }
}

/// Departure window
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SelectionConfig {
    pub horizon_minutes: i64,
    pub max_count: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            horizon_minutes: 60,
            max_count: 6,
        }
    }
}

/// Headway model for the synthetic schedule
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub routes: Vec<FallbackRoute>,
    pub peak_headway_minutes: u32,
    pub offpeak_headway_minutes: u32,
    /// Half-open hour ranges `[start, end)` using peak headway
    pub peak_hours: Vec<HourRange>,
    pub horizon_minutes: i64,
    pub max_count: usize,
}

/// One synthetic route and its position within the hour
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FallbackRoute {
    pub route: String,
    /// Minute offset applied to every slot
    #[serde(default)]
    pub offset_minutes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn contains(&self, hour: u32) -> bool {
        self.start <= hour && hour < self.end
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            routes: vec![
                FallbackRoute {
                    route: "S1".to_string(),
                    offset_minutes: 2,
                },
                FallbackRoute {
                    route: "S2".to_string(),
                    offset_minutes: 7,
                },
            ],
            peak_headway_minutes: 5,
            offpeak_headway_minutes: 10,
            peak_hours: vec![
                HourRange { start: 7, end: 10 },
                HourRange { start: 17, end: 20 },
            ],
            horizon_minutes: 60,
            max_count: 6,
        }
    }
}

/// Terminus labels per route and direction flag
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DirectionsConfig {
    /// Used for routes without their own entry
    pub default: Option<RouteDirections>,
    pub routes: Vec<RouteDirections>,
}

/// Labels for direction flag 0 and 1, plus keywords for free-text inference
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RouteDirections {
    #[serde(default)]
    pub route: String,
    pub labels: [String; 2],
    /// Lowercase substrings that identify each direction in free text.
    /// Empty lists fall back to the lowercased label.
    #[serde(default)]
    pub keywords: [Vec<String>; 2],
}

impl Default for DirectionsConfig {
    fn default() -> Self {
        Self {
            default: Some(RouteDirections {
                route: String::new(),
                labels: ["Barcelona".to_string(), "Terrassa/Sabadell".to_string()],
                keywords: [
                    vec!["barcelona".to_string(), "catalunya".to_string()],
                    vec!["terrassa".to_string(), "sabadell".to_string()],
                ],
            }),
            routes: vec![
                RouteDirections {
                    route: "S1".to_string(),
                    labels: ["Barcelona".to_string(), "Terrassa".to_string()],
                    keywords: [
                        vec!["barcelona".to_string(), "catalunya".to_string()],
                        vec!["terrassa".to_string()],
                    ],
                },
                RouteDirections {
                    route: "S2".to_string(),
                    labels: ["Barcelona".to_string(), "Sabadell".to_string()],
                    keywords: [
                        vec!["barcelona".to_string(), "catalunya".to_string()],
                        vec!["sabadell".to_string()],
                    ],
                },
            ],
        }
    }
}

/// Colour model of the output image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorModel {
    /// 8-bit RGB, neutral background with an accent colour
    FullColor,
    /// Strict black and white
    Bitonal,
}

/// Which glyph table the named fonts are taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GlyphSet {
    Ascii,
    Latin1,
    Cyrillic,
}

/// Font face name and integer scale
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FontConfig {
    /// Mono font name such as `10x20` or `9x18_bold`
    pub face: String,
    #[serde(default = "default_scale")]
    pub scale: u32,
}

fn default_scale() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FontTiersConfig {
    pub title: FontConfig,
    pub body: FontConfig,
    pub emphasis: FontConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Margins {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

/// Panel geometry and typography
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BoardConfig {
    pub width: u32,
    pub height: u32,
    pub color: ColorModel,
    pub max_rows: usize,
    pub row_height: u32,
    pub margins: Margins,
    pub glyphs: GlyphSet,
    pub fonts: FontTiersConfig,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            width: 1072,  // PocketBook 6" portrait
            height: 1448,
            color: ColorModel::FullColor,
            max_rows: 6,
            row_height: 100,
            margins: Margins {
                top: 50,
                bottom: 50,
                left: 50,
                right: 50,
            },
            glyphs: GlyphSet::Latin1,
            fonts: FontTiersConfig {
                title: FontConfig {
                    face: "9x18_bold".to_string(),
                    scale: 4,
                },
                body: FontConfig {
                    face: "10x20".to_string(),
                    scale: 3,
                },
                emphasis: FontConfig {
                    face: "9x18_bold".to_string(),
                    scale: 3,
                },
            },
        }
    }
}

/// User-visible strings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LabelsConfig {
    /// Countdown text for departures within the current minute
    pub now_token: String,
    /// Appended to integer minute countdowns
    pub minutes_suffix: String,
    /// Shown in place of the rows when there is nothing to list
    pub no_data: String,
    /// Header badge on boards built from live data
    pub live_badge: String,
    /// Header badge on boards built from the fallback model
    pub offline_badge: String,
    /// Footer prefix before the resolution time
    pub updated_prefix: String,
}

impl Default for LabelsConfig {
    fn default() -> Self {
        Self {
            now_token: "now".to_string(),
            minutes_suffix: "min".to_string(),
            no_data: "No data".to_string(),
            live_badge: "LIVE".to_string(),
            offline_badge: "OFFLINE".to_string(),
            updated_prefix: "Updated".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    pub path: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("departure-board.png"),
        }
    }
}

impl Config {
    /// Built-in source list: live trip updates first, published timetable second
    pub fn default_sources() -> Vec<SourceConfig> {
        vec![
            SourceConfig::GtfsRealtime(RealtimeSourceConfig {
                url: "https://dadesobertes.fgc.cat/gtfs-realtime/trip-updates".to_string(),
                stop_id: None,
                timeout_secs: default_timeout_secs(),
            }),
            SourceConfig::StaticArchive(StaticArchiveSourceConfig {
                url: "https://www.fgc.cat/google/google_transit.zip".to_string(),
                stop_id: None,
                timeout_secs: default_archive_timeout_secs(),
            }),
        ]
    }

    /// Load configuration from the specified path.
    /// Falls back to the default configuration if the file doesn't exist or is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<Config>(&contents) {
                Ok(config) => {
                    info!(stop = %config.stop.name, path = %path.display(), "loaded configuration");
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid config file format, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no config file found, using defaults");
                Self::default()
            }
        };

        if config.sources.is_empty() {
            config.sources = Self::default_sources();
        }
        config
    }

    /// Save the current configuration to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path.as_ref(), contents)?;
        info!(path = %path.as_ref().display(), "configuration saved");
        Ok(())
    }

    /// Stop id for a source: its own override, else the shared one.
    /// The static archive only uses its own id and otherwise resolves by name.
    pub fn stop_id_for<'a>(&'a self, source: &'a SourceConfig) -> Option<&'a str> {
        match source {
            SourceConfig::GtfsRealtime(c) => c.stop_id.as_deref().or(self.stop.stop_id.as_deref()),
            SourceConfig::Json(c) => c.stop_id.as_deref().or(self.stop.stop_id.as_deref()),
            SourceConfig::StaticArchive(c) => c.stop_id.as_deref(),
        }
    }
}
