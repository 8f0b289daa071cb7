//! # Departure Board Core Library
//!
//! This library turns volatile transit feeds into a static raster image listing
//! the next departures from a single stop. The image is meant for a
//! low-refresh-rate panel (e-ink) that an external scheduler refreshes every
//! few minutes; every run is stateless.
//!
//! ## Design Philosophy
//!
//! ### Always Produce a Board
//! - **Partial failure is normal**: feeds time out, return garbage or return
//!   nothing. Every upstream failure is absorbed by moving to the next source
//!   and finally to a synthetic headway model.
//! - **Only output persistence can fail a run**: layout is total and rendering
//!   degrades to built-in glyphs instead of aborting.
//!
//! ### Explicit Time
//! Every time-sensitive function takes `now` as a parameter. Nothing below
//! [`orchestrator`] reads the wall clock, so the whole pipeline is
//! deterministic under test.
//!
//! ### Data Flow
//! 1. **Fetch**: [`feed`] sources are tried in priority order with backoff
//! 2. **Normalize**: raw records become [`Departure`]s ([`normalize`])
//! 3. **Select**: deduplicate, window, sort and bound ([`select`])
//! 4. **Fallback**: synthesize a headway schedule when nothing qualified ([`fallback`])
//! 5. **Layout**: place text runs on a fixed canvas ([`layout`])
//! 6. **Render**: rasterize and encode losslessly ([`renderer`])
//!
//! ## Core Types
//! - [`Departure`]: one upcoming vehicle at the configured stop
//! - [`SourceKind`]: whether a departure came from live data or the fallback model
//! - [`StopIdentity`]: the stop's identifiers within a source's namespace

use std::collections::BTreeSet;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// Module declarations
pub mod config;
pub mod fallback;
pub mod feed;
pub mod fonts;
pub mod layout;
pub mod logging;
pub mod normalize;
pub mod orchestrator;
pub mod renderer;
pub mod select;

/// Where a departure came from.
///
/// A rendered board never mixes the two kinds: fallback departures are only
/// generated when live sources produced nothing usable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// Real-time prediction or published timetable
    Realtime,
    /// Synthetic headway model output
    Fallback,
}

/// One upcoming vehicle arrival at the configured stop.
///
/// `arrival_time` is the authoritative sort key. It is timezone-aware so the
/// footer and countdowns are computed in the stop's local offset.
///
/// # Example
/// ```
/// use chrono::{FixedOffset, TimeZone};
/// use departure_board_lib::{Departure, SourceKind};
///
/// let tz = FixedOffset::east_opt(3600).unwrap();
/// let departure = Departure {
///     route_label: "S1".to_string(),
///     direction_label: "Terrassa".to_string(),
///     arrival_time: tz.with_ymd_and_hms(2025, 3, 14, 8, 12, 0).unwrap(),
///     source_kind: SourceKind::Realtime,
/// };
///
/// assert!(departure.is_live());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Departure {
    /// Short line code, never empty
    pub route_label: String,
    /// Human-readable destination
    pub direction_label: String,
    /// Predicted or scheduled arrival
    pub arrival_time: DateTime<FixedOffset>,
    /// Live data or synthetic fallback
    pub source_kind: SourceKind,
}

impl Departure {
    pub fn is_live(&self) -> bool {
        self.source_kind == SourceKind::Realtime
    }
}

/// Resolved identifiers of the configured stop within one source's namespace.
///
/// A single station name can map to several raw ids (a parent station plus
/// its platforms), so the identity holds a set. An identity with no ids is
/// unresolved; the orchestrator fills it once per run from a stop table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopIdentity {
    name: String,
    ids: BTreeSet<String>,
}

impl StopIdentity {
    /// Identity known only by name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ids: BTreeSet::new(),
        }
    }

    /// Identity with a single known id.
    pub fn with_id(name: impl Into<String>, id: impl Into<String>) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(id.into());
        Self {
            name: name.into(),
            ids,
        }
    }

    /// Identity with any number of known ids.
    pub fn with_ids<I, S>(name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub fn is_resolved(&self) -> bool {
        !self.ids.is_empty()
    }

    pub fn matches(&self, stop_id: &str) -> bool {
        self.ids.contains(stop_id)
    }
}
