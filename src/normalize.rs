//! # Departure Normalization
//!
//! Turns source-specific [`RawRecord`]s into canonical [`Departure`]s.
//!
//! ## Direction Resolution
//! The direction label comes from a `(route, direction flag)` pair looked up
//! in a [`DirectionTable`]. Records without a flag are rejected rather than
//! guessed, with one explicitly heuristic exception: JSON records and
//! scheduled rows carry free text (destination, headsign), and when exactly
//! one direction's keywords appear in it that direction is used.
//!
//! ## Time
//! Arrivals strictly before `now` are rejected. An arrival later in the
//! current minute is kept; the layout shows it as "now".

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tracing::debug;

use crate::config::{DirectionsConfig, RouteDirections};
use crate::feed::RawRecord;
use crate::{Departure, SourceKind};

/// Why a record did not become a departure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("record has no route")]
    MissingRoute,
    #[error("no direction flag and no recognisable destination")]
    NoDirection,
    #[error("no terminus label for route {route} direction {flag}")]
    UnknownDirection { route: String, flag: u32 },
    #[error("timestamp {0} out of range")]
    BadTimestamp(i64),
    #[error("arrival already passed")]
    InPast,
}

/// Terminus labels and inference keywords of one route.
#[derive(Clone, Debug, PartialEq)]
pub struct Termini {
    labels: [String; 2],
    keywords: [Vec<String>; 2],
}

impl Termini {
    fn from_config(config: &RouteDirections) -> Self {
        let keywords = [0, 1].map(|flag| {
            let configured: Vec<String> = config.keywords[flag]
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            if configured.is_empty() {
                vec![config.labels[flag].to_lowercase()]
            } else {
                configured
            }
        });
        Self {
            labels: config.labels.clone(),
            keywords,
        }
    }

    pub fn label(&self, flag: u32) -> Option<&str> {
        self.labels.get(flag as usize).map(String::as_str)
    }

    /// Direction whose keywords, and only whose keywords, occur in `text`.
    pub fn infer(&self, text: &str) -> Option<u32> {
        let haystack = text.to_lowercase();
        let hits: Vec<u32> = (0..2u32)
            .filter(|flag| {
                self.keywords[*flag as usize]
                    .iter()
                    .any(|k| haystack.contains(k.as_str()))
            })
            .collect();
        match hits[..] {
            [flag] => Some(flag),
            _ => None,
        }
    }
}

/// Per-route terminus lookup with an optional default for unlisted routes.
#[derive(Clone, Debug, Default)]
pub struct DirectionTable {
    default: Option<Termini>,
    routes: HashMap<String, Termini>,
}

impl DirectionTable {
    pub fn from_config(config: &DirectionsConfig) -> Self {
        Self {
            default: config.default.as_ref().map(Termini::from_config),
            routes: config
                .routes
                .iter()
                .map(|r| (r.route.clone(), Termini::from_config(r)))
                .collect(),
        }
    }

    pub fn termini(&self, route: &str) -> Option<&Termini> {
        self.routes.get(route).or(self.default.as_ref())
    }

    pub fn label(&self, route: &str, flag: u32) -> Option<&str> {
        self.termini(route)?.label(flag)
    }

    /// Heuristic: direction flag from destination-like free text.
    pub fn infer_flag(&self, route: &str, text: &str) -> Option<u32> {
        self.termini(route)?.infer(text)
    }
}

/// Map one raw record to a departure.
pub fn normalize(
    record: &RawRecord,
    directions: &DirectionTable,
    now: DateTime<FixedOffset>,
) -> Result<Departure, Rejection> {
    let (route, flag, arrival) = match record {
        RawRecord::TripUpdate(update) => (
            update.route_id.trim(),
            update.direction_id,
            from_epoch(update.arrival_epoch, now)?,
        ),
        RawRecord::Json(json) => {
            let route = json.route.trim();
            let flag = json
                .direction_id
                .or_else(|| directions.infer_flag(route, &json.text));
            (route, flag, from_epoch(json.arrival_epoch, now)?)
        }
        RawRecord::Scheduled(row) => {
            let route = row.route_label.trim();
            let flag = row.direction_id.or_else(|| {
                row.headsign
                    .as_deref()
                    .and_then(|h| directions.infer_flag(route, h))
            });
            (route, flag, row.arrival)
        }
    };

    if route.is_empty() {
        return Err(Rejection::MissingRoute);
    }
    let flag = flag.ok_or(Rejection::NoDirection)?;
    let direction = directions
        .label(route, flag)
        .ok_or_else(|| Rejection::UnknownDirection {
            route: route.to_string(),
            flag,
        })?;
    if arrival < now {
        return Err(Rejection::InPast);
    }

    Ok(Departure {
        route_label: route.to_string(),
        direction_label: direction.to_string(),
        arrival_time: arrival,
        source_kind: SourceKind::Realtime,
    })
}

/// Normalize a batch, returning accepted departures and the rejection count.
pub fn normalize_all(
    records: &[RawRecord],
    directions: &DirectionTable,
    now: DateTime<FixedOffset>,
) -> (Vec<Departure>, usize) {
    let mut departures = Vec::with_capacity(records.len());
    let mut rejected = 0;
    for record in records {
        match normalize(record, directions, now) {
            Ok(departure) => departures.push(departure),
            Err(reason) => {
                debug!(%reason, "record rejected");
                rejected += 1;
            }
        }
    }
    (departures, rejected)
}

fn from_epoch(seconds: i64, now: DateTime<FixedOffset>) -> Result<DateTime<FixedOffset>, Rejection> {
    DateTime::from_timestamp(seconds, 0)
        .map(|utc| utc.with_timezone(&now.timezone()))
        .ok_or(Rejection::BadTimestamp(seconds))
}
