//! Departure selection: window, order and bound the canonical list.

use chrono::{DateTime, Duration, FixedOffset};

use crate::Departure;

/// Departures strictly after `now` and no more than `horizon` ahead, sorted by
/// arrival and truncated to `max_count`.
///
/// An empty result is not an error; it is what triggers the fallback model.
pub fn select(
    departures: Vec<Departure>,
    now: DateTime<FixedOffset>,
    horizon: Duration,
    max_count: usize,
) -> Vec<Departure> {
    let in_window = departures
        .into_iter()
        .filter(|d| d.arrival_time > now && d.arrival_time - now <= horizon)
        .collect();
    order_and_truncate(in_window, max_count)
}

/// Sort by `(arrival, route, direction)`, drop exact duplicates, keep the
/// first `max_count`.
///
/// Shared with the fallback generator so both lists are ordered identically.
pub fn order_and_truncate(mut departures: Vec<Departure>, max_count: usize) -> Vec<Departure> {
    departures.sort_by(|a, b| {
        a.arrival_time
            .cmp(&b.arrival_time)
            .then_with(|| a.route_label.cmp(&b.route_label))
            .then_with(|| a.direction_label.cmp(&b.direction_label))
    });
    // The same trip can show up under a parent station and a platform id
    departures.dedup_by(|a, b| {
        a.arrival_time == b.arrival_time
            && a.route_label == b.route_label
            && a.direction_label == b.direction_label
    });
    departures.truncate(max_count);
    departures
}
