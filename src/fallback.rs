//! # Fallback Headway Model
//!
//! This module synthesizes a plausible departure list when no live source
//! produced anything usable. It is a last resort, not a timetable: the board
//! it feeds is marked offline and every departure carries
//! [`SourceKind::Fallback`].
//!
//! ## Model
//!
//! ### Slots
//! Each configured route runs on a fixed grid within the hour. With headway
//! `h` and route offset `o`, the minute values are `(b + o) mod 60` for
//! `b = 0, h, 2h, ...` below 60. Headway is the peak value when the current
//! hour falls in a configured peak range, the off-peak value otherwise.
//!
//! ### Next occurrence
//! Every slot is projected to its next absolute time strictly after `now`,
//! rolling into the next hour when the minute has passed or is current. Candidates
//! beyond the horizon are dropped, the rest are ordered and truncated exactly
//! like live departures.
//!
//! ### Directions
//! Slots in the first half of the hour go to direction 0, the second half to
//! direction 1. This alternation is a placeholder heuristic and is only ever
//! shown on an offline board.
//!
//! Generation never fails; no configured routes yield an empty list.

use chrono::{DateTime, Duration, FixedOffset, Timelike};

use crate::config::FallbackConfig;
use crate::normalize::DirectionTable;
use crate::select::order_and_truncate;
use crate::{Departure, SourceKind};

/// Generate the synthetic schedule for `now`.
pub fn generate(
    now: DateTime<FixedOffset>,
    config: &FallbackConfig,
    directions: &DirectionTable,
) -> Vec<Departure> {
    let hour = now.hour();
    let headway = if config.peak_hours.iter().any(|range| range.contains(hour)) {
        config.peak_headway_minutes
    } else {
        config.offpeak_headway_minutes
    }
    .max(1);
    let horizon = Duration::minutes(config.horizon_minutes);

    // Truncate to the start of the current hour without touching the offset
    let hour_start = now
        - Duration::minutes(i64::from(now.minute()))
        - Duration::seconds(i64::from(now.second()))
        - Duration::nanoseconds(i64::from(now.nanosecond()));

    let mut departures = Vec::new();
    for route in &config.routes {
        for base in (0..60).step_by(headway as usize) {
            let minute = (base + route.offset_minutes) % 60;
            let mut candidate = hour_start + Duration::minutes(i64::from(minute));
            if candidate <= now {
                candidate += Duration::hours(1);
            }
            if candidate - now > horizon {
                continue;
            }

            let flag = if minute < 30 { 0 } else { 1 };
            departures.push(Departure {
                route_label: route.route.clone(),
                direction_label: directions
                    .label(&route.route, flag)
                    .unwrap_or_default()
                    .to_string(),
                arrival_time: candidate,
                source_kind: SourceKind::Fallback,
            });
        }
    }

    order_and_truncate(departures, config.max_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirectionsConfig, FallbackRoute};
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2025, 3, 14, hour, minute, second)
            .unwrap()
    }

    fn directions() -> DirectionTable {
        DirectionTable::from_config(&DirectionsConfig::default())
    }

    fn single_route(offset: u32) -> FallbackConfig {
        FallbackConfig {
            routes: vec![FallbackRoute {
                route: "S1".to_string(),
                offset_minutes: offset,
            }],
            max_count: 20,
            ..FallbackConfig::default()
        }
    }

    fn minutes_from(now: DateTime<FixedOffset>, departures: &[Departure]) -> Vec<i64> {
        departures
            .iter()
            .map(|d| (d.arrival_time - now).num_minutes())
            .collect()
    }

    #[test]
    fn off_peak_uses_ten_minute_headway() {
        let now = at(12, 0, 0);
        let out = generate(now, &single_route(2), &directions());
        assert_eq!(minutes_from(now, &out), vec![2, 12, 22, 32, 42, 52]);
        assert!(out.iter().all(|d| d.source_kind == SourceKind::Fallback));
    }

    #[test]
    fn peak_hours_use_five_minute_headway() {
        let now = at(8, 0, 0);
        let out = generate(now, &single_route(0), &directions());
        assert_eq!(out.len(), 12);
        assert_eq!(out[0].arrival_time - now, Duration::minutes(5));
        // :00 is not after now, so it moves to the next hour
        assert_eq!(out[11].arrival_time - now, Duration::hours(1));
        assert!(out.iter().all(|d| d.arrival_time > now));
    }

    #[test]
    fn peak_range_end_is_exclusive() {
        let now = at(10, 0, 0);
        let out = generate(now, &single_route(0), &directions());
        assert_eq!(out[0].arrival_time - now, Duration::minutes(10));
        assert_eq!(out[1].arrival_time - now, Duration::minutes(20));
    }

    #[test]
    fn passed_slots_roll_into_next_hour() {
        let now = at(12, 45, 30);
        let out = generate(now, &single_route(2), &directions());
        let clock: Vec<(u32, u32)> = out
            .iter()
            .map(|d| (d.arrival_time.hour(), d.arrival_time.minute()))
            .collect();
        assert_eq!(
            clock,
            vec![(12, 52), (13, 2), (13, 12), (13, 22), (13, 32), (13, 42)]
        );
        assert!(out.iter().all(|d| d.arrival_time > now));
        assert!(out.iter().all(|d| d.arrival_time.offset() == now.offset()));
    }

    #[test]
    fn direction_alternates_by_half_hour() {
        let now = at(12, 0, 0);
        let out = generate(now, &single_route(2), &directions());
        for d in &out {
            let expected = if d.arrival_time.minute() < 30 {
                "Barcelona"
            } else {
                "Terrassa"
            };
            assert_eq!(d.direction_label, expected);
        }
    }

    #[test]
    fn default_routes_are_merged_and_truncated() {
        let now = at(12, 0, 0);
        let out = generate(now, &FallbackConfig::default(), &directions());
        assert_eq!(out.len(), 6);
        let routes: Vec<&str> = out.iter().map(|d| d.route_label.as_str()).collect();
        assert_eq!(routes, vec!["S1", "S2", "S1", "S2", "S1", "S2"]);
    }

    #[test]
    fn no_routes_yields_empty() {
        let config = FallbackConfig {
            routes: Vec::new(),
            ..FallbackConfig::default()
        };
        assert!(generate(at(12, 0, 0), &config, &directions()).is_empty());
    }

    #[test]
    fn zero_headway_does_not_loop_forever() {
        let config = FallbackConfig {
            offpeak_headway_minutes: 0,
            ..single_route(0)
        };
        let out = generate(at(12, 0, 0), &config, &directions());
        assert_eq!(out.len(), 20);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::config::{DirectionsConfig, FallbackRoute};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn config_strategy() -> impl Strategy<Value = FallbackConfig> {
        (
            prop::collection::vec(0u32..60, 0..4),
            1u32..30,
            1u32..30,
            1i64..180,
            0usize..12,
        )
            .prop_map(|(offsets, peak, offpeak, horizon, max_count)| FallbackConfig {
                routes: offsets
                    .into_iter()
                    .enumerate()
                    .map(|(i, offset_minutes)| FallbackRoute {
                        route: format!("S{}", i + 1),
                        offset_minutes,
                    })
                    .collect(),
                peak_headway_minutes: peak,
                offpeak_headway_minutes: offpeak,
                horizon_minutes: horizon,
                max_count,
                ..FallbackConfig::default()
            })
    }

    proptest! {
        #[test]
        fn generation_is_deterministic_and_bounded(
            config in config_strategy(),
            seconds_into_day in 0u32..86_400,
        ) {
            let now = FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2025, 3, 14, 0, 0, 0)
                .unwrap()
                + Duration::seconds(i64::from(seconds_into_day));
            let directions = DirectionTable::from_config(&DirectionsConfig::default());

            let first = generate(now, &config, &directions);
            let second = generate(now, &config, &directions);
            prop_assert_eq!(&first, &second);

            prop_assert!(first.len() <= config.max_count);
            for d in &first {
                prop_assert!(d.arrival_time > now);
                prop_assert!(d.arrival_time - now <= Duration::minutes(config.horizon_minutes));
            }
            for pair in first.windows(2) {
                prop_assert!(pair[0].arrival_time <= pair[1].arrival_time);
            }
        }
    }
}
