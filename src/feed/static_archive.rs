//! # Static GTFS Timetable
//!
//! Downloads the published timetable archive and expands it into scheduled
//! arrivals at the configured stop. The archive is downloaded once per run:
//! when it served the stop lookup, the first fetch reuses those bytes.
//!
//! ## Service Days
//!
//! A trip runs on a date when its `service_id` is active on that date:
//! - `calendar.txt` activates it on listed weekdays between its start and end dates
//! - `calendar_dates.txt` adds (`exception_type = 1`) or removes
//!   (`exception_type = 2`) it for single dates
//!
//! Stop times past `24:00:00` belong to the previous service day and continue
//! after midnight, so both yesterday's and today's services are expanded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read, Seek};
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Days, Duration, FixedOffset, NaiveDate, TimeZone, Weekday};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::ZipArchive;

use super::{get_bytes, http_client, FeedSource, FetchError, RawRecord};
use crate::config::StaticArchiveSourceConfig;
use crate::StopIdentity;

const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

/// Longest trip a service day may describe; later stop times are malformed.
const MAX_SERVICE_HOURS: u32 = 72;

/// A scheduled arrival expanded onto a concrete date.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduledStopTime {
    /// `route_short_name` when published, else the route id
    pub route_label: String,
    pub direction_id: Option<u32>,
    pub headsign: Option<String>,
    pub arrival: DateTime<FixedOffset>,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    stop_id: String,
    #[serde(default)]
    stop_name: String,
}

#[derive(Debug, Deserialize)]
struct RouteRow {
    route_id: String,
    #[serde(default)]
    route_short_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TripRow {
    route_id: String,
    service_id: String,
    trip_id: String,
    #[serde(default)]
    trip_headsign: Option<String>,
    #[serde(default)]
    direction_id: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    #[serde(default)]
    arrival_time: Option<String>,
    stop_id: String,
}

#[derive(Debug, Deserialize)]
struct CalendarRow {
    service_id: String,
    monday: u8,
    tuesday: u8,
    wednesday: u8,
    thursday: u8,
    friday: u8,
    saturday: u8,
    sunday: u8,
    start_date: String,
    end_date: String,
}

impl CalendarRow {
    fn runs_on(&self, date: NaiveDate) -> bool {
        let flag = match date.weekday() {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        };
        let in_range = match (parse_gtfs_date(&self.start_date), parse_gtfs_date(&self.end_date)) {
            (Some(start), Some(end)) => start <= date && date <= end,
            _ => false,
        };
        flag == 1 && in_range
    }
}

#[derive(Debug, Deserialize)]
struct CalendarDateRow {
    service_id: String,
    date: String,
    exception_type: u8,
}

const EXCEPTION_ADDED: u8 = 1;
const EXCEPTION_REMOVED: u8 = 2;

/// Static timetable archive downloaded over HTTP.
pub struct StaticArchive {
    name: String,
    url: String,
    client: reqwest::Client,
    /// Archive downloaded by the stop lookup, taken by the next fetch
    prefetched: Mutex<Option<Vec<u8>>>,
}

impl StaticArchive {
    pub fn new(config: &StaticArchiveSourceConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            name: "static-archive".to_string(),
            url: config.url.clone(),
            client: http_client(config.timeout_secs)?,
            prefetched: Mutex::new(None),
        })
    }

    async fn download(&self) -> Result<Vec<u8>, FetchError> {
        let cached = self.prefetched.lock().ok().and_then(|mut slot| slot.take());
        if let Some(bytes) = cached {
            debug!(bytes = bytes.len(), "reusing archive from stop lookup");
            return Ok(bytes);
        }
        let bytes = get_bytes(&self.client, &self.url, &[]).await?;
        debug!(bytes = bytes.len(), "downloaded timetable archive");
        Ok(bytes)
    }
}

impl FeedSource for StaticArchive {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        stop: &StopIdentity,
        now: DateTime<FixedOffset>,
        horizon: Duration,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let archive = self.download().await?;
        let records = parse_archive(&archive, stop, now, horizon)?;
        if records.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(records)
    }

    async fn lookup_stop(&self, name: &str) -> Result<Option<BTreeSet<String>>, FetchError> {
        let archive = self.download().await?;
        let ids = stop_ids_by_name(&archive, name)?;
        if let Ok(mut slot) = self.prefetched.lock() {
            *slot = Some(archive);
        }
        Ok(Some(ids))
    }
}

/// Ids in `stops.txt` whose station name contains `name`, ignoring case.
pub fn stop_ids_by_name(bytes: &[u8], name: &str) -> Result<BTreeSet<String>, FetchError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(decode_error)?;
    let stops: Vec<StopRow> = read_table(&mut archive, "stops.txt")?;
    Ok(resolve_stop_ids(&stops, name))
}

/// Expand the archive into scheduled arrivals at `stop` within
/// `[now, now + horizon]`.
pub fn parse_archive(
    bytes: &[u8],
    stop: &StopIdentity,
    now: DateTime<FixedOffset>,
    horizon: Duration,
) -> Result<Vec<RawRecord>, FetchError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(decode_error)?;

    let stop_ids: BTreeSet<String> = if stop.is_resolved() {
        stop.ids().map(str::to_string).collect()
    } else {
        let stops: Vec<StopRow> = read_table(&mut archive, "stops.txt")?;
        let ids = resolve_stop_ids(&stops, stop.name());
        if ids.is_empty() {
            warn!(stop = stop.name(), "station name not found in stops.txt");
            return Err(FetchError::Empty);
        }
        info!(stop = stop.name(), ids = ?ids, "resolved stop by name");
        ids
    };

    let today = now.date_naive();
    let yesterday = today.pred_opt().unwrap_or(today);
    let calendar: Vec<CalendarRow> = read_optional_table(&mut archive, "calendar.txt")?;
    let exceptions: Vec<CalendarDateRow> = read_optional_table(&mut archive, "calendar_dates.txt")?;
    let service_days = [
        (yesterday, active_services(&calendar, &exceptions, yesterday)),
        (today, active_services(&calendar, &exceptions, today)),
    ];

    let route_labels: HashMap<String, String> = read_optional_table::<RouteRow, _>(&mut archive, "routes.txt")?
        .into_iter()
        .filter_map(|r| {
            let label = r.route_short_name.filter(|s| !s.trim().is_empty())?;
            Some((r.route_id, label.trim().to_string()))
        })
        .collect();

    let trips: HashMap<String, TripRow> = read_table::<TripRow, _>(&mut archive, "trips.txt")?
        .into_iter()
        .filter(|t| service_days.iter().any(|(_, s)| s.contains(&t.service_id)))
        .map(|t| (t.trip_id.clone(), t))
        .collect();

    let window_end = now + horizon;
    let mut records = Vec::new();
    for_each_row(&mut archive, "stop_times.txt", |row: StopTimeRow| {
        if !stop_ids.contains(&row.stop_id) {
            return;
        }
        let Some(trip) = trips.get(&row.trip_id) else {
            return;
        };
        let Some(seconds) = row.arrival_time.as_deref().and_then(parse_gtfs_time) else {
            return;
        };
        for (date, services) in &service_days {
            if !services.contains(&trip.service_id) {
                continue;
            }
            let Some(arrival) = service_time(*date, seconds, now.offset()) else {
                continue;
            };
            if arrival < now || arrival > window_end {
                continue;
            }
            records.push(RawRecord::Scheduled(ScheduledStopTime {
                route_label: route_labels
                    .get(&trip.route_id)
                    .cloned()
                    .unwrap_or_else(|| trip.route_id.clone()),
                direction_id: trip.direction_id,
                headsign: trip.trip_headsign.clone().filter(|h| !h.trim().is_empty()),
                arrival,
            }));
        }
    })?;

    debug!(records = records.len(), trips = trips.len(), "scheduled arrivals in window");
    Ok(records)
}

/// Stop ids whose name contains `name`, ignoring case.
fn resolve_stop_ids(stops: &[StopRow], name: &str) -> BTreeSet<String> {
    let needle = name.trim().to_lowercase();
    if needle.is_empty() {
        return BTreeSet::new();
    }
    stops
        .iter()
        .filter(|s| s.stop_name.to_lowercase().contains(&needle))
        .map(|s| s.stop_id.clone())
        .collect()
}

/// Service ids running on `date`.
fn active_services(
    calendar: &[CalendarRow],
    exceptions: &[CalendarDateRow],
    date: NaiveDate,
) -> HashSet<String> {
    let mut active: HashSet<String> = calendar
        .iter()
        .filter(|row| row.runs_on(date))
        .map(|row| row.service_id.clone())
        .collect();

    for exception in exceptions {
        if parse_gtfs_date(&exception.date) != Some(date) {
            continue;
        }
        match exception.exception_type {
            EXCEPTION_ADDED => {
                active.insert(exception.service_id.clone());
            }
            EXCEPTION_REMOVED => {
                active.remove(&exception.service_id);
            }
            other => debug!(exception_type = other, "unknown calendar exception type"),
        }
    }
    active
}

fn parse_gtfs_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

/// Seconds since service-day midnight for `H:MM:SS` or `HH:MM:SS`;
/// hours may exceed 23 but not [`MAX_SERVICE_HOURS`].
fn parse_gtfs_time(value: &str) -> Option<u32> {
    let mut parts = value.trim().splitn(3, ':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if hours > MAX_SERVICE_HOURS || minutes >= 60 || seconds >= 60 {
        return None;
    }
    hours
        .checked_mul(3600)?
        .checked_add(minutes * 60)?
        .checked_add(seconds)
}

/// Absolute time of a stop time on a service day. Times at or past
/// 24:00:00 are moved to the following day minus 24 hours.
fn service_time(date: NaiveDate, seconds: u32, offset: &FixedOffset) -> Option<DateTime<FixedOffset>> {
    let days = seconds / SECONDS_PER_DAY;
    let seconds = seconds % SECONDS_PER_DAY;
    let date = date.checked_add_days(Days::new(u64::from(days)))?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    let local = midnight + Duration::seconds(i64::from(seconds));
    offset.from_local_datetime(&local).single()
}

fn decode_error(err: impl std::fmt::Display) -> FetchError {
    FetchError::DecodeError(err.to_string())
}

fn csv_reader<R: Read>(reader: R) -> csv::Reader<R> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader)
}

/// Stream a required table row by row.
fn for_each_row<T, R, F>(archive: &mut ZipArchive<R>, name: &str, mut visit: F) -> Result<(), FetchError>
where
    T: DeserializeOwned,
    R: Read + Seek,
    F: FnMut(T),
{
    let file = archive.by_name(name).map_err(|err| match err {
        ZipError::FileNotFound => FetchError::DecodeError(format!("archive has no {name}")),
        other => decode_error(other),
    })?;
    for row in csv_reader(file).deserialize::<T>() {
        visit(row.map_err(decode_error)?);
    }
    Ok(())
}

fn read_table<T, R>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<T>, FetchError>
where
    T: DeserializeOwned,
    R: Read + Seek,
{
    let mut rows = Vec::new();
    for_each_row(archive, name, |row| rows.push(row))?;
    Ok(rows)
}

/// Like [`read_table`], but a missing file is an empty table.
fn read_optional_table<T, R>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<T>, FetchError>
where
    T: DeserializeOwned,
    R: Read + Seek,
{
    if !archive.file_names().any(|file| file == name) {
        return Ok(Vec::new());
    }
    read_table(archive, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(3600).unwrap()
    }

    fn build_archive(files: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    // 2025-03-14 is a Friday.
    fn fixture() -> Vec<u8> {
        build_archive(&[
            (
                "stops.txt",
                "stop_id,stop_name\n70037,Sant Cugat Centre\n70037-2,Sant Cugat Centre - Andana 2\n70038,Valldoreix\n",
            ),
            ("routes.txt", "route_id,route_short_name\nR1,S1\nR2,S2\n"),
            (
                "calendar.txt",
                "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
                 WEEKDAY,1,1,1,1,1,0,0,20250101,20251231\n\
                 WEEKEND,0,0,0,0,0,1,1,20250101,20251231\n",
            ),
            (
                "calendar_dates.txt",
                "service_id,date,exception_type\nHOLIDAY,20250314,1\n",
            ),
            (
                "trips.txt",
                "route_id,service_id,trip_id,trip_headsign,direction_id\n\
                 R1,WEEKDAY,T1,Barcelona - Pl. Catalunya,0\n\
                 R2,WEEKDAY,T2,Sabadell Parc del Nord,1\n\
                 R1,WEEKEND,T3,Terrassa Nacions Unides,1\n\
                 R2,HOLIDAY,T4,Barcelona - Pl. Catalunya,\n\
                 R1,WEEKDAY,T5,Terrassa Nacions Unides,1\n",
            ),
            (
                "stop_times.txt",
                "trip_id,arrival_time,departure_time,stop_id,stop_sequence\n\
                 T1,08:05:00,08:05:30,70037,5\n\
                 T2,08:20:00,08:20:30,70037-2,7\n\
                 T3,08:10:00,08:10:30,70037,5\n\
                 T4,8:30:00,8:30:30,70037,6\n\
                 T1,08:09:00,08:09:30,70038,6\n\
                 T5,09:45:00,09:45:30,70037,5\n\
                 T5,,07:00:00,70037,1\n",
            ),
        ])
    }

    fn arrivals(records: &[RawRecord]) -> Vec<(String, String)> {
        let mut out: Vec<_> = records
            .iter()
            .map(|r| match r {
                RawRecord::Scheduled(s) => (s.route_label.clone(), s.arrival.format("%H:%M").to_string()),
                other => panic!("unexpected record {other:?}"),
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn resolves_stop_by_name_and_applies_calendar() {
        let now = tz().with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
        let stop = StopIdentity::named("sant cugat");
        let records = parse_archive(&fixture(), &stop, now, Duration::minutes(60)).unwrap();

        // Weekend trip T3 is inactive, T5 is beyond the horizon, Valldoreix is another stop.
        assert_eq!(
            arrivals(&records),
            vec![
                ("S1".to_string(), "08:05".to_string()),
                ("S2".to_string(), "08:20".to_string()),
                ("S2".to_string(), "08:30".to_string()),
            ]
        );
    }

    #[test]
    fn station_lookup_collects_every_platform() {
        let ids = stop_ids_by_name(&fixture(), "Sant Cugat Centre").unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["70037", "70037-2"]);

        assert!(stop_ids_by_name(&fixture(), "Montserrat").unwrap().is_empty());
        assert!(matches!(
            stop_ids_by_name(b"not a zip", "Sant Cugat"),
            Err(FetchError::DecodeError(_))
        ));
    }

    #[test]
    fn carries_direction_and_headsign() {
        let now = tz().with_ymd_and_hms(2025, 3, 14, 8, 25, 0).unwrap();
        let stop = StopIdentity::with_id("Sant Cugat Centre", "70037");
        let records = parse_archive(&fixture(), &stop, now, Duration::minutes(30)).unwrap();
        assert_eq!(
            records,
            vec![RawRecord::Scheduled(ScheduledStopTime {
                route_label: "S2".into(),
                direction_id: None,
                headsign: Some("Barcelona - Pl. Catalunya".into()),
                arrival: tz().with_ymd_and_hms(2025, 3, 14, 8, 30, 0).unwrap(),
            })]
        );
    }

    #[test]
    fn removed_exception_disables_service() {
        let archive = build_archive(&[
            ("stops.txt", "stop_id,stop_name\nA,Alpha\n"),
            (
                "calendar.txt",
                "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\n\
                 WK,1,1,1,1,1,1,1,20250101,20251231\n",
            ),
            ("calendar_dates.txt", "service_id,date,exception_type\nWK,20250314,2\n"),
            ("trips.txt", "route_id,service_id,trip_id\nR,WK,T\n"),
            ("stop_times.txt", "trip_id,arrival_time,stop_id\nT,10:00:00,A\n"),
        ]);
        let stop = StopIdentity::with_id("Alpha", "A");

        let removed_day = tz().with_ymd_and_hms(2025, 3, 14, 9, 30, 0).unwrap();
        assert!(parse_archive(&archive, &stop, removed_day, Duration::minutes(60))
            .unwrap()
            .is_empty());

        let normal_day = tz().with_ymd_and_hms(2025, 3, 13, 9, 30, 0).unwrap();
        assert_eq!(
            parse_archive(&archive, &stop, normal_day, Duration::minutes(60))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn after_midnight_times_come_from_previous_service_day() {
        let archive = build_archive(&[
            ("stops.txt", "stop_id,stop_name\nA,Alpha\n"),
            ("calendar_dates.txt", "service_id,date,exception_type\nFRI,20250314,1\n"),
            ("trips.txt", "route_id,service_id,trip_id\nN,FRI,T\n"),
            ("stop_times.txt", "trip_id,arrival_time,stop_id\nT,24:40:00,A\n"),
        ]);
        let stop = StopIdentity::with_id("Alpha", "A");
        let now = tz().with_ymd_and_hms(2025, 3, 15, 0, 15, 0).unwrap();

        let records = parse_archive(&archive, &stop, now, Duration::minutes(60)).unwrap();
        match &records[..] {
            [RawRecord::Scheduled(s)] => {
                assert_eq!(s.arrival, tz().with_ymd_and_hms(2025, 3, 15, 0, 40, 0).unwrap());
                assert_eq!(s.route_label, "N");
            }
            other => panic!("unexpected records {other:?}"),
        }
    }

    #[test]
    fn unknown_station_is_empty_and_missing_table_is_decode_error() {
        let now = tz().with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap();
        let stop = StopIdentity::named("Montserrat");
        assert_eq!(
            parse_archive(&fixture(), &stop, now, Duration::minutes(60)),
            Err(FetchError::Empty)
        );

        let broken = build_archive(&[("stops.txt", "stop_id,stop_name\nA,Alpha\n")]);
        let stop = StopIdentity::with_id("Alpha", "A");
        assert!(matches!(
            parse_archive(&broken, &stop, now, Duration::minutes(60)),
            Err(FetchError::DecodeError(_))
        ));

        assert!(matches!(
            parse_archive(b"not a zip", &stop, now, Duration::minutes(60)),
            Err(FetchError::DecodeError(_))
        ));
    }

    #[test]
    fn gtfs_time_parsing() {
        assert_eq!(parse_gtfs_time("08:05:00"), Some(8 * 3600 + 5 * 60));
        assert_eq!(parse_gtfs_time("7:00:30"), Some(7 * 3600 + 30));
        assert_eq!(parse_gtfs_time("25:10:00"), Some(25 * 3600 + 10 * 60));
        assert_eq!(parse_gtfs_time("08:61:00"), None);
        assert_eq!(parse_gtfs_time(""), None);
        assert_eq!(parse_gtfs_time("99999999:00:00"), None);
        assert_eq!(parse_gtfs_time("73:00:00"), None);
    }

    #[test]
    fn oversized_hour_field_skips_the_row() {
        let archive = build_archive(&[
            ("stops.txt", "stop_id,stop_name\nA,Alpha\n"),
            ("calendar_dates.txt", "service_id,date,exception_type\nFRI,20250314,1\n"),
            ("trips.txt", "route_id,service_id,trip_id\nR,FRI,T\n"),
            (
                "stop_times.txt",
                "trip_id,arrival_time,stop_id\nT,99999999:00:00,A\nT,10:15:00,A\n",
            ),
        ]);
        let stop = StopIdentity::with_id("Alpha", "A");
        let now = tz().with_ymd_and_hms(2025, 3, 14, 10, 0, 0).unwrap();

        let records = parse_archive(&archive, &stop, now, Duration::minutes(60)).unwrap();
        assert_eq!(records.len(), 1);
    }
}
