//! # Transit Feed Sources
//!
//! This module handles all network operations for acquiring departures at the
//! configured stop. Three very different upstreams are put behind one
//! capability, [`FeedSource`]:
//!
//! - [`gtfs_rt`]: GTFS-Realtime trip updates (protobuf)
//! - [`json_feed`]: an open-data records API (JSON)
//! - [`static_archive`]: the published GTFS timetable (zipped CSV)
//!
//! Sources return [`RawRecord`]s exactly as the upstream describes them;
//! turning those into departures is the job of [`crate::normalize`].
//!
//! ## Error Handling
//!
//! Every failure mode maps onto one of four [`FetchError`] variants. None of
//! them is fatal: the orchestrator retries the source with backoff, then
//! moves on to the next source, and ultimately to the synthetic schedule.

use std::collections::BTreeSet;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, FixedOffset};
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, SourceConfig};
use crate::StopIdentity;

pub mod gtfs_rt;
pub mod json_feed;
pub mod static_archive;

pub use gtfs_rt::{RealtimeFeed, TripStopUpdate};
pub use json_feed::{JsonFeed, JsonRecord};
pub use static_archive::{ScheduledStopTime, StaticArchive};

/// Errors that can occur while fetching from a single source.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Transport failure: DNS, connect, TLS, timeout, truncated body
    #[error("source unreachable: {0}")]
    Unreachable(String),

    /// The server answered with a non-success status
    #[error("unexpected HTTP status {0}")]
    BadStatus(u16),

    /// The payload arrived but could not be understood
    #[error("malformed payload: {0}")]
    DecodeError(String),

    /// The payload was fine but held nothing for this stop and window
    #[error("no records for stop")]
    Empty,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            FetchError::BadStatus(status.as_u16())
        } else if err.is_decode() {
            FetchError::DecodeError(err.to_string())
        } else {
            FetchError::Unreachable(err.to_string())
        }
    }
}

/// A source-specific record, not yet normalized.
#[derive(Clone, Debug, PartialEq)]
pub enum RawRecord {
    /// A stop-time update from a GTFS-Realtime trip update
    TripUpdate(TripStopUpdate),
    /// One object from a JSON records endpoint
    Json(JsonRecord),
    /// One scheduled stop-time row from the static timetable
    Scheduled(ScheduledStopTime),
}

/// Capability shared by every upstream: fetch raw records for a stop within
/// a time horizon.
#[allow(async_fn_in_trait)]
pub trait FeedSource {
    /// Short name used in logs and run reports
    fn name(&self) -> &str;

    /// Fetch records for `stop` arriving within `[now, now + horizon]`.
    ///
    /// Real-time sources ignore the window (the selector applies it); the
    /// static archive needs it to bound the scheduled rows it expands.
    async fn fetch(
        &self,
        stop: &StopIdentity,
        now: DateTime<FixedOffset>,
        horizon: Duration,
    ) -> Result<Vec<RawRecord>, FetchError>;

    /// Ids of the station called `name` in this source's stop table.
    ///
    /// `Ok(None)` means the source carries no stop table; an empty set means
    /// the table has no such station.
    async fn lookup_stop(&self, name: &str) -> Result<Option<BTreeSet<String>>, FetchError> {
        let _ = name;
        Ok(None)
    }
}

/// The configured upstreams, dispatched statically.
pub enum Source {
    Realtime(RealtimeFeed),
    Json(JsonFeed),
    StaticArchive(StaticArchive),
}

impl Source {
    /// Build a source with its own HTTP client and per-attempt timeout.
    pub fn from_config(config: &SourceConfig) -> Result<Self, reqwest::Error> {
        Ok(match config {
            SourceConfig::GtfsRealtime(c) => Source::Realtime(RealtimeFeed::new(c)?),
            SourceConfig::Json(c) => Source::Json(JsonFeed::new(c)?),
            SourceConfig::StaticArchive(c) => Source::StaticArchive(StaticArchive::new(c)?),
        })
    }
}

impl FeedSource for Source {
    fn name(&self) -> &str {
        match self {
            Source::Realtime(s) => s.name(),
            Source::Json(s) => s.name(),
            Source::StaticArchive(s) => s.name(),
        }
    }

    async fn fetch(
        &self,
        stop: &StopIdentity,
        now: DateTime<FixedOffset>,
        horizon: Duration,
    ) -> Result<Vec<RawRecord>, FetchError> {
        match self {
            Source::Realtime(s) => s.fetch(stop, now, horizon).await,
            Source::Json(s) => s.fetch(stop, now, horizon).await,
            Source::StaticArchive(s) => s.fetch(stop, now, horizon).await,
        }
    }

    async fn lookup_stop(&self, name: &str) -> Result<Option<BTreeSet<String>>, FetchError> {
        match self {
            Source::StaticArchive(s) => s.lookup_stop(name).await,
            Source::Realtime(_) | Source::Json(_) => Ok(None),
        }
    }
}

/// Build every configured source in priority order, each paired with the
/// stop identity in its own namespace.
pub fn build_sources(config: &Config) -> Result<Vec<(StopIdentity, Source)>, reqwest::Error> {
    config
        .sources
        .iter()
        .map(|source_config| {
            let stop = match config.stop_id_for(source_config) {
                Some(id) => StopIdentity::with_id(&config.stop.name, id),
                None => StopIdentity::named(&config.stop.name),
            };
            Ok((stop, Source::from_config(source_config)?))
        })
        .collect()
}

/// HTTP client shared by one source's attempts.
pub(crate) fn http_client(timeout_secs: u64) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(StdDuration::from_secs(timeout_secs))
        .user_agent(concat!("departure-board/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// GET `url` and return the body of a successful response.
pub(crate) async fn get_bytes(
    client: &reqwest::Client,
    url: &str,
    query: &[(String, String)],
) -> Result<Vec<u8>, FetchError> {
    let response = client.get(url).query(query).send().await?;
    let status = response.status();
    debug!(url, status = status.as_u16(), "feed response");
    if !status.is_success() {
        return Err(FetchError::BadStatus(status.as_u16()));
    }
    let body = response.bytes().await?;
    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refused_connection_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/feed", listener.local_addr().unwrap());
        drop(listener);

        let client = http_client(2).unwrap();
        let err = get_bytes(&client, &url, &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn timeout_is_unreachable() {
        // Connections queue in the backlog but nothing ever answers
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/feed", listener.local_addr().unwrap());

        let client = http_client(1).unwrap();
        let err = get_bytes(&client, &url, &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)), "{err:?}");
        drop(listener);
    }

    #[test]
    fn error_display() {
        assert_eq!(FetchError::BadStatus(404).to_string(), "unexpected HTTP status 404");
        assert_eq!(FetchError::Empty.to_string(), "no records for stop");
    }

    #[test]
    fn sources_follow_configured_order_and_namespaces() {
        let mut config = Config::default();
        config.sources = Config::default_sources();
        let sources = build_sources(&config).unwrap();

        assert_eq!(sources.len(), 2);
        let (realtime_stop, realtime) = &sources[0];
        assert_eq!(realtime.name(), "gtfs-realtime");
        assert!(realtime_stop.matches("70037"));

        let (archive_stop, archive) = &sources[1];
        assert_eq!(archive.name(), "static-archive");
        assert!(!archive_stop.is_resolved());
        assert_eq!(archive_stop.name(), "Sant Cugat Centre");
    }
}
