//! GTFS-Realtime trip updates.
//!
//! Only the part of the GTFS-Realtime schema this board reads is modelled;
//! prost skips every other field while decoding.

use chrono::{DateTime, Duration, FixedOffset};
use prost::Message;
use tracing::{debug, warn};

use super::{get_bytes, http_client, FeedSource, FetchError, RawRecord};
use crate::config::RealtimeSourceConfig;
use crate::StopIdentity;

/// Subset of `gtfs-realtime.proto` (proto2).
pub mod proto {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FeedMessage {
        #[prost(message, optional, tag = "1")]
        pub header: Option<FeedHeader>,
        #[prost(message, repeated, tag = "2")]
        pub entity: Vec<FeedEntity>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FeedHeader {
        #[prost(string, optional, tag = "1")]
        pub gtfs_realtime_version: Option<String>,
        #[prost(uint64, optional, tag = "3")]
        pub timestamp: Option<u64>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct FeedEntity {
        #[prost(string, optional, tag = "1")]
        pub id: Option<String>,
        #[prost(bool, optional, tag = "2")]
        pub is_deleted: Option<bool>,
        #[prost(message, optional, tag = "3")]
        pub trip_update: Option<TripUpdate>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TripUpdate {
        #[prost(message, optional, tag = "1")]
        pub trip: Option<TripDescriptor>,
        #[prost(message, repeated, tag = "2")]
        pub stop_time_update: Vec<StopTimeUpdate>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct TripDescriptor {
        #[prost(string, optional, tag = "1")]
        pub trip_id: Option<String>,
        #[prost(int32, optional, tag = "4")]
        pub schedule_relationship: Option<i32>,
        #[prost(string, optional, tag = "5")]
        pub route_id: Option<String>,
        #[prost(uint32, optional, tag = "6")]
        pub direction_id: Option<u32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StopTimeUpdate {
        #[prost(uint32, optional, tag = "1")]
        pub stop_sequence: Option<u32>,
        #[prost(message, optional, tag = "2")]
        pub arrival: Option<StopTimeEvent>,
        #[prost(message, optional, tag = "3")]
        pub departure: Option<StopTimeEvent>,
        #[prost(string, optional, tag = "4")]
        pub stop_id: Option<String>,
        #[prost(int32, optional, tag = "5")]
        pub schedule_relationship: Option<i32>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct StopTimeEvent {
        #[prost(int32, optional, tag = "1")]
        pub delay: Option<i32>,
        #[prost(int64, optional, tag = "2")]
        pub time: Option<i64>,
    }

    /// `TripDescriptor.ScheduleRelationship.CANCELED`
    pub const TRIP_CANCELED: i32 = 3;
    /// `StopTimeUpdate.ScheduleRelationship.SKIPPED`
    pub const STOP_SKIPPED: i32 = 1;
}

use proto::FeedMessage;

/// A predicted arrival of one trip at the configured stop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TripStopUpdate {
    pub route_id: String,
    /// GTFS `direction_id`, absent on some feeds
    pub direction_id: Option<u32>,
    pub stop_id: String,
    /// Arrival as POSIX seconds
    pub arrival_epoch: i64,
}

/// GTFS-Realtime trip-updates endpoint.
pub struct RealtimeFeed {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl RealtimeFeed {
    pub fn new(config: &RealtimeSourceConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            name: "gtfs-realtime".to_string(),
            url: config.url.clone(),
            client: http_client(config.timeout_secs)?,
        })
    }
}

impl FeedSource for RealtimeFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        stop: &StopIdentity,
        _now: DateTime<FixedOffset>,
        _horizon: Duration,
    ) -> Result<Vec<RawRecord>, FetchError> {
        if !stop.is_resolved() {
            warn!(stop = stop.name(), "no stop id configured for GTFS-Realtime source");
            return Err(FetchError::Empty);
        }
        let payload = get_bytes(&self.client, &self.url, &[]).await?;
        let feed = decode_feed(&payload)?;
        debug!(entities = feed.entity.len(), bytes = payload.len(), "decoded trip updates");

        let records = extract_updates(&feed, stop);
        if records.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(records)
    }
}

/// Decode a feed message, accepting both the plain encoding and a single
/// length-delimited message.
pub fn decode_feed(payload: &[u8]) -> Result<FeedMessage, FetchError> {
    match FeedMessage::decode(payload) {
        Ok(feed) if !feed.entity.is_empty() => Ok(feed),
        plain => match FeedMessage::decode_length_delimited(payload) {
            Ok(feed) if !feed.entity.is_empty() => Ok(feed),
            _ => plain.map_err(|err| FetchError::DecodeError(err.to_string())),
        },
    }
}

/// Stop-time updates at `stop` that carry an arrival time.
pub fn extract_updates(feed: &FeedMessage, stop: &StopIdentity) -> Vec<RawRecord> {
    let mut records = Vec::new();
    for entity in &feed.entity {
        if entity.is_deleted.unwrap_or(false) {
            continue;
        }
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        let trip = trip_update.trip.clone().unwrap_or_default();
        if trip.schedule_relationship == Some(proto::TRIP_CANCELED) {
            continue;
        }

        for update in &trip_update.stop_time_update {
            if update.schedule_relationship == Some(proto::STOP_SKIPPED) {
                continue;
            }
            let Some(stop_id) = update.stop_id.as_deref().filter(|id| stop.matches(id)) else {
                continue;
            };
            let Some(arrival_epoch) = update.arrival.as_ref().and_then(|a| a.time) else {
                continue;
            };
            records.push(RawRecord::TripUpdate(TripStopUpdate {
                route_id: trip.route_id.clone().unwrap_or_default(),
                direction_id: trip.direction_id,
                stop_id: stop_id.to_string(),
                arrival_epoch,
            }));
        }
    }
    records
}
