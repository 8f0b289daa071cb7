//! Open-data JSON records endpoint.
//!
//! Record APIs wrap their rows in one of two envelopes:
//! `{"results": [{...}]}` or `{"records": [{"fields": {...}}]}`. Field names
//! vary per dataset and come from configuration.

use chrono::{DateTime, Duration, FixedOffset};
use serde_json::Value;
use tracing::{debug, warn};

use super::{get_bytes, http_client, FeedSource, FetchError, RawRecord};
use crate::config::JsonSourceConfig;
use crate::StopIdentity;

/// One record with a resolvable arrival time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonRecord {
    pub route: String,
    /// Arrival as POSIX seconds
    pub arrival_epoch: i64,
    /// Structured direction, when the dataset has one
    pub direction_id: Option<u32>,
    /// Free text (destination, trip name...) for direction inference
    pub text: String,
}

/// Which JSON fields hold what.
#[derive(Clone, Debug)]
pub struct JsonFields {
    pub route: String,
    pub arrival: String,
    pub direction: Option<String>,
    pub text: Vec<String>,
}

/// JSON records endpoint queried with a stop filter.
pub struct JsonFeed {
    name: String,
    url: String,
    client: reqwest::Client,
    query: Vec<(String, String)>,
    limit: u32,
    fields: JsonFields,
}

impl JsonFeed {
    pub fn new(config: &JsonSourceConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            name: "json".to_string(),
            url: config.url.clone(),
            client: http_client(config.timeout_secs)?,
            query: config
                .query
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            limit: config.limit,
            fields: JsonFields {
                route: config.route_field.clone(),
                arrival: config.arrival_field.clone(),
                direction: config.direction_field.clone(),
                text: config.text_fields.clone(),
            },
        })
    }

    /// Query parameters with `{stop_id}` substituted.
    fn query_for(&self, stop_id: &str) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (k.clone(), v.replace("{stop_id}", stop_id)))
            .collect();
        query.push(("limit".to_string(), self.limit.to_string()));
        query
    }
}

impl FeedSource for JsonFeed {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(
        &self,
        stop: &StopIdentity,
        _now: DateTime<FixedOffset>,
        _horizon: Duration,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let Some(stop_id) = stop.ids().next() else {
            warn!(stop = stop.name(), "no stop id configured for JSON source");
            return Err(FetchError::Empty);
        };
        let body = get_bytes(&self.client, &self.url, &self.query_for(stop_id)).await?;
        let payload: Value = serde_json::from_slice(&body)
            .map_err(|err| FetchError::DecodeError(err.to_string()))?;

        let records = extract_records(&payload, &self.fields)?;
        debug!(records = records.len(), "JSON records with arrival time");
        if records.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(records)
    }
}

/// Records from either envelope that carry a usable arrival time.
pub fn extract_records(payload: &Value, fields: &JsonFields) -> Result<Vec<RawRecord>, FetchError> {
    let rows: Vec<&Value> = if let Some(results) = payload.get("results").and_then(Value::as_array) {
        results.iter().collect()
    } else if let Some(records) = payload.get("records").and_then(Value::as_array) {
        records
            .iter()
            .map(|record| record.get("fields").unwrap_or(record))
            .collect()
    } else {
        return Err(FetchError::DecodeError(
            "no `results` or `records` array".to_string(),
        ));
    };

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let arrival_epoch = row.get(&fields.arrival).and_then(epoch_seconds)?;
            let route = row.get(&fields.route).map(text_of).unwrap_or_default();
            let direction_id = fields
                .direction
                .as_ref()
                .and_then(|field| row.get(field))
                .and_then(direction_flag);
            let text = fields
                .text
                .iter()
                .filter_map(|field| row.get(field).map(text_of))
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            Some(RawRecord::Json(JsonRecord {
                route,
                arrival_epoch,
                direction_id,
                text,
            }))
        })
        .collect())
}

/// POSIX seconds from a number, a numeric string or an RFC 3339 string.
fn epoch_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.timestamp())
            })
        }
        _ => None,
    }
}

fn direction_flag(value: &Value) -> Option<u32> {
    let flag = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u32::try_from(flag).ok().filter(|f| *f <= 1)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields() -> JsonFields {
        JsonFields {
            route: "lin".to_string(),
            arrival: "arrival".to_string(),
            direction: Some("dir".to_string()),
            text: vec!["destination".to_string(), "trip_name".to_string()],
        }
    }

    #[test]
    fn results_envelope_with_mixed_timestamp_formats() {
        let payload = json!({
            "total_count": 4,
            "results": [
                { "lin": "S1", "arrival": 1_700_000_300, "dir": 0, "destination": "Barcelona" },
                { "lin": "S2", "arrival": "1700000400", "dir": "1", "destination": "Sabadell Parc del Nord" },
                { "lin": "S5", "arrival": "2023-11-14T23:20:00+01:00", "destination": "Sant Cugat" },
                { "lin": "S6", "destination": "no time at all" }
            ]
        });

        let records = extract_records(&payload, &fields()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[1],
            RawRecord::Json(JsonRecord {
                route: "S2".into(),
                arrival_epoch: 1_700_000_400,
                direction_id: Some(1),
                text: "Sabadell Parc del Nord".into(),
            })
        );
        match &records[2] {
            RawRecord::Json(record) => {
                assert_eq!(record.arrival_epoch, 1_700_000_400);
                assert_eq!(record.direction_id, None);
            }
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn records_envelope_reads_nested_fields() {
        let payload = json!({
            "records": [
                { "recordid": "a", "fields": { "lin": "S1", "arrival": 1_700_000_000,
                  "destination": "Terrassa", "trip_name": "Rambla" } }
            ]
        });
        let records = extract_records(&payload, &fields()).unwrap();
        match &records[..] {
            [RawRecord::Json(record)] => assert_eq!(record.text, "Terrassa Rambla"),
            other => panic!("unexpected records {other:?}"),
        }
    }

    #[test]
    fn unknown_envelope_is_a_decode_error() {
        let payload = json!({ "error": "dataset not found" });
        assert!(matches!(
            extract_records(&payload, &fields()),
            Err(FetchError::DecodeError(_))
        ));
    }

    #[test]
    fn direction_flag_must_be_zero_or_one() {
        assert_eq!(direction_flag(&json!(0)), Some(0));
        assert_eq!(direction_flag(&json!("1")), Some(1));
        assert_eq!(direction_flag(&json!(2)), None);
        assert_eq!(direction_flag(&json!("north")), None);
    }

    #[test]
    fn stop_id_is_substituted_into_query() {
        let mut config = JsonSourceConfig {
            url: "https://example.org/records".into(),
            stop_id: None,
            timeout_secs: 5,
            query: Default::default(),
            limit: 20,
            route_field: "lin".into(),
            arrival_field: "arrival".into(),
            direction_field: None,
            text_fields: vec![],
        };
        config
            .query
            .insert("refine".into(), "stop_id:{stop_id}".into());
        let feed = JsonFeed::new(&config).unwrap();

        assert_eq!(
            feed.query_for("70037"),
            vec![
                ("refine".to_string(), "stop_id:70037".to_string()),
                ("limit".to_string(), "20".to_string()),
            ]
        );
    }
}
