use super::mac::normalize_mac;
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::ops::RangeInclusive;

const TAG_MAC_FIELDS: [&str; 4] = ["tag_mac", "tagMac", "mac", "tag"];
const RSSI_FIELDS: [&str; 2] = ["rssi", "RSSI"];

/// One accepted proximity sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconReading {
    pub tag_mac: String,
    pub rssi: i32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedReading {
    pub index: usize,
    pub error: Error,
}

#[derive(Debug, Clone, Default)]
pub struct BeaconBatch {
    pub readings: Vec<BeaconReading>,
    pub rejected: Vec<RejectedReading>,
}

fn parse_object(payload: &[u8]) -> Result<serde_json::Map<String, Value>> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Parse("payload is not a JSON object".to_string()).into()),
        Err(e) => Err(Error::Parse(format!("malformed JSON: {}", e)).into()),
    }
}

/// Status messages only carry liveness. An empty body is accepted.
pub fn parse_status(payload: &[u8]) -> Result<()> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }
    parse_object(payload).map(|_| ())
}

/// Decode `{"readings":[{"tag_mac": "...", "rssi": -60}]}`.
///
/// A missing tag MAC anywhere rejects the whole message; an invalid MAC, RSSI
/// or timestamp rejects only that reading.
pub fn parse_beacon(
    payload: &[u8],
    received_at: DateTime<Utc>,
    rssi_range: &RangeInclusive<i32>,
) -> Result<BeaconBatch> {
    let body = parse_object(payload)?;
    let readings = body
        .get("readings")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Parse("missing readings array".to_string()))?;

    let mut batch = BeaconBatch::default();
    for (index, raw) in readings.iter().enumerate() {
        let Some(reading) = raw.as_object() else {
            return Err(Error::Parse(format!("reading {} is not an object", index)).into());
        };
        let Some(tag_field) = TAG_MAC_FIELDS.iter().find_map(|f| reading.get(*f)) else {
            return Err(Error::Parse(format!("reading {} has no tag_mac", index)).into());
        };

        match validate_reading(tag_field, reading, received_at, rssi_range) {
            Ok(reading) => batch.readings.push(reading),
            Err(error) => batch.rejected.push(RejectedReading { index, error }),
        }
    }

    Ok(batch)
}

fn validate_reading(
    tag_field: &Value,
    reading: &serde_json::Map<String, Value>,
    received_at: DateTime<Utc>,
    rssi_range: &RangeInclusive<i32>,
) -> std::result::Result<BeaconReading, Error> {
    let tag_mac = tag_field
        .as_str()
        .and_then(normalize_mac)
        .ok_or_else(|| Error::Validation(format!("invalid tag MAC {}", tag_field)))?;

    let rssi_value = RSSI_FIELDS
        .iter()
        .find_map(|f| reading.get(*f))
        .ok_or_else(|| Error::Validation(format!("reading for {} has no rssi", tag_mac)))?;
    let rssi = rssi_value
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .filter(|v| rssi_range.contains(v))
        .ok_or_else(|| Error::Validation(format!("rssi {} out of range for {}", rssi_value, tag_mac)))?;

    let at = match reading.get("timestamp") {
        None | Some(Value::Null) => received_at,
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Validation(format!("bad timestamp {}: {}", raw, e)))?,
        Some(other) => {
            return Err(Error::Validation(format!("bad timestamp {}", other)));
        }
    };

    Ok(BeaconReading { tag_mac, rssi, at })
}
