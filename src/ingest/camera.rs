use crate::db::models::DeviceStatus;
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

const TIMESTAMP_FIELDS: [&str; 3] = ["Timestamp", "timestamp", "dateTime"];
const MEDIA_FIELDS: [&str; 6] = [
    "snapshot_url",
    "image_url",
    "snapshot",
    "snapshot_path",
    "image_path",
    "thumbnail_url",
];
const EXTERNAL_ID_FIELDS: [&str; 3] = ["eventId", "EventID", "event_id"];
const PERSON_FIELDS: [&str; 3] = ["personName", "person_name", "name"];

/// Decoded analytic event body
#[derive(Debug, Clone, PartialEq)]
pub struct CameraEventPayload {
    pub body: Value,
    pub occurred_at: DateTime<Utc>,
    pub external_id: Option<String>,
    pub media_refs: Vec<String>,
    /// Recognised person, when the analytic reports one
    pub person: Option<String>,
}

fn parse_object(payload: &[u8]) -> Result<Map<String, Value>> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Parse("camera payload is not a JSON object".to_string()).into()),
        Err(e) => Err(Error::Parse(format!("malformed camera JSON: {}", e)).into()),
    }
}

fn string_field(body: &Map<String, Value>, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|f| match body.get(*f) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// RFC 3339 string or epoch seconds/milliseconds
fn timestamp_field(body: &Map<String, Value>) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS.iter().find_map(|f| match body.get(*f)? {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            if raw > 100_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    })
}

pub fn parse_event(payload: &[u8], received_at: DateTime<Utc>) -> Result<CameraEventPayload> {
    let body = parse_object(payload)?;

    let mut media_refs = Vec::new();
    for field in MEDIA_FIELDS {
        if let Some(Value::String(reference)) = body.get(field) {
            if !reference.is_empty() && !media_refs.contains(reference) {
                media_refs.push(reference.clone());
            }
        }
    }

    Ok(CameraEventPayload {
        occurred_at: timestamp_field(&body).unwrap_or(received_at),
        external_id: string_field(&body, &EXTERNAL_ID_FIELDS),
        person: string_field(&body, &PERSON_FIELDS),
        media_refs,
        body: Value::Object(body),
    })
}

/// Camera and collector status. Missing status means online.
pub fn parse_status(payload: &[u8]) -> Result<DeviceStatus> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Ok(DeviceStatus::Online);
    }
    let body = parse_object(payload)?;
    let status = match body.get("status").or_else(|| body.get("state")) {
        None => DeviceStatus::Online,
        Some(Value::Bool(online)) => {
            if *online {
                DeviceStatus::Online
            } else {
                DeviceStatus::Offline
            }
        }
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "offline" | "disconnected" | "down" => DeviceStatus::Offline,
            _ => DeviceStatus::Online,
        },
        Some(other) => {
            return Err(Error::Parse(format!("unsupported status value {}", other)).into());
        }
    };
    Ok(status)
}

pub fn parse_info(payload: &[u8]) -> Result<Value> {
    parse_object(payload).map(Value::Object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_fields_are_extracted() -> Result<()> {
        let received = Utc::now();
        let event = parse_event(
            br#"{"Timestamp":"2024-05-01T08:30:00Z","eventId":"evt-1","personName":"Dana",
                 "snapshot_url":"https://media/s.jpg","thumbnail_url":"https://media/t.jpg",
                 "image_url":"https://media/s.jpg"}"#,
            received,
        )?;
        assert_eq!(event.occurred_at.to_rfc3339(), "2024-05-01T08:30:00+00:00");
        assert_eq!(event.external_id.as_deref(), Some("evt-1"));
        assert_eq!(event.person.as_deref(), Some("Dana"));
        assert_eq!(event.media_refs, vec!["https://media/s.jpg", "https://media/t.jpg"]);
        Ok(())
    }

    #[test]
    fn missing_timestamp_uses_receive_time() -> Result<()> {
        let received = Utc::now();
        let event = parse_event(br#"{"score": 0.9}"#, received)?;
        assert_eq!(event.occurred_at, received);
        assert!(event.external_id.is_none());

        let event = parse_event(br#"{"timestamp": 1714552200000}"#, received)?;
        assert_eq!(event.occurred_at.timestamp(), 1_714_552_200);
        Ok(())
    }

    #[test]
    fn malformed_event_is_parse_error() {
        let err = parse_event(b"nope", Utc::now()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Parse(_))));
    }

    #[test]
    fn status_values() -> Result<()> {
        assert_eq!(parse_status(b"")?, DeviceStatus::Online);
        assert_eq!(parse_status(br#"{"status":"OFFLINE"}"#)?, DeviceStatus::Offline);
        assert_eq!(parse_status(br#"{"state":false}"#)?, DeviceStatus::Offline);
        assert_eq!(parse_status(br#"{"status":"online"}"#)?, DeviceStatus::Online);
        assert!(parse_status(br#"{"status":3}"#).is_err());
        Ok(())
    }
}
