use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

/// Raw proximity reading. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CollectionLog {
    pub id: Uuid,
    pub tag_id: Uuid,
    pub gateway_id: Uuid,
    pub rssi: i32,
    pub recorded_at: DateTime<Utc>,
}

impl CollectionLog {
    pub fn new(tag_id: Uuid, gateway_id: Uuid, rssi: i32, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tag_id,
            gateway_id,
            rssi,
            recorded_at,
        }
    }
}

/// Camera analytic event. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CameraEvent {
    pub id: Uuid,
    pub camera_id: Uuid,
    pub analytic: String,
    /// Event id reported by the collector, used to recognise redeliveries
    pub external_id: Option<String>,
    pub payload: Json<serde_json::Value>,
    pub media_refs: Vec<String>,
    pub occurred_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Per (tag, gateway, day) presence rollup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DailyUsage {
    pub tag_id: Uuid,
    pub gateway_id: Uuid,
    pub day: NaiveDate,
    pub dwell_seconds: i64,
    pub sessions: i32,
    pub samples: i64,
}
