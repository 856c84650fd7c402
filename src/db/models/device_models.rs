use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Liveness status shared by gateways, cameras and collectors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "device_status", rename_all = "lowercase")]
pub enum DeviceStatus {
    #[serde(rename = "online")]
    Online,
    #[serde(rename = "offline")]
    Offline,
}

impl Display for DeviceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// RTLS gateway, keyed by its canonical MAC address
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Gateway {
    pub id: Uuid,
    pub mac_address: String,
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub tenant_id: Option<String>,
    pub building_id: Option<String>,
    pub floor_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Gateway {
    pub fn new(mac_address: &str, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mac_address: mac_address.to_string(),
            status: DeviceStatus::Online,
            last_seen_at: Some(seen_at),
            tenant_id: None,
            building_id: None,
            floor_id: None,
            created_at: seen_at,
            updated_at: seen_at,
        }
    }
}

/// Tracked beacon
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tag {
    pub id: Uuid,
    pub mac_address: String,
    pub person_id: Option<Uuid>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Tag {
    pub fn new(mac_address: &str, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mac_address: mac_address.to_string(),
            person_id: None,
            last_seen_at: Some(seen_at),
            created_at: seen_at,
        }
    }
}

/// Composite camera identity taken from the topic hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CameraKey {
    pub tenant: String,
    pub building: String,
    pub floor: String,
    pub code: String,
}

impl Display for CameraKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.tenant, self.building, self.floor, self.code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Camera {
    pub id: Uuid,
    pub tenant: String,
    pub building: String,
    pub floor: String,
    pub code: String,
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub info: Option<sqlx::types::Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Camera {
    pub fn new(key: &CameraKey, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant: key.tenant.clone(),
            building: key.building.clone(),
            floor: key.floor.clone(),
            code: key.code.clone(),
            status: DeviceStatus::Online,
            last_seen_at: Some(seen_at),
            info: None,
            created_at: seen_at,
            updated_at: seen_at,
        }
    }

    pub fn key(&self) -> CameraKey {
        CameraKey {
            tenant: self.tenant.clone(),
            building: self.building.clone(),
            floor: self.floor.clone(),
            code: self.code.clone(),
        }
    }
}

/// Building-level camera collector
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Collector {
    pub id: Uuid,
    pub tenant: String,
    pub building: String,
    pub status: DeviceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Result of an idempotent identity upsert
#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub record: T,
    /// True when this call registered a previously unseen identity
    pub created: bool,
}
