//! Persistence contract consumed by the pipeline.
//!
//! Each method is a short, self-contained write or read. Nothing here holds a
//! lock across calls, so one slow subject cannot stall another.

use crate::db::models::{
    AlertEvent, AlertRule, Camera, CameraEvent, CameraKey, CollectionLog, DailyUsage,
    DeliveryRecord, DeliveryStatus, DeviceStatus, Gateway, Incident, IncidentTransition,
    PendingDelivery, Tag, Upserted, WebhookSubscription,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{Fault, MemoryStore};
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Round trip to the backing database, used by health reporting
    async fn ping(&self) -> Result<()>;

    /// Register the gateway if unseen, otherwise refresh `last_seen_at` and mark it online
    async fn upsert_gateway(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Gateway>>;
    async fn set_gateway_status(&self, id: Uuid, status: DeviceStatus) -> Result<()>;
    async fn list_gateways(&self) -> Result<Vec<Gateway>>;

    async fn upsert_tag(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Tag>>;
    async fn list_tags(&self) -> Result<Vec<Tag>>;

    async fn upsert_camera(
        &self,
        key: &CameraKey,
        status: DeviceStatus,
        info: Option<serde_json::Value>,
        seen_at: DateTime<Utc>,
    ) -> Result<Upserted<Camera>>;
    async fn upsert_collector(
        &self,
        tenant: &str,
        building: &str,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn append_collection_log(&self, log: &CollectionLog) -> Result<()>;
    async fn collection_logs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CollectionLog>>;
    /// Adds each row to any existing one for the same (tag, gateway, day) and deletes
    /// the listed logs. Either all of it lands or none of it does. Returns logs deleted.
    async fn apply_rollup(&self, usage: &[DailyUsage], log_ids: &[Uuid]) -> Result<u64>;

    /// Idempotent on (camera, external id); returns the stored event
    async fn append_camera_event(&self, event: &CameraEvent) -> Result<CameraEvent>;

    async fn enabled_rules(&self) -> Result<Vec<AlertRule>>;
    async fn insert_alert_event(&self, event: &AlertEvent) -> Result<()>;
    async fn last_alert_at(&self, rule_id: Uuid, subject: &str) -> Result<Option<DateTime<Utc>>>;

    /// Inserts the incident together with its creation transition
    async fn insert_incident(&self, incident: &Incident, transition: &IncidentTransition) -> Result<()>;
    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>>;
    /// Newest non-resolved incident for (rule, subject) created at or after `since`
    async fn find_open_rule_incident(
        &self,
        rule_id: Uuid,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Incident>>;
    async fn find_incident_by_camera_event(&self, camera_event_id: Uuid) -> Result<Option<Incident>>;
    /// Compare-and-set on `expected_version`. Returns false when another writer won.
    async fn update_incident(
        &self,
        incident: &Incident,
        expected_version: i32,
        transition: Option<&IncidentTransition>,
    ) -> Result<bool>;
    async fn incident_transitions(&self, incident_id: Uuid) -> Result<Vec<IncidentTransition>>;

    async fn active_subscriptions(&self) -> Result<Vec<WebhookSubscription>>;
    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()>;
    async fn delivery_records(&self, status: Option<DeliveryStatus>, limit: i64) -> Result<Vec<DeliveryRecord>>;
    async fn stash_pending(&self, pending: &[PendingDelivery]) -> Result<()>;
    /// Removes and returns every stashed delivery
    async fn take_pending(&self) -> Result<Vec<PendingDelivery>>;
}
