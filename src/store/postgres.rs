use super::Store;
use crate::db::models::{
    AlertEvent, AlertRule, Camera, CameraEvent, CameraKey, CollectionLog, DailyUsage,
    DeliveryRecord, DeliveryStatus, DeviceStatus, Gateway, Incident, IncidentTransition,
    PendingDelivery, Tag, Upserted, WebhookSubscription,
};
use crate::db::repositories::{
    AlertsRepository, CameraEventsRepository, CollectionLogsRepository, DevicesRepository,
    IncidentsRepository, WebhooksRepository,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// PostgreSQL-backed store delegating to one repository per aggregate
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<PgPool>,
    devices: DevicesRepository,
    logs: CollectionLogsRepository,
    camera_events: CameraEventsRepository,
    alerts: AlertsRepository,
    incidents: IncidentsRepository,
    webhooks: WebhooksRepository,
}

impl PgStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            devices: DevicesRepository::new(pool.clone()),
            logs: CollectionLogsRepository::new(pool.clone()),
            camera_events: CameraEventsRepository::new(pool.clone()),
            alerts: AlertsRepository::new(pool.clone()),
            incidents: IncidentsRepository::new(pool.clone()),
            webhooks: WebhooksRepository::new(pool.clone()),
            pool,
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<()> {
        crate::db::ping(&self.pool).await
    }

    async fn upsert_gateway(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Gateway>> {
        self.devices.upsert_gateway(mac, seen_at).await
    }

    async fn set_gateway_status(&self, id: Uuid, status: DeviceStatus) -> Result<()> {
        self.devices.set_gateway_status(id, status).await
    }

    async fn list_gateways(&self) -> Result<Vec<Gateway>> {
        self.devices.list_gateways().await
    }

    async fn upsert_tag(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Tag>> {
        self.devices.upsert_tag(mac, seen_at).await
    }

    async fn list_tags(&self) -> Result<Vec<Tag>> {
        self.devices.list_tags().await
    }

    async fn upsert_camera(
        &self,
        key: &CameraKey,
        status: DeviceStatus,
        info: Option<serde_json::Value>,
        seen_at: DateTime<Utc>,
    ) -> Result<Upserted<Camera>> {
        self.devices.upsert_camera(key, status, info, seen_at).await
    }

    async fn upsert_collector(
        &self,
        tenant: &str,
        building: &str,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        self.devices.upsert_collector(tenant, building, status, seen_at).await
    }

    async fn append_collection_log(&self, log: &CollectionLog) -> Result<()> {
        self.logs.append(log).await
    }

    async fn collection_logs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CollectionLog>> {
        self.logs.get_before(cutoff).await
    }

    async fn apply_rollup(&self, usage: &[DailyUsage], log_ids: &[Uuid]) -> Result<u64> {
        self.logs.apply_rollup(usage, log_ids).await
    }

    async fn append_camera_event(&self, event: &CameraEvent) -> Result<CameraEvent> {
        self.camera_events.append(event).await
    }

    async fn enabled_rules(&self) -> Result<Vec<AlertRule>> {
        self.alerts.get_enabled_rules().await
    }

    async fn insert_alert_event(&self, event: &AlertEvent) -> Result<()> {
        self.alerts.create_event(event).await
    }

    async fn last_alert_at(&self, rule_id: Uuid, subject: &str) -> Result<Option<DateTime<Utc>>> {
        self.alerts.last_fired_at(rule_id, subject).await
    }

    async fn insert_incident(&self, incident: &Incident, transition: &IncidentTransition) -> Result<()> {
        self.incidents.create(incident, transition).await
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        self.incidents.get_by_id(id).await
    }

    async fn find_open_rule_incident(
        &self,
        rule_id: Uuid,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        self.incidents.find_open_for_rule(rule_id, subject, since).await
    }

    async fn find_incident_by_camera_event(&self, camera_event_id: Uuid) -> Result<Option<Incident>> {
        self.incidents.find_by_camera_event(camera_event_id).await
    }

    async fn update_incident(
        &self,
        incident: &Incident,
        expected_version: i32,
        transition: Option<&IncidentTransition>,
    ) -> Result<bool> {
        self.incidents.update(incident, expected_version, transition).await
    }

    async fn incident_transitions(&self, incident_id: Uuid) -> Result<Vec<IncidentTransition>> {
        self.incidents.get_transitions(incident_id).await
    }

    async fn active_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
        self.webhooks.get_active().await
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.webhooks.record_delivery(record).await
    }

    async fn delivery_records(&self, status: Option<DeliveryStatus>, limit: i64) -> Result<Vec<DeliveryRecord>> {
        self.webhooks.get_deliveries(status, limit).await
    }

    async fn stash_pending(&self, pending: &[PendingDelivery]) -> Result<()> {
        self.webhooks.stash_pending(pending).await
    }

    async fn take_pending(&self) -> Result<Vec<PendingDelivery>> {
        self.webhooks.take_pending().await
    }
}
