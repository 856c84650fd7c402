use super::Store;
use crate::db::models::{
    AlertEvent, AlertRule, Camera, CameraEvent, CameraKey, CollectionLog, Collector, DailyUsage,
    DeliveryRecord, DeliveryStatus, DeviceStatus, Gateway, Incident, IncidentStatus,
    IncidentTransition, PendingDelivery, Tag, Upserted, WebhookSubscription,
};
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    gateways: HashMap<String, Gateway>,
    tags: HashMap<String, Tag>,
    cameras: HashMap<CameraKey, Camera>,
    collectors: HashMap<(String, String), Collector>,
    collection_logs: Vec<CollectionLog>,
    daily_usage: HashMap<(Uuid, Uuid, NaiveDate), DailyUsage>,
    camera_events: Vec<CameraEvent>,
    rules: Vec<AlertRule>,
    alert_events: Vec<AlertEvent>,
    incidents: HashMap<Uuid, Incident>,
    transitions: Vec<IncidentTransition>,
    subscriptions: Vec<WebhookSubscription>,
    deliveries: Vec<DeliveryRecord>,
    pending: Vec<PendingDelivery>,
    faults: Vec<Fault>,
}

impl Tables {
    fn take_fault(&mut self, fault: Fault) -> bool {
        match self.faults.iter().position(|f| *f == fault) {
            Some(index) => {
                self.faults.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Store operation that can be made to fail once, for exercising error paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// `apply_rollup` fails after its usage rows were staged
    Rollup,
    /// `enabled_rules` fails
    RuleLoad,
}

/// In-process store with the same semantics as the PostgreSQL one
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_rule(&self, rule: AlertRule) {
        self.tables.write().await.rules.push(rule);
    }

    pub async fn insert_subscription(&self, subscription: WebhookSubscription) {
        self.tables.write().await.subscriptions.push(subscription);
    }

    pub async fn collection_logs(&self) -> Vec<CollectionLog> {
        self.tables.read().await.collection_logs.clone()
    }

    pub async fn camera_events(&self) -> Vec<CameraEvent> {
        self.tables.read().await.camera_events.clone()
    }

    pub async fn alert_events(&self) -> Vec<AlertEvent> {
        self.tables.read().await.alert_events.clone()
    }

    pub async fn incidents(&self) -> Vec<Incident> {
        let tables = self.tables.read().await;
        let mut incidents: Vec<_> = tables.incidents.values().cloned().collect();
        incidents.sort_by_key(|i| i.created_at);
        incidents
    }

    pub async fn cameras(&self) -> Vec<Camera> {
        self.tables.read().await.cameras.values().cloned().collect()
    }

    pub async fn collectors(&self) -> Vec<Collector> {
        self.tables.read().await.collectors.values().cloned().collect()
    }

    pub async fn daily_usage(&self) -> Vec<DailyUsage> {
        self.tables.read().await.daily_usage.values().cloned().collect()
    }

    pub async fn pending(&self) -> Vec<PendingDelivery> {
        self.tables.read().await.pending.clone()
    }

    /// Backdate a gateway's liveness, used to simulate silence
    /// Make the next call of the given operation fail
    pub async fn fail_next(&self, fault: Fault) {
        self.tables.write().await.faults.push(fault);
    }

    pub async fn set_gateway_last_seen(&self, mac: &str, at: DateTime<Utc>) {
        if let Some(gateway) = self.tables.write().await.gateways.get_mut(mac) {
            gateway.last_seen_at = Some(at);
        }
    }

    pub async fn set_tag_last_seen(&self, mac: &str, at: DateTime<Utc>) {
        if let Some(tag) = self.tables.write().await.tags.get_mut(mac) {
            tag.last_seen_at = Some(at);
        }
    }
}

fn latest(current: Option<DateTime<Utc>>, seen_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(current.map_or(seen_at, |c| c.max(seen_at)))
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert_gateway(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Gateway>> {
        let mut tables = self.tables.write().await;
        if let Some(gateway) = tables.gateways.get_mut(mac) {
            gateway.last_seen_at = latest(gateway.last_seen_at, seen_at);
            gateway.status = DeviceStatus::Online;
            gateway.updated_at = Utc::now();
            return Ok(Upserted { record: gateway.clone(), created: false });
        }
        let gateway = Gateway::new(mac, seen_at);
        tables.gateways.insert(mac.to_string(), gateway.clone());
        Ok(Upserted { record: gateway, created: true })
    }

    async fn set_gateway_status(&self, id: Uuid, status: DeviceStatus) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(gateway) = tables.gateways.values_mut().find(|g| g.id == id) {
            gateway.status = status;
            gateway.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_gateways(&self) -> Result<Vec<Gateway>> {
        Ok(self.tables.read().await.gateways.values().cloned().collect())
    }

    async fn upsert_tag(&self, mac: &str, seen_at: DateTime<Utc>) -> Result<Upserted<Tag>> {
        let mut tables = self.tables.write().await;
        if let Some(tag) = tables.tags.get_mut(mac) {
            tag.last_seen_at = latest(tag.last_seen_at, seen_at);
            return Ok(Upserted { record: tag.clone(), created: false });
        }
        let tag = Tag::new(mac, seen_at);
        tables.tags.insert(mac.to_string(), tag.clone());
        Ok(Upserted { record: tag, created: true })
    }

    async fn list_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.tables.read().await.tags.values().cloned().collect())
    }

    async fn upsert_camera(
        &self,
        key: &CameraKey,
        status: DeviceStatus,
        info: Option<serde_json::Value>,
        seen_at: DateTime<Utc>,
    ) -> Result<Upserted<Camera>> {
        let mut tables = self.tables.write().await;
        if let Some(camera) = tables.cameras.get_mut(key) {
            camera.last_seen_at = latest(camera.last_seen_at, seen_at);
            camera.status = status;
            if let Some(info) = info {
                camera.info = Some(sqlx::types::Json(info));
            }
            camera.updated_at = Utc::now();
            return Ok(Upserted { record: camera.clone(), created: false });
        }
        let mut camera = Camera::new(key, seen_at);
        camera.status = status;
        camera.info = info.map(sqlx::types::Json);
        tables.cameras.insert(key.clone(), camera.clone());
        Ok(Upserted { record: camera, created: true })
    }

    async fn upsert_collector(
        &self,
        tenant: &str,
        building: &str,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        let collector = tables
            .collectors
            .entry((tenant.to_string(), building.to_string()))
            .or_insert_with(|| Collector {
                id: Uuid::new_v4(),
                tenant: tenant.to_string(),
                building: building.to_string(),
                status,
                last_seen_at: None,
            });
        collector.status = status;
        collector.last_seen_at = latest(collector.last_seen_at, seen_at);
        Ok(())
    }

    async fn append_collection_log(&self, log: &CollectionLog) -> Result<()> {
        self.tables.write().await.collection_logs.push(log.clone());
        Ok(())
    }

    async fn collection_logs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CollectionLog>> {
        let tables = self.tables.read().await;
        let mut logs: Vec<_> = tables
            .collection_logs
            .iter()
            .filter(|log| log.recorded_at < cutoff)
            .cloned()
            .collect();
        logs.sort_by_key(|log| log.recorded_at);
        Ok(logs)
    }

    async fn apply_rollup(&self, usage: &[DailyUsage], log_ids: &[Uuid]) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let mut staged = tables.daily_usage.clone();
        for row in usage {
            staged
                .entry((row.tag_id, row.gateway_id, row.day))
                .and_modify(|existing| {
                    existing.dwell_seconds += row.dwell_seconds;
                    existing.sessions += row.sessions;
                    existing.samples += row.samples;
                })
                .or_insert_with(|| row.clone());
        }

        if tables.take_fault(Fault::Rollup) {
            return Err(Error::Database("Failed to purge collection logs".to_string()).into());
        }

        let before = tables.collection_logs.len();
        let purged: HashSet<&Uuid> = log_ids.iter().collect();
        tables.collection_logs.retain(|log| !purged.contains(&log.id));
        tables.daily_usage = staged;
        Ok((before - tables.collection_logs.len()) as u64)
    }

    async fn append_camera_event(&self, event: &CameraEvent) -> Result<CameraEvent> {
        let mut tables = self.tables.write().await;
        if let Some(external_id) = &event.external_id {
            if let Some(existing) = tables.camera_events.iter().find(|e| {
                e.camera_id == event.camera_id && e.external_id.as_ref() == Some(external_id)
            }) {
                return Ok(existing.clone());
            }
        }
        tables.camera_events.push(event.clone());
        Ok(event.clone())
    }

    async fn enabled_rules(&self) -> Result<Vec<AlertRule>> {
        let mut tables = self.tables.write().await;
        if tables.take_fault(Fault::RuleLoad) {
            return Err(Error::Database("Failed to load alert rules".to_string()).into());
        }
        Ok(tables.rules.iter().filter(|r| r.enabled).cloned().collect())
    }

    async fn insert_alert_event(&self, event: &AlertEvent) -> Result<()> {
        self.tables.write().await.alert_events.push(event.clone());
        Ok(())
    }

    async fn last_alert_at(&self, rule_id: Uuid, subject: &str) -> Result<Option<DateTime<Utc>>> {
        let tables = self.tables.read().await;
        Ok(tables
            .alert_events
            .iter()
            .filter(|e| e.rule_id == rule_id && e.subject == subject)
            .map(|e| e.fired_at)
            .max())
    }

    async fn insert_incident(&self, incident: &Incident, transition: &IncidentTransition) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.incidents.insert(incident.id, incident.clone());
        tables.transitions.push(transition.clone());
        Ok(())
    }

    async fn get_incident(&self, id: Uuid) -> Result<Option<Incident>> {
        Ok(self.tables.read().await.incidents.get(&id).cloned())
    }

    async fn find_open_rule_incident(
        &self,
        rule_id: Uuid,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        let tables = self.tables.read().await;
        Ok(tables
            .incidents
            .values()
            .filter(|i| {
                i.rule_id == Some(rule_id)
                    && i.subject.as_deref() == Some(subject)
                    && i.status != IncidentStatus::Resolved
                    && i.created_at >= since
            })
            .max_by_key(|i| i.created_at)
            .cloned())
    }

    async fn find_incident_by_camera_event(&self, camera_event_id: Uuid) -> Result<Option<Incident>> {
        let tables = self.tables.read().await;
        Ok(tables
            .incidents
            .values()
            .find(|i| i.camera_event_id == Some(camera_event_id))
            .cloned())
    }

    async fn update_incident(
        &self,
        incident: &Incident,
        expected_version: i32,
        transition: Option<&IncidentTransition>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.incidents.get_mut(&incident.id) {
            Some(current) if current.version == expected_version => {
                *current = incident.clone();
            }
            _ => return Ok(false),
        }
        if let Some(transition) = transition {
            tables.transitions.push(transition.clone());
        }
        Ok(true)
    }

    async fn incident_transitions(&self, incident_id: Uuid) -> Result<Vec<IncidentTransition>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transitions
            .iter()
            .filter(|t| t.incident_id == incident_id)
            .cloned()
            .collect())
    }

    async fn active_subscriptions(&self) -> Result<Vec<WebhookSubscription>> {
        let tables = self.tables.read().await;
        Ok(tables.subscriptions.iter().filter(|s| s.active).cloned().collect())
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.tables.write().await.deliveries.push(record.clone());
        Ok(())
    }

    async fn delivery_records(&self, status: Option<DeliveryStatus>, limit: i64) -> Result<Vec<DeliveryRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<_> = tables
            .deliveries
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }

    async fn stash_pending(&self, pending: &[PendingDelivery]) -> Result<()> {
        self.tables.write().await.pending.extend_from_slice(pending);
        Ok(())
    }

    async fn take_pending(&self) -> Result<Vec<PendingDelivery>> {
        Ok(std::mem::take(&mut self.tables.write().await.pending))
    }
}
