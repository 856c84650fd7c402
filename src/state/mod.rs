//! Canonical device identities and the append-only telemetry logs.
//!
//! Identities are registered on first sight and never duplicated; liveness
//! timestamps only move forward.

use crate::db::models::{
    Camera, CameraEvent, CameraKey, CollectionLog, DeviceStatus, Gateway, Tag, Upserted,
};
use crate::ingest::camera::CameraEventPayload;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::Serialize;
use sqlx::types::Json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub mod liveness;


pub use liveness::GatewayLivenessMonitor;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistrationStats {
    pub gateways: u64,
    pub tags: u64,
    pub cameras: u64,
}

pub struct StateStore {
    store: Arc<dyn Store>,
    gateways_registered: AtomicU64,
    tags_registered: AtomicU64,
    cameras_registered: AtomicU64,
}

impl StateStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            gateways_registered: AtomicU64::new(0),
            tags_registered: AtomicU64::new(0),
            cameras_registered: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Register or refresh a gateway. `mac` must already be canonical.
    pub async fn touch_gateway(&self, mac: &str, at: DateTime<Utc>) -> Result<Gateway> {
        let Upserted { record, created } = self.store.upsert_gateway(mac, at).await?;
        if created {
            self.gateways_registered.fetch_add(1, Ordering::Relaxed);
            info!("Auto-registered gateway {} ({})", record.mac_address, record.id);
        }
        Ok(record)
    }

    pub async fn register_tag(&self, mac: &str, at: DateTime<Utc>) -> Result<Tag> {
        let Upserted { record, created } = self.store.upsert_tag(mac, at).await?;
        if created {
            self.tags_registered.fetch_add(1, Ordering::Relaxed);
            debug!("Auto-registered tag {} ({})", record.mac_address, record.id);
        }
        Ok(record)
    }

    pub async fn touch_camera(
        &self,
        key: &CameraKey,
        status: DeviceStatus,
        info: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<Camera> {
        let Upserted { record, created } = self.store.upsert_camera(key, status, info, at).await?;
        if created {
            self.cameras_registered.fetch_add(1, Ordering::Relaxed);
            info!("Auto-registered camera {} ({})", key, record.id);
        }
        Ok(record)
    }

    pub async fn touch_collector(
        &self,
        tenant: &str,
        building: &str,
        status: DeviceStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.store.upsert_collector(tenant, building, status, at).await
    }

    pub async fn record_reading(
        &self,
        tag: &Tag,
        gateway: &Gateway,
        rssi: i32,
        at: DateTime<Utc>,
    ) -> Result<CollectionLog> {
        let log = CollectionLog::new(tag.id, gateway.id, rssi, at);
        self.store.append_collection_log(&log).await?;
        Ok(log)
    }

    /// Append a camera event. Redelivery of an event with a known external id
    /// returns the stored record instead of a new one.
    pub async fn record_camera_event(
        &self,
        camera: &Camera,
        analytic: &str,
        payload: &CameraEventPayload,
        received_at: DateTime<Utc>,
    ) -> Result<CameraEvent> {
        let event = CameraEvent {
            id: Uuid::new_v4(),
            camera_id: camera.id,
            analytic: analytic.to_string(),
            external_id: payload.external_id.clone(),
            payload: Json(payload.body.clone()),
            media_refs: payload.media_refs.clone(),
            occurred_at: payload.occurred_at,
            received_at,
        };
        self.store.append_camera_event(&event).await
    }

    pub fn registrations(&self) -> RegistrationStats {
        RegistrationStats {
            gateways: self.gateways_registered.load(Ordering::Relaxed),
            tags: self.tags_registered.load(Ordering::Relaxed),
            cameras: self.cameras_registered.load(Ordering::Relaxed),
        }
    }
}
