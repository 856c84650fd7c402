use super::camera::{self, CameraEventPayload};
use super::mac::normalize_mac;
use super::rtls;
use super::topic::{CameraTopicKind, Route, RtlsKind, TopicRouter};
use super::{InboundMessage, IngestStats};
use crate::alerts::{CameraContext, ReadingContext, RuleEngine};
use crate::config::IngestConfig;
use crate::db::models::{CameraEvent, CameraKey, DeviceStatus, Gateway, Severity};
use crate::error::Error;
use crate::incidents::{IncidentManager, NewIncident, SourceRef};
use crate::sessionizer::{PairKey, Sessionizer};
use crate::state::StateStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::ops::RangeInclusive;
use std::sync::Arc;

const FACE_CAPTURE_ACTOR: &str = "face-capture";

/// Applies one routed message to the state store, sessionizer, rule engine
/// and incident manager
pub struct MessageProcessor {
    router: TopicRouter,
    state: Arc<StateStore>,
    sessionizer: Arc<Sessionizer>,
    engine: Arc<RuleEngine>,
    incidents: Arc<IncidentManager>,
    stats: Arc<IngestStats>,
    face_capture_analytic: String,
    rssi_range: RangeInclusive<i32>,
}

impl MessageProcessor {
    pub fn new(
        router: TopicRouter,
        state: Arc<StateStore>,
        sessionizer: Arc<Sessionizer>,
        engine: Arc<RuleEngine>,
        incidents: Arc<IncidentManager>,
        stats: Arc<IngestStats>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            router,
            state,
            sessionizer,
            engine,
            incidents,
            stats,
            face_capture_analytic: config.face_capture_analytic.clone(),
            rssi_range: config.rssi_min..=config.rssi_max,
        }
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    pub async fn process(&self, route: &Route, message: &InboundMessage) -> Result<()> {
        match route {
            Route::Rtls { gateway, kind } => {
                let gateway = normalize_mac(gateway)
                    .ok_or_else(|| Error::Validation(format!("invalid gateway MAC {}", gateway)))?;
                match kind {
                    RtlsKind::Status => {
                        rtls::parse_status(&message.payload)?;
                        self.state.touch_gateway(&gateway, message.received_at).await?;
                        Ok(())
                    }
                    RtlsKind::Beacon => self.handle_beacon(&gateway, message).await,
                }
            }
            Route::Camera { key, kind } => match kind {
                CameraTopicKind::Status => {
                    let status = camera::parse_status(&message.payload)?;
                    self.state
                        .touch_camera(key, status, None, message.received_at)
                        .await?;
                    Ok(())
                }
                CameraTopicKind::Info => {
                    let info = camera::parse_info(&message.payload)?;
                    self.state
                        .touch_camera(key, DeviceStatus::Online, Some(info), message.received_at)
                        .await?;
                    Ok(())
                }
                CameraTopicKind::Event { analytic } => {
                    self.handle_camera_event(key, analytic, message).await
                }
            },
            Route::CollectorStatus { tenant, building } => {
                let status = camera::parse_status(&message.payload)?;
                self.state
                    .touch_collector(tenant, building, status, message.received_at)
                    .await
            }
            Route::Malformed { reason } => {
                Err(Error::Parse(format!("{}: {}", message.topic, reason)).into())
            }
            Route::Unrecognized => {
                debug!("Ignoring message on unrecognized topic {}", message.topic);
                Ok(())
            }
        }
    }

    async fn handle_beacon(&self, gateway_mac: &str, message: &InboundMessage) -> Result<()> {
        let batch = rtls::parse_beacon(&message.payload, message.received_at, &self.rssi_range)?;

        // liveness counts even when every reading is rejected
        let gateway = self.state.touch_gateway(gateway_mac, message.received_at).await?;

        for rejected in &batch.rejected {
            IngestStats::bump(&self.stats.rejected_readings);
            debug!(
                "Rejected reading {} on {}: {}",
                rejected.index, message.topic, rejected.error
            );
        }

        for reading in batch.readings {
            if let Err(e) = self
                .apply_reading(&gateway, &reading.tag_mac, reading.rssi, reading.at)
                .await
            {
                IngestStats::bump(&self.stats.rejected_readings);
                warn!(
                    "Failed to apply reading for {} via {}: {}",
                    reading.tag_mac, gateway.mac_address, e
                );
            }
        }
        Ok(())
    }

    async fn apply_reading(
        &self,
        gateway: &Gateway,
        tag_mac: &str,
        rssi: i32,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let tag = self.state.register_tag(tag_mac, at).await?;
        let log = self.state.record_reading(&tag, gateway, rssi, at).await?;
        IngestStats::bump(&self.stats.readings);

        let update = self
            .sessionizer
            .observe(&PairKey::new(&tag.mac_address, &gateway.mac_address), at);

        let ctx = ReadingContext {
            log_id: log.id,
            tag: tag.mac_address.clone(),
            gateway: gateway.mac_address.clone(),
            building: gateway.building_id.clone(),
            rssi,
            at,
            session: update.current().clone(),
        };
        if let Err(e) = self.engine.evaluate_reading(&ctx).await {
            IngestStats::bump(&self.stats.rule_failures);
            warn!(
                "Rule evaluation failed for {} via {}: {}",
                ctx.tag, ctx.gateway, e
            );
        }
        Ok(())
    }

    async fn handle_camera_event(
        &self,
        key: &CameraKey,
        analytic: &str,
        message: &InboundMessage,
    ) -> Result<()> {
        let payload = camera::parse_event(&message.payload, message.received_at)?;
        let camera = self
            .state
            .touch_camera(key, DeviceStatus::Online, None, message.received_at)
            .await?;
        let event = self
            .state
            .record_camera_event(&camera, analytic, &payload, message.received_at)
            .await?;
        IngestStats::bump(&self.stats.camera_events);

        let ctx = CameraContext {
            event_id: event.id,
            camera: key.clone(),
            analytic: analytic.to_string(),
            at: event.occurred_at,
        };
        if let Err(e) = self.engine.evaluate_camera_event(&ctx).await {
            IngestStats::bump(&self.stats.rule_failures);
            warn!("Rule evaluation failed for {} event on {}: {}", analytic, key, e);
        }

        if analytic == self.face_capture_analytic {
            self.raise_face_capture(key, &event, &payload).await?;
        }
        Ok(())
    }

    async fn raise_face_capture(
        &self,
        key: &CameraKey,
        event: &CameraEvent,
        payload: &CameraEventPayload,
    ) -> Result<()> {
        let title = match &payload.person {
            Some(person) => format!("[AUTO] Face capture: {} at {}", person, key.code),
            None => format!("[AUTO] Face capture at {}", key.code),
        };
        let new = NewIncident {
            title,
            description: Some(format!("Face capture reported by camera {}", key)),
            severity: Severity::High,
            source: SourceRef::FaceCapture {
                camera_event_id: event.id,
            },
            media_refs: event.media_refs.clone(),
            actor: FACE_CAPTURE_ACTOR.to_string(),
        };
        let outcome = self.incidents.create(new, event.occurred_at).await?;
        if outcome.is_created() {
            info!(
                "Face capture on {} raised incident {}",
                key,
                outcome.incident().id
            );
        }
        Ok(())
    }
}
