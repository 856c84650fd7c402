use crate::db::models::{AlertEvent, AlertRule, Gateway, Incident};
use crate::messaging::event::{EventMessage, EventSink, EventType};
use log::{info, warn};
use std::sync::Arc;

/// Helper for emitting incident and alert stream events
#[derive(Clone)]
pub struct LifecycleEvents {
    sink: Arc<dyn EventSink>,
}

impl LifecycleEvents {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    fn emit(&self, event_type: EventType, source_id: Option<uuid::Uuid>, payload: serde_json::Value) {
        match EventMessage::new(event_type.clone(), source_id, payload) {
            Ok(event) => self.sink.emit(event),
            Err(e) => warn!("Failed to build {} event: {}", event_type, e),
        }
    }

    /// Publish an incident lifecycle event carrying the incident snapshot
    pub fn incident(&self, event_type: EventType, incident: &Incident, actor: &str) {
        let payload = serde_json::json!({
            "incident_id": incident.id.to_string(),
            "title": incident.title,
            "status": incident.status,
            "source": incident.source,
            "severity": incident.severity,
            "rule_id": incident.rule_id,
            "subject": incident.subject,
            "alert_event_id": incident.alert_event_id,
            "camera_event_id": incident.camera_event_id,
            "media_refs": incident.media_refs,
            "due_at": incident.due_at.to_rfc3339(),
            "actor": actor,
        });

        self.emit(event_type.clone(), Some(incident.id), payload);
        info!("Published {} for incident {}", event_type, incident.id);
    }

    pub fn alert_fired(&self, alert: &AlertEvent, rule: &AlertRule) {
        let payload = serde_json::json!({
            "alert_event_id": alert.id.to_string(),
            "rule_id": rule.id.to_string(),
            "rule_name": rule.name,
            "subject": alert.subject,
            "severity": alert.severity,
            "trigger": alert.trigger.0,
            "fired_at": alert.fired_at.to_rfc3339(),
        });

        self.emit(EventType::AlertFired, Some(alert.id), payload);
    }

    pub fn gateway_offline(&self, gateway: &Gateway, silent_secs: i64) {
        let payload = serde_json::json!({
            "gateway_id": gateway.id.to_string(),
            "mac_address": gateway.mac_address,
            "last_seen_at": gateway.last_seen_at.map(|t| t.to_rfc3339()),
            "silent_secs": silent_secs,
        });

        self.emit(EventType::GatewayOffline, Some(gateway.id), payload);
        info!("Gateway {} went offline", gateway.mac_address);
    }

    pub fn gateway_online(&self, gateway: &Gateway) {
        let payload = serde_json::json!({
            "gateway_id": gateway.id.to_string(),
            "mac_address": gateway.mac_address,
            "last_seen_at": gateway.last_seen_at.map(|t| t.to_rfc3339()),
        });

        self.emit(EventType::GatewayOnline, Some(gateway.id), payload);
        info!("Gateway {} is back online", gateway.mac_address);
    }
}

/// Sink that keeps every event in memory
#[cfg(test)]
#[derive(Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<EventMessage>>,
}

#[cfg(test)]
impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EventMessage> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn of_type(&self, event_type: &EventType) -> Vec<EventMessage> {
        self.events()
            .into_iter()
            .filter(|e| &e.event_type == event_type)
            .collect()
    }
}

#[cfg(test)]
impl EventSink for CollectingSink {
    fn emit(&self, event: EventMessage) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
