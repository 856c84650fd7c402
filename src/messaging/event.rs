use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Event types carried on the incident and alert streams
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    // Incident lifecycle stream
    IncidentCreated,
    IncidentAcknowledged,
    IncidentResolved,
    IncidentMediaAttached,

    // Alert stream
    AlertFired,
    GatewayOffline,
    GatewayOnline,

    // System events
    SystemStartup,
    SystemShutdown,

    // Custom event
    Custom(String),
}

impl EventType {
    /// True for events on the incident lifecycle stream
    pub fn is_incident(&self) -> bool {
        matches!(
            self,
            Self::IncidentCreated
                | Self::IncidentAcknowledged
                | Self::IncidentResolved
                | Self::IncidentMediaAttached
        )
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncidentCreated => write!(f, "incident.created"),
            Self::IncidentAcknowledged => write!(f, "incident.acknowledged"),
            Self::IncidentResolved => write!(f, "incident.resolved"),
            Self::IncidentMediaAttached => write!(f, "incident.media_attached"),
            Self::AlertFired => write!(f, "alert.fired"),
            Self::GatewayOffline => write!(f, "alert.gateway_offline"),
            Self::GatewayOnline => write!(f, "alert.gateway_online"),
            Self::SystemStartup => write!(f, "system.startup"),
            Self::SystemShutdown => write!(f, "system.shutdown"),
            Self::Custom(name) => write!(f, "custom.{}", name),
        }
    }
}

/// Event message structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMessage {
    /// Unique event ID
    pub id: Uuid,
    /// Event type
    pub event_type: EventType,
    /// Event source ID (incident, alert event or gateway)
    pub source_id: Option<Uuid>,
    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Event data payload
    pub payload: serde_json::Value,
}

impl EventMessage {
    /// Create a new event message
    pub fn new<T: Serialize>(
        event_type: EventType,
        source_id: Option<Uuid>,
        payload: T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type,
            source_id,
            timestamp: chrono::Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create a new event message with empty payload
    pub fn new_empty(event_type: EventType, source_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            source_id,
            timestamp: chrono::Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    /// Get the routing key for the event
    pub fn routing_key(&self) -> String {
        match &self.source_id {
            Some(id) => format!("{}.{}", self.event_type, id),
            None => self.event_type.to_string(),
        }
    }

    /// Body sent to webhook subscribers
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({
            "event_id": self.id,
            "event_type": self.event_type.to_string(),
            "timestamp": self.timestamp.to_rfc3339(),
            "payload": self.payload,
        })
    }
}

/// Receiver of finalized incident and alert events.
///
/// `emit` never blocks the caller; the dispatcher applies its own overflow policy.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EventMessage);
}
