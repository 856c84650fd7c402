use super::alert_models::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "incident_status", rename_all = "lowercase")]
pub enum IncidentStatus {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "acknowledged")]
    Acknowledged,
    #[serde(rename = "resolved")]
    Resolved,
}

impl IncidentStatus {
    /// Forward-only transitions. Resolved is terminal.
    pub fn can_transition_to(&self, next: IncidentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Acknowledged)
                | (Self::Open, Self::Resolved)
                | (Self::Acknowledged, Self::Resolved)
        )
    }
}

impl Display for IncidentStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Acknowledged => write!(f, "acknowledged"),
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "incident_source", rename_all = "snake_case")]
pub enum IncidentSource {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "rule")]
    Rule,
    #[serde(rename = "face_capture")]
    FaceCapture,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Incident {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: IncidentStatus,
    pub source: IncidentSource,
    pub severity: Severity,
    pub rule_id: Option<Uuid>,
    pub subject: Option<String>,
    pub alert_event_id: Option<Uuid>,
    pub camera_event_id: Option<Uuid>,
    pub media_refs: Vec<String>,
    pub sla_minutes: i32,
    pub due_at: DateTime<Utc>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every write, used for optimistic concurrency
    pub version: i32,
}

/// Audit row for every incident state change
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IncidentTransition {
    pub id: Uuid,
    pub incident_id: Uuid,
    pub from_status: Option<IncidentStatus>,
    pub to_status: IncidentStatus,
    pub actor: String,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

impl IncidentTransition {
    pub fn new(
        incident_id: Uuid,
        from_status: Option<IncidentStatus>,
        to_status: IncidentStatus,
        actor: &str,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            incident_id,
            from_status,
            to_status,
            actor: actor.to_string(),
            note,
            at,
        }
    }
}
