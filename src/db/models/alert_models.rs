use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[sqlx(type_name = "alert_severity", rename_all = "lowercase")]
pub enum Severity {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "critical")]
    Critical,
}

impl Severity {
    /// Minutes allowed before an incident of this severity is overdue
    pub fn sla_minutes(&self) -> i32 {
        match self {
            Self::Critical => 15,
            Self::High => 60,
            Self::Medium => 240,
            Self::Low => 1440,
        }
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Structural match pattern. Every present field must equal the record's field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparison {
    Below,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbsenceTarget {
    #[default]
    Tag,
    Gateway,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// RSSI crosses a threshold for a number of consecutive samples
    Threshold {
        comparison: Comparison,
        rssi: i32,
        #[serde(default = "default_consecutive")]
        consecutive: u32,
    },
    /// No reading from the subject within the window. Evaluated by the sweep.
    Absence {
        window_secs: i64,
        #[serde(default)]
        target: AbsenceTarget,
    },
    /// Camera event of the given analytic type
    AnalyticMatch { analytic: String },
    /// Open presence session lasting at least this long
    Dwell { max_seconds: i64 },
    /// Tag entered a scoped gateway's sector. Fires once per presence session.
    Presence,
}

fn default_consecutive() -> u32 {
    1
}

/// Rule definition. Read-only to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertRule {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub scope: Json<RuleScope>,
    pub condition: Json<RuleCondition>,
    pub severity: Severity,
    pub auto_incident: bool,
    pub cooldown_secs: i64,
    pub title_template: Option<String>,
}

impl AlertRule {
    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs.max(0))
    }
}

/// Immutable record of a rule firing
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertEvent {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub subject: String,
    pub severity: Severity,
    /// Reference to the triggering reading or event
    pub trigger: Json<serde_json::Value>,
    pub fired_at: DateTime<Utc>,
}
