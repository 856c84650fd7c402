use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use crate::messaging::event::EventMessage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "subscription_kind", rename_all = "lowercase")]
pub enum SubscriptionKind {
    #[serde(rename = "webhook")]
    Webhook,
    #[serde(rename = "chat")]
    Chat,
}

/// Outbound notification target. Read-only to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub name: String,
    pub kind: SubscriptionKind,
    pub target_url: String,
    /// Empty means every event
    pub event_types: Vec<String>,
    pub secret: Option<String>,
    pub active: bool,
}

impl WebhookSubscription {
    /// Exact match, `stream.*` wildcard, or `*`
    pub fn accepts(&self, event_type: &str) -> bool {
        if self.event_types.is_empty() {
            return true;
        }
        self.event_types.iter().any(|filter| {
            if filter == "*" || filter == event_type {
                return true;
            }
            match filter.strip_suffix(".*") {
                Some(prefix) => event_type
                    .strip_prefix(prefix)
                    .map_or(false, |rest| rest.starts_with('.')),
                None => false,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "delivery_status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[serde(rename = "delivered")]
    Delivered,
    #[serde(rename = "dead_lettered")]
    DeadLettered,
}

/// Final outcome of one (event, subscription) delivery
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub event_type: String,
    pub status: DeliveryStatus,
    pub attempts: i32,
    pub last_status_code: Option<i32>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Delivery stashed at shutdown and re-enqueued on the next start
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingDelivery {
    pub id: Uuid,
    /// None when the event had not yet been fanned out to subscriptions
    pub subscription_id: Option<Uuid>,
    pub event: Json<EventMessage>,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}
