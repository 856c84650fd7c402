use super::signing::sign;
use crate::db::models::{SubscriptionKind, WebhookSubscription};
use crate::error::Error;
use crate::messaging::event::EventMessage;
use anyhow::Result;
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::time::Duration;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "X-SV-Signature";
pub const WEBHOOK_ID_HEADER: &str = "X-SV-Webhook-Id";
pub const EVENT_TYPE_HEADER: &str = "X-SV-Event-Type";
pub const DELIVERY_ID_HEADER: &str = "X-SV-Delivery-Id";

/// One attempt at delivering an event to a subscription
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Stable across retries so receivers can de-duplicate
    pub delivery_id: Uuid,
    pub event: EventMessage,
    /// 1-based
    pub attempt: u32,
}

/// Sends a rendered event to one subscriber.
///
/// Returns the HTTP status code; transport failures are errors.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, subscription: &WebhookSubscription, request: &DeliveryRequest) -> Result<u16>;
}

/// Text posted to chat subscribers
pub fn render_chat_text(event: &EventMessage) -> String {
    let payload = &event.payload;
    let field = |name: &str| payload.get(name).and_then(Value::as_str);

    let mut text = match field("title") {
        Some(title) => format!("[{}] {}", event.event_type, title),
        None => match field("rule_name") {
            Some(rule) => format!("[{}] {} ({})", event.event_type, rule, field("subject").unwrap_or("-")),
            None => match field("mac_address") {
                Some(mac) => format!("[{}] gateway {}", event.event_type, mac),
                None => format!("[{}]", event.event_type),
            },
        },
    };
    if let Some(severity) = field("severity") {
        text.push_str(&format!("\nSeverity: {}", severity));
    }
    if let Some(status) = field("status") {
        text.push_str(&format!("\nStatus: {}", status));
    }
    if let Some(media) = payload.get("media_refs").and_then(Value::as_array) {
        for reference in media.iter().filter_map(Value::as_str) {
            text.push_str(&format!("\nFile: {}", reference));
        }
    }
    text
}

/// Request body for the subscription's kind
pub fn render_body(subscription: &WebhookSubscription, event: &EventMessage) -> Result<Vec<u8>> {
    let body = match subscription.kind {
        SubscriptionKind::Webhook => event.envelope(),
        SubscriptionKind::Chat => json!({
            "event_id": event.id,
            "event_type": event.event_type.to_string(),
            "text": render_chat_text(event),
        }),
    };
    Ok(serde_json::to_vec(&body).map_err(Error::from)?)
}

/// HTTP POST transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .build()
            .map_err(|e| Error::Delivery(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(&self, subscription: &WebhookSubscription, request: &DeliveryRequest) -> Result<u16> {
        let body = render_body(subscription, &request.event)?;

        let mut builder = self
            .client
            .post(&subscription.target_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(WEBHOOK_ID_HEADER, subscription.id.to_string())
            .header(EVENT_TYPE_HEADER, request.event.event_type.to_string())
            .header(DELIVERY_ID_HEADER, request.delivery_id.to_string());
        if let Some(secret) = subscription.secret.as_deref().filter(|s| !s.is_empty()) {
            builder = builder.header(SIGNATURE_HEADER, sign(secret, &body)?);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Delivery(format!("POST {} failed: {}", subscription.target_url, e)))?;

        let status = response.status().as_u16();
        debug!(
            "Delivery {} attempt {} to {} returned {}",
            request.delivery_id, request.attempt, subscription.name, status
        );
        Ok(status)
    }
}
