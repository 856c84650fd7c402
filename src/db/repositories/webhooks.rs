use crate::db::models::{DeliveryRecord, DeliveryStatus, PendingDelivery, WebhookSubscription};
use crate::error::Error;
use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;

/// Subscriptions, delivery outcomes and the shutdown outbox
#[derive(Clone)]
pub struct WebhooksRepository {
    pool: Arc<PgPool>,
}

impl WebhooksRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn get_active(&self) -> Result<Vec<WebhookSubscription>> {
        let result = sqlx::query_as::<_, WebhookSubscription>(
            r#"
            SELECT id, name, kind, target_url, event_types, secret, active
            FROM webhook_subscriptions
            WHERE active = TRUE
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load subscriptions: {}", e)))?;

        Ok(result)
    }

    pub async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, subscription_id, event_id, event_type, status, attempts,
                last_status_code, last_error, created_at, completed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.subscription_id)
        .bind(record.event_id)
        .bind(&record.event_type)
        .bind(record.status)
        .bind(record.attempts)
        .bind(record.last_status_code)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.completed_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record delivery: {}", e)))?;

        Ok(())
    }

    pub async fn get_deliveries(&self, status: Option<DeliveryStatus>, limit: i64) -> Result<Vec<DeliveryRecord>> {
        let result = sqlx::query_as::<_, DeliveryRecord>(
            r#"
            SELECT id, subscription_id, event_id, event_type, status, attempts,
                   last_status_code, last_error, created_at, completed_at
            FROM webhook_deliveries
            WHERE ($1::delivery_status IS NULL OR status = $1)
            ORDER BY completed_at DESC
            LIMIT $2
            "#,
        )
        .bind(status)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load deliveries: {}", e)))?;

        Ok(result)
    }

    pub async fn stash_pending(&self, pending: &[PendingDelivery]) -> Result<()> {
        for item in pending {
            sqlx::query(
                r#"
                INSERT INTO pending_deliveries (id, subscription_id, event, attempts, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(item.id)
            .bind(item.subscription_id)
            .bind(&item.event)
            .bind(item.attempts)
            .bind(item.created_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to stash pending delivery: {}", e)))?;
        }

        Ok(())
    }

    pub async fn take_pending(&self) -> Result<Vec<PendingDelivery>> {
        let result = sqlx::query_as::<_, PendingDelivery>(
            r#"
            DELETE FROM pending_deliveries
            RETURNING id, subscription_id, event, attempts, created_at
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load pending deliveries: {}", e)))?;

        Ok(result)
    }
}
