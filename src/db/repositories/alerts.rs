use crate::db::models::{AlertEvent, AlertRule};
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Rule definitions (read-only here) and fired alert events
#[derive(Clone)]
pub struct AlertsRepository {
    pool: Arc<PgPool>,
}

impl AlertsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn get_enabled_rules(&self) -> Result<Vec<AlertRule>> {
        let result = sqlx::query_as::<_, AlertRule>(
            r#"
            SELECT id, name, enabled, scope, condition, severity, auto_incident, cooldown_secs, title_template
            FROM alert_rules
            WHERE enabled = TRUE
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load alert rules: {}", e)))?;

        Ok(result)
    }

    pub async fn create_event(&self, event: &AlertEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_events (id, rule_id, subject, severity, trigger, fired_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.rule_id)
        .bind(&event.subject)
        .bind(event.severity)
        .bind(&event.trigger)
        .bind(event.fired_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create alert event: {}", e)))?;

        Ok(())
    }

    pub async fn last_fired_at(&self, rule_id: Uuid, subject: &str) -> Result<Option<DateTime<Utc>>> {
        let result: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(fired_at) FROM alert_events WHERE rule_id = $1 AND subject = $2",
        )
        .bind(rule_id)
        .bind(subject)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to read last alert: {}", e)))?;

        Ok(result)
    }
}
