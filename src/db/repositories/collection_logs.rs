use crate::db::models::{CollectionLog, DailyUsage};
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

/// Raw readings and their daily rollup
#[derive(Clone)]
pub struct CollectionLogsRepository {
    pool: Arc<PgPool>,
}

impl CollectionLogsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn append(&self, log: &CollectionLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_logs (id, tag_id, gateway_id, rssi, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(log.id)
        .bind(log.tag_id)
        .bind(log.gateway_id)
        .bind(log.rssi)
        .bind(log.recorded_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to append collection log: {}", e)))?;

        Ok(())
    }

    /// Logs older than the cutoff in timestamp order
    pub async fn get_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<CollectionLog>> {
        let result = sqlx::query_as::<_, CollectionLog>(
            r#"
            SELECT id, tag_id, gateway_id, rssi, recorded_at
            FROM collection_logs
            WHERE recorded_at < $1
            ORDER BY recorded_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load collection logs: {}", e)))?;

        Ok(result)
    }

    /// Adds the usage rows and deletes the rolled-up logs in one transaction
    pub async fn apply_rollup(&self, usage: &[DailyUsage], log_ids: &[Uuid]) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        for row in usage {
            sqlx::query(
                r#"
                INSERT INTO daily_usage (tag_id, gateway_id, day, dwell_seconds, sessions, samples)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (tag_id, gateway_id, day) DO UPDATE
                SET dwell_seconds = daily_usage.dwell_seconds + EXCLUDED.dwell_seconds,
                    sessions = daily_usage.sessions + EXCLUDED.sessions,
                    samples = daily_usage.samples + EXCLUDED.samples
                "#,
            )
            .bind(row.tag_id)
            .bind(row.gateway_id)
            .bind(row.day)
            .bind(row.dwell_seconds)
            .bind(row.sessions)
            .bind(row.samples)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to upsert daily usage: {}", e)))?;
        }

        let purged = sqlx::query("DELETE FROM collection_logs WHERE id = ANY($1)")
            .bind(log_ids)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("Failed to purge collection logs: {}", e)))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit rollup: {}", e)))?;

        Ok(purged)
    }
}
