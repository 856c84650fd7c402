use crate::db::models::CameraEvent;
use crate::error::Error;
use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct CameraEventsRepository {
    pool: Arc<PgPool>,
}

impl CameraEventsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Insert the event, or return the stored one when the collector redelivered it
    pub async fn append(&self, event: &CameraEvent) -> Result<CameraEvent> {
        let inserted = sqlx::query_as::<_, CameraEvent>(
            r#"
            INSERT INTO camera_events (id, camera_id, analytic, external_id, payload, media_refs, occurred_at, received_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (camera_id, external_id) WHERE external_id IS NOT NULL DO NOTHING
            RETURNING id, camera_id, analytic, external_id, payload, media_refs, occurred_at, received_at
            "#,
        )
        .bind(event.id)
        .bind(event.camera_id)
        .bind(&event.analytic)
        .bind(&event.external_id)
        .bind(&event.payload)
        .bind(&event.media_refs)
        .bind(event.occurred_at)
        .bind(event.received_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to append camera event: {}", e)))?;

        if let Some(inserted) = inserted {
            return Ok(inserted);
        }

        let existing = sqlx::query_as::<_, CameraEvent>(
            r#"
            SELECT id, camera_id, analytic, external_id, payload, media_refs, occurred_at, received_at
            FROM camera_events
            WHERE camera_id = $1 AND external_id = $2
            "#,
        )
        .bind(event.camera_id)
        .bind(&event.external_id)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load existing camera event: {}", e)))?;

        Ok(existing)
    }
}
