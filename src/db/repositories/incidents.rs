use crate::db::models::{Incident, IncidentTransition};
use crate::error::Error;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use uuid::Uuid;

const INCIDENT_COLUMNS: &str = "id, title, description, status, source, severity, rule_id, subject, \
     alert_event_id, camera_event_id, media_refs, sla_minutes, due_at, created_by, created_at, \
     acknowledged_at, acknowledged_by, resolved_at, resolved_by, updated_at, version";

/// Incidents and their transition log
#[derive(Clone)]
pub struct IncidentsRepository {
    pool: Arc<PgPool>,
}

impl IncidentsRepository {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    pub async fn create(&self, incident: &Incident, transition: &IncidentTransition) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO incidents (
                id, title, description, status, source, severity, rule_id, subject, alert_event_id,
                camera_event_id, media_refs, sla_minutes, due_at, created_by, created_at,
                acknowledged_at, acknowledged_by, resolved_at, resolved_by, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(incident.id)
        .bind(&incident.title)
        .bind(&incident.description)
        .bind(incident.status)
        .bind(incident.source)
        .bind(incident.severity)
        .bind(incident.rule_id)
        .bind(&incident.subject)
        .bind(incident.alert_event_id)
        .bind(incident.camera_event_id)
        .bind(&incident.media_refs)
        .bind(incident.sla_minutes)
        .bind(incident.due_at)
        .bind(&incident.created_by)
        .bind(incident.created_at)
        .bind(incident.acknowledged_at)
        .bind(&incident.acknowledged_by)
        .bind(incident.resolved_at)
        .bind(&incident.resolved_by)
        .bind(incident.updated_at)
        .bind(incident.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to create incident: {}", e)))?;

        insert_transition(&mut tx, transition).await?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit incident: {}", e)))?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Incident>> {
        let result = sqlx::query_as::<_, Incident>(&format!(
            "SELECT {} FROM incidents WHERE id = $1",
            INCIDENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get incident: {}", e)))?;

        Ok(result)
    }

    pub async fn find_open_for_rule(
        &self,
        rule_id: Uuid,
        subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Incident>> {
        let result = sqlx::query_as::<_, Incident>(&format!(
            r#"
            SELECT {} FROM incidents
            WHERE rule_id = $1 AND subject = $2 AND status <> 'resolved' AND created_at >= $3
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            INCIDENT_COLUMNS
        ))
        .bind(rule_id)
        .bind(subject)
        .bind(since)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to find open incident: {}", e)))?;

        Ok(result)
    }

    pub async fn find_by_camera_event(&self, camera_event_id: Uuid) -> Result<Option<Incident>> {
        let result = sqlx::query_as::<_, Incident>(&format!(
            "SELECT {} FROM incidents WHERE camera_event_id = $1",
            INCIDENT_COLUMNS
        ))
        .bind(camera_event_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to find incident by camera event: {}", e)))?;

        Ok(result)
    }

    /// Versioned update plus optional transition row, in one transaction
    pub async fn update(
        &self,
        incident: &Incident,
        expected_version: i32,
        transition: Option<&IncidentTransition>,
    ) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        let result = sqlx::query(
            r#"
            UPDATE incidents
            SET status = $3, media_refs = $4, acknowledged_at = $5, acknowledged_by = $6,
                resolved_at = $7, resolved_by = $8, updated_at = $9, version = $10
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(incident.id)
        .bind(expected_version)
        .bind(incident.status)
        .bind(&incident.media_refs)
        .bind(incident.acknowledged_at)
        .bind(&incident.acknowledged_by)
        .bind(incident.resolved_at)
        .bind(&incident.resolved_by)
        .bind(incident.updated_at)
        .bind(incident.version)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to update incident: {}", e)))?;

        if result.rows_affected() == 0 {
            tx.rollback()
                .await
                .map_err(|e| Error::Database(format!("Failed to roll back: {}", e)))?;
            return Ok(false);
        }

        if let Some(transition) = transition {
            insert_transition(&mut tx, transition).await?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit incident update: {}", e)))?;

        Ok(true)
    }

    pub async fn get_transitions(&self, incident_id: Uuid) -> Result<Vec<IncidentTransition>> {
        let result = sqlx::query_as::<_, IncidentTransition>(
            r#"
            SELECT id, incident_id, from_status, to_status, actor, note, at
            FROM incident_transitions
            WHERE incident_id = $1
            ORDER BY at ASC
            "#,
        )
        .bind(incident_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to load incident transitions: {}", e)))?;

        Ok(result)
    }
}

async fn insert_transition(
    tx: &mut Transaction<'_, Postgres>,
    transition: &IncidentTransition,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO incident_transitions (id, incident_id, from_status, to_status, actor, note, at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(transition.id)
    .bind(transition.incident_id)
    .bind(transition.from_status)
    .bind(transition.to_status)
    .bind(&transition.actor)
    .bind(&transition.note)
    .bind(transition.at)
    .execute(&mut **tx)
    .await
    .map_err(|e| Error::Database(format!("Failed to record incident transition: {}", e)))?;

    Ok(())
}
