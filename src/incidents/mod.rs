//! Incident lifecycle: `open -> acknowledged -> resolved`.
//!
//! The manager is the only writer of incident records. Every write is a
//! versioned compare-and-set, every state change is logged with its actor and
//! emits an incident lifecycle event.

use crate::db::models::{Incident, IncidentSource, IncidentStatus, IncidentTransition, Severity};
use crate::error::Error;
use crate::messaging::event::EventType;
use crate::messaging::lifecycle::LifecycleEvents;
use crate::store::Store;
use crate::utils::KeyedLocks;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::sync::Arc;
use uuid::Uuid;

#[cfg(test)]
mod tests;

const MAX_WRITE_ATTEMPTS: usize = 3;

/// Why the incident exists
#[derive(Debug, Clone)]
pub enum SourceRef {
    Manual,
    Rule {
        rule_id: Uuid,
        subject: String,
        alert_event_id: Uuid,
        cooldown: Duration,
    },
    FaceCapture {
        camera_event_id: Uuid,
    },
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    pub source: SourceRef,
    pub media_refs: Vec<String>,
    pub actor: String,
}

#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created(Incident),
    /// An equivalent incident already exists; nothing was written
    Duplicate(Incident),
}

impl CreateOutcome {
    pub fn incident(&self) -> &Incident {
        match self {
            Self::Created(i) | Self::Duplicate(i) => i,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

pub struct IncidentManager {
    store: Arc<dyn Store>,
    events: LifecycleEvents,
    locks: KeyedLocks,
}

impl IncidentManager {
    pub fn new(store: Arc<dyn Store>, events: LifecycleEvents) -> Self {
        Self {
            store,
            events,
            locks: KeyedLocks::new(),
        }
    }

    /// Create an incident unless one already covers the same source
    pub async fn create(&self, new: NewIncident, at: DateTime<Utc>) -> Result<CreateOutcome> {
        if new.title.trim().is_empty() {
            return Err(Error::Validation("incident title must not be empty".to_string()).into());
        }

        let dedup_key = match &new.source {
            SourceRef::Manual => None,
            SourceRef::Rule { rule_id, subject, .. } => Some(format!("rule:{}:{}", rule_id, subject)),
            SourceRef::FaceCapture { camera_event_id } => Some(format!("camera-event:{}", camera_event_id)),
        };
        let _guard = match &dedup_key {
            Some(key) => Some(self.locks.lock(key).await),
            None => None,
        };

        if let Some(existing) = self.find_duplicate(&new.source, at).await? {
            debug!("Incident for {:?} already exists: {}", new.source, existing.id);
            return Ok(CreateOutcome::Duplicate(existing));
        }

        let incident = build_incident(new, at);
        let transition = IncidentTransition::new(
            incident.id,
            None,
            IncidentStatus::Open,
            &incident.created_by,
            None,
            at,
        );
        self.store.insert_incident(&incident, &transition).await?;

        info!(
            "Created {:?} incident {} ({}): {}",
            incident.source, incident.id, incident.severity, incident.title
        );
        self.events
            .incident(EventType::IncidentCreated, &incident, &incident.created_by);

        Ok(CreateOutcome::Created(incident))
    }

    async fn find_duplicate(&self, source: &SourceRef, at: DateTime<Utc>) -> Result<Option<Incident>> {
        match source {
            SourceRef::Manual => Ok(None),
            SourceRef::Rule { rule_id, subject, cooldown, .. } => {
                self.store
                    .find_open_rule_incident(*rule_id, subject, at - *cooldown)
                    .await
            }
            SourceRef::FaceCapture { camera_event_id } => {
                self.store.find_incident_by_camera_event(*camera_event_id).await
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Incident> {
        self.store
            .get_incident(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Incident {}", id)).into())
    }

    pub async fn transitions(&self, id: Uuid) -> Result<Vec<IncidentTransition>> {
        self.store.incident_transitions(id).await
    }

    pub async fn acknowledge(&self, id: Uuid, actor: &str, note: Option<String>) -> Result<Incident> {
        self.transition(id, IncidentStatus::Acknowledged, actor, note).await
    }

    pub async fn resolve(&self, id: Uuid, actor: &str, note: Option<String>) -> Result<Incident> {
        self.transition(id, IncidentStatus::Resolved, actor, note).await
    }

    async fn transition(
        &self,
        id: Uuid,
        next: IncidentStatus,
        actor: &str,
        note: Option<String>,
    ) -> Result<Incident> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.get(id).await?;
            if !current.status.can_transition_to(next) {
                return Err(Error::InvalidTransition(format!(
                    "incident {} cannot move from {} to {}",
                    id, current.status, next
                ))
                .into());
            }

            let now = Utc::now();
            let mut updated = current.clone();
            updated.status = next;
            updated.updated_at = now;
            updated.version = current.version + 1;
            match next {
                IncidentStatus::Acknowledged => {
                    updated.acknowledged_at = Some(now);
                    updated.acknowledged_by = Some(actor.to_string());
                }
                IncidentStatus::Resolved => {
                    updated.resolved_at = Some(now);
                    updated.resolved_by = Some(actor.to_string());
                }
                IncidentStatus::Open => {}
            }

            let transition =
                IncidentTransition::new(id, Some(current.status), next, actor, note.clone(), now);
            if self
                .store
                .update_incident(&updated, current.version, Some(&transition))
                .await?
            {
                info!("Incident {} {} by {}", id, next, actor);
                let event_type = match next {
                    IncidentStatus::Resolved => EventType::IncidentResolved,
                    _ => EventType::IncidentAcknowledged,
                };
                self.events.incident(event_type, &updated, actor);
                return Ok(updated);
            }
            warn!("Concurrent update on incident {}, retrying", id);
        }

        Err(Error::StateConflict(format!("incident {} is being updated concurrently", id)).into())
    }

    /// Append a media reference. Allowed in any non-resolved state.
    pub async fn attach_media(&self, id: Uuid, reference: &str, actor: &str) -> Result<Incident> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(Error::Validation("media reference must not be empty".to_string()).into());
        }

        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.get(id).await?;
            if current.status == IncidentStatus::Resolved {
                return Err(Error::InvalidTransition(format!(
                    "incident {} is resolved; media can no longer be attached",
                    id
                ))
                .into());
            }

            let now = Utc::now();
            let mut updated = current.clone();
            updated.media_refs.push(reference.to_string());
            updated.updated_at = now;
            updated.version = current.version + 1;

            let transition = IncidentTransition::new(
                id,
                Some(current.status),
                current.status,
                actor,
                Some(format!("media attached: {}", reference)),
                now,
            );
            if self
                .store
                .update_incident(&updated, current.version, Some(&transition))
                .await?
            {
                self.events
                    .incident(EventType::IncidentMediaAttached, &updated, actor);
                return Ok(updated);
            }
            warn!("Concurrent update on incident {}, retrying", id);
        }

        Err(Error::StateConflict(format!("incident {} is being updated concurrently", id)).into())
    }
}

fn build_incident(new: NewIncident, at: DateTime<Utc>) -> Incident {
    let sla_minutes = new.severity.sla_minutes();
    let (source, rule_id, subject, alert_event_id, camera_event_id) = match new.source {
        SourceRef::Manual => (IncidentSource::Manual, None, None, None, None),
        SourceRef::Rule {
            rule_id,
            subject,
            alert_event_id,
            ..
        } => (
            IncidentSource::Rule,
            Some(rule_id),
            Some(subject),
            Some(alert_event_id),
            None,
        ),
        SourceRef::FaceCapture { camera_event_id } => {
            (IncidentSource::FaceCapture, None, None, None, Some(camera_event_id))
        }
    };

    Incident {
        id: Uuid::new_v4(),
        title: new.title.trim().to_string(),
        description: new.description,
        status: IncidentStatus::Open,
        source,
        severity: new.severity,
        rule_id,
        subject,
        alert_event_id,
        camera_event_id,
        media_refs: new.media_refs,
        sla_minutes,
        due_at: at + Duration::minutes(sla_minutes as i64),
        created_by: new.actor,
        created_at: at,
        acknowledged_at: None,
        acknowledged_by: None,
        resolved_at: None,
        resolved_by: None,
        updated_at: at,
        version: 0,
    }
}
