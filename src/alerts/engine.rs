use super::rules::{render_title, MatchRecord, Subject};
use crate::db::models::{
    AbsenceTarget, AlertEvent, AlertRule, CameraKey, Comparison, RuleCondition,
};
use crate::incidents::{CreateOutcome, IncidentManager, NewIncident, SourceRef};
use crate::messaging::lifecycle::LifecycleEvents;
use crate::sessionizer::PresenceSession;
use crate::store::Store;
use crate::utils::KeyedLocks;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::json;
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

const RULE_ACTOR: &str = "rule-engine";

/// One accepted beacon reading, after state and session updates
#[derive(Debug, Clone)]
pub struct ReadingContext {
    pub log_id: Uuid,
    pub tag: String,
    pub gateway: String,
    pub building: Option<String>,
    pub rssi: i32,
    pub at: DateTime<Utc>,
    pub session: PresenceSession,
}

#[derive(Debug, Clone)]
pub struct CameraContext {
    pub event_id: Uuid,
    pub camera: CameraKey,
    pub analytic: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum FireOutcome {
    Fired {
        alert: AlertEvent,
        incident: Option<CreateOutcome>,
    },
    /// Matched inside the cooldown window of an earlier firing
    Suppressed { rule_id: Uuid, subject: String },
}

impl FireOutcome {
    pub fn is_fired(&self) -> bool {
        matches!(self, Self::Fired { .. })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub matched: u64,
    pub fired: u64,
    pub suppressed: u64,
    pub incidents_created: u64,
    pub sweeps: u64,
}

#[derive(Default)]
struct Counters {
    matched: AtomicU64,
    fired: AtomicU64,
    suppressed: AtomicU64,
    incidents_created: AtomicU64,
    sweeps: AtomicU64,
}

/// Consecutive crossings of one threshold rule by one pair
struct Streak {
    count: u32,
    last_at: DateTime<Utc>,
}

struct CachedRules {
    loaded_at: Instant,
    rules: Arc<Vec<AlertRule>>,
}

/// Evaluates enabled rules against readings, camera events and the absence
/// sweep. Dedup decisions for a (rule, subject) pair are serialised through a
/// keyed lock shared by all three paths.
pub struct RuleEngine {
    store: Arc<dyn Store>,
    incidents: Arc<IncidentManager>,
    events: LifecycleEvents,
    locks: KeyedLocks,
    rules: RwLock<Option<CachedRules>>,
    refresh: Duration,
    streaks: Mutex<HashMap<String, Streak>>,
    counters: Counters,
}

impl RuleEngine {
    pub fn new(
        store: Arc<dyn Store>,
        incidents: Arc<IncidentManager>,
        events: LifecycleEvents,
        refresh: Duration,
    ) -> Self {
        Self {
            store,
            incidents,
            events,
            locks: KeyedLocks::new(),
            rules: RwLock::new(None),
            refresh,
            streaks: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Enabled rules, reloaded from the store once the cache is stale
    pub async fn rules(&self) -> Result<Arc<Vec<AlertRule>>> {
        if let Some(cached) = self.rules.read().await.as_ref() {
            if cached.loaded_at.elapsed() < self.refresh {
                return Ok(cached.rules.clone());
            }
        }

        let mut guard = self.rules.write().await;
        if let Some(cached) = guard.as_ref() {
            if cached.loaded_at.elapsed() < self.refresh {
                return Ok(cached.rules.clone());
            }
        }
        let rules = Arc::new(self.store.enabled_rules().await?);
        debug!("Loaded {} enabled alert rule(s)", rules.len());
        *guard = Some(CachedRules {
            loaded_at: Instant::now(),
            rules: rules.clone(),
        });
        Ok(rules)
    }

    pub async fn invalidate_rules(&self) {
        *self.rules.write().await = None;
    }

    pub async fn evaluate_reading(&self, ctx: &ReadingContext) -> Result<Vec<FireOutcome>> {
        let rules = self.rules().await?;
        let record = MatchRecord {
            device: Some(ctx.gateway.clone()),
            tag: Some(ctx.tag.clone()),
            building: ctx.building.clone(),
            ..Default::default()
        };
        let subject = Subject::Pair {
            tag: ctx.tag.clone(),
            device: ctx.gateway.clone(),
        };

        let mut outcomes = Vec::new();
        for rule in rules.iter().filter(|r| r.scope.matches(&record)) {
            let trigger = match &rule.condition.0 {
                RuleCondition::Threshold {
                    comparison,
                    rssi,
                    consecutive,
                } => {
                    let crossed = match comparison {
                        Comparison::Below => ctx.rssi < *rssi,
                        Comparison::Above => ctx.rssi > *rssi,
                    };
                    let streak = self.update_streak(rule.id, &subject, crossed, ctx.at);
                    if !crossed || streak < (*consecutive).max(1) {
                        continue;
                    }
                    json!({
                        "collection_log_id": ctx.log_id,
                        "rssi": ctx.rssi,
                        "threshold": rssi,
                        "consecutive": streak,
                    })
                }
                RuleCondition::Dwell { max_seconds } => {
                    let dwell = ctx.session.duration().num_seconds();
                    if dwell < *max_seconds {
                        continue;
                    }
                    json!({
                        "collection_log_id": ctx.log_id,
                        "session_start": ctx.session.start.to_rfc3339(),
                        "dwell_seconds": dwell,
                    })
                }
                RuleCondition::Presence => {
                    if ctx.session.samples != 1 {
                        continue;
                    }
                    json!({
                        "collection_log_id": ctx.log_id,
                        "session_start": ctx.session.start.to_rfc3339(),
                        "building": ctx.building,
                    })
                }
                _ => continue,
            };

            match self.fire(rule, &subject, trigger, ctx.at).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Rule {} failed for {}: {}", rule.name, subject, e),
            }
        }
        Ok(outcomes)
    }

    pub async fn evaluate_camera_event(&self, ctx: &CameraContext) -> Result<Vec<FireOutcome>> {
        let rules = self.rules().await?;
        let record = MatchRecord {
            camera: Some(ctx.camera.code.clone()),
            analytic: Some(ctx.analytic.clone()),
            building: Some(ctx.camera.building.clone()),
            ..Default::default()
        };
        let subject = Subject::Camera(ctx.camera.clone());

        let mut outcomes = Vec::new();
        for rule in rules.iter().filter(|r| r.scope.matches(&record)) {
            let RuleCondition::AnalyticMatch { analytic } = &rule.condition.0 else {
                continue;
            };
            if analytic != &ctx.analytic {
                continue;
            }
            let trigger = json!({
                "camera_event_id": ctx.event_id,
                "analytic": ctx.analytic,
                "camera": ctx.camera.to_string(),
            });
            match self.fire(rule, &subject, trigger, ctx.at).await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Rule {} failed for {}: {}", rule.name, subject, e),
            }
        }
        Ok(outcomes)
    }

    /// Check absence rules against last-seen timestamps
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<FireOutcome>> {
        self.counters.sweeps.fetch_add(1, Ordering::Relaxed);
        let rules = self.rules().await?;
        let absence: Vec<_> = rules
            .iter()
            .filter_map(|rule| match &rule.condition.0 {
                RuleCondition::Absence { window_secs, target } => {
                    Some((rule, chrono::Duration::seconds(*window_secs), *target))
                }
                _ => None,
            })
            .collect();
        if absence.is_empty() {
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        if absence.iter().any(|(_, _, t)| *t == AbsenceTarget::Tag) {
            for tag in self.store.list_tags().await? {
                let record = MatchRecord {
                    tag: Some(tag.mac_address.clone()),
                    ..Default::default()
                };
                candidates.push((AbsenceTarget::Tag, record, Subject::Tag(tag.mac_address), tag.last_seen_at));
            }
        }
        if absence.iter().any(|(_, _, t)| *t == AbsenceTarget::Gateway) {
            for gateway in self.store.list_gateways().await? {
                let record = MatchRecord {
                    device: Some(gateway.mac_address.clone()),
                    building: gateway.building_id.clone(),
                    ..Default::default()
                };
                candidates.push((
                    AbsenceTarget::Gateway,
                    record,
                    Subject::Gateway(gateway.mac_address),
                    gateway.last_seen_at,
                ));
            }
        }

        let mut outcomes = Vec::new();
        for (rule, window, target) in absence {
            for (kind, record, subject, last_seen) in &candidates {
                if *kind != target || !rule.scope.matches(record) {
                    continue;
                }
                let absent = last_seen.map_or(true, |seen| now - seen > window);
                if !absent {
                    continue;
                }
                let trigger = json!({
                    "last_seen_at": last_seen.map(|t| t.to_rfc3339()),
                    "window_secs": window.num_seconds(),
                });
                match self.fire(rule, subject, trigger, now).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => error!("Absence rule {} failed for {}: {}", rule.name, subject, e),
                }
            }
        }
        Ok(outcomes)
    }

    /// Record a match and create the alert unless the cooldown suppresses it
    pub async fn fire(
        &self,
        rule: &AlertRule,
        subject: &Subject,
        trigger: serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<FireOutcome> {
        let subject_key = subject.to_string();
        let _guard = self.locks.lock(&format!("{}:{}", rule.id, subject_key)).await;
        self.counters.matched.fetch_add(1, Ordering::Relaxed);

        if let Some(last) = self.store.last_alert_at(rule.id, &subject_key).await? {
            if at - last < rule.cooldown() {
                self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!("Suppressed {} for {} (cooldown)", rule.name, subject_key);
                return Ok(FireOutcome::Suppressed {
                    rule_id: rule.id,
                    subject: subject_key,
                });
            }
        }

        let alert = AlertEvent {
            id: Uuid::new_v4(),
            rule_id: rule.id,
            subject: subject_key.clone(),
            severity: rule.severity,
            trigger: Json(trigger),
            fired_at: at,
        };
        self.store.insert_alert_event(&alert).await?;
        self.counters.fired.fetch_add(1, Ordering::Relaxed);
        info!("Rule {} fired for {} ({})", rule.name, subject_key, rule.severity);
        self.events.alert_fired(&alert, rule);

        let incident = if rule.auto_incident {
            let new = NewIncident {
                title: render_title(
                    rule.title_template.as_deref(),
                    &rule.name,
                    subject,
                    rule.severity,
                ),
                description: Some(format!("Raised automatically by rule {}", rule.name)),
                severity: rule.severity,
                source: SourceRef::Rule {
                    rule_id: rule.id,
                    subject: subject_key,
                    alert_event_id: alert.id,
                    cooldown: rule.cooldown(),
                },
                media_refs: Vec::new(),
                actor: RULE_ACTOR.to_string(),
            };
            match self.incidents.create(new, at).await {
                Ok(outcome) => {
                    if outcome.is_created() {
                        self.counters.incidents_created.fetch_add(1, Ordering::Relaxed);
                    }
                    Some(outcome)
                }
                Err(e) => {
                    warn!("Failed to raise incident for alert {}: {}", alert.id, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(FireOutcome::Fired { alert, incident })
    }

    fn update_streak(&self, rule_id: Uuid, subject: &Subject, crossed: bool, at: DateTime<Utc>) -> u32 {
        let mut streaks = self.lock_streaks();
        let key = format!("{}:{}", rule_id, subject);
        if crossed {
            let streak = streaks.entry(key).or_insert(Streak { count: 0, last_at: at });
            streak.count = streak.count.saturating_add(1);
            streak.last_at = streak.last_at.max(at);
            streak.count
        } else {
            streaks.remove(&key);
            0
        }
    }

    /// Drop streaks whose last crossing is older than `horizon`. Returns how many went.
    pub fn evict_idle_streaks(&self, now: DateTime<Utc>, horizon: chrono::Duration) -> usize {
        let mut streaks = self.lock_streaks();
        let before = streaks.len();
        streaks.retain(|_, streak| now - streak.last_at <= horizon);
        before - streaks.len()
    }

    pub fn open_streaks(&self) -> usize {
        self.lock_streaks().len()
    }

    fn lock_streaks(&self) -> MutexGuard<'_, HashMap<String, Streak>> {
        match self.streaks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            matched: self.counters.matched.load(Ordering::Relaxed),
            fired: self.counters.fired.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
            incidents_created: self.counters.incidents_created.load(Ordering::Relaxed),
            sweeps: self.counters.sweeps.load(Ordering::Relaxed),
        }
    }
}
