use super::*;
use crate::db::models::{
    AbsenceTarget, AlertRule, CameraKey, Comparison, RuleCondition, RuleScope, Severity,
};
use crate::incidents::IncidentManager;
use crate::messaging::event::EventType;
use crate::messaging::lifecycle::{CollectingSink, LifecycleEvents};
use crate::sessionizer::PresenceSession;
use crate::store::{MemoryStore, Store};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use std::sync::Arc;
use uuid::Uuid;

const TAG: &str = "11:22:33:44:55:66";
const GATEWAY: &str = "AA:BB:CC:DD:EE:FF";

struct Harness {
    engine: Arc<RuleEngine>,
    store: Arc<MemoryStore>,
    sink: Arc<CollectingSink>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(CollectingSink::new());
    let events = LifecycleEvents::new(sink.clone());
    let incidents = Arc::new(IncidentManager::new(store.clone(), events.clone()));
    let engine = Arc::new(RuleEngine::new(
        store.clone(),
        incidents,
        events,
        std::time::Duration::ZERO,
    ));
    Harness { engine, store, sink }
}

fn rule(condition: RuleCondition, cooldown_secs: i64, auto_incident: bool) -> AlertRule {
    AlertRule {
        id: Uuid::new_v4(),
        name: "Weak signal".to_string(),
        enabled: true,
        scope: Json(RuleScope::default()),
        condition: Json(condition),
        severity: Severity::Medium,
        auto_incident,
        cooldown_secs,
        title_template: None,
    }
}

fn below(rssi: i32, consecutive: u32) -> RuleCondition {
    RuleCondition::Threshold {
        comparison: Comparison::Below,
        rssi,
        consecutive,
    }
}

fn reading(rssi: i32, at: DateTime<Utc>, start: DateTime<Utc>) -> ReadingContext {
    ReadingContext {
        log_id: Uuid::new_v4(),
        tag: TAG.to_string(),
        gateway: GATEWAY.to_string(),
        building: None,
        rssi,
        at,
        session: PresenceSession {
            tag: TAG.to_string(),
            device: GATEWAY.to_string(),
            start,
            end: at,
            samples: 1,
            late_samples: 0,
        },
    }
}

fn fired(outcomes: &[FireOutcome]) -> usize {
    outcomes.iter().filter(|o| o.is_fired()).count()
}

#[tokio::test]
async fn cooldown_suppresses_within_window() -> Result<()> {
    let h = harness();
    h.store.insert_rule(rule(below(-80, 1), 60, false)).await;
    let t0 = Utc::now();

    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, t0, t0)).await?), 1);

    let outcomes = h.engine.evaluate_reading(&reading(-90, t0 + Duration::seconds(30), t0)).await?;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], FireOutcome::Suppressed { .. }));

    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, t0 + Duration::seconds(70), t0)).await?), 1);

    assert_eq!(h.store.alert_events().await.len(), 2);
    let stats = h.engine.stats();
    assert_eq!(stats.matched, 3);
    assert_eq!(stats.suppressed, 1);
    assert_eq!(h.sink.of_type(&EventType::AlertFired).len(), 2);
    Ok(())
}

#[tokio::test]
async fn threshold_needs_consecutive_samples() -> Result<()> {
    let h = harness();
    h.store.insert_rule(rule(below(-80, 3), 0, false)).await;
    let t0 = Utc::now();
    let at = |s| t0 + Duration::seconds(s);

    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, at(0), t0)).await?), 0);
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, at(1), t0)).await?), 0);
    // a strong sample breaks the streak
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-50, at(2), t0)).await?), 0);
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, at(3), t0)).await?), 0);
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, at(4), t0)).await?), 0);
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, at(5), t0)).await?), 1);
    Ok(())
}

#[tokio::test]
async fn idle_streaks_are_evicted() -> Result<()> {
    let h = harness();
    h.store.insert_rule(rule(below(-80, 3), 0, false)).await;
    let t0 = Utc::now();

    h.engine.evaluate_reading(&reading(-90, t0, t0)).await?;
    h.engine.evaluate_reading(&reading(-90, t0 + Duration::seconds(1), t0)).await?;
    assert_eq!(h.engine.open_streaks(), 1);

    let horizon = Duration::seconds(3600);
    assert_eq!(h.engine.evict_idle_streaks(t0 + Duration::seconds(60), horizon), 0);
    assert_eq!(h.engine.evict_idle_streaks(t0 + Duration::seconds(3602), horizon), 1);
    assert_eq!(h.engine.open_streaks(), 0);

    // an evicted streak starts over
    let later = t0 + Duration::seconds(4000);
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-90, later, later)).await?), 0);
    Ok(())
}

#[tokio::test]
async fn threshold_comparison_is_strict() -> Result<()> {
    let h = harness();
    h.store
        .insert_rule(rule(
            RuleCondition::Threshold {
                comparison: Comparison::Above,
                rssi: -40,
                consecutive: 1,
            },
            0,
            false,
        ))
        .await;
    let t0 = Utc::now();
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-40, t0, t0)).await?), 0);
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-39, t0, t0)).await?), 1);
    Ok(())
}

#[tokio::test]
async fn scope_limits_rule_to_its_device() -> Result<()> {
    let h = harness();
    let mut scoped = rule(below(-80, 1), 0, false);
    scoped.scope = Json(RuleScope {
        device: Some("aabbccddee00".to_string()),
        ..Default::default()
    });
    h.store.insert_rule(scoped).await;

    let t0 = Utc::now();
    assert!(h.engine.evaluate_reading(&reading(-90, t0, t0)).await?.is_empty());

    let mut other = reading(-90, t0, t0);
    other.gateway = "AA:BB:CC:DD:EE:00".to_string();
    assert_eq!(fired(&h.engine.evaluate_reading(&other).await?), 1);
    Ok(())
}

#[tokio::test]
async fn dwell_fires_on_long_sessions() -> Result<()> {
    let h = harness();
    h.store
        .insert_rule(rule(RuleCondition::Dwell { max_seconds: 600 }, 3600, false))
        .await;
    let t0 = Utc::now();

    assert!(h.engine.evaluate_reading(&reading(-60, t0 + Duration::seconds(599), t0)).await?.is_empty());
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-60, t0 + Duration::seconds(600), t0)).await?), 1);
    Ok(())
}

#[tokio::test]
async fn presence_fires_when_a_session_opens() -> Result<()> {
    let h = harness();
    let mut sector = rule(RuleCondition::Presence, 0, false);
    sector.scope = Json(RuleScope {
        device: Some(GATEWAY.to_string()),
        ..Default::default()
    });
    h.store.insert_rule(sector).await;
    let t0 = Utc::now();

    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-60, t0, t0)).await?), 1);

    // still inside the same session
    let mut staying = reading(-60, t0 + Duration::seconds(5), t0);
    staying.session.samples = 2;
    assert!(h.engine.evaluate_reading(&staying).await?.is_empty());

    // back after a gap opens a fresh session
    let later = t0 + Duration::seconds(120);
    assert_eq!(fired(&h.engine.evaluate_reading(&reading(-60, later, later)).await?), 1);

    let mut elsewhere = reading(-60, later, later);
    elsewhere.gateway = "AA:BB:CC:DD:EE:01".to_string();
    assert!(h.engine.evaluate_reading(&elsewhere).await?.is_empty());

    let alerts = h.store.alert_events().await;
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().all(|a| a.trigger.0["session_start"].is_string()));
    Ok(())
}

#[tokio::test]
async fn auto_incident_is_created_once_per_cooldown() -> Result<()> {
    let h = harness();
    let mut r = rule(below(-80, 1), 60, true);
    r.title_template = Some("{rule} on {subject}".to_string());
    h.store.insert_rule(r).await;
    let t0 = Utc::now();

    let outcomes = h.engine.evaluate_reading(&reading(-90, t0, t0)).await?;
    let FireOutcome::Fired { incident: Some(outcome), .. } = &outcomes[0] else {
        panic!("expected an incident");
    };
    assert!(outcome.is_created());
    assert_eq!(
        outcome.incident().title,
        format!("Weak signal on pair:{}@{}", TAG, GATEWAY)
    );
    assert_eq!(outcome.incident().severity, Severity::Medium);

    h.engine.evaluate_reading(&reading(-90, t0 + Duration::seconds(10), t0)).await?;
    assert_eq!(h.store.incidents().await.len(), 1);
    assert_eq!(h.engine.stats().incidents_created, 1);
    Ok(())
}

#[tokio::test]
async fn analytic_match_fires_for_camera_events() -> Result<()> {
    let h = harness();
    h.store
        .insert_rule(rule(
            RuleCondition::AnalyticMatch {
                analytic: "intrusion".to_string(),
            },
            0,
            false,
        ))
        .await;
    let camera = CameraKey {
        tenant: "acme".to_string(),
        building: "hq".to_string(),
        floor: "1".to_string(),
        code: "cam-1".to_string(),
    };
    let ctx = |analytic: &str| CameraContext {
        event_id: Uuid::new_v4(),
        camera: camera.clone(),
        analytic: analytic.to_string(),
        at: Utc::now(),
    };

    assert!(h.engine.evaluate_camera_event(&ctx("lineCrossing")).await?.is_empty());
    let outcomes = h.engine.evaluate_camera_event(&ctx("intrusion")).await?;
    assert_eq!(fired(&outcomes), 1);
    assert_eq!(h.store.alert_events().await[0].subject, "camera:acme/hq/1/cam-1");
    Ok(())
}

#[tokio::test]
async fn absence_sweep_reads_last_seen() -> Result<()> {
    let h = harness();
    h.store
        .insert_rule(rule(
            RuleCondition::Absence {
                window_secs: 120,
                target: AbsenceTarget::Tag,
            },
            300,
            false,
        ))
        .await;
    let now = Utc::now();
    h.store.upsert_tag(TAG, now).await?;
    h.store.upsert_tag("11:22:33:44:55:77", now).await?;
    h.store.set_tag_last_seen(TAG, now - Duration::seconds(121)).await;

    let outcomes = h.engine.sweep(now).await?;
    assert_eq!(fired(&outcomes), 1);
    assert_eq!(h.store.alert_events().await[0].subject, format!("tag:{}", TAG));

    // the next sweep inside the cooldown only records a match
    let outcomes = h.engine.sweep(now + Duration::seconds(30)).await?;
    assert_eq!(fired(&outcomes), 0);
    assert_eq!(outcomes.len(), 1);
    Ok(())
}

#[tokio::test]
async fn gateway_absence_ignores_tags() -> Result<()> {
    let h = harness();
    h.store
        .insert_rule(rule(
            RuleCondition::Absence {
                window_secs: 60,
                target: AbsenceTarget::Gateway,
            },
            300,
            false,
        ))
        .await;
    let now = Utc::now();
    h.store.upsert_tag(TAG, now - Duration::seconds(600)).await?;
    h.store.upsert_gateway(GATEWAY, now - Duration::seconds(61)).await?;

    let outcomes = h.engine.sweep(now).await?;
    assert_eq!(fired(&outcomes), 1);
    assert_eq!(h.store.alert_events().await[0].subject, format!("gateway:{}", GATEWAY));
    Ok(())
}

#[tokio::test]
async fn sweep_and_messages_share_dedup() -> Result<()> {
    let h = harness();
    let r = rule(below(-80, 1), 60, false);
    let rule_id = r.id;
    h.store.insert_rule(r.clone()).await;
    let at = Utc::now();
    let subject = Subject::Pair {
        tag: TAG.to_string(),
        device: GATEWAY.to_string(),
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let rule = r.clone();
        let subject = subject.clone();
        handles.push(tokio::spawn(async move {
            engine.fire(&rule, &subject, serde_json::Value::Null, at).await
        }));
    }
    let mut fired_count = 0;
    for handle in handles {
        if handle.await??.is_fired() {
            fired_count += 1;
        }
    }
    assert_eq!(fired_count, 1);
    assert!(h.store.last_alert_at(rule_id, &subject.to_string()).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn disabled_rules_are_ignored() -> Result<()> {
    let h = harness();
    let mut r = rule(below(-80, 1), 0, false);
    r.enabled = false;
    h.store.insert_rule(r).await;
    let t0 = Utc::now();
    assert!(h.engine.evaluate_reading(&reading(-90, t0, t0)).await?.is_empty());
    Ok(())
}
