use super::*;
use crate::config::OverflowPolicy;
use crate::db::models::SubscriptionKind;
use crate::messaging::event::EventType;
use crate::store::MemoryStore;
use async_trait::async_trait;
use std::collections::VecDeque;

/// Replies from a per-subscription script; falls back to a default status
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<Uuid, VecDeque<u16>>>,
    fallback: Mutex<HashMap<Uuid, u16>>,
    requests: Mutex<Vec<(Uuid, DeliveryRequest)>>,
}

impl ScriptedTransport {
    fn script(&self, subscription: Uuid, replies: &[u16], then: u16) {
        self.scripts
            .lock()
            .unwrap()
            .insert(subscription, replies.iter().copied().collect());
        self.fallback.lock().unwrap().insert(subscription, then);
    }

    fn requests_for(&self, subscription: Uuid) -> Vec<DeliveryRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == subscription)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn deliver(&self, subscription: &WebhookSubscription, request: &DeliveryRequest) -> Result<u16> {
        self.requests
            .lock()
            .unwrap()
            .push((subscription.id, request.clone()));
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&subscription.id)
            .and_then(|replies| replies.pop_front());
        Ok(scripted.unwrap_or_else(|| {
            self.fallback
                .lock()
                .unwrap()
                .get(&subscription.id)
                .copied()
                .unwrap_or(200)
        }))
    }
}

fn config() -> DispatcherConfig {
    DispatcherConfig {
        queue_capacity: 64,
        max_attempts: 5,
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        drain_timeout_secs: 5,
        publish_to_broker: false,
        ..DispatcherConfig::default()
    }
}

fn subscription(name: &str, event_types: &[&str]) -> WebhookSubscription {
    WebhookSubscription {
        id: Uuid::new_v4(),
        name: name.to_string(),
        kind: SubscriptionKind::Webhook,
        target_url: format!("http://{}.invalid/hook", name),
        event_types: event_types.iter().map(|s| s.to_string()).collect(),
        secret: Some("s3cret".to_string()),
        active: true,
    }
}

fn event(event_type: EventType) -> EventMessage {
    EventMessage::new_empty(event_type, Some(Uuid::new_v4()))
}

async fn wait_for_records(store: &MemoryStore, count: usize) -> Result<Vec<DeliveryRecord>> {
    for _ in 0..200 {
        let records = store.delivery_records(None, 100).await?;
        if records.len() >= count {
            return Ok(records);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(anyhow::anyhow!("timed out waiting for {} delivery records", count))
}

#[tokio::test]
async fn retries_until_success_with_stable_delivery_id() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let sub = subscription("ops", &[]);
    transport.script(sub.id, &[500, 500, 500], 200);
    store.insert_subscription(sub.clone()).await;

    let dispatcher = Dispatcher::new(config(), store.clone(), transport.clone(), None);
    dispatcher.start().await?;
    dispatcher.emit(event(EventType::IncidentCreated));

    let records = wait_for_records(&store, 1).await?;
    dispatcher.shutdown().await?;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, DeliveryStatus::Delivered);
    assert_eq!(records[0].attempts, 4);
    assert_eq!(records[0].last_status_code, Some(200));

    let requests = transport.requests_for(sub.id);
    assert_eq!(requests.len(), 4);
    assert!(requests.iter().all(|r| r.delivery_id == records[0].id));
    assert_eq!(requests.iter().map(|r| r.attempt).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_are_dead_lettered() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let sub = subscription("broken", &[]);
    transport.script(sub.id, &[], 503);
    store.insert_subscription(sub.clone()).await;

    let dispatcher = Dispatcher::new(config(), store.clone(), transport.clone(), None);
    dispatcher.start().await?;
    dispatcher.emit(event(EventType::AlertFired));

    let records = wait_for_records(&store, 1).await?;
    dispatcher.shutdown().await?;

    assert_eq!(records[0].status, DeliveryStatus::DeadLettered);
    assert_eq!(records[0].attempts, 5);
    assert_eq!(records[0].last_status_code, Some(503));
    let dead = store
        .delivery_records(Some(DeliveryStatus::DeadLettered), 10)
        .await?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dispatcher.stats().dead_lettered, 1);
    Ok(())
}

#[tokio::test]
async fn failing_subscriber_does_not_block_others() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let slow = subscription("slow", &[]);
    let healthy = subscription("healthy", &[]);
    transport.script(slow.id, &[], 500);
    store.insert_subscription(slow.clone()).await;
    store.insert_subscription(healthy.clone()).await;

    let mut cfg = config();
    cfg.initial_backoff_ms = 200;
    cfg.max_backoff_ms = 200;
    let dispatcher = Dispatcher::new(cfg, store.clone(), transport.clone(), None);
    dispatcher.start().await?;
    for _ in 0..3 {
        dispatcher.emit(event(EventType::IncidentCreated));
    }

    let records = wait_for_records(&store, 3).await?;
    assert!(records
        .iter()
        .all(|r| r.subscription_id == healthy.id && r.status == DeliveryStatus::Delivered));
    Ok(())
}

#[tokio::test]
async fn event_filters_select_subscriptions() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let incidents_only = subscription("incidents", &["incident.*"]);
    let exact = subscription("acks", &["incident.acknowledged"]);
    store.insert_subscription(incidents_only.clone()).await;
    store.insert_subscription(exact.clone()).await;

    let dispatcher = Dispatcher::new(config(), store.clone(), transport.clone(), None);
    dispatcher.start().await?;
    dispatcher.emit(event(EventType::IncidentCreated));
    dispatcher.emit(event(EventType::AlertFired));
    dispatcher.emit(event(EventType::IncidentAcknowledged));

    let report = dispatcher.shutdown().await?;
    assert!(report.drained);
    assert_eq!(transport.requests_for(incidents_only.id).len(), 2);
    assert_eq!(transport.requests_for(exact.id).len(), 1);
    Ok(())
}

#[tokio::test]
async fn overflow_drop_oldest_and_reject_new() -> Result<()> {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());

    let mut cfg = config();
    cfg.queue_capacity = 2;
    // not started, so nothing is consumed
    let dropping = Dispatcher::new(cfg.clone(), store.clone(), transport.clone(), None);
    for _ in 0..5 {
        dropping.emit(event(EventType::AlertFired));
    }
    assert_eq!(dropping.queue_depth(), 2);
    assert_eq!(dropping.stats().dropped, 3);

    cfg.overflow = OverflowPolicy::RejectNew;
    let rejecting = Dispatcher::new(cfg, store, transport, None);
    let first = event(EventType::IncidentCreated);
    rejecting.emit(first.clone());
    rejecting.emit(event(EventType::IncidentCreated));
    rejecting.emit(event(EventType::IncidentCreated));
    assert_eq!(rejecting.stats().rejected, 1);
    assert_eq!(rejecting.queue_depth(), 2);
    Ok(())
}

#[tokio::test]
async fn shutdown_stashes_and_restart_delivers() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let sub = subscription("flaky", &[]);
    transport.script(sub.id, &[500], 200);
    store.insert_subscription(sub.clone()).await;

    let mut cfg = config();
    cfg.initial_backoff_ms = 60_000;
    cfg.max_backoff_ms = 60_000;
    cfg.drain_timeout_secs = 0;
    let dispatcher = Dispatcher::new(cfg, store.clone(), transport.clone(), None);
    dispatcher.start().await?;
    dispatcher.emit(event(EventType::IncidentResolved));

    // first attempt fails and the job parks in a long backoff
    for _ in 0..200 {
        if !transport.requests_for(sub.id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let report = dispatcher.shutdown().await?;
    assert!(!report.drained);
    assert_eq!(report.stashed, 1);

    let pending = store.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].subscription_id, Some(sub.id));
    assert_eq!(pending[0].attempts, 1);
    let delivery_id = pending[0].id;

    let restarted = Dispatcher::new(config(), store.clone(), transport.clone(), None);
    restarted.start().await?;
    let records = wait_for_records(&store, 1).await?;
    restarted.shutdown().await?;

    assert_eq!(records[0].id, delivery_id);
    assert_eq!(records[0].status, DeliveryStatus::Delivered);
    assert_eq!(records[0].attempts, 2);
    assert!(store.pending().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn undispatched_events_survive_shutdown() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let sub = subscription("ops", &[]);
    store.insert_subscription(sub.clone()).await;

    let dispatcher = Dispatcher::new(config(), store.clone(), transport.clone(), None);
    dispatcher.emit(event(EventType::IncidentCreated));
    dispatcher.emit(event(EventType::IncidentCreated));
    // never started: shutdown moves the queue to the outbox
    let report = dispatcher.shutdown().await?;
    assert_eq!(report.stashed, 2);
    assert!(store.pending().await.iter().all(|p| p.subscription_id.is_none()));

    let restarted = Dispatcher::new(config(), store.clone(), transport.clone(), None);
    restarted.start().await?;
    assert_eq!(wait_for_records(&store, 2).await?.len(), 2);
    restarted.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn outage_backs_up_into_the_bounded_queue() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let sub = subscription("down", &[]);
    transport.script(sub.id, &[], 503);
    store.insert_subscription(sub.clone()).await;

    let mut cfg = config();
    cfg.queue_capacity = 2;
    cfg.max_in_flight = 1;
    cfg.max_pending = 1;
    cfg.initial_backoff_ms = 60_000;
    cfg.max_backoff_ms = 60_000;
    cfg.drain_timeout_secs = 0;
    let dispatcher = Dispatcher::new(cfg, store.clone(), transport.clone(), None);
    dispatcher.start().await?;

    dispatcher.emit(event(EventType::AlertFired));
    for _ in 0..200 {
        if !transport.requests_for(sub.id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // the only slot is parked in a long backoff
    for _ in 0..50 {
        dispatcher.emit(event(EventType::AlertFired));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = dispatcher.stats();
    assert_eq!(stats.in_flight, 1);
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.dropped, 48);
    assert_eq!(transport.requests_for(sub.id).len(), 1);

    let report = dispatcher.shutdown().await?;
    assert_eq!(report.stashed, 3);
    Ok(())
}

#[tokio::test]
async fn reject_new_applies_once_deliveries_are_outstanding() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let sub = subscription("down", &[]);
    transport.script(sub.id, &[], 500);
    store.insert_subscription(sub.clone()).await;

    let mut cfg = config();
    cfg.queue_capacity = 3;
    cfg.overflow = OverflowPolicy::RejectNew;
    cfg.max_pending = 1;
    cfg.initial_backoff_ms = 60_000;
    cfg.max_backoff_ms = 60_000;
    cfg.drain_timeout_secs = 0;
    let dispatcher = Dispatcher::new(cfg, store.clone(), transport.clone(), None);
    dispatcher.start().await?;

    dispatcher.emit(event(EventType::IncidentCreated));
    for _ in 0..200 {
        if !transport.requests_for(sub.id).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for _ in 0..10 {
        dispatcher.emit(event(EventType::IncidentCreated));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = dispatcher.stats();
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.rejected, 7);
    dispatcher.shutdown().await?;
    Ok(())
}
