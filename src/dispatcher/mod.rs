//! Outbound event dispatcher.
//!
//! Incident and alert events are queued without blocking the producer, fanned
//! out to every matching subscription and delivered with bounded retries.
//! A delivery ends either `delivered` or `dead_lettered`; anything still
//! pending at shutdown goes to the outbox and is re-enqueued on next start.

use crate::config::DispatcherConfig;
use crate::db::models::{DeliveryRecord, DeliveryStatus, PendingDelivery, WebhookSubscription};
use crate::messaging::event::{EventMessage, EventSink};
use crate::messaging::MessageBroker;
use crate::store::Store;
use crate::utils::Backoff;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use sqlx::types::Json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

pub mod queue;
pub mod signing;
pub mod transport;

#[cfg(test)]
mod tests;

pub use queue::{BoundedQueue, PushOutcome};
pub use transport::{DeliveryRequest, DeliveryTransport, HttpTransport};

/// One (event, subscription) delivery and its attempt count so far
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event: EventMessage,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl DeliveryJob {
    pub fn new(subscription_id: Uuid, event: EventMessage) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            event,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    fn into_pending(self) -> PendingDelivery {
        PendingDelivery {
            id: self.id,
            subscription_id: Some(self.subscription_id),
            event: Json(self.event),
            attempts: self.attempts as i32,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Dispatch {
    /// Not yet fanned out
    Event(EventMessage),
    Delivery(DeliveryJob),
}

impl Dispatch {
    fn into_pending(self) -> PendingDelivery {
        match self {
            Self::Event(event) => PendingDelivery {
                id: Uuid::new_v4(),
                subscription_id: None,
                event: Json(event),
                attempts: 0,
                created_at: Utc::now(),
            },
            Self::Delivery(job) => job.into_pending(),
        }
    }

    fn from_pending(pending: PendingDelivery) -> Self {
        match pending.subscription_id {
            None => Self::Event(pending.event.0),
            Some(subscription_id) => Self::Delivery(DeliveryJob {
                id: pending.id,
                subscription_id,
                event: pending.event.0,
                attempts: pending.attempts.max(0) as u32,
                created_at: pending.created_at,
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DispatcherStats {
    pub queued: usize,
    pub in_flight: usize,
    pub accepted: u64,
    pub dropped: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub broker_published: u64,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    dead_lettered: AtomicU64,
    retries: AtomicU64,
    broker_published: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// True when everything finished inside the drain timeout
    pub drained: bool,
    /// Deliveries moved to the outbox
    pub stashed: usize,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    store: Arc<dyn Store>,
    transport: Arc<dyn DeliveryTransport>,
    broker: Option<Arc<MessageBroker>>,
    queue: BoundedQueue<Dispatch>,
    permits: Semaphore,
    /// One permit per delivery taken off the queue and not yet finished
    outstanding: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    in_flight: Mutex<HashMap<Uuid, DeliveryJob>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn DeliveryTransport>,
        broker: Option<Arc<MessageBroker>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: BoundedQueue::new(config.queue_capacity, config.overflow),
            permits: Semaphore::new(config.max_in_flight.max(1)),
            outstanding: Arc::new(Semaphore::new(config.max_pending.max(1))),
            config,
            store,
            transport,
            broker,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashMap::new()),
            consumer: Mutex::new(None),
            counters: Counters::default(),
        })
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<Uuid, DeliveryJob>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn enqueue(&self, item: Dispatch) {
        match self.queue.push(item) {
            PushOutcome::Accepted => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
            PushOutcome::DroppedOldest(dropped) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Dispatch queue full, dropped oldest item {}", describe(&dropped));
            }
            PushOutcome::Rejected(rejected) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Dispatch queue full, rejected {}", describe(&rejected));
            }
            PushOutcome::Closed(item) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("Dispatcher is shut down, refused {}", describe(&item));
            }
        }
    }

    /// Re-enqueue the outbox and start the consumer
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let pending = self.store.take_pending().await?;
        if !pending.is_empty() {
            info!("Re-enqueuing {} pending deliveries from the outbox", pending.len());
        }
        for item in pending {
            self.enqueue(Dispatch::from_pending(item));
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                // nothing leaves the queue until a delivery slot is free
                let Some(permit) = this.acquire_outstanding().await else {
                    break;
                };
                let item = tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    item = this.queue.pop() => item,
                };
                let Some(item) = item else {
                    break;
                };
                match item {
                    Dispatch::Event(event) => this.fan_out(event, permit).await,
                    Dispatch::Delivery(job) => this.resume(job, permit).await,
                }
            }
            debug!("Dispatcher consumer stopped");
        });

        let mut consumer = match self.consumer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *consumer = Some(handle);
        info!(
            "Dispatcher started (capacity {}, {:?} on overflow)",
            self.queue.capacity(),
            self.config.overflow
        );
        Ok(())
    }

    /// None once cancelled
    async fn acquire_outstanding(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            permit = self.outstanding.clone().acquire_owned() => permit.ok(),
        }
    }

    async fn fan_out(self: &Arc<Self>, event: EventMessage, permit: OwnedSemaphorePermit) {
        if self.config.publish_to_broker {
            if let Some(broker) = self.broker.as_ref().filter(|b| b.is_connected()) {
                match broker.publish(&event).await {
                    Ok(()) => {
                        self.counters.broker_published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!("Failed to publish {} to broker: {}", event.event_type, e),
                }
            }
        }

        let subscriptions = match self.store.active_subscriptions().await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!("Failed to load subscriptions for {}: {}", event.id, e);
                if let Err(e) = self.store.stash_pending(&[Dispatch::Event(event).into_pending()]).await {
                    error!("Failed to stash event: {}", e);
                }
                return;
            }
        };

        let event_type = event.event_type.to_string();
        let mut first = Some(permit);
        for subscription in subscriptions.into_iter().filter(|s| s.accepts(&event_type)) {
            let job = DeliveryJob::new(subscription.id, event.clone());
            let permit = match first.take() {
                Some(permit) => Some(permit),
                None => self.acquire_outstanding().await,
            };
            match permit {
                Some(permit) => self.spawn_delivery(subscription, job, permit),
                // cancelled while waiting for a slot: left for the outbox
                None => {
                    self.in_flight().insert(job.id, job);
                }
            }
        }
    }

    async fn resume(self: &Arc<Self>, job: DeliveryJob, permit: OwnedSemaphorePermit) {
        match self.store.active_subscriptions().await {
            Ok(subscriptions) => match subscriptions.into_iter().find(|s| s.id == job.subscription_id) {
                Some(subscription) => self.spawn_delivery(subscription, job, permit),
                None => warn!(
                    "Subscription {} is gone, discarding delivery {}",
                    job.subscription_id, job.id
                ),
            },
            Err(e) => {
                error!("Failed to load subscription for delivery {}: {}", job.id, e);
                self.in_flight().insert(job.id, job);
            }
        }
    }

    fn spawn_delivery(
        self: &Arc<Self>,
        subscription: WebhookSubscription,
        job: DeliveryJob,
        permit: OwnedSemaphorePermit,
    ) {
        self.in_flight().insert(job.id, job.clone());
        let this = self.clone();
        self.tracker.spawn(async move {
            this.deliver(subscription, job).await;
            drop(permit);
        });
    }

    async fn deliver(&self, subscription: WebhookSubscription, mut job: DeliveryJob) {
        let backoff = Backoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        )
        .with_jitter();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_status = None;
        let mut last_error = None;

        while job.attempts < max_attempts {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => return,
                permit = self.permits.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            job.attempts += 1;
            if job.attempts > 1 {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
            }
            let request = DeliveryRequest {
                delivery_id: job.id,
                event: job.event.clone(),
                attempt: job.attempts,
            };
            let result = self.transport.deliver(&subscription, &request).await;
            drop(permit);

            match result {
                Ok(status) if (200..300).contains(&status) => {
                    self.finish(&job, DeliveryStatus::Delivered, Some(status), None).await;
                    return;
                }
                Ok(status) => {
                    last_status = Some(status);
                    last_error = Some(format!("HTTP {}", status));
                }
                Err(e) => last_error = Some(e.to_string()),
            }
            debug!(
                "Delivery {} to {} failed (attempt {}/{}): {}",
                job.id,
                subscription.name,
                job.attempts,
                max_attempts,
                last_error.as_deref().unwrap_or_default()
            );
            self.in_flight().insert(job.id, job.clone());

            if job.attempts >= max_attempts {
                break;
            }
            let delay = backoff.delay_for_attempt(job.attempts);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        warn!(
            "Dead-lettering delivery {} of {} to {} after {} attempts: {}",
            job.id,
            job.event.event_type,
            subscription.name,
            job.attempts,
            last_error.as_deref().unwrap_or("unknown error")
        );
        self.finish(&job, DeliveryStatus::DeadLettered, last_status, last_error)
            .await;
    }

    async fn finish(
        &self,
        job: &DeliveryJob,
        status: DeliveryStatus,
        status_code: Option<u16>,
        error: Option<String>,
    ) {
        let record = DeliveryRecord {
            id: job.id,
            subscription_id: job.subscription_id,
            event_id: job.event.id,
            event_type: job.event.event_type.to_string(),
            status,
            attempts: job.attempts as i32,
            last_status_code: status_code.map(i32::from),
            last_error: error,
            created_at: job.created_at,
            completed_at: Utc::now(),
        };
        match status {
            DeliveryStatus::Delivered => self.counters.delivered.fetch_add(1, Ordering::Relaxed),
            DeliveryStatus::DeadLettered => self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed),
        };
        if let Err(e) = self.store.record_delivery(&record).await {
            error!("Failed to record delivery {}: {}", job.id, e);
        }
        self.in_flight().remove(&job.id);
    }

    /// Stop accepting events, let queued and in-flight deliveries finish
    /// within the drain timeout, then move whatever is left to the outbox
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.queue.close();
        self.tracker.close();
        let mut consumer = match self.consumer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let drain_timeout = Duration::from_secs(self.config.drain_timeout_secs);
        let drained = tokio::time::timeout(drain_timeout, async {
            if let Some(handle) = consumer.as_mut() {
                let _ = handle.await;
            }
            consumer = None;
            self.tracker.wait().await;
        })
        .await
        .is_ok();

        if !drained {
            warn!("Dispatcher did not drain within {:?}, cancelling", drain_timeout);
            self.cancel.cancel();
            // the consumer may still be parking jobs for the outbox
            if let Some(handle) = consumer {
                let _ = handle.await;
            }
            self.tracker.wait().await;
        }

        let mut pending: Vec<PendingDelivery> = self
            .queue
            .drain()
            .into_iter()
            .map(Dispatch::into_pending)
            .collect();
        pending.extend(self.in_flight().drain().map(|(_, job)| job.into_pending()));

        if !pending.is_empty() {
            self.store.stash_pending(&pending).await?;
            info!("Moved {} undelivered item(s) to the outbox", pending.len());
        }
        self.cancel.cancel();

        Ok(ShutdownReport {
            drained,
            stashed: pending.len(),
        })
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queued: self.queue.len(),
            in_flight: self.in_flight().len(),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            broker_published: self.counters.broker_published.load(Ordering::Relaxed),
        }
    }
}

impl EventSink for Dispatcher {
    fn emit(&self, event: EventMessage) {
        self.enqueue(Dispatch::Event(event));
    }
}

fn describe(item: &Dispatch) -> String {
    match item {
        Dispatch::Event(event) => format!("event {} ({})", event.id, event.event_type),
        Dispatch::Delivery(job) => format!("delivery {} ({})", job.id, job.event.event_type),
    }
}
