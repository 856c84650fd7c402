//! Wires the ingestion path, background loops and dispatcher into one service
//! with an explicit start/shutdown lifecycle.

use crate::alerts::{EngineStats, RuleEngine};
use crate::config::Config;
use crate::dispatcher::{DeliveryTransport, Dispatcher, DispatcherStats};
use crate::error::Error;
use crate::incidents::IncidentManager;
use crate::ingest::{InboundMessage, InboundSink, IngestSnapshot, IngestStats, MessageProcessor, TopicRouter, WorkerPool};
use crate::messaging::event::{EventMessage, EventSink, EventType};
use crate::messaging::{LifecycleEvents, MessageBroker};
use crate::services::RetentionService;
use crate::sessionizer::Sessionizer;
use crate::state::{GatewayLivenessMonitor, RegistrationStats, StateStore};
use crate::store::Store;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pairs idle for longer than this are dropped from the live sessionizer
/// and from the rule engine's threshold streaks
const SESSION_IDLE_HORIZON_SECS: i64 = 3600;

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    /// None when running without a broker
    pub broker_connected: Option<bool>,
    pub store_reachable: bool,
    pub queue_depth: usize,
    pub open_pairs: usize,
    pub uptime_secs: i64,
    pub ingest: IngestSnapshot,
    pub rules: EngineStats,
    pub dispatcher: DispatcherStats,
    pub registrations: RegistrationStats,
}

pub struct Pipeline {
    config: Config,
    store: Arc<dyn Store>,
    broker: Option<Arc<MessageBroker>>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<StateStore>,
    sessionizer: Arc<Sessionizer>,
    incidents: Arc<IncidentManager>,
    engine: Arc<RuleEngine>,
    liveness: Arc<GatewayLivenessMonitor>,
    retention: Arc<RetentionService>,
    workers: Arc<WorkerPool>,
    stats: Arc<IngestStats>,
    router: TopicRouter,
    subscriber_cancel: CancellationToken,
    background_cancel: CancellationToken,
    subscriber: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Pipeline {
    /// Build every component. Must be called inside a tokio runtime.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        transport: Arc<dyn DeliveryTransport>,
        broker: Option<Arc<MessageBroker>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let dispatcher = Dispatcher::new(
            config.dispatcher.clone(),
            store.clone(),
            transport,
            broker.clone(),
        );
        let events = LifecycleEvents::new(dispatcher.clone());

        let state = Arc::new(StateStore::new(store.clone()));
        let sessionizer = Arc::new(Sessionizer::new(
            config.ingest.session_gap(),
            config.ingest.session_history,
        ));
        let incidents = Arc::new(IncidentManager::new(store.clone(), events.clone()));
        let engine = Arc::new(RuleEngine::new(
            store.clone(),
            incidents.clone(),
            events.clone(),
            Duration::from_secs(config.alerts.rule_refresh_secs),
        ));
        let liveness = Arc::new(GatewayLivenessMonitor::new(
            store.clone(),
            events,
            chrono::Duration::seconds(config.alerts.gateway_offline_secs as i64),
            config.alerts.liveness_interval(),
        ));
        let retention = Arc::new(RetentionService::new(
            config.retention.clone(),
            store.clone(),
            config.ingest.session_gap(),
        ));

        let router = TopicRouter::new(
            &config.message_broker.rtls_topic_base,
            &config.message_broker.camera_topic_base,
        );
        let stats = Arc::new(IngestStats::default());
        let processor = Arc::new(MessageProcessor::new(
            router.clone(),
            state.clone(),
            sessionizer.clone(),
            engine.clone(),
            incidents.clone(),
            stats.clone(),
            &config.ingest,
        ));
        let workers = Arc::new(WorkerPool::new(
            processor,
            config.ingest.workers,
            config.ingest.worker_queue,
        ));

        Ok(Arc::new(Self {
            config,
            store,
            broker,
            dispatcher,
            state,
            sessionizer,
            incidents,
            engine,
            liveness,
            retention,
            workers,
            stats,
            router,
            subscriber_cancel: CancellationToken::new(),
            background_cancel: CancellationToken::new(),
            subscriber: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            started_at: Utc::now(),
        }))
    }

    /// Connect, start the subscriber and every background loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match &self.broker {
            Some(broker) => {
                match broker.connect().await {
                    Ok(()) => {}
                    Err(e) if self.config.message_broker.required => {
                        return Err(Error::Transport(format!("Broker unreachable at startup: {}", e)).into());
                    }
                    Err(e) => warn!("Broker unreachable at startup, will keep retrying: {}", e),
                }
                let handle = broker.clone().run_subscriber(
                    self.router.filters(),
                    self.workers.clone(),
                    self.subscriber_cancel.clone(),
                );
                *guard(&self.subscriber) = Some(handle);
            }
            None => warn!("No message broker configured; telemetry is accepted only through submit()"),
        }

        self.dispatcher.start().await?;

        let mut tasks = Vec::new();
        tasks.push(self.spawn_sweep());
        tasks.push(self.liveness.clone().start(self.background_cancel.clone()));
        if let Some(handle) = self.retention.clone().start(self.background_cancel.clone()) {
            tasks.push(handle);
        }
        guard(&self.tasks).extend(tasks);

        match EventMessage::new(
            EventType::SystemStartup,
            None,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "timestamp": Utc::now().to_rfc3339()
            }),
        ) {
            Ok(event) => self.dispatcher.emit(event),
            Err(e) => warn!("Failed to build startup event: {}", e),
        }

        info!("Pipeline started");
        Ok(())
    }

    /// Absence sweep plus idle pair eviction, on the sweep interval
    fn spawn_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let cancel = self.background_cancel.clone();
        let period = Duration::from_secs(self.config.alerts.sweep_interval_secs.max(1));
        info!("Starting absence sweep every {:?}", period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let now = Utc::now();
                        match this.engine.sweep(now).await {
                            Ok(outcomes) => {
                                let fired = outcomes.iter().filter(|o| o.is_fired()).count();
                                if fired > 0 {
                                    info!("Absence sweep fired {} alert(s)", fired);
                                }
                            }
                            Err(e) => error!("Absence sweep failed: {}", e),
                        }
                        let horizon = chrono::Duration::seconds(SESSION_IDLE_HORIZON_SECS);
                        let evicted = this.sessionizer.evict_idle(now, horizon);
                        if evicted > 0 {
                            info!("Evicted {} idle presence pair(s)", evicted);
                        }
                        let streaks = this.engine.evict_idle_streaks(now, horizon);
                        if streaks > 0 {
                            debug!("Evicted {} idle threshold streak(s)", streaks);
                        }
                    }
                }
            }
        })
    }

    /// Ordered shutdown: unsubscribe, drain workers, stop background loops,
    /// then let the dispatcher finish or stash its deliveries
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down pipeline");

        self.subscriber_cancel.cancel();
        let subscriber = guard(&self.subscriber).take();
        if let Some(handle) = subscriber {
            if let Err(e) = handle.await {
                warn!("Subscriber task ended abnormally: {}", e);
            }
        }

        let drain = Duration::from_secs(self.config.ingest.drain_timeout_secs);
        if !self.workers.shutdown(drain).await {
            warn!("Some in-flight messages were abandoned after {:?}", drain);
        }

        self.background_cancel.cancel();
        let tasks: Vec<_> = guard(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.dispatcher.emit(EventMessage::new_empty(EventType::SystemShutdown, None));
        let report = self.dispatcher.shutdown().await?;
        info!(
            "Pipeline stopped (dispatcher drained: {}, stashed: {})",
            report.drained, report.stashed
        );
        Ok(())
    }

    pub async fn health(&self) -> Health {
        let broker_connected = self.broker.as_ref().map(|b| b.is_connected());
        let store_reachable = self.store.ping().await.is_ok();
        let status = match (broker_connected, store_reachable) {
            (Some(false), _) | (_, false) => "degraded",
            _ => "ok",
        };
        Health {
            status,
            broker_connected,
            store_reachable,
            queue_depth: self.dispatcher.queue_depth(),
            open_pairs: self.sessionizer.pair_count(),
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
            ingest: self.stats.snapshot(),
            rules: self.engine.stats(),
            dispatcher: self.dispatcher.stats(),
            registrations: self.state.registrations(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn incidents(&self) -> &Arc<IncidentManager> {
        &self.incidents
    }

    pub fn sessionizer(&self) -> &Arc<Sessionizer> {
        &self.sessionizer
    }

    pub fn rules(&self) -> &Arc<RuleEngine> {
        &self.engine
    }
}

#[async_trait]
impl InboundSink for Pipeline {
    async fn submit(&self, message: InboundMessage) -> Result<()> {
        self.workers.submit(message).await
    }
}
