use crate::db::models::DeviceStatus;
use crate::messaging::lifecycle::LifecycleEvents;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Flags gateways that stop reporting and announces when they come back.
///
/// Only status changes produce events; the first observation of a gateway
/// just seeds the cache.
pub struct GatewayLivenessMonitor {
    store: Arc<dyn Store>,
    events: LifecycleEvents,
    threshold: Duration,
    interval: std::time::Duration,
    known: Mutex<HashMap<Uuid, DeviceStatus>>,
}

impl GatewayLivenessMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        events: LifecycleEvents,
        threshold: Duration,
        interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            events,
            threshold,
            interval,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Run one pass. Returns the number of status changes.
    pub async fn check(&self, now: DateTime<Utc>) -> Result<usize> {
        let gateways = self.store.list_gateways().await?;
        let mut changes = 0;

        for gateway in gateways {
            let silent = gateway.last_seen_at.map(|seen| now - seen);
            let observed = match silent {
                Some(silent) if silent <= self.threshold => DeviceStatus::Online,
                _ => DeviceStatus::Offline,
            };

            let previous = {
                let mut known = match self.known.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                known.insert(gateway.id, observed)
            };

            match previous {
                None => {
                    if gateway.status != observed {
                        self.store.set_gateway_status(gateway.id, observed).await?;
                    }
                }
                Some(previous) if previous != observed => {
                    self.store.set_gateway_status(gateway.id, observed).await?;
                    changes += 1;
                    match observed {
                        DeviceStatus::Offline => self.events.gateway_offline(
                            &gateway,
                            silent.map(|s| s.num_seconds()).unwrap_or_default(),
                        ),
                        DeviceStatus::Online => self.events.gateway_online(&gateway),
                    }
                }
                Some(_) => {}
            }
        }

        if changes > 0 {
            debug!("Gateway liveness pass recorded {} status change(s)", changes);
        }
        Ok(changes)
    }

    /// Start the monitor in the background
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        info!(
            "Starting gateway liveness monitor (offline after {}s, every {:?})",
            self.threshold.num_seconds(),
            self.interval
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.check(Utc::now()).await {
                            error!("Gateway liveness check failed: {}", e);
                        }
                    }
                }
            }
            debug!("Gateway liveness monitor stopped");
        })
    }
}
