use crate::config::RetentionConfig;
use crate::db::models::DailyUsage;
use crate::sessionizer::sessionize_pairs;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::{debug, error, info};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub usage_rows: usize,
    pub sessions: usize,
    pub held_sessions: usize,
    pub purged_logs: u64,
}

/// Rolls expired collection logs into daily usage rows, then purges them
pub struct RetentionService {
    config: RetentionConfig,
    store: Arc<dyn Store>,
    gap: Duration,
}

impl RetentionService {
    pub fn new(config: RetentionConfig, store: Arc<dyn Store>, gap: Duration) -> Self {
        Self { config, store, gap }
    }

    /// Start the retention loop in the background
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.enabled {
            info!("Retention service is disabled");
            return None;
        }

        info!(
            "Starting retention service: keep {} days, run every {} minutes",
            self.config.retention_days, self.config.interval_minutes
        );

        Some(tokio::spawn(async move {
            let mut interval = interval(std::time::Duration::from_secs(
                self.config.interval_minutes.max(1) * 60,
            ));

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            error!("Error running retention rollup: {}", e);
                        }
                    }
                }
            }
            debug!("Retention service stopped");
        }))
    }

    /// Roll up and purge everything older than the retention window.
    ///
    /// A pair's trailing session is held back while a reading at or after the
    /// cutoff could still extend it. Its logs stay put and are rolled up whole
    /// by a later run.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RollupReport> {
        let cutoff = now - Duration::days(self.config.retention_days.max(0));
        let logs = self.store.collection_logs_before(cutoff).await?;
        if logs.is_empty() {
            debug!("No collection logs older than {}", cutoff);
            return Ok(RollupReport::default());
        }

        info!("Rolling up {} collection logs older than {}", logs.len(), cutoff);

        let spans = sessionize_pairs(
            logs.iter()
                .map(|log| ((log.tag_id, log.gateway_id), log.recorded_at)),
            self.gap,
        );

        let mut usage: BTreeMap<(Uuid, Uuid, NaiveDate), DailyUsage> = BTreeMap::new();
        let mut held_from: HashMap<(Uuid, Uuid), DateTime<Utc>> = HashMap::new();
        let mut sessions = 0;
        let mut held_sessions = 0;
        for ((tag_id, gateway_id), mut pair_spans) in spans {
            if let Some(last) = pair_spans.last() {
                if cutoff - last.end <= self.gap {
                    held_from.insert((tag_id, gateway_id), last.start);
                    held_sessions += 1;
                    pair_spans.pop();
                }
            }

            for span in pair_spans {
                sessions += 1;
                let day = span.start.date_naive();
                let row = usage.entry((tag_id, gateway_id, day)).or_insert(DailyUsage {
                    tag_id,
                    gateway_id,
                    day,
                    dwell_seconds: 0,
                    sessions: 0,
                    samples: 0,
                });
                row.dwell_seconds += span.duration().num_seconds();
                row.sessions += 1;
                row.samples += span.samples as i64;
            }
        }

        let rolled_up: Vec<Uuid> = logs
            .iter()
            .filter(|log| match held_from.get(&(log.tag_id, log.gateway_id)) {
                Some(start) => log.recorded_at < *start,
                None => true,
            })
            .map(|log| log.id)
            .collect();

        let rows: Vec<DailyUsage> = usage.into_values().collect();
        let purged_logs = if rolled_up.is_empty() {
            0
        } else {
            self.store.apply_rollup(&rows, &rolled_up).await?
        };

        info!(
            "Retention rollup wrote {} usage rows from {} sessions, purged {} logs, held back {} open sessions",
            rows.len(),
            sessions,
            purged_logs,
            held_sessions
        );

        Ok(RollupReport {
            usage_rows: rows.len(),
            sessions,
            held_sessions,
            purged_logs,
        })
    }
}
