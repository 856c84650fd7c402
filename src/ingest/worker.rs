use super::processor::MessageProcessor;
use super::topic::Route;
use super::{InboundMessage, InboundSink, IngestStats};
use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Job {
    route: Route,
    message: InboundMessage,
}

/// Fixed set of workers, each fed by its own bounded queue.
///
/// Messages are assigned by hashing the route's device key, so every
/// message for one gateway or camera is processed in arrival order by a
/// single worker.
pub struct WorkerPool {
    processor: Arc<MessageProcessor>,
    senders: Mutex<Option<Vec<mpsc::Sender<Job>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(processor: Arc<MessageProcessor>, workers: usize, queue_size: usize) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (tx, rx) = mpsc::channel(queue_size.max(1));
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(index, processor.clone(), rx)));
        }
        info!("Started {} ingest worker(s)", workers);

        Self {
            processor,
            senders: Mutex::new(Some(senders)),
            handles: Mutex::new(handles),
        }
    }

    fn sender_for(&self, partition: &str) -> Option<mpsc::Sender<Job>> {
        let senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let senders = senders.as_ref()?;
        let mut hasher = DefaultHasher::new();
        partition.hash(&mut hasher);
        let index = (hasher.finish() % senders.len() as u64) as usize;
        Some(senders[index].clone())
    }

    /// Stop accepting messages and wait for queued ones to finish.
    /// Returns false if the drain timed out.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let senders = match self.senders.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(senders);

        let handles: Vec<_> = match self.handles.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        if handles.is_empty() {
            return true;
        }

        match tokio::time::timeout(timeout, join_all(handles)).await {
            Ok(_) => {
                info!("Ingest workers drained");
                true
            }
            Err(_) => {
                warn!("Ingest workers did not drain within {:?}", timeout);
                false
            }
        }
    }
}

#[async_trait]
impl InboundSink for WorkerPool {
    async fn submit(&self, message: InboundMessage) -> Result<()> {
        let stats = self.processor.stats();
        IngestStats::bump(&stats.received);

        let route = self.processor.router().route(&message.topic);
        let Some(partition) = route.partition_key() else {
            match &route {
                Route::Malformed { reason } => {
                    IngestStats::bump(&stats.malformed);
                    warn!("Malformed topic {}: {}", message.topic, reason);
                }
                _ => {
                    IngestStats::bump(&stats.unrecognized);
                    debug!("No route for topic {}", message.topic);
                }
            }
            return Ok(());
        };

        let sender = self
            .sender_for(&partition)
            .ok_or_else(|| Error::Transport("ingest pool is shut down".to_string()))?;
        sender
            .send(Job { route, message })
            .await
            .map_err(|_| Error::Transport("ingest worker stopped".to_string()))?;
        Ok(())
    }
}

async fn run_worker(index: usize, processor: Arc<MessageProcessor>, mut rx: mpsc::Receiver<Job>) {
    debug!("Ingest worker {} started", index);
    let stats = processor.stats().clone();

    while let Some(job) = rx.recv().await {
        let outcome = AssertUnwindSafe(processor.process(&job.route, &job.message))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => IngestStats::bump(&stats.processed),
            Ok(Err(e)) => {
                IngestStats::bump(&stats.failed);
                warn!("Failed to process message on {}: {}", job.message.topic, e);
            }
            Err(_) => {
                IngestStats::bump(&stats.panics);
                error!("Ingest worker {} panicked on {}", index, job.message.topic);
            }
        }
    }

    debug!("Ingest worker {} stopped", index);
}
