//! Inbound telemetry: topic routing, payload parsing and the worker pool that
//! applies each message to state, sessions, rules and incidents.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod camera;
pub mod mac;
pub mod processor;
pub mod rtls;
pub mod topic;
pub mod worker;


pub use processor::MessageProcessor;
pub use topic::{Route, TopicRouter};
pub use worker::WorkerPool;

/// Raw message as received from the transport
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// Where the subscriber hands off received messages
#[async_trait]
pub trait InboundSink: Send + Sync {
    async fn submit(&self, message: InboundMessage) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSnapshot {
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub unrecognized: u64,
    pub malformed: u64,
    pub readings: u64,
    pub rejected_readings: u64,
    pub camera_events: u64,
    /// Messages stored fine but whose rule evaluation errored
    pub rule_failures: u64,
    pub panics: u64,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub received: AtomicU64,
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub unrecognized: AtomicU64,
    pub malformed: AtomicU64,
    pub readings: AtomicU64,
    pub rejected_readings: AtomicU64,
    pub camera_events: AtomicU64,
    pub rule_failures: AtomicU64,
    pub panics: AtomicU64,
}

impl IngestStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            unrecognized: self.unrecognized.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            readings: self.readings.load(Ordering::Relaxed),
            rejected_readings: self.rejected_readings.load(Ordering::Relaxed),
            camera_events: self.camera_events.load(Ordering::Relaxed),
            rule_failures: self.rule_failures.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}
