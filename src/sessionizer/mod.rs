//! Folds raw proximity readings into contiguous presence sessions.
//!
//! Two readings of the same (tag, device) pair belong to one session iff the
//! gap between them is at most the configured threshold. Live state is kept
//! per pair behind an explicit handle; [`sessionize`] recomputes sessions
//! offline from stored logs with the exact same rule.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub tag: String,
    pub device: String,
}

impl PairKey {
    pub fn new(tag: &str, device: &str) -> Self {
        Self {
            tag: tag.to_string(),
            device: device.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceSession {
    pub tag: String,
    pub device: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples: u32,
    /// Samples that arrived with a timestamp before `end`
    pub late_samples: u32,
}

impl PresenceSession {
    fn open(key: &PairKey, at: DateTime<Utc>) -> Self {
        Self {
            tag: key.tag.clone(),
            device: key.device.clone(),
            start: at,
            end: at,
            samples: 1,
            late_samples: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// What a single observation did to the pair's session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Opened(PresenceSession),
    Extended(PresenceSession),
    /// The gap was exceeded: `closed` ended and `opened` started at the new reading
    Rotated {
        closed: PresenceSession,
        opened: PresenceSession,
    },
    /// Timestamp earlier than the session end. Counted, end not rewound.
    Late(PresenceSession),
}

impl SessionUpdate {
    /// The session that is open after this update
    pub fn current(&self) -> &PresenceSession {
        match self {
            Self::Opened(s) | Self::Extended(s) | Self::Late(s) => s,
            Self::Rotated { opened, .. } => opened,
        }
    }
}

#[derive(Debug, Default)]
pub struct PairState {
    open: Option<PresenceSession>,
    history: VecDeque<PresenceSession>,
}

/// Exclusive handle on one pair's session state
pub type PairHandle = Arc<Mutex<PairState>>;

/// Sessions for one pair, for reporting
#[derive(Debug, Clone, Serialize)]
pub struct PairSessions {
    pub current: PresenceSession,
    /// False once the gap has elapsed since the last sample
    pub active: bool,
    pub recent: Vec<PresenceSession>,
}

pub struct Sessionizer {
    gap: Duration,
    history_limit: usize,
    pairs: Mutex<HashMap<PairKey, PairHandle>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Sessionizer {
    pub fn new(gap: Duration, history_limit: usize) -> Self {
        Self {
            gap,
            history_limit,
            pairs: Mutex::new(HashMap::new()),
        }
    }

    pub fn gap(&self) -> Duration {
        self.gap
    }

    /// Handle for the pair, created on first use
    pub fn handle(&self, key: &PairKey) -> PairHandle {
        guard(&self.pairs)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Apply one reading. Callers must feed a given pair in arrival order.
    pub fn observe(&self, key: &PairKey, at: DateTime<Utc>) -> SessionUpdate {
        let handle = self.handle(key);
        let mut state = guard(&handle);

        let Some(open) = state.open.as_mut() else {
            let session = PresenceSession::open(key, at);
            state.open = Some(session.clone());
            return SessionUpdate::Opened(session);
        };

        if at < open.end {
            open.samples += 1;
            open.late_samples += 1;
            return SessionUpdate::Late(open.clone());
        }

        if at - open.end <= self.gap {
            open.end = at;
            open.samples += 1;
            return SessionUpdate::Extended(open.clone());
        }

        let closed = std::mem::replace(open, PresenceSession::open(key, at));
        let opened = open.clone();
        state.history.push_back(closed.clone());
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
        SessionUpdate::Rotated { closed, opened }
    }

    pub fn current(&self, key: &PairKey) -> Option<PresenceSession> {
        let handle = guard(&self.pairs).get(key).cloned()?;
        let state = guard(&handle);
        state.open.clone()
    }

    /// Current and recently closed sessions, optionally filtered by tag or device
    pub fn snapshot(
        &self,
        tag: Option<&str>,
        device: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<PairSessions> {
        let handles: Vec<(PairKey, PairHandle)> = guard(&self.pairs)
            .iter()
            .filter(|(key, _)| tag.map_or(true, |t| key.tag == t))
            .filter(|(key, _)| device.map_or(true, |d| key.device == d))
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();

        let mut result: Vec<PairSessions> = handles
            .into_iter()
            .filter_map(|(_, handle)| {
                let state = guard(&handle);
                let current = state.open.clone()?;
                Some(PairSessions {
                    active: now - current.end <= self.gap,
                    recent: state.history.iter().cloned().collect(),
                    current,
                })
            })
            .collect();
        result.sort_by(|a, b| {
            (&a.current.tag, &a.current.device).cmp(&(&b.current.tag, &b.current.device))
        });
        result
    }

    /// Drop pairs whose last sample is older than `horizon`. Returns how many were dropped.
    pub fn evict_idle(&self, now: DateTime<Utc>, horizon: Duration) -> usize {
        let mut pairs = guard(&self.pairs);
        let before = pairs.len();
        pairs.retain(|_, handle| {
            let state = guard(handle);
            state.open.as_ref().map_or(false, |s| now - s.end <= horizon)
        });
        before - pairs.len()
    }

    pub fn pair_count(&self) -> usize {
        guard(&self.pairs).len()
    }
}

/// Offline session span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub samples: u32,
}

impl Span {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

/// Exact gap-rule sessionization of one pair's timestamps, in any input order
pub fn sessionize(timestamps: &[DateTime<Utc>], gap: Duration) -> Vec<Span> {
    let mut sorted = timestamps.to_vec();
    sorted.sort();

    let mut spans: Vec<Span> = Vec::new();
    for at in sorted {
        match spans.last_mut() {
            Some(span) if at - span.end <= gap => {
                span.end = at;
                span.samples += 1;
            }
            _ => spans.push(Span {
                start: at,
                end: at,
                samples: 1,
            }),
        }
    }
    spans
}

/// Group samples by pair key and sessionize each pair
pub fn sessionize_pairs<K, I>(samples: I, gap: Duration) -> BTreeMap<K, Vec<Span>>
where
    K: Ord,
    I: IntoIterator<Item = (K, DateTime<Utc>)>,
{
    let mut grouped: BTreeMap<K, Vec<DateTime<Utc>>> = BTreeMap::new();
    for (key, at) in samples {
        grouped.entry(key).or_default().push(at);
    }
    grouped
        .into_iter()
        .map(|(key, timestamps)| {
            let spans = sessionize(&timestamps, gap);
            (key, spans)
        })
        .collect()
}
