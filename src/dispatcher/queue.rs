use crate::config::OverflowPolicy;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome<T> {
    Accepted,
    /// Queue was full; the oldest item was evicted to make room
    DroppedOldest(T),
    /// Queue was full; the new item was refused
    Rejected(T),
    Closed(T),
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer queue with a configurable overflow policy.
///
/// `push` never waits, so producers are never slowed down by the consumer.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            capacity: capacity.max(1),
            policy,
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, item: T) -> PushOutcome<T> {
        let outcome = {
            let mut inner = self.lock();
            if inner.closed {
                return PushOutcome::Closed(item);
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(item);
                PushOutcome::Accepted
            } else {
                match self.policy {
                    OverflowPolicy::RejectNew => return PushOutcome::Rejected(item),
                    OverflowPolicy::DropOldest => {
                        let dropped = inner.items.pop_front();
                        inner.items.push_back(item);
                        match dropped {
                            Some(dropped) => PushOutcome::DroppedOldest(dropped),
                            None => PushOutcome::Accepted,
                        }
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Next item, waiting if empty. None once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse new items; queued items can still be popped
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Take everything still queued
    pub fn drain(&self) -> Vec<T> {
        self.lock().items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn drop_oldest_keeps_newest() {
        let queue = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(1), PushOutcome::Accepted);
        assert_eq!(queue.push(2), PushOutcome::Accepted);
        assert_eq!(queue.push(3), PushOutcome::DroppedOldest(1));
        assert_eq!(queue.drain(), vec![2, 3]);
    }

    #[test]
    fn reject_new_keeps_oldest() {
        let queue = BoundedQueue::new(2, OverflowPolicy::RejectNew);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.push(3), PushOutcome::Rejected(3));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = Arc::new(BoundedQueue::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("event");
        assert_eq!(consumer.await.unwrap(), Some("event"));
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = BoundedQueue::new(4, OverflowPolicy::DropOldest);
        queue.push(1);
        queue.close();
        assert_eq!(queue.push(2), PushOutcome::Closed(2));
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, None);
    }
}
