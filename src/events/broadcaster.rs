// src/events/broadcaster.rs
//! Live fan-out of run events and reconciliation notices

use crate::model::{Event, EventKind, RunId, RunStatus};
use crate::observability::{MetricsRecorder, NoopMetrics, SUBSCRIBERS_DROPPED};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Default per-subscriber queue bound
pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;

/// What the reconciler decided about a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    /// Process gone past the grace period; run moved to `orphaned`
    Orphaned,

    /// Process alive but quiet; `last_progress` re-touched
    StaleRecovered,

    /// Lingering process of a terminal run was killed
    LingeringKilled,
}

/// Reconciliation decision, delivered live only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileNotice {
    pub run_id: RunId,
    pub action: ReconcileAction,
    pub status: RunStatus,
    pub pid: Option<u32>,
    pub at: DateTime<Utc>,
}

/// Message fanned out to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum Broadcast {
    /// Event committed to the run's log
    Event(Event),

    Reconciliation(ReconcileNotice),

    /// An append was abandoned after its retries ran out
    AppendFailed {
        run_id: RunId,
        kind: EventKind,
        error: String,
    },
}

impl Broadcast {
    pub fn run_id(&self) -> &RunId {
        match self {
            Broadcast::Event(e) => &e.run_id,
            Broadcast::Reconciliation(n) => &n.run_id,
            Broadcast::AppendFailed { run_id, .. } => run_id,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Broadcast::Event(e) => Some(e),
            _ => None,
        }
    }
}

/// Fire-and-forget sink the event log and reconciler publish into
pub trait Publisher: Send + Sync {
    fn publish(&self, message: Broadcast);
}

struct Subscriber {
    filter: Option<RunId>,
    sender: mpsc::Sender<Broadcast>,
    overflowed: Arc<AtomicBool>,
}

/// Broadcaster statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcasterStats {
    /// Messages handed to `publish`
    pub published: u64,

    /// Individual subscriber deliveries
    pub delivered: u64,

    /// Subscribers dropped because their queue was full
    pub disconnected: u64,

    /// Currently registered subscribers
    pub subscribers: usize,
}

/// Bounded-queue fan-out
///
/// `publish` never awaits: each delivery is a `try_send`. A subscriber whose
/// queue is full is removed and its receiver sees the end of the stream.
pub struct Broadcaster {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    published: AtomicU64,
    delivered: AtomicU64,
    disconnected: AtomicU64,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Broadcaster {
    pub fn new(capacity: usize, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            disconnected: AtomicU64::new(0),
            metrics,
        }
    }

    /// Register a subscriber, optionally limited to one run
    pub fn subscribe(&self, run_id: Option<RunId>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));

        self.subscribers.write().insert(
            id,
            Subscriber {
                filter: run_id,
                sender,
                overflowed: overflowed.clone(),
            },
        );
        debug!(subscriber = id, "Subscriber registered");

        Subscription {
            id,
            receiver,
            overflowed,
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscribers.write().remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn stats(&self) -> BroadcasterStats {
        BroadcasterStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_QUEUE, Arc::new(NoopMetrics))
    }
}

impl Publisher for Broadcaster {
    fn publish(&self, message: Broadcast) {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut overflowed = Vec::new();
        let mut closed = Vec::new();
        {
            let subscribers = self.subscribers.read();
            for (id, sub) in subscribers.iter() {
                if sub.filter.as_ref().is_some_and(|f| f != message.run_id()) {
                    continue;
                }
                match sub.sender.try_send(message.clone()) {
                    Ok(()) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Full(_)) => {
                        sub.overflowed.store(true, Ordering::Release);
                        overflowed.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }

        if overflowed.is_empty() && closed.is_empty() {
            return;
        }

        let mut subscribers = self.subscribers.write();
        for id in &overflowed {
            if subscribers.remove(id).is_some() {
                self.disconnected.fetch_add(1, Ordering::Relaxed);
                self.metrics.incr_counter(SUBSCRIBERS_DROPPED, &[]);
                warn!(subscriber = id, capacity = self.capacity, "Subscriber queue full, disconnecting");
            }
        }
        for id in &closed {
            subscribers.remove(id);
        }
    }
}

/// Receiving end of a subscription
///
/// `recv` returns `None` once the subscriber was disconnected (or the
/// broadcaster went away); `was_disconnected` tells the two apart.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Broadcast>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Broadcast> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Broadcast> {
        self.receiver.try_recv().ok()
    }

    /// Whether the broadcaster dropped this subscriber for falling behind
    pub fn was_disconnected(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock;

    fn event(run: &str, seq: u64) -> Broadcast {
        Broadcast::Event(Event {
            run_id: RunId::new(run),
            seq,
            timestamp: clock::now(),
            kind: EventKind::RunnerOutput,
            payload: serde_json::json!({ "seq": seq }),
        })
    }

    #[tokio::test]
    async fn test_filtered_delivery() {
        let b = Broadcaster::default();
        let mut all = b.subscribe(None);
        let mut only_a = b.subscribe(Some(RunId::new("a")));

        b.publish(event("a", 1));
        b.publish(event("b", 1));

        assert_eq!(all.recv().await.unwrap().run_id().as_str(), "a");
        assert_eq!(all.recv().await.unwrap().run_id().as_str(), "b");
        assert_eq!(only_a.recv().await.unwrap().run_id().as_str(), "a");
        assert!(only_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_disconnected() {
        let b = Broadcaster::new(2, Arc::new(NoopMetrics));
        let mut slow = b.subscribe(None);
        let mut fast = b.subscribe(None);

        for seq in 1..=3 {
            b.publish(event("a", seq));
            // fast keeps up
            assert!(fast.recv().await.is_some());
        }

        assert!(slow.was_disconnected());
        assert!(!fast.was_disconnected());
        assert_eq!(b.subscriber_count(), 1);

        // buffered messages drain, then the stream ends
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_some());
        assert!(slow.recv().await.is_none());

        let stats = b.stats();
        assert_eq!(stats.published, 3);
        assert_eq!(stats.disconnected, 1);
        assert_eq!(stats.delivered, 5);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let b = Broadcaster::default();
        let sub = b.subscribe(None);
        drop(sub);
        b.publish(event("a", 1));
        assert_eq!(b.subscriber_count(), 0);
        assert_eq!(b.stats().disconnected, 0);
    }

    #[test]
    fn test_unsubscribe() {
        let b = Broadcaster::default();
        let sub = b.subscribe(None);
        assert!(b.unsubscribe(sub.id()));
        assert!(!b.unsubscribe(sub.id()));
    }
}
