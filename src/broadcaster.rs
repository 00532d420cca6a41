//! Broadcaster — in-process fan-out of finalized detections.
//!
//! Each subscriber owns one unbounded queue. `publish` never blocks and never
//! fails: queues whose consumer went away are pruned on the spot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::classifier::common_name;
use crate::store::Detection;

/// Detection as delivered to live viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    #[serde(flatten)]
    pub detection: Detection,
    pub common_name: Option<String>,
}

impl From<Detection> for DetectionEvent {
    fn from(detection: Detection) -> Self {
        let common_name = common_name(&detection.category_name).map(String::from);
        Self {
            detection,
            common_name,
        }
    }
}

impl DetectionEvent {
    /// One server-sent-events frame.
    pub fn to_sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

type Queues = HashMap<u64, mpsc::UnboundedSender<DetectionEvent>>;

struct Shared {
    next_id: AtomicU64,
    queues: Mutex<Queues>,
}

#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

/// A live subscriber queue. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<DetectionEvent>,
    owner: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once unsubscribed or the broadcaster shut down.
    pub async fn recv(&mut self) -> Option<DetectionEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<DetectionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.owner.upgrade() {
            remove(&shared, self.id);
        }
    }
}

fn lock(shared: &Shared) -> MutexGuard<'_, Queues> {
    // A panic while holding the lock cannot leave the map half-updated.
    shared.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove(shared: &Shared, id: u64) -> bool {
    lock(shared).remove(&id).is_some()
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let count = {
            let mut queues = lock(&self.shared);
            queues.insert(id, tx);
            queues.len()
        };
        debug!(subscriber = id, subscribers = count, "Subscriber registered");
        Subscription {
            id,
            rx,
            owner: Arc::downgrade(&self.shared),
        }
    }

    /// Remove the queue now. Events published afterwards never reach it;
    /// events already queued can still be drained.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        if remove(&self.shared, subscription.id) {
            debug!(subscriber = subscription.id, "Subscriber removed");
        }
    }

    /// Enqueue `event` on every registered queue. Returns how many received it.
    pub fn publish(&self, event: DetectionEvent) -> usize {
        let mut queues = lock(&self.shared);
        queues.retain(|_, tx| tx.send(event.clone()).is_ok());
        queues.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared).len()
    }

    /// Detach every subscriber; their `recv` yields `None` after draining.
    pub fn shutdown(&self) {
        let detached = {
            let mut queues = lock(&self.shared);
            let n = queues.len();
            queues.clear();
            n
        };
        debug!(detached, "Broadcaster shut down");
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}
