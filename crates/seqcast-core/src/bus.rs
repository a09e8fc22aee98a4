// ABOUTME: Publish bus fanning committed events out to per-connection bounded channels.
// ABOUTME: Publishing never waits; a subscriber whose channel is full is detached and flagged as overflowed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use ulid::Ulid;

use crate::event::Event;

struct Subscriber {
    tx: mpsc::Sender<Arc<Event>>,
    overflowed: Arc<AtomicBool>,
}

#[derive(Default)]
struct BusInner {
    subscribers: HashMap<Ulid, Subscriber>,
    closed: bool,
}

/// Outcome of a single publish, mostly useful for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub overflowed: usize,
    pub detached: usize,
}

/// Best-effort notification of newly committed events. Durability lives in
/// the event log, so anything a subscriber misses can be read back from it.
pub struct PublishBus {
    inner: Mutex<BusInner>,
    capacity: usize,
}

impl PublishBus {
    /// Create a bus whose subscriptions each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber. Events published after this call are
    /// delivered to it in ascending sequence order.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let overflowed = Arc::new(AtomicBool::new(false));
        let id = Ulid::new();

        let mut inner = self.lock();
        if !inner.closed {
            inner.subscribers.insert(
                id,
                Subscriber {
                    tx,
                    overflowed: Arc::clone(&overflowed),
                },
            );
        }

        Subscription { id, rx, overflowed }
    }

    /// Notify every subscriber of a committed event.
    pub fn publish(&self, event: Arc<Event>) -> PublishReport {
        let mut report = PublishReport::default();
        let mut inner = self.lock();

        inner.subscribers.retain(|id, sub| {
            match sub.tx.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    report.delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.overflowed.store(true, Ordering::Release);
                    report.overflowed += 1;
                    tracing::debug!(subscriber = %id, sequence_id = event.sequence_id, "subscriber queue full, detaching");
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    report.detached += 1;
                    false
                }
            }
        });

        report
    }

    /// Detach a subscriber explicitly.
    pub fn unsubscribe(&self, id: Ulid) {
        self.lock().subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Detach every subscriber and refuse new ones.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }
}

/// Receiving end of a bus subscription.
pub struct Subscription {
    id: Ulid,
    rx: mpsc::Receiver<Arc<Event>>,
    overflowed: Arc<AtomicBool>,
}

impl Subscription {
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// Wait for the next event. Returns `None` once the subscription has
    /// been detached and its buffer drained; check [`Subscription::overflowed`]
    /// to tell an overflow apart from a bus shutdown.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}
