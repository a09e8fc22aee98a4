// ABOUTME: Replay pins keep a range of the log alive while a reader is assembling a replay.
// ABOUTME: Pruning consults the lowest active pin and never cuts past it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Registry of active replay pins, shared by the writer and all readers.
#[derive(Debug, Clone, Default)]
pub struct ReplayPins {
    inner: Arc<Mutex<BTreeMap<u64, usize>>>,
}

impl ReplayPins {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, usize>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Protect every event with a sequence id greater than `after` until the
    /// returned guard is dropped.
    pub fn pin(&self, after: u64) -> ReplayPin {
        *self.lock().entry(after).or_insert(0) += 1;
        ReplayPin {
            pins: self.clone(),
            after,
        }
    }

    /// Number of live pins.
    pub fn active(&self) -> usize {
        self.lock().values().sum()
    }

    /// Run `f` with the lowest pinned position while holding the registry
    /// lock, so no new pin can slip in while the caller prunes.
    pub(crate) fn with_floor<T>(&self, f: impl FnOnce(Option<u64>) -> T) -> T {
        let guard = self.lock();
        let floor = guard.keys().next().copied();
        let out = f(floor);
        drop(guard);
        out
    }

    fn release(&self, after: u64) {
        let mut guard = self.lock();
        if let Some(count) = guard.get_mut(&after) {
            *count -= 1;
            if *count == 0 {
                guard.remove(&after);
            }
        }
    }
}

/// RAII guard returned by [`ReplayPins::pin`].
#[derive(Debug)]
pub struct ReplayPin {
    pins: ReplayPins,
    after: u64,
}

impl ReplayPin {
    pub fn after(&self) -> u64 {
        self.after
    }
}

impl Drop for ReplayPin {
    fn drop(&mut self) {
        self.pins.release(self.after);
    }
}
