//! Per-filename exclusivity markers.
//!
//! At most one pipeline may run for a filename at a time. The marker is
//! taken on the request path and released when the job finishes, when the
//! queue refuses it, or when the request turns out to be a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Concurrent set of in-flight keys with atomic check-and-set semantics
#[derive(Debug, Clone, Default)]
pub struct InFlightSet {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    // key -> generation of the current holder
    held: Mutex<HashMap<String, u64>>,
    next_generation: AtomicU64,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the marker for `key` if nobody holds it
    pub fn try_acquire(&self, key: &str) -> Option<InFlightGuard> {
        let mut held = self.lock();
        if held.contains_key(key) {
            return None;
        }
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        held.insert(key.to_string(), generation);
        Some(self.guard(key, generation))
    }

    /// Take the marker even if another run holds it.
    ///
    /// The previous holder's guard becomes stale: dropping it later will
    /// not release the forced run's marker.
    pub fn force_acquire(&self, key: &str) -> InFlightGuard {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(key.to_string(), generation);
        self.guard(key, generation)
    }

    /// Unconditionally clear the marker for `key`
    pub fn release(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self, key: &str, generation: u64) -> InFlightGuard {
        InFlightGuard {
            set: self.clone(),
            key: key.to_string(),
            generation,
            released: false,
        }
    }

    fn release_generation(&self, key: &str, generation: u64) {
        let mut held = self.lock();
        if held.get(key) == Some(&generation) {
            held.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        // The map is never left half-updated, so a poisoned lock is still usable
        self.inner
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the marker when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    set: InFlightSet,
    key: String,
    generation: u64,
    released: bool,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now rather than at drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.set.release_generation(&self.key, self.generation);
            self.released = true;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}
