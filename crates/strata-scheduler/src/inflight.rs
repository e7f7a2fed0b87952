//! Process-local set of units currently executing.
//!
//! This is the only deduplication between ticks: the store does not hand out
//! exclusive claims, so two processes polling the same store can both run a
//! unit. Entries are released when the [`InFlightGuard`] drops.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use strata_core::ids::InstanceId;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct Entry {
    instance_id: InstanceId,
    cancel: CancellationToken,
}

type Entries<K> = Arc<Mutex<HashMap<K, Entry>>>;

/// Lock-guarded map of executing ids with a per-instance cap.
#[derive(Debug)]
pub struct InFlight<K> {
    inner: Entries<K>,
    per_instance_cap: usize,
}

impl<K> Clone for InFlight<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            per_instance_cap: self.per_instance_cap,
        }
    }
}

/// Result of [`InFlight::try_claim`].
#[derive(Debug)]
pub enum Claim<K: Copy + Eq + Hash> {
    Claimed(InFlightGuard<K>),
    /// Already executing in this process.
    Busy,
    /// The instance has reached its cap; retry on a later tick.
    AtCapacity,
}

impl<K: Copy + Eq + Hash> InFlight<K> {
    pub fn new(per_instance_cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            per_instance_cap: per_instance_cap.max(1),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(usize::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry>> {
        // A panicking worker cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_claim(&self, key: K, instance_id: InstanceId) -> Claim<K> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            return Claim::Busy;
        }
        let on_instance = entries
            .values()
            .filter(|e| e.instance_id == instance_id)
            .count();
        if on_instance >= self.per_instance_cap {
            return Claim::AtCapacity;
        }

        let cancel = CancellationToken::new();
        entries.insert(
            key,
            Entry {
                instance_id,
                cancel: cancel.clone(),
            },
        );
        Claim::Claimed(InFlightGuard {
            inner: Arc::clone(&self.inner),
            key,
            cancel,
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Fires the cancellation token of an executing unit. Returns whether the
    /// unit was executing.
    pub fn cancel(&self, key: &K) -> bool {
        match self.lock().get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count_for_instance(&self, instance_id: InstanceId) -> usize {
        self.lock()
            .values()
            .filter(|e| e.instance_id == instance_id)
            .count()
    }
}

/// Holds a claim; dropping it releases the id.
#[derive(Debug)]
pub struct InFlightGuard<K: Copy + Eq + Hash> {
    inner: Entries<K>,
    key: K,
    cancel: CancellationToken,
}

impl<K: Copy + Eq + Hash> InFlightGuard<K> {
    pub fn key(&self) -> K {
        self.key
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<K: Copy + Eq + Hash> Drop for InFlightGuard<K> {
    fn drop(&mut self) {
        let mut entries = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(&self.key);
    }
}
