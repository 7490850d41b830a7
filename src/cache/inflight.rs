//! In-flight fill registry
//!
//! At most one producer fills a given cache slot at a time. The winner of
//! [`InFlightRegistry::claim`] gets an [`InFlightGuard`]; everyone else
//! streams without caching. The guard releases the slot when dropped, so the
//! release happens exactly once on every exit path.
//!
//! The mutex is a plain `std::sync::Mutex` held only for the set operation,
//! never across an await point.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::keys::ContentKey;

/// Set of cache slots currently being filled
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    keys: Mutex<HashSet<ContentKey>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<ContentKey>> {
        // A panic while holding the lock cannot leave the set half-updated
        self.keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically mark `key` as in flight. Exactly one concurrent caller
    /// gets `true`.
    pub fn try_claim(&self, key: &ContentKey) -> bool {
        self.lock().insert(key.clone())
    }

    /// Unmark `key`. Prefer [`InFlightRegistry::claim`], whose guard calls
    /// this for you.
    pub fn release(&self, key: &ContentKey) {
        self.lock().remove(key);
    }

    pub fn contains(&self, key: &ContentKey) -> bool {
        self.lock().contains(key)
    }

    /// Number of slots currently being filled
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claim `key`, returning a guard that releases it on drop
    pub fn claim(self: &Arc<Self>, key: &ContentKey) -> Option<InFlightGuard> {
        if !self.try_claim(key) {
            debug!(key = %key, "Fill already in flight");
            return None;
        }
        Some(InFlightGuard {
            registry: Arc::clone(self),
            key: key.clone(),
        })
    }
}

/// Ownership of one in-flight slot
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    key: ContentKey,
}

impl InFlightGuard {
    pub fn key(&self) -> &ContentKey {
        &self.key
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
        debug!(key = %self.key, "Released in-flight slot");
    }
}
