//! The decision cache: a bounded LRU of recent blocking decisions,
//! keyed by canonical name.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use crate::rules::BlockDecision;

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] decision cache mutex poisoned, cannot recover from this - aborting";

/// A bounded LRU of name -> decision.
///
/// A capacity of zero disables the cache entirely: every `get` is a
/// miss and every `insert` is ignored.  That is a mode, not an error -
/// the repository works identically either way, just slower.
pub struct DecisionCache {
    inner: Option<Mutex<LruCache<String, BlockDecision>>>,
}

impl std::fmt::Debug for DecisionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("DecisionCache")
            .field("enabled", &self.inner.is_some())
            .field("len", &self.len())
            .finish()
    }
}

impl DecisionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    pub fn get(&self, name: &str) -> Option<BlockDecision> {
        let cache = self.inner.as_ref()?;
        cache.lock().expect(MUTEX_POISON_MESSAGE).get(name).cloned()
    }

    pub fn insert(&self, name: String, decision: BlockDecision) {
        if let Some(cache) = self.inner.as_ref() {
            cache.lock().expect(MUTEX_POISON_MESSAGE).put(name, decision);
        }
    }

    /// Drop every cached decision.  Called when a new snapshot is
    /// swapped in.
    pub fn purge(&self) {
        if let Some(cache) = self.inner.as_ref() {
            cache.lock().expect(MUTEX_POISON_MESSAGE).clear();
        }
    }

    pub fn len(&self) -> usize {
        match self.inner.as_ref() {
            Some(cache) => cache.lock().expect(MUTEX_POISON_MESSAGE).len(),
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
