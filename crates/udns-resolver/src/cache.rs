//! The response cache: resolved records keyed by fingerprint, with
//! least-recently-used eviction when full and lazy expiry on read.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use udns_types::protocol::types::ResourceRecord;

const MUTEX_POISON_MESSAGE: &str =
    "[INTERNAL ERROR] cache mutex poisoned, cannot recover from this - aborting";

/// A convenience wrapper around the response cache which lets it be
/// shared between tasks.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying cache.
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<ResponseCache>>,
}

impl std::fmt::Debug for SharedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("SharedCache")
            .field("len", &self.len())
            .finish()
    }
}

impl SharedCache {
    /// Create a new cache holding at most `capacity` records.
    ///
    /// # Errors
    ///
    /// If the capacity is zero.
    pub fn with_capacity(capacity: usize) -> Result<Self, CapacityError> {
        let capacity = NonZeroUsize::new(capacity).ok_or(CapacityError)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(ResponseCache {
                entries: LruCache::new(capacity),
            })),
        })
    }

    /// Get a non-expired record.  An entry whose expiry has passed is
    /// removed and reads as absent: a record returned here is never
    /// expired at the instant of return.
    pub fn get(&self, key: &str) -> Option<ResourceRecord> {
        self.get_at(key, Instant::now())
    }

    /// Like `get`, against an explicit clock reading.
    pub fn get_at(&self, key: &str, now: Instant) -> Option<ResourceRecord> {
        self.inner
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .get_at(key, now)
    }

    /// Insert or replace the record stored under its fingerprint,
    /// marking it most recently used.  Records which can never be
    /// served (TTL of zero) are not inserted.
    pub fn set(&self, record: ResourceRecord) {
        if record.ttl == 0 {
            return;
        }
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).set(record);
    }

    /// Remove the record under a key.  Returns whether one was there.
    pub fn delete(&self, key: &str) -> bool {
        self.inner
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .entries
            .pop(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect(MUTEX_POISON_MESSAGE).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The keys currently cached, most recently used first.
    pub fn keys(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .entries
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }
}

struct ResponseCache {
    entries: LruCache<String, ResourceRecord>,
}

impl ResponseCache {
    fn get_at(&mut self, key: &str, now: Instant) -> Option<ResourceRecord> {
        let expired = self.entries.get(key)?.is_expired(now);
        if expired {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).cloned()
    }

    fn set(&mut self, record: ResourceRecord) {
        self.entries.put(record.fingerprint(), record);
    }
}

/// The error for a cache constructed with no room for even one
/// record.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct CapacityError;

impl std::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "cache capacity must be at least 1")
    }
}

impl std::error::Error for CapacityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
