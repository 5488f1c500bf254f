//! Per-object memo table used by plugins during a single run.
//!
//! Every [`Secret`](crate::config::Secret) and
//! [`StorageMap`](crate::config::StorageMap) owns one `ObjectCache`. Plugins
//! use it to avoid repeating expensive remote reads, and must clear (or
//! refresh) an entry after any remote mutation that makes it stale.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// What a cached value is for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Oldest/newest access key metadata of a cloud identity.
    AccessKeys,
    /// Listing of store keys and when each was last saved.
    StoredKeys,
    /// Public encryption key used by a store to seal values.
    PublicKey,
}

type Entry = Box<dyn Any + Send + Sync>;

/// A typed key/value store with no expiry.
#[derive(Default)]
pub struct ObjectCache {
    entries: Mutex<HashMap<CacheKey, Entry>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a value, replacing anything cached under the same key.
    pub fn set<V: Any + Send + Sync>(&self, key: CacheKey, value: V) {
        self.lock().insert(key, Box::new(value));
    }

    /// Fetch a copy of the cached value.
    ///
    /// Returns `None` when nothing is cached under `key` or when the cached
    /// value is not a `V`.
    pub fn get<V: Any + Clone>(&self, key: &CacheKey) -> Option<V> {
        self.lock()
            .get(key)
            .and_then(|entry| entry.downcast_ref::<V>())
            .cloned()
    }

    pub fn clear(&self, key: &CacheKey) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// A cache belongs to exactly one owner: cloning the owner starts a new, empty
// cache rather than sharing entries.
impl Clone for ObjectCache {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("entries", &self.len())
            .finish()
    }
}
