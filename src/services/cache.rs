//! Bounded in-memory caches for hot read paths.
//!
//! Two instances exist at runtime: the Content-Disposition store (original
//! filenames used when serving downloads) and the album render store
//! (public album JSON). Both are small maps with an eviction strategy and a
//! `hold` marker that reserves a key while its value is being looked up in
//! the database, so a burst of requests for one cold key produces a single
//! lookup instead of a stampede.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Evict the entry whose last read is oldest.
    LastGetTime,
    /// Evict the entry with the fewest reads.
    GetsCount,
}

struct Entry<V> {
    value: Option<V>,
    held: bool,
    last_get: Instant,
    gets: u64,
}

pub struct BoundedCache<V> {
    inner: Mutex<HashMap<String, Entry<V>>>,
    limit: usize,
    eviction: Eviction,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(limit: usize, eviction: Eviction) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            limit: limit.max(1),
            eviction,
        }
    }

    /// Reads a value, bumping its usage counters.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.get_mut(key)?;
        entry.last_get = Instant::now();
        entry.gets += 1;
        entry.value.clone()
    }

    /// Attempts to reserve a key for a single in-flight lookup. Returns
    /// `true` when the caller acquired the hold and is expected to either
    /// `put` a value or `release` the key. Returns `false` when the key is
    /// already populated or another caller holds it.
    pub fn hold(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.get(key) {
            Some(entry) if entry.held || entry.value.is_some() => false,
            _ => {
                inner.insert(
                    key.to_string(),
                    Entry {
                        value: None,
                        held: true,
                        last_get: Instant::now(),
                        gets: 0,
                    },
                );
                true
            }
        }
    }

    /// Drops a hold without storing a value (lookup failed).
    pub fn release(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get(key) {
            if entry.held && entry.value.is_none() {
                inner.remove(key);
            }
        }
    }

    /// Stores a value, clearing any hold, and evicts past the limit.
    pub fn put(&self, key: &str, value: V) {
        let mut inner = self.inner.lock();
        inner.insert(
            key.to_string(),
            Entry {
                value: Some(value),
                held: false,
                last_get: Instant::now(),
                gets: 0,
            },
        );

        while inner.len() > self.limit {
            // Held entries are mid-lookup and must not be evicted.
            let victim = match self.eviction {
                Eviction::LastGetTime => inner
                    .iter()
                    .filter(|(_, e)| !e.held)
                    .min_by_key(|(_, e)| e.last_get)
                    .map(|(k, _)| k.clone()),
                Eviction::GetsCount => inner
                    .iter()
                    .filter(|(_, e)| !e.held)
                    .min_by_key(|(_, e)| e.gets)
                    .map(|(k, _)| k.clone()),
            };
            match victim {
                Some(k) => {
                    inner.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn delete(&self, key: &str) {
        self.inner.lock().remove(key);
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
