//! Null-value cache: short-lived record that a key resolved to absent (spec §4.3).

use std::collections::HashMap;

/// At most one record per key; each has an expiry strictly after insertion.
#[derive(Debug, Default)]
pub struct NullValueCache {
    entries: HashMap<String, u64>,
}

impl NullValueCache {
    pub fn new() -> Self {
        NullValueCache::default()
    }

    /// Records `key` as resolved-to-absent until `now + ttl_millis`.
    pub fn insert(&mut self, key: String, now: u64, ttl_millis: u64) {
        self.entries.insert(key, now + ttl_millis.max(1));
    }

    /// `true` if `key` has an unexpired negative-cache record. Expired
    /// records are reaped lazily here rather than just ignored, matching
    /// "expired records are reaped lazily and on periodic sweeps" (invariant 7).
    pub fn contains_fresh(&mut self, key: &str, now: u64) -> bool {
        match self.entries.get(key) {
            Some(&expiry) if expiry > now => true,
            Some(_) => {
                self.entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Periodic sweep used by the GC's auxiliary cleanup phase.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, &mut expiry| expiry > now);
        before - self.entries.len()
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
