//! Bounded in-process memory cache (L1).
//!
//! Deliberately not an LRU: entries carry an insertion timestamp, reads
//! check a fixed TTL, and overflow evicts the oldest-inserted entries until
//! the map is back at capacity.  The owning coordinator wraps this in a
//! mutex; nothing here suspends.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct MemoryEntry {
    pub inserted_at: Instant,
    pub status: u16,
    pub content_type: String,
    pub bytes: Bytes,
}

#[derive(Debug)]
pub struct MemoryCache {
    entries: HashMap<String, MemoryEntry>,
    capacity: usize,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    /// Look up a key; entries past the TTL are dropped and reported as a miss.
    pub fn get(&mut self, key: &str) -> Option<MemoryEntry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|e| e.inserted_at.elapsed() >= self.ttl);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).cloned()
    }

    /// Insert an entry, evicting the oldest-inserted entries if the map
    /// exceeds capacity afterwards.
    pub fn insert(&mut self, key: String, entry: MemoryEntry) {
        self.entries.insert(key, entry);
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Drop everything; returns the number of entries removed.
    pub fn clear(&mut self) -> usize {
        let n = self.entries.len();
        self.entries.clear();
        n
    }
}
