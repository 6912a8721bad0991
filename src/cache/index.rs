use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use super::CacheKey;
use crate::error::CacheError;
use crate::metrics::Metrics;

pub const INDEX_VERSION: u32 = 1;

/// One cached asset. Only the store deletes `local_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub locator: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub download_duration_ms: u64,
}

/// On-disk form of the index: keys in LRU to MRU order, the entries, and
/// the metrics block.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PersistedIndex {
    pub version: u32,
    pub order: Vec<CacheKey>,
    pub entries: HashMap<CacheKey, CacheEntry>,
    #[serde(default)]
    pub metrics: Metrics,
}

/// LRU-ordered entries. The head (least recently used) is the next
/// eviction candidate and `len() <= capacity()` always holds.
pub struct CacheIndex {
    entries: LruCache<CacheKey, CacheEntry>,
    capacity: usize,
}

impl CacheIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            capacity,
        }
    }

    /// Rebuild from a persisted record. Entries beyond `capacity` are
    /// dropped from the LRU end and returned so their files can go.
    pub fn from_record(record: PersistedIndex, capacity: usize) -> (Self, Vec<CacheEntry>) {
        let PersistedIndex {
            order, mut entries, ..
        } = record;

        let mut ordered: Vec<CacheEntry> = order
            .iter()
            .filter_map(|key| entries.remove(key))
            .collect();
        // 不在 order 列表里的条目视为最旧
        let mut unordered: Vec<CacheEntry> = entries.into_values().collect();
        unordered.sort_by_key(|e| e.last_accessed_at);
        unordered.append(&mut ordered);

        let mut index = Self::new(capacity);
        let overflow = unordered.len().saturating_sub(index.capacity);
        let dropped: Vec<CacheEntry> = unordered.drain(..overflow).collect();
        for entry in unordered {
            index.entries.push(entry.key.clone(), entry);
        }
        (index, dropped)
    }

    pub fn to_record(&self, metrics: Metrics) -> PersistedIndex {
        PersistedIndex {
            version: INDEX_VERSION,
            order: self.keys(),
            entries: self
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            metrics,
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

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains(key)
    }

    /// Look up without touching the LRU order.
    pub fn peek(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.peek(key)
    }

    /// Record an access: move to the MRU end and bump the access fields.
    pub fn touch(&mut self, key: &CacheKey) -> Option<&CacheEntry> {
        let entry = self.entries.get_mut(key)?;
        entry.last_accessed_at = Utc::now();
        entry.access_count += 1;
        Some(entry)
    }

    /// Insert at the MRU end. The caller must have made room first.
    pub fn insert(&mut self, entry: CacheEntry) -> Result<(), CacheError> {
        if !self.entries.contains(&entry.key) && self.is_full() {
            return Err(CacheError::CapacityInvariantViolation {
                len: self.entries.len() + 1,
                capacity: self.capacity,
            });
        }
        self.entries.push(entry.key.clone(), entry);
        Ok(())
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.pop(key)
    }

    pub fn pop_lru(&mut self) -> Option<CacheEntry> {
        self.entries.pop_lru().map(|(_, entry)| entry)
    }

    /// Remove everything, returning the entries in LRU to MRU order.
    pub fn drain(&mut self) -> Vec<CacheEntry> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.pop_lru() {
            drained.push(entry);
        }
        drained
    }

    /// Keys from LRU to MRU.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    /// Entries from LRU to MRU.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.iter().rev().map(|(_, v)| v.clone()).collect()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|(_, v)| v.size_bytes).sum()
    }
}
