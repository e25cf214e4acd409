//! In-memory cache entry table
//!
//! Maps `(category, sub-key)` to the last successfully obtained payload.
//! Entries are swapped in whole behind an `Arc`, so a reader of a key that is
//! being overwritten sees either the old or the new entry, never a mix.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

use crate::data::CacheKey;

/// A cached payload and when it was obtained
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub payload: Arc<Value>,
    pub fetched_at: DateTime<Utc>,
}

/// Concurrent table of cache entries
///
/// Backed by a sharded map: reads never wait on reads, and a write only
/// contends with operations on keys in the same shard. Zero-key categories
/// are never evicted; per-country entries are capped when
/// `max_keyed_entries` is set.
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    max_keyed_entries: Option<usize>,
    keyed_len: AtomicUsize,
    /// Held for a whole eviction pass so concurrent inserts evict one at a time
    eviction: Mutex<()>,
}

impl EntryTable {
    /// Creates an unbounded table
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a table holding at most `max` per-country entries
    pub fn with_keyed_limit(max: Option<usize>) -> Self {
        Self {
            max_keyed_entries: max,
            ..Self::default()
        }
    }

    /// Returns the entry for `key`, if one has ever been stored
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Stores `payload` for `key`, replacing any previous entry
    pub fn put(&self, key: CacheKey, payload: Arc<Value>, now: DateTime<Utc>) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            payload,
            fetched_at: now,
        });
        let keyed = key.category.is_keyed();
        let previous = self.entries.insert(key.clone(), Arc::clone(&entry));

        if keyed && previous.is_none() {
            self.keyed_len.fetch_add(1, Ordering::SeqCst);
            self.enforce_keyed_limit(&key);
        }
        entry
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evicts the oldest per-country entries until the cap holds
    ///
    /// `keep` is the entry just inserted and is never chosen. Only scans the
    /// table when the cap is actually exceeded.
    fn enforce_keyed_limit(&self, keep: &CacheKey) {
        let Some(max) = self.max_keyed_entries else {
            return;
        };
        let _pass = self.eviction.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        while self.keyed_len.load(Ordering::SeqCst) > max {
            let oldest = self
                .entries
                .iter()
                .filter(|item| item.key().category.is_keyed() && item.key() != keep)
                .min_by_key(|item| item.value().fetched_at)
                .map(|item| item.key().clone());

            let Some(victim) = oldest else {
                return;
            };
            warn!(key = %victim, "evicting cache entry over keyed limit {}", max);
            if self.entries.remove(&victim).is_some() {
                self.keyed_len.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Category;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn history_key(country: &str) -> CacheKey {
        CacheKey::new(Category::CountryHistory, format!("{}|30", country))
    }

    #[test]
    fn test_get_returns_none_for_missing_key() {
        let table = EntryTable::new();
        assert!(table.get(&CacheKey::new(Category::GlobalTotals, "")).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_put_then_get() {
        let table = EntryTable::new();
        let key = CacheKey::new(Category::GlobalTotals, "");
        table.put(key.clone(), Arc::new(json!({"cases": 1})), at(100));

        let entry = table.get(&key).unwrap();
        assert_eq!(*entry.payload, json!({"cases": 1}));
        assert_eq!(entry.fetched_at, at(100));
    }

    #[test]
    fn test_put_overwrites_unconditionally() {
        let table = EntryTable::new();
        let key = history_key("spain");
        table.put(key.clone(), Arc::new(json!({"v": 1})), at(200));
        // older timestamp still overwrites
        table.put(key.clone(), Arc::new(json!({"v": 2})), at(100));

        let entry = table.get(&key).unwrap();
        assert_eq!(*entry.payload, json!({"v": 2}));
        assert_eq!(entry.fetched_at, at(100));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reader_keeps_old_entry_across_overwrite() {
        let table = EntryTable::new();
        let key = CacheKey::new(Category::AllCountries, "");
        table.put(key.clone(), Arc::new(json!([1])), at(1));

        let before = table.get(&key).unwrap();
        table.put(key.clone(), Arc::new(json!([2])), at(2));

        assert_eq!(*before.payload, json!([1]));
        assert_eq!(before.fetched_at, at(1));
        assert_eq!(*table.get(&key).unwrap().payload, json!([2]));
    }

    #[test]
    fn test_keyed_limit_evicts_oldest_keyed_entry() {
        let table = EntryTable::with_keyed_limit(Some(2));
        let global = CacheKey::new(Category::GlobalTotals, "");
        table.put(global.clone(), Arc::new(json!({})), at(0) + Duration::seconds(1));

        table.put(history_key("a"), Arc::new(json!({})), at(10));
        table.put(history_key("b"), Arc::new(json!({})), at(20));
        table.put(history_key("c"), Arc::new(json!({})), at(30));

        assert!(table.get(&history_key("a")).is_none());
        assert!(table.get(&history_key("b")).is_some());
        assert!(table.get(&history_key("c")).is_some());
        assert!(table.get(&global).is_some(), "zero-key entries are never evicted");
    }

    #[test]
    fn test_keyed_limit_ignores_overwrites() {
        let table = EntryTable::with_keyed_limit(Some(1));
        table.put(history_key("a"), Arc::new(json!({"v": 1})), at(10));
        table.put(history_key("a"), Arc::new(json!({"v": 2})), at(20));
        assert_eq!(table.len(), 1);
        assert!(table.get(&history_key("a")).is_some());
    }

    #[test]
    fn test_new_entry_survives_even_if_oldest() {
        let table = EntryTable::with_keyed_limit(Some(1));
        table.put(history_key("a"), Arc::new(json!({})), at(50));
        table.put(history_key("b"), Arc::new(json!({})), at(10));
        assert!(table.get(&history_key("a")).is_none());
        assert!(table.get(&history_key("b")).is_some());
    }

    #[test]
    fn test_concurrent_inserts_keep_exactly_the_cap() {
        let table = EntryTable::with_keyed_limit(Some(16));

        std::thread::scope(|scope| {
            for thread in 0..8i64 {
                let table = &table;
                scope.spawn(move || {
                    for i in 0..50i64 {
                        let key = history_key(&format!("c{}-{}", thread, i));
                        table.put(key, Arc::new(json!({})), at(thread * 1000 + i));
                    }
                });
            }
        });

        assert_eq!(table.len(), 16);
    }
}
