//! In-process durable tier.

use super::{DurableTier, DurableTierStats};
use crate::cache::entry::StoredEntry;
use crate::error::Result;
use crate::telemetry::names;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default bound on the number of entries.
pub const DEFAULT_MAX_ENTRIES: usize = 50_000;

#[derive(Default)]
struct Indexed {
    entries: HashMap<String, StoredEntry>,

    /// Tag -> keys carrying it
    tags: HashMap<String, HashSet<String>>,

    /// Ordered by expiry so sweeps and evictions start at the front
    expiry: BTreeSet<(DateTime<Utc>, String)>,
}

impl Indexed {
    fn insert(&mut self, key: &str, entry: StoredEntry) {
        for tag in &entry.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.to_string());
        }
        self.expiry.insert((entry.expires_at, key.to_string()));
        self.entries.insert(key.to_string(), entry);
    }

    fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        self.expiry.remove(&(entry.expires_at, key.to_string()));
        Some(entry)
    }

    fn remove_all(&mut self, keys: Vec<String>) -> Vec<String> {
        keys.into_iter().filter(|key| self.remove(key).is_some()).collect()
    }
}

/// Durable tier kept in process memory.
///
/// Holds a key map, a multi-valued tag index and an expiry index, so tag
/// purges and sweeps never scan the whole store. When `max_entries` is
/// reached the entry expiring soonest makes room for the new one.
pub struct MemoryDurableTier {
    inner: Mutex<Indexed>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryDurableTier {
    pub fn new(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(Indexed::default()),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

impl Default for MemoryDurableTier {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl DurableTier for MemoryDurableTier {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        let found = {
            let mut inner = self.inner.lock();
            let (found, expired) = match inner.entries.get(key) {
                Some(entry) if !entry.is_expired() => (Some(entry.clone()), false),
                Some(_) => (None, true),
                None => (None, false),
            };
            if expired {
                inner.remove(key);
            }
            found
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_HITS, "tier" => "durable").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_MISSES, "tier" => "durable").increment(1);
        }
        Ok(found)
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()> {
        let size = {
            let mut inner = self.inner.lock();
            let replaced = inner.remove(key).is_some();

            if !replaced && inner.entries.len() >= self.max_entries {
                if let Some((_, soonest)) = inner.expiry.first().cloned() {
                    inner.remove(&soonest);
                    counter!(names::CACHE_EVICTIONS, "tier" => "durable").increment(1);
                    debug!(key = %soonest, "Evicted soonest-expiring durable entry");
                }
            }

            inner.insert(key, entry);
            inner.entries.len()
        };

        counter!(names::CACHE_SETS, "tier" => "durable").increment(1);
        gauge!(names::CACHE_ENTRIES, "tier" => "durable").set(size as f64);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.inner.lock().remove(key).is_some())
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = match inner.tags.get(tag) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };
        Ok(inner.remove_all(keys))
    }

    async fn delete_by_pattern(&self, pattern: &Regex) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        Ok(inner.remove_all(keys))
    }

    async fn clear(&self) -> Result<()> {
        *self.inner.lock() = Indexed::default();
        gauge!(names::CACHE_ENTRIES, "tier" => "durable").set(0.0);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let now = Utc::now();
        let inner = self.inner.lock();
        Ok(inner.entries.values().filter(|e| !e.is_expired_at(now)).count() as u64)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .expiry
            .iter()
            .take_while(|(expires_at, _)| *expires_at <= now)
            .map(|(_, key)| key.clone())
            .collect();
        Ok(inner.remove_all(expired).len() as u64)
    }

    async fn stats(&self) -> Result<DurableTierStats> {
        let mut stats = DurableTierStats {
            backend: self.name().to_string(),
            entries: self.count().await?,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        Ok(stats)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheEntry;
    use serde_json::json;
    use std::time::Duration;

    fn stored(ttl: Duration, tags: &[&str]) -> StoredEntry {
        CacheEntry::new(json!({"name": "Apple"}), ttl)
            .unwrap()
            .with_tags(tags.iter().copied())
    }

    fn aged(age_secs: i64, ttl: Duration) -> StoredEntry {
        let created = Utc::now() - chrono::Duration::seconds(age_secs);
        CacheEntry::created_at(json!(1), created, ttl).unwrap()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let tier = MemoryDurableTier::new(10);
        tier.set("listing:1", stored(Duration::from_secs(60), &[])).await.unwrap();

        let entry = tier.get("listing:1").await.unwrap().unwrap();
        assert_eq!(entry.data["name"], "Apple");

        assert!(tier.delete("listing:1").await.unwrap());
        assert!(!tier.delete("listing:1").await.unwrap());
        assert!(tier.get("listing:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let tier = MemoryDurableTier::new(10);
        tier.set("old", aged(10, Duration::from_secs(1))).await.unwrap();

        assert!(tier.get("old").await.unwrap().is_none());
        assert_eq!(tier.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_by_tag_uses_index() {
        let tier = MemoryDurableTier::new(10);
        let ttl = Duration::from_secs(60);
        tier.set("listing:1", stored(ttl, &["listings"])).await.unwrap();
        tier.set("listing:2", stored(ttl, &["listings", "category:bikes"])).await.unwrap();
        tier.set("thread:1", stored(ttl, &["forum_threads"])).await.unwrap();

        assert_eq!(tier.delete_by_tag("listings").await.unwrap().len(), 2);
        assert!(tier.delete_by_tag("category:bikes").await.unwrap().is_empty());
        assert_eq!(tier.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retag_on_overwrite() {
        let tier = MemoryDurableTier::new(10);
        let ttl = Duration::from_secs(60);
        tier.set("k", stored(ttl, &["a"])).await.unwrap();
        tier.set("k", stored(ttl, &["b"])).await.unwrap();

        assert!(tier.delete_by_tag("a").await.unwrap().is_empty());
        assert_eq!(tier.delete_by_tag("b").await.unwrap(), vec!["k"]);
    }

    #[tokio::test]
    async fn test_delete_by_pattern() {
        let tier = MemoryDurableTier::new(10);
        let ttl = Duration::from_secs(60);
        tier.set("listing:1", stored(ttl, &[])).await.unwrap();
        tier.set("listing:2", stored(ttl, &[])).await.unwrap();
        tier.set("profile:9", stored(ttl, &[])).await.unwrap();

        let pattern = Regex::new(r"^listing:\d+$").unwrap();
        assert_eq!(tier.delete_by_pattern(&pattern).await.unwrap().len(), 2);
        assert_eq!(tier.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_expired_sweeps_front_of_index() {
        let tier = MemoryDurableTier::new(10);
        tier.set("a", aged(10, Duration::from_secs(1))).await.unwrap();
        tier.set("b", aged(10, Duration::from_secs(2))).await.unwrap();
        tier.set("c", stored(Duration::from_secs(60), &[])).await.unwrap();

        assert_eq!(tier.delete_expired(Utc::now()).await.unwrap(), 2);
        assert_eq!(tier.count().await.unwrap(), 1);
        assert_eq!(tier.delete_expired(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_full_tier_drops_soonest_expiring() {
        let tier = MemoryDurableTier::new(2);
        tier.set("short", stored(Duration::from_secs(5), &[])).await.unwrap();
        tier.set("long", stored(Duration::from_secs(500), &[])).await.unwrap();
        tier.set("new", stored(Duration::from_secs(50), &[])).await.unwrap();

        assert!(tier.get("short").await.unwrap().is_none());
        assert!(tier.get("long").await.unwrap().is_some());
        assert!(tier.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats() {
        let tier = MemoryDurableTier::default();
        tier.set("k", stored(Duration::from_secs(60), &[])).await.unwrap();
        tier.get("k").await.unwrap();
        tier.get("missing").await.unwrap();

        let stats = tier.stats().await.unwrap();
        assert_eq!(stats.backend, "memory");
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        tier.clear().await.unwrap();
        assert_eq!(tier.count().await.unwrap(), 0);
    }
}
