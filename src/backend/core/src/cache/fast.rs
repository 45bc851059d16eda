//! Fast in-process tier (L1).
//!
//! A capacity-bounded map with insertion-order eviction. Reads never touch the
//! eviction order: the oldest *written* entry is the one that goes when the
//! tier is full. Expired entries are removed lazily by `get`.

use super::entry::CacheEntry;
use crate::telemetry::names;
use chrono::Utc;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Default number of entries held by the fast tier.
pub const DEFAULT_FAST_CAPACITY: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Point-in-time statistics for a fast tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FastTierStats {
    /// Number of stored entries (expired-but-unread entries included)
    pub size: usize,

    /// Maximum number of entries
    pub capacity: usize,

    pub hits: u64,
    pub misses: u64,

    /// Entries dropped to make room for new ones
    pub evictions: u64,

    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Fast Tier
// ═══════════════════════════════════════════════════════════════════════════════

struct Slot<V> {
    seq: u64,
    entry: CacheEntry<V>,
}

struct FastState<V> {
    entries: HashMap<String, Slot<V>>,

    /// Insertion sequence -> key; the first element is the oldest write
    order: BTreeMap<u64, String>,

    next_seq: u64,
}

impl<V> FastState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let slot = self.entries.remove(key)?;
        self.order.remove(&slot.seq);
        Some(slot.entry)
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&str, &CacheEntry<V>) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, slot)| pred(key, &slot.entry))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &doomed {
            self.remove(key);
        }
        doomed
    }
}

/// Capacity-bounded in-memory tier.
pub struct FastTier<V> {
    state: Mutex<FastState<V>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<V: Clone> FastTier<V> {
    /// Create a tier holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(FastState {
                entries: HashMap::with_capacity(capacity),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a live entry; an expired entry is deleted and counted as a miss.
    pub fn get(&self, key: &str) -> Option<CacheEntry<V>> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let (found, expired) = match state.entries.get(key) {
            Some(slot) if !slot.entry.is_expired_at(now) => (Some(slot.entry.clone()), false),
            Some(_) => (None, true),
            None => (None, false),
        };
        if expired {
            state.remove(key);
        }
        drop(state);

        if let Some(entry) = found {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_HITS, "tier" => "fast").increment(1);
            return Some(entry);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(
            names::CACHE_MISSES,
            "tier" => "fast",
            "reason" => if expired { "expired" } else { "not_found" }
        )
        .increment(1);
        None
    }

    /// Live entry without touching the hit/miss counters.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        let state = self.state.lock();
        state
            .entries
            .get(key)
            .filter(|slot| !slot.entry.is_expired())
            .map(|slot| slot.entry.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Insert or replace an entry.
    ///
    /// A replaced key moves to the back of the eviction order and never
    /// causes an eviction; a new key evicts the oldest write when full.
    pub fn set(&self, key: &str, entry: CacheEntry<V>) {
        let mut state = self.state.lock();

        let replaced = state.remove(key).is_some();
        let mut evicted = None;
        if !replaced && state.entries.len() >= self.capacity {
            if let Some((_, oldest)) = state.order.pop_first() {
                state.entries.remove(&oldest);
                evicted = Some(oldest);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(seq, key.to_string());
        state.entries.insert(key.to_string(), Slot { seq, entry });
        let size = state.entries.len();
        drop(state);

        if let Some(oldest) = evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_EVICTIONS, "tier" => "fast").increment(1);
            debug!(key = %oldest, "Evicted oldest fast-tier entry");
        }
        counter!(names::CACHE_SETS, "tier" => "fast").increment(1);
        gauge!(names::CACHE_ENTRIES, "tier" => "fast").set(size as f64);
    }

    /// Remove a key, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.remove(key).is_some();
        let size = state.entries.len();
        drop(state);

        if removed {
            gauge!(names::CACHE_ENTRIES, "tier" => "fast").set(size as f64);
        }
        removed
    }

    /// Remove every entry carrying `tag`, returning the removed keys.
    pub fn delete_by_tag(&self, tag: &str) -> Vec<String> {
        self.remove_where(|_, entry| entry.has_tag(tag))
    }

    /// Remove every entry whose key matches `pattern`, returning the removed keys.
    pub fn delete_by_pattern(&self, pattern: &Regex) -> Vec<String> {
        self.remove_where(|key, _| pattern.is_match(key))
    }

    /// Drop entries whose expiry has passed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        self.remove_where(|_, entry| entry.is_expired_at(now)).len()
    }

    fn remove_where(&self, pred: impl FnMut(&str, &CacheEntry<V>) -> bool) -> Vec<String> {
        let mut state = self.state.lock();
        let removed = state.remove_where(pred);
        let size = state.entries.len();
        drop(state);

        if !removed.is_empty() {
            gauge!(names::CACHE_ENTRIES, "tier" => "fast").set(size as f64);
        }
        removed
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        drop(state);
        gauge!(names::CACHE_ENTRIES, "tier" => "fast").set(0.0);
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> FastTierStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        FastTierStats {
            size: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
        }
    }
}

impl<V: Clone> Default for FastTier<V> {
    fn default() -> Self {
        Self::new(DEFAULT_FAST_CAPACITY)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
