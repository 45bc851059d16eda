//! Multi-tier caching for the marketplace.
//!
//! This module provides:
//!
//! - **Fast tier (L1)**: capacity-bounded in-process map, insertion-order eviction
//! - **Durable tier (L2)**: pluggable store (in-memory or Redis) with tag and expiry indices
//! - **MultiLayerCache**: read-through orchestration, L2 -> L1 promotion, in-flight
//!   fetch deduplication and stale-while-revalidate
//! - **Type-safe Keys**: marketplace keys carrying their invalidation tags
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         MultiLayerCache                             │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  get / set / get_or_fetch          in-flight map (one fetch per key)│
//! │         │                                                           │
//! │         ▼                                                           │
//! │  ┌─────────────────────┐   miss   ┌──────────────────────────────┐  │
//! │  │  FastTier (L1)      │ ───────▶ │  DurableTier (L2)            │  │
//! │  │  typed values       │ ◀─────── │  JSON entries, tag + expiry  │  │
//! │  └─────────────────────┘ promote  └──────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use bazaar_cache::cache::{CacheConfig, CacheKey, FetchOptions, MultiLayerCache, SetOptions};
//!
//! let cache = MultiLayerCache::memory_only(CacheConfig::default());
//!
//! let key = CacheKey::listing("42");
//! let listing: Listing = cache
//!     .get_or_fetch(&key.build(), move || load_listing(42), FetchOptions::for_key(&key))
//!     .await?;
//!
//! cache.delete_by_tag("listings").await;
//! ```

pub mod durable;
pub mod entry;
pub mod fast;
pub mod key;

pub use durable::{
    DurableTier, DurableTierStats, MemoryDurableTier, RedisDurableTier, RedisTierConfig,
    DEFAULT_MAX_ENTRIES,
};
pub use entry::{weak_etag, CacheEntry, StoredEntry};
pub use fast::{FastTier, FastTierStats, DEFAULT_FAST_CAPACITY};
pub use key::{hash_composite_key, hash_for_key, listing_feed_key, CacheKey, KeyType};

use crate::error::{BazaarError, Result};
use crate::telemetry::names;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::counter;
use parking_lot::Mutex;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{type_name, Any};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Default interval between durable-tier expiry sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Shortest sweep interval the sweeper will run with.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Values the cache can hold: typed in the fast tier, JSON in the durable tier.
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

type ErasedValue = Arc<dyn Any + Send + Sync>;
type SharedFetch = Shared<BoxFuture<'static, Result<ErasedValue>>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Runtime configuration for [`MultiLayerCache`].
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// TTL used when a write does not specify one
    pub default_ttl: Duration,

    /// Fast tier capacity in entries
    pub fast_capacity: usize,

    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            fast_capacity: DEFAULT_FAST_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

/// Builder for [`CacheConfig`].
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    pub fn fast_capacity(mut self, capacity: usize) -> Self {
        self.config.fast_capacity = capacity;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for a cache write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Entry lifetime; `None` uses the configured default
    pub ttl: Option<Duration>,

    pub tags: Vec<String>,

    /// Do not write the fast tier
    pub skip_fast: bool,

    /// Do not write the durable tier
    pub skip_durable: bool,

    /// Entity tag; derived from the payload when absent
    pub etag: Option<String>,
}

impl SetOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed TTL and tags from a typed key.
    pub fn for_key(key: &CacheKey) -> Self {
        Self::new().ttl(key.ttl()).tags(key.tags().iter().cloned())
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn skip_fast(mut self) -> Self {
        self.skip_fast = true;
        self
    }

    pub fn skip_durable(mut self) -> Self {
        self.skip_durable = true;
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }
}

/// Options for [`MultiLayerCache::get_or_fetch`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOptions {
    /// How a fetched value is written back
    pub set: SetOptions,

    /// Serve a cached value and refresh it in the background
    pub stale_while_revalidate: bool,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_key(key: &CacheKey) -> Self {
        SetOptions::for_key(key).into()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.set = self.set.ttl(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.set = self.set.tag(tag);
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.set = self.set.tags(tags);
        self
    }

    pub fn skip_fast(mut self) -> Self {
        self.set = self.set.skip_fast();
        self
    }

    pub fn skip_durable(mut self) -> Self {
        self.set = self.set.skip_durable();
        self
    }

    pub fn etag(mut self, etag: impl Into<String>) -> Self {
        self.set = self.set.etag(etag);
        self
    }

    pub fn stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }
}

impl From<SetOptions> for FetchOptions {
    fn from(set: SetOptions) -> Self {
        Self {
            set,
            stale_while_revalidate: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-tier and aggregate cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub fast: FastTierStats,

    /// `None` without a durable tier or when it could not report
    pub durable: Option<DurableTierStats>,

    /// Lookups answered by either tier
    pub hits: u64,

    /// Lookups answered by neither tier
    pub misses: u64,

    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,

    /// Fetches currently pending
    pub in_flight: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Multi-Layer Cache
// ═══════════════════════════════════════════════════════════════════════════════

struct InFlight {
    id: u64,
    fetch: SharedFetch,
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct CacheInner {
    config: CacheConfig,
    fast: FastTier<ErasedValue>,
    durable: Option<Arc<dyn DurableTier>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_fetch_id: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sweeper: Mutex<Option<Sweeper>>,
}

/// Two-tier cache shared by every request handler.
///
/// Cloning is cheap; all clones operate on the same tiers. Durable-tier
/// failures never surface from this type: they are logged, counted and the
/// call continues against the fast tier alone.
#[derive(Clone)]
pub struct MultiLayerCache {
    inner: Arc<CacheInner>,
}

impl MultiLayerCache {
    /// Create a cache over an optional durable tier.
    pub fn new(config: CacheConfig, durable: Option<Arc<dyn DurableTier>>) -> Self {
        info!(
            fast_capacity = config.fast_capacity,
            default_ttl = ?config.default_ttl,
            durable = durable.as_ref().map(|d| d.name()).unwrap_or("none"),
            "Multi-layer cache created"
        );

        Self {
            inner: Arc::new(CacheInner {
                fast: FastTier::new(config.fast_capacity),
                config,
                durable,
                in_flight: Mutex::new(HashMap::new()),
                next_fetch_id: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Create a cache with the given durable tier.
    pub fn with_durable(config: CacheConfig, durable: Arc<dyn DurableTier>) -> Self {
        Self::new(config, Some(durable))
    }

    /// Create a cache with no durable tier.
    pub fn memory_only(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn from_inner(inner: Arc<CacheInner>) -> Self {
        Self { inner }
    }

    fn durable_failed(&self, op: &'static str, key: &str, error: &BazaarError) {
        counter!(names::DURABLE_ERRORS, "op" => op).increment(1);
        warn!(
            op = op,
            key = %key,
            error = %error,
            "Durable tier operation failed, continuing with fast tier only"
        );
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reads
    // ─────────────────────────────────────────────────────────────────────────

    /// Get a value, consulting the fast tier first.
    ///
    /// A durable hit is promoted into the fast tier before it is returned.
    pub async fn get<T: Cacheable>(&self, key: &str) -> Option<T> {
        self.lookup::<T>(key).await.map(|entry| entry.data)
    }

    async fn lookup<T: Cacheable>(&self, key: &str) -> Option<CacheEntry<T>> {
        if let Some(entry) = self.inner.fast.get(key) {
            match entry.try_map_data(|erased| erased.downcast_ref::<T>().cloned().ok_or(())) {
                Ok(typed) => {
                    self.record_lookup(true);
                    return Some(typed);
                }
                Err(()) => {
                    debug!(key = %key, expected = type_name::<T>(), "Fast tier holds another type");
                }
            }
        }

        if let Some(durable) = &self.inner.durable {
            match durable.get(key).await {
                Ok(Some(stored)) => {
                    match stored.try_map_data(|json| serde_json::from_value::<T>(json.clone())) {
                        Ok(typed) => {
                            let erased: ErasedValue = Arc::new(typed.data.clone());
                            self.inner.fast.set(key, typed.map_data(|_| erased));
                            self.record_lookup(true);
                            return Some(typed);
                        }
                        Err(e) => {
                            warn!(
                                key = %key,
                                expected = type_name::<T>(),
                                error = %e,
                                "Durable entry does not decode into the requested type"
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => self.durable_failed("get", key, &e),
            }
        }

        self.record_lookup(false);
        None
    }

    /// Whether a live entry exists in either tier; does not count as a lookup.
    pub async fn exists(&self, key: &str) -> bool {
        if self.inner.fast.contains(key) {
            return true;
        }
        match &self.inner.durable {
            Some(durable) => match durable.get(key).await {
                Ok(found) => found.is_some(),
                Err(e) => {
                    self.durable_failed("exists", key, &e);
                    false
                }
            },
            None => false,
        }
    }

    /// Entity tag of the live entry under `key`.
    pub async fn etag(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.inner.fast.peek(key) {
            return entry.etag;
        }
        match &self.inner.durable {
            Some(durable) => match durable.get(key).await {
                Ok(found) => found.and_then(|entry| entry.etag),
                Err(e) => {
                    self.durable_failed("etag", key, &e);
                    None
                }
            },
            None => None,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a value to every tier not skipped by `options`.
    ///
    /// Fails only for a zero TTL or a value that cannot be serialized;
    /// durable-tier write failures are logged and absorbed.
    pub async fn set<T: Cacheable>(&self, key: &str, data: T, options: SetOptions) -> Result<()> {
        let ttl = options.ttl.unwrap_or(self.inner.config.default_ttl);
        let json = serde_json::to_value(&data)?;
        let etag = match options.etag {
            Some(etag) => etag,
            None => weak_etag(&serde_json::to_vec(&json)?),
        };

        let entry = CacheEntry::new(json, ttl)?
            .with_tags(options.tags)
            .with_etag(Some(etag));

        if !options.skip_fast {
            let erased: ErasedValue = Arc::new(data);
            self.inner.fast.set(key, entry.map_data(|_| erased));
        }

        if !options.skip_durable {
            if let Some(durable) = &self.inner.durable {
                if let Err(e) = durable.set(key, entry).await {
                    self.durable_failed("set", key, &e);
                }
            }
        }

        counter!(names::CACHE_SETS, "tier" => "all").increment(1);
        Ok(())
    }

    /// Return the cached value or run `fetcher` to produce it.
    ///
    /// Concurrent callers for the same key share a single fetcher run and its
    /// outcome. The fetch runs as its own task, so it completes even when
    /// every caller has gone away.
    pub async fn get_or_fetch<T, F, Fut, E>(
        &self,
        key: &str,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<T>
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BazaarError> + Send + 'static,
    {
        if let Some(value) = self.get::<T>(key).await {
            if options.stale_while_revalidate {
                let refresh = self.start_fetch(key, fetcher, options.set);
                let key = key.to_string();
                tokio::spawn(async move {
                    if let Err(e) = refresh.await {
                        warn!(key = %key, error = %e, "Background revalidation failed");
                    }
                });
            }
            return Ok(value);
        }

        let erased = self.start_fetch(key, fetcher, options.set).await?;
        erased
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| BazaarError::type_mismatch(key, type_name::<T>()))
    }

    /// Join the pending fetch for `key` or start a new one.
    fn start_fetch<T, F, Fut, E>(&self, key: &str, fetcher: F, options: SetOptions) -> SharedFetch
    where
        T: Cacheable,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        E: Into<BazaarError> + Send + 'static,
    {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some(pending) = in_flight.get(key) {
            counter!(names::FETCHES, "outcome" => "joined").increment(1);
            debug!(key = %key, "Joining pending fetch");
            return pending.fetch.clone();
        }

        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed);
        let cache = self.clone();
        let owned_key = key.to_string();

        let task = tokio::spawn(async move {
            let outcome = match fetcher().await {
                Ok(value) => {
                    if let Err(e) = cache.set(&owned_key, value.clone(), options).await {
                        warn!(key = %owned_key, error = %e, "Fetched value could not be cached");
                    }
                    counter!(names::FETCHES, "outcome" => "success").increment(1);
                    Ok(Arc::new(value) as ErasedValue)
                }
                Err(e) => {
                    let error: BazaarError = e.into();
                    counter!(names::FETCHES, "outcome" => "failure").increment(1);
                    debug!(key = %owned_key, error = %error, "Fetch failed");
                    Err(error)
                }
            };
            cache.finish_fetch(&owned_key, id);
            outcome
        });

        let fetch: BoxFuture<'static, Result<ErasedValue>> = Box::pin(async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(BazaarError::from(e)),
            }
        });
        let fetch = fetch.shared();
        in_flight.insert(
            key.to_string(),
            InFlight {
                id,
                fetch: fetch.clone(),
            },
        );
        fetch
    }

    fn finish_fetch(&self, key: &str, id: u64) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(key).map(|pending| pending.id) == Some(id) {
            in_flight.remove(key);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Invalidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Delete a key from both tiers, returning whether any tier held it.
    pub async fn delete(&self, key: &str) -> bool {
        let mut removed = self.inner.fast.delete(key);
        if let Some(durable) = &self.inner.durable {
            match durable.delete(key).await {
                Ok(found) => removed |= found,
                Err(e) => self.durable_failed("delete", key, &e),
            }
        }
        removed
    }

    /// Delete every entry tagged `tag` from both tiers.
    ///
    /// Returns the number of distinct keys removed; a key held by both tiers counts once.
    pub async fn delete_by_tag(&self, tag: &str) -> u64 {
        let mut purged: HashSet<String> = self.inner.fast.delete_by_tag(tag).into_iter().collect();
        if let Some(durable) = &self.inner.durable {
            match durable.delete_by_tag(tag).await {
                Ok(keys) => purged.extend(keys),
                Err(e) => self.durable_failed("delete_by_tag", tag, &e),
            }
        }
        debug!(tag = %tag, purged = purged.len(), "Purged entries by tag");
        purged.len() as u64
    }

    /// Delete every entry whose key matches `pattern` from both tiers.
    ///
    /// Returns the number of distinct keys removed.
    pub async fn delete_by_pattern(&self, pattern: &Regex) -> u64 {
        let mut purged: HashSet<String> =
            self.inner.fast.delete_by_pattern(pattern).into_iter().collect();
        if let Some(durable) = &self.inner.durable {
            match durable.delete_by_pattern(pattern).await {
                Ok(keys) => purged.extend(keys),
                Err(e) => self.durable_failed("delete_by_pattern", pattern.as_str(), &e),
            }
        }
        debug!(pattern = %pattern, purged = purged.len(), "Purged entries by pattern");
        purged.len() as u64
    }

    /// Drop everything from both tiers.
    pub async fn clear(&self) {
        self.inner.fast.clear();
        if let Some(durable) = &self.inner.durable {
            if let Err(e) = durable.clear().await {
                self.durable_failed("clear", "*", &e);
            }
        }
        info!("Cache cleared");
    }

    /// Sweep expired entries from the durable tier.
    ///
    /// The fast tier expires lazily on read and is not swept.
    pub async fn cleanup(&self) -> u64 {
        let Some(durable) = &self.inner.durable else {
            return 0;
        };
        match durable.delete_expired(Utc::now()).await {
            Ok(swept) => {
                if swept > 0 {
                    counter!(names::CACHE_SWEPT, "tier" => "durable").increment(swept);
                    debug!(swept = swept, "Swept expired durable entries");
                }
                swept
            }
            Err(e) => {
                self.durable_failed("delete_expired", "*", &e);
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let durable = match &self.inner.durable {
            Some(durable) => match durable.stats().await {
                Ok(stats) => Some(stats),
                Err(e) => {
                    self.durable_failed("stats", "*", &e);
                    None
                }
            },
            None => None,
        };

        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            fast: self.inner.fast.stats(),
            durable,
            hits,
            misses,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            in_flight: self.inner.in_flight.lock().len(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Background Sweep
    // ─────────────────────────────────────────────────────────────────────────

    /// Start the periodic durable-tier sweep; a second call is a no-op.
    ///
    /// Intervals below [`MIN_SWEEP_INTERVAL`] are raised to it.
    pub fn start_sweeper(&self) {
        let mut slot = self.inner.sweeper.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = self.inner.config.sweep_interval.max(MIN_SWEEP_INTERVAL);
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;
            info!(interval = ?interval, "Cache sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else {
                            break;
                        };
                        MultiLayerCache::from_inner(inner).cleanup().await;
                    }
                }
            }

            info!("Cache sweeper stopped");
        });

        *slot = Some(Sweeper {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stop the background sweep and wait for it to exit.
    ///
    /// Pending fetches are left to complete.
    pub async fn shutdown(&self) {
        let sweeper = self.inner.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.shutdown.send(true);
            if let Err(e) = sweeper.task.await {
                warn!(error = %e, "Cache sweeper did not stop cleanly");
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
