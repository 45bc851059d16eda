#![allow(clippy::result_large_err)]
//! # Bazaar Cache
//!
//! Multi-tier caching for the marketplace backend, with rule-driven
//! invalidation from upstream change feeds.
//!
//! ## Architecture
//!
//! - **Cache**: in-process fast tier in front of a durable tier (memory or Redis),
//!   with in-flight fetch deduplication and stale-while-revalidate
//! - **Invalidation**: rule registry, change-feed subscriptions, per-resource
//!   debouncing, tag and pattern purges
//! - **Telemetry**: structured logging and metric names
//! - **Config**: file and environment driven settings

pub mod cache;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod telemetry;

pub use error::{BazaarError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cache::{
        CacheConfig, CacheEntry, CacheKey, CacheStats, Cacheable, DurableTier, FastTier,
        FetchOptions, KeyType, MemoryDurableTier, MultiLayerCache, RedisDurableTier,
        RedisTierConfig, SetOptions,
    };
    pub use crate::config::Config;
    pub use crate::error::{BazaarError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};
    pub use crate::invalidation::{
        BroadcastChangeFeed, ChangeEvent, ChangeFeed, ChangeKind, InvalidationConfig,
        InvalidationManager, InvalidationObserver, InvalidationRule,
    };
}
