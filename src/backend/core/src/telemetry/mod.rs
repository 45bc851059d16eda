//! Telemetry: structured logging and metric names.
//!
//! Logging goes through `tracing`; metrics go through the `metrics` facade and
//! reach whatever recorder the host application installs (none by default).

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig};

/// Metric names emitted by the cache and the invalidation manager.
pub mod names {
    pub const CACHE_HITS: &str = "cache_hits_total";
    pub const CACHE_MISSES: &str = "cache_misses_total";
    pub const CACHE_SETS: &str = "cache_sets_total";
    pub const CACHE_EVICTIONS: &str = "cache_evictions_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";
    pub const CACHE_SWEPT: &str = "cache_swept_total";
    pub const DURABLE_ERRORS: &str = "durable_tier_errors_total";
    pub const FETCHES: &str = "cache_fetches_total";
    pub const INVALIDATIONS: &str = "cache_invalidations_total";
    pub const CHANGE_EVENTS: &str = "change_events_total";
}
