//! Configuration management.
//!
//! Settings come from an optional file (TOML, YAML or JSON) overlaid with
//! environment variables prefixed `BAZAAR`, nested with `__`:
//!
//! ```text
//! BAZAAR__CACHE__DEFAULT_TTL=10m
//! BAZAAR__CACHE__DURABLE__BACKEND=redis
//! BAZAAR__CACHE__DURABLE__URL=redis://cache:6379
//! BAZAAR__INVALIDATION__DEBOUNCE=500ms
//! ```

use crate::cache::{
    CacheConfig, DurableTier, MemoryDurableTier, RedisDurableTier, RedisTierConfig,
    DEFAULT_FAST_CAPACITY, DEFAULT_MAX_ENTRIES, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL,
};
use crate::error::{BazaarError, Result};
use crate::invalidation::{
    glob_to_regex, ChangeKind, InvalidationConfig, InvalidationRule, DEFAULT_DEBOUNCE,
    DEFAULT_LOG_CAPACITY,
};
use crate::telemetry::LoggingConfig;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const ENV_PREFIX: &str = "BAZAAR";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Cache tiers
    #[serde(default)]
    pub cache: CacheSettings,

    /// Change-driven invalidation
    #[serde(default)]
    pub invalidation: InvalidationSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// TTL applied when a write does not give one
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Maximum entries held by the fast tier
    #[serde(default = "default_fast_capacity")]
    pub fast_capacity: usize,

    /// Interval of the background expiry sweep
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Durable tier backend
    #[serde(default)]
    pub durable: DurableSettings,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            fast_capacity: default_fast_capacity(),
            sweep_interval: default_sweep_interval(),
            durable: DurableSettings::default(),
        }
    }
}

/// Which durable tier to run, if any.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DurableSettings {
    /// Fast tier only
    None,

    /// In-process durable tier
    Memory {
        #[serde(default = "default_max_entries")]
        max_entries: usize,
    },

    Redis {
        #[serde(default = "default_redis_url")]
        url: String,

        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

impl Default for DurableSettings {
    fn default() -> Self {
        Self::Memory {
            max_entries: default_max_entries(),
        }
    }
}

impl DurableSettings {
    /// Open the configured durable tier.
    ///
    /// An unreachable Redis is logged and the cache runs on the fast tier alone.
    pub async fn connect(&self) -> Option<Arc<dyn DurableTier>> {
        match self {
            Self::None => None,
            Self::Memory { max_entries } => Some(Arc::new(MemoryDurableTier::new(*max_entries))),
            Self::Redis { url, key_prefix } => {
                let config = RedisTierConfig {
                    url: url.clone(),
                    key_prefix: key_prefix.clone(),
                };
                match RedisDurableTier::connect(config).await {
                    Ok(tier) => Some(Arc::new(tier)),
                    Err(e) => {
                        e.log();
                        warn!(url = %url, "Durable tier unavailable, running memory-only");
                        None
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvalidationSettings {
    /// Quiet period before a resource's pending rules run
    #[serde(default = "default_debounce", with = "humantime_serde")]
    pub debounce: Duration,

    /// Number of invalidation records kept for inspection
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,

    /// Rules registered at startup
    #[serde(default)]
    pub rules: Vec<RuleSettings>,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            log_capacity: default_log_capacity(),
            rules: Vec::new(),
        }
    }
}

/// A rule as written in configuration.
///
/// ```toml
/// [[invalidation.rules]]
/// id = "listing-changes"
/// resource = "listings"
/// events = ["update", "delete"]
/// tags = ["listings", "listing_feeds"]
/// patterns = ["^category-.*:listings:"]
/// globs = ["listings:page-*"]
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleSettings {
    pub id: String,

    pub resource: String,

    /// Change kinds that fire the rule; all kinds when omitted
    #[serde(default = "all_kinds")]
    pub events: Vec<ChangeKind>,

    /// Feed-side filter expression
    #[serde(default)]
    pub filter: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Key regexes
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Key globs (`*`, `?`)
    #[serde(default)]
    pub globs: Vec<String>,
}

impl RuleSettings {
    /// Build the runtime rule, compiling every pattern.
    pub fn to_rule(&self) -> Result<InvalidationRule> {
        let mut rule = self
            .events
            .iter()
            .fold(InvalidationRule::new(&self.id, &self.resource), |rule, kind| rule.on(*kind));

        if let Some(filter) = &self.filter {
            rule = rule.with_filter(filter);
        }
        for tag in &self.tags {
            rule = rule.purge_tag(tag);
        }
        for pattern in &self.patterns {
            let regex = Regex::new(pattern).map_err(|e| {
                BazaarError::configuration(format!(
                    "Rule {} has an invalid pattern {:?}: {}",
                    self.id, pattern, e
                ))
            })?;
            rule = rule.purge_pattern(regex);
        }
        for glob in &self.globs {
            let regex = glob_to_regex(glob).map_err(|e| {
                BazaarError::configuration(format!(
                    "Rule {} has an invalid glob {:?}: {}",
                    self.id,
                    glob,
                    e.user_message()
                ))
            })?;
            rule = rule.purge_pattern(regex);
        }

        Ok(rule)
    }
}

// Default value functions
fn default_ttl() -> Duration { DEFAULT_TTL }
fn default_fast_capacity() -> usize { DEFAULT_FAST_CAPACITY }
fn default_sweep_interval() -> Duration { DEFAULT_SWEEP_INTERVAL }
fn default_max_entries() -> usize { DEFAULT_MAX_ENTRIES }
fn default_redis_url() -> String { RedisTierConfig::default().url }
fn default_key_prefix() -> String { RedisTierConfig::default().key_prefix }
fn default_debounce() -> Duration { DEFAULT_DEBOUNCE }
fn default_log_capacity() -> usize { DEFAULT_LOG_CAPACITY }
fn all_kinds() -> Vec<ChangeKind> { ChangeKind::ALL.to_vec() }

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, overlaid with the environment.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the cache cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.cache.default_ttl.is_zero() {
            return Err(BazaarError::configuration("cache.default_ttl must be greater than zero"));
        }
        if self.cache.fast_capacity == 0 {
            return Err(BazaarError::configuration("cache.fast_capacity must be at least 1"));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(BazaarError::configuration("cache.sweep_interval must be greater than zero"));
        }

        let mut ids = HashSet::new();
        for rule in &self.invalidation.rules {
            if !ids.insert(rule.id.as_str()) {
                return Err(BazaarError::configuration(format!(
                    "Duplicate invalidation rule id: {}",
                    rule.id
                )));
            }
        }
        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::builder()
            .default_ttl(self.cache.default_ttl)
            .fast_capacity(self.cache.fast_capacity)
            .sweep_interval(self.cache.sweep_interval)
            .build()
    }

    pub fn invalidation_config(&self) -> InvalidationConfig {
        InvalidationConfig::builder()
            .debounce(self.invalidation.debounce)
            .log_capacity(self.invalidation.log_capacity)
            .build()
    }

    /// Compile every configured rule.
    pub fn rules(&self) -> Result<Vec<InvalidationRule>> {
        self.invalidation.rules.iter().map(RuleSettings::to_rule).collect()
    }
}
