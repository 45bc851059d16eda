//! Durable tier (L2) implementations.
//!
//! This module provides pluggable durable backends:
//! - **MemoryDurableTier**: In-process store with tag and expiry indices
//! - **RedisDurableTier**: Networked store using Redis sets and a sorted set
//!
//! Durable tiers only ever see [`StoredEntry`] values (JSON payloads). Any
//! error they return is absorbed by the orchestrator, which falls back to
//! fast-tier-only behaviour for that call.

mod memory;
mod redis;

pub use self::memory::{MemoryDurableTier, DEFAULT_MAX_ENTRIES};
pub use self::redis::{RedisDurableTier, RedisTierConfig};

use super::entry::StoredEntry;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

// ═══════════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable tier statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DurableTierStats {
    /// Backend name
    pub backend: String,

    /// Number of live entries
    pub entries: u64,

    pub hits: u64,
    pub misses: u64,

    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

impl DurableTierStats {
    /// Calculate the hit rate.
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Durable Tier Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for durable cache tiers.
#[async_trait]
pub trait DurableTier: Send + Sync {
    /// Get a live entry; expired entries are never returned.
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>>;

    /// Insert or replace an entry.
    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()>;

    /// Delete an entry, returning whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete every entry carrying `tag`, returning the keys removed.
    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>>;

    /// Delete every entry whose key matches `pattern`, returning the keys removed.
    async fn delete_by_pattern(&self, pattern: &Regex) -> Result<Vec<String>>;

    /// Clear all entries.
    async fn clear(&self) -> Result<()>;

    /// Number of live entries.
    async fn count(&self) -> Result<u64>;

    /// Remove entries that expired at or before `now`.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Get tier statistics.
    async fn stats(&self) -> Result<DurableTierStats>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}
