//! Redis-backed durable tier.
//!
//! Key layout under the configured prefix:
//! - `{prefix}entry:{key}`: JSON-encoded entry, written with `PX` expiry
//! - `{prefix}tag:{tag}`: set of keys carrying the tag
//! - `{prefix}expiry`: sorted set of keys scored by expiry (unix millis)
//! - `{prefix}entry_tags`: hash of key -> JSON tag list, used to unlink tag sets

use super::{DurableTier, DurableTierStats};
use crate::cache::entry::StoredEntry;
use crate::error::{BazaarError, ErrorCode, Result};
use crate::telemetry::names;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const SCAN_BATCH: usize = 100;

/// Configuration for the Redis tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisTierConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix applied to every key written by the tier
    pub key_prefix: String,
}

impl Default for RedisTierConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "bazaar:".to_string(),
        }
    }
}

/// Durable tier stored in Redis.
pub struct RedisDurableTier {
    conn: MultiplexedConnection,
    config: RedisTierConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisDurableTier {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(config: RedisTierConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            BazaarError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let mut conn = client.get_multiplexed_async_connection().await.map_err(|e| {
            BazaarError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to connect to Redis",
                e.to_string(),
            )
        })?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(|e| {
            BazaarError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Redis ping failed",
                e.to_string(),
            )
        })?;

        info!(url = %config.url, prefix = %config.key_prefix, "Redis durable tier connected");

        Ok(Self {
            conn,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn entry_key(&self, key: &str) -> String {
        entry_key(&self.config.key_prefix, key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.config.key_prefix, tag)
    }

    fn expiry_key(&self) -> String {
        format!("{}expiry", self.config.key_prefix)
    }

    fn tags_hash_key(&self) -> String {
        format!("{}entry_tags", self.config.key_prefix)
    }

    /// Scan logical keys of every stored entry.
    async fn scan_entry_keys(&self, conn: &mut MultiplexedConnection) -> Result<Vec<String>> {
        let pattern = format!("{}*", self.entry_key(""));
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(conn)
                .await?;

            found.extend(
                keys.iter()
                    .filter_map(|k| logical_key(&self.config.key_prefix, k))
                    .map(str::to_string),
            );

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(found)
    }

    /// Delete entries and drop them from every index.
    ///
    /// Returns the number of entry documents that were actually removed.
    /// Remove entries and their index members, returning the keys that held an entry.
    async fn unlink(&self, conn: &mut MultiplexedConnection, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let tag_lists: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.tags_hash_key())
            .arg(keys)
            .query_async(conn)
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys {
            pipe.del(self.entry_key(key));
        }
        pipe.zrem(self.expiry_key(), keys)
            .ignore()
            .hdel(self.tags_hash_key(), keys)
            .ignore();

        for (key, tags) in keys.iter().zip(tag_lists) {
            for tag in decode_tags(tags.as_deref()) {
                pipe.srem(self.tag_key(&tag), key).ignore();
            }
        }

        let deleted: Vec<u64> = pipe.query_async(conn).await?;
        Ok(keys
            .iter()
            .zip(deleted)
            .filter(|(_, count)| *count > 0)
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[async_trait]
impl DurableTier for RedisDurableTier {
    async fn get(&self, key: &str) -> Result<Option<StoredEntry>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.entry_key(key)).await?;

        let entry = match raw {
            Some(json) => Some(serde_json::from_str::<StoredEntry>(&json)?),
            None => None,
        }
        .filter(|entry| !entry.is_expired());

        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_HITS, "tier" => "durable").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            counter!(names::CACHE_MISSES, "tier" => "durable").increment(1);
        }
        Ok(entry)
    }

    async fn set(&self, key: &str, entry: StoredEntry) -> Result<()> {
        let ttl_ms = entry
            .remaining_ttl()
            .map(|d| d.as_millis().max(1) as u64)
            .unwrap_or(0);
        if ttl_ms == 0 {
            debug!(key = %key, "Skipping durable write of an already expired entry");
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&entry)?;
        let tags_json = serde_json::to_string(&entry.tags)?;

        // Previous tags must be unlinked, otherwise a retagged entry stays
        // reachable from its old tag sets.
        let previous: Option<String> = conn.hget(self.tags_hash_key(), key).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for tag in decode_tags(previous.as_deref()) {
            pipe.srem(self.tag_key(&tag), key).ignore();
        }
        pipe.cmd("SET")
            .arg(self.entry_key(key))
            .arg(&payload)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .zadd(self.expiry_key(), key, entry.expires_at.timestamp_millis())
            .ignore()
            .hset(self.tags_hash_key(), key, &tags_json)
            .ignore();
        for tag in &entry.tags {
            pipe.sadd(self.tag_key(tag), key).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        counter!(names::CACHE_SETS, "tier" => "durable").increment(1);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(!self.unlink(&mut conn, &[key.to_string()]).await?.is_empty())
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let tag_key = self.tag_key(tag);
        let keys: Vec<String> = conn.smembers(&tag_key).await?;

        let deleted = self.unlink(&mut conn, &keys).await?;
        conn.del::<_, ()>(&tag_key).await?;
        Ok(deleted)
    }

    async fn delete_by_pattern(&self, pattern: &Regex) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = self
            .scan_entry_keys(&mut conn)
            .await?
            .into_iter()
            .filter(|k| pattern.is_match(k))
            .collect();

        self.unlink(&mut conn, &keys).await
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.config.key_prefix);
        let mut cursor: u64 = 0;
        let mut total_deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await?;
                total_deleted += deleted;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        info!(deleted = total_deleted, "Cleared Redis durable tier");
        gauge!(names::CACHE_ENTRIES, "tier" => "durable").set(0.0);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let live: u64 = conn
            .zcount(self.expiry_key(), format!("({}", now_ms), "+inf")
            .await?;
        Ok(live)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.conn.clone();
        let now_ms = now.timestamp_millis();
        let expired: Vec<String> = conn
            .zrangebyscore(self.expiry_key(), "-inf", now_ms)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        // Entry documents are usually gone already through PX; the index
        // members are what the sweep actually reclaims.
        self.unlink(&mut conn, &expired).await?;
        Ok(expired.len() as u64)
    }

    async fn stats(&self) -> Result<DurableTierStats> {
        let entries = self.count().await?;
        gauge!(names::CACHE_ENTRIES, "tier" => "durable").set(entries as f64);

        let mut stats = DurableTierStats {
            backend: self.name().to_string(),
            entries,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: 0.0,
        };
        stats.calculate_hit_rate();
        Ok(stats)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

fn entry_key(prefix: &str, key: &str) -> String {
    format!("{}entry:{}", prefix, key)
}

fn logical_key<'a>(prefix: &str, stored: &'a str) -> Option<&'a str> {
    stored.strip_prefix(prefix)?.strip_prefix("entry:")
}

fn decode_tags(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default()
}
