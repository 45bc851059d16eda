//! Cache entry data model.
//!
//! Entries are immutable value wrappers: a refresh replaces the whole entry,
//! nothing mutates one in place. The durable tier only ever sees
//! [`StoredEntry`], whose payload is JSON; typed values stay in process.

use crate::error::{BazaarError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// A cached value with expiry, tags and an optional entity tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// Cached payload
    pub data: T,

    /// When this entry was created
    pub created_at: DateTime<Utc>,

    /// When this entry stops being served; always after `created_at`
    pub expires_at: DateTime<Utc>,

    /// Tags for grouped invalidation
    #[serde(default)]
    pub tags: Vec<String>,

    /// Entity tag for conditional responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// Entry representation at the durable-tier edge.
pub type StoredEntry = CacheEntry<serde_json::Value>;

impl<T> CacheEntry<T> {
    /// Create an entry that lives for `ttl` starting now.
    ///
    /// Fails with `InvalidTtl` for a zero TTL, which would break
    /// `expires_at > created_at`.
    pub fn new(data: T, ttl: Duration) -> Result<Self> {
        Self::created_at(data, Utc::now(), ttl)
    }

    /// Create an entry with an explicit creation time.
    pub fn created_at(data: T, created_at: DateTime<Utc>, ttl: Duration) -> Result<Self> {
        let ttl_ms = ttl.as_millis() as u64;
        if ttl.is_zero() {
            return Err(BazaarError::invalid_ttl(ttl_ms));
        }
        let span = chrono::Duration::from_std(ttl).map_err(|_| BazaarError::invalid_ttl(ttl_ms))?;
        let expires_at = created_at
            .checked_add_signed(span)
            .ok_or_else(|| BazaarError::invalid_ttl(ttl_ms))?;

        Ok(Self {
            data,
            created_at,
            expires_at,
            tags: Vec::new(),
            etag: None,
        })
    }

    /// Attach tags, dropping duplicates while keeping first-seen order.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            let tag = tag.into();
            if !self.tags.contains(&tag) {
                self.tags.push(tag);
            }
        }
        self
    }

    /// Attach an entity tag.
    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Get the remaining TTL, `None` once expired.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .signed_duration_since(Utc::now())
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
    }

    /// The full lifetime the entry was created with.
    pub fn ttl(&self) -> Duration {
        self.expires_at
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or_default()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Build a new entry with the same metadata and a converted payload.
    pub fn map_data<U>(&self, f: impl FnOnce(&T) -> U) -> CacheEntry<U> {
        CacheEntry {
            data: f(&self.data),
            created_at: self.created_at,
            expires_at: self.expires_at,
            tags: self.tags.clone(),
            etag: self.etag.clone(),
        }
    }

    /// Fallible variant of [`CacheEntry::map_data`].
    pub fn try_map_data<U, E>(
        &self,
        f: impl FnOnce(&T) -> std::result::Result<U, E>,
    ) -> std::result::Result<CacheEntry<U>, E> {
        Ok(CacheEntry {
            data: f(&self.data)?,
            created_at: self.created_at,
            expires_at: self.expires_at,
            tags: self.tags.clone(),
            etag: self.etag.clone(),
        })
    }
}

/// Weak entity tag derived from a serialized payload.
pub fn weak_etag(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    format!("W/\"{}\"", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_not_expired() {
        let entry = CacheEntry::new("apple", Duration::from_secs(3600)).unwrap();
        assert!(!entry.is_expired());
        assert!(entry.expires_at > entry.created_at);
        assert!(entry.remaining_ttl().is_some());
    }

    #[test]
    fn test_entry_expiration() {
        let created = Utc::now() - chrono::Duration::milliseconds(200);
        let entry = CacheEntry::created_at(vec![1, 2, 3], created, Duration::from_millis(100)).unwrap();

        assert!(entry.is_expired());
        assert_eq!(entry.remaining_ttl(), None);
        assert_eq!(entry.ttl(), Duration::from_millis(100));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let err = CacheEntry::new("x", Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidTtl);
    }

    #[test]
    fn test_tags_are_deduplicated() {
        let entry = CacheEntry::new(1u32, Duration::from_secs(1))
            .unwrap()
            .with_tags(["listings", "category:bikes", "listings"]);

        assert_eq!(entry.tags, vec!["listings".to_string(), "category:bikes".to_string()]);
        assert!(entry.has_tag("category:bikes"));
        assert!(!entry.has_tag("forum"));
    }

    #[test]
    fn test_map_data_keeps_metadata() {
        let entry = CacheEntry::new(21u32, Duration::from_secs(60))
            .unwrap()
            .with_tags(["numbers"])
            .with_etag(Some("W/\"abc\"".to_string()));
        let doubled = entry.map_data(|v| v * 2);

        assert_eq!(doubled.data, 42);
        assert_eq!(doubled.expires_at, entry.expires_at);
        assert_eq!(doubled.tags, entry.tags);
        assert_eq!(doubled.etag, entry.etag);
    }

    #[test]
    fn test_weak_etag_is_stable() {
        let a = weak_etag(br#"{"name":"Apple"}"#);
        let b = weak_etag(br#"{"name":"Apple"}"#);
        let c = weak_etag(br#"{"name":"Pear"}"#);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("W/\""));
        assert_eq!(a.len(), 3 + 32 + 1);
    }
}
