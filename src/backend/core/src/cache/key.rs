//! Type-safe cache keys for marketplace resources.
//!
//! Keys carry the tags the invalidation rules purge by, so a key built with
//! [`CacheKey::listing`] is dropped by any rule purging `"listings"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Key Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Enumeration of cache key types with associated default TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// A single listing
    Listing,

    /// Paged listing queries (short TTL, churns with every new listing)
    ListingFeed,

    /// Category tree (rarely modified)
    Category,

    /// Forum thread with its header data
    ForumThread,

    /// Forum post pages
    ForumPost,

    /// Campaign details and progress
    Campaign,

    /// Public user profile
    Profile,

    /// Admin dashboard aggregates (very short TTL)
    AdminReport,

    /// Custom key type
    Custom,
}

impl KeyType {
    /// Get the default TTL for this key type.
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Listing => Duration::from_secs(300),     // 5 minutes
            Self::ListingFeed => Duration::from_secs(60),  // 1 minute
            Self::Category => Duration::from_secs(3600),   // 1 hour
            Self::ForumThread => Duration::from_secs(120), // 2 minutes
            Self::ForumPost => Duration::from_secs(120),   // 2 minutes
            Self::Campaign => Duration::from_secs(600),    // 10 minutes
            Self::Profile => Duration::from_secs(900),     // 15 minutes
            Self::AdminReport => Duration::from_secs(30),  // 30 seconds
            Self::Custom => Duration::from_secs(300),      // 5 minutes
        }
    }

    /// Get the key type prefix for namespacing.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Listing => "listing",
            Self::ListingFeed => "listings",
            Self::Category => "category",
            Self::ForumThread => "thread",
            Self::ForumPost => "post",
            Self::Campaign => "campaign",
            Self::Profile => "profile",
            Self::AdminReport => "admin",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Key
// ═══════════════════════════════════════════════════════════════════════════════

/// A type-safe cache key with namespace support.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    key_type: KeyType,
    id: Option<String>,
    namespace: Option<String>,
    segments: Vec<String>,
    tags: Vec<String>,
    ttl: Option<Duration>,
    version: Option<u32>,
}

impl CacheKey {
    /// Create a new cache key with the given type.
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            id: None,
            namespace: None,
            segments: Vec::new(),
            tags: Vec::new(),
            ttl: None,
            version: None,
        }
    }

    /// Set the primary ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the namespace (e.g. a community or tenant).
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Add a key segment.
    pub fn with_segment(mut self, segment: impl Into<String>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Add a tag for invalidation.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Add multiple tags.
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(|t| t.into()));
        self
    }

    /// Set custom TTL override.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Set key version for cache busting.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Get the TTL (custom or default for key type).
    pub fn ttl(&self) -> Duration {
        self.ttl.unwrap_or_else(|| self.key_type.default_ttl())
    }

    /// Build the cache key string.
    ///
    /// Layout: `[namespace:]prefix[:vN][:id][:segment...]`.
    pub fn build(&self) -> String {
        let mut parts = Vec::with_capacity(4 + self.segments.len());

        if let Some(ref ns) = self.namespace {
            parts.push(ns.clone());
        }
        parts.push(self.key_type.prefix().to_string());
        if let Some(version) = self.version {
            parts.push(format!("v{}", version));
        }
        if let Some(ref id) = self.id {
            parts.push(id.clone());
        }
        parts.extend(self.segments.iter().cloned());

        parts.join(":")
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.build())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors
// ═══════════════════════════════════════════════════════════════════════════════

impl CacheKey {
    /// A single listing, tagged by the listing collection and its own id.
    pub fn listing(listing_id: impl Into<String>) -> Self {
        let id = listing_id.into();
        Self::new(KeyType::Listing)
            .with_tag("listings")
            .with_tag(format!("listing:{}", id))
            .with_id(id)
    }

    /// One page of a listing query; `query_hash` comes from [`hash_composite_key`].
    pub fn listing_feed(query_hash: impl Into<String>) -> Self {
        Self::new(KeyType::ListingFeed)
            .with_id(query_hash)
            .with_tag("listings")
            .with_tag("listing_feeds")
    }

    /// Listings within a category, paged.
    pub fn listings_in_category(category_id: impl Into<String>, page: u32) -> Self {
        let category = category_id.into();
        Self::new(KeyType::ListingFeed)
            .with_namespace(format!("category-{}", category))
            .with_id(format!("page-{}", page))
            .with_tag("listings")
            .with_tag(format!("category:{}", category))
    }

    pub fn category(category_id: impl Into<String>) -> Self {
        Self::new(KeyType::Category)
            .with_id(category_id)
            .with_tag("categories")
    }

    pub fn forum_thread(thread_id: impl Into<String>) -> Self {
        let id = thread_id.into();
        Self::new(KeyType::ForumThread)
            .with_tag("forum_threads")
            .with_tag(format!("thread:{}", id))
            .with_id(id)
    }

    /// A page of posts in a thread.
    pub fn forum_posts(thread_id: impl Into<String>, page: u32) -> Self {
        let thread = thread_id.into();
        Self::new(KeyType::ForumPost)
            .with_id(thread.clone())
            .with_segment(format!("page-{}", page))
            .with_tag("forum_posts")
            .with_tag(format!("thread:{}", thread))
    }

    pub fn campaign(campaign_id: impl Into<String>) -> Self {
        Self::new(KeyType::Campaign)
            .with_id(campaign_id)
            .with_tag("campaigns")
    }

    pub fn profile(user_id: impl Into<String>) -> Self {
        let id = user_id.into();
        Self::new(KeyType::Profile)
            .with_tag("profiles")
            .with_tag(format!("user:{}", id))
            .with_id(id)
    }

    pub fn admin_report(report: impl Into<String>) -> Self {
        Self::new(KeyType::AdminReport)
            .with_id(report)
            .with_tag("admin_reports")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key Hashing Utilities
// ═══════════════════════════════════════════════════════════════════════════════

/// Hash a value for use in cache keys.
pub fn hash_for_key<T: std::hash::Hash>(value: &T) -> String {
    use std::hash::{DefaultHasher, Hasher};
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Hash multiple values for use in cache keys.
pub fn hash_composite_key<I, T>(values: I) -> String
where
    I: IntoIterator<Item = T>,
    T: std::hash::Hash,
{
    use std::hash::{DefaultHasher, Hasher};
    let mut hasher = DefaultHasher::new();
    for value in values {
        value.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Key for a listing search described by serializable query parameters.
pub fn listing_feed_key(params: &impl Serialize) -> CacheKey {
    let params_json = serde_json::to_string(params).unwrap_or_default();
    CacheKey::listing_feed(hash_for_key(&params_json))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
