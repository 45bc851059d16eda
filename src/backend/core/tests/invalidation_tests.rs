//! End-to-end invalidation: change feed -> debounce -> purge.

use bazaar_cache::cache::{CacheConfig, CacheKey, MemoryDurableTier, MultiLayerCache, SetOptions};
use bazaar_cache::invalidation::{
    BroadcastChangeFeed, ChangeEvent, ChangeKind, InvalidationConfig, InvalidationManager,
    InvalidationObserver, InvalidationRule, InvalidationTrigger,
};
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const DEBOUNCE: Duration = Duration::from_millis(100);

// ============================================================================
// Test Utilities
// ============================================================================

#[derive(Default)]
struct RecordingObserver {
    executions: Mutex<Vec<(String, u64)>>,
}

impl InvalidationObserver for RecordingObserver {
    fn record(&self, rule_id: &str, purged: u64) {
        self.executions.lock().push((rule_id.to_string(), purged));
    }
}

struct Harness {
    cache: MultiLayerCache,
    feed: Arc<BroadcastChangeFeed>,
    observer: Arc<RecordingObserver>,
    manager: InvalidationManager,
}

fn harness(cache: MultiLayerCache) -> Harness {
    let feed = Arc::new(BroadcastChangeFeed::default());
    let observer = Arc::new(RecordingObserver::default());
    let manager = InvalidationManager::with_observer(
        cache.clone(),
        feed.clone(),
        InvalidationConfig::builder().debounce(DEBOUNCE).build(),
        observer.clone(),
    );
    Harness {
        cache,
        feed,
        observer,
        manager,
    }
}

async fn put(cache: &MultiLayerCache, key: &str, tag: &str) {
    cache
        .set(key, json!({"key": key}), SetOptions::new().tag(tag))
        .await
        .unwrap();
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_product_update_scenario() {
    let h = harness(MultiLayerCache::memory_only(CacheConfig::default()));
    h.manager
        .add_rule(
            InvalidationRule::new("r1", "products")
                .on(ChangeKind::Update)
                .purge_tag("products"),
        )
        .await;
    h.manager.start().await;

    put(&h.cache, "product:1", "products").await;
    put(&h.cache, "product:2", "products").await;
    put(&h.cache, "review:1", "reviews").await;

    h.feed.publish(ChangeEvent::new("products", ChangeKind::Update));
    tokio::time::sleep(DEBOUNCE * 3).await;

    assert!(!h.cache.exists("product:1").await);
    assert!(!h.cache.exists("product:2").await);
    assert!(h.cache.exists("review:1").await);
    assert_eq!(h.observer.executions.lock().clone(), vec![("r1".to_string(), 2)]);

    h.manager.stop().await;
}

#[tokio::test]
async fn test_burst_covers_union_of_matched_rules() {
    let durable = Arc::new(MemoryDurableTier::new(1_000));
    let h = harness(MultiLayerCache::with_durable(CacheConfig::default(), durable));

    h.manager
        .add_rule(
            InvalidationRule::new("listing-edits", "listings")
                .on(ChangeKind::Update)
                .purge_tag("listings"),
        )
        .await;
    h.manager
        .add_rule(
            InvalidationRule::new("listing-removals", "listings")
                .on(ChangeKind::Delete)
                .purge_pattern(Regex::new("^category-").unwrap()),
        )
        .await;
    h.manager.start().await;

    let listing = CacheKey::listing("1");
    h.cache
        .set(&listing.build(), json!({"id": 1}), SetOptions::for_key(&listing))
        .await
        .unwrap();
    let page = CacheKey::listings_in_category("bikes", 1);
    h.cache
        .set(&page.build(), json!([1]), SetOptions::new().tag("category-pages"))
        .await
        .unwrap();
    let profile = CacheKey::profile("7");
    h.cache
        .set(&profile.build(), json!({"id": 7}), SetOptions::for_key(&profile))
        .await
        .unwrap();

    for _ in 0..10 {
        h.feed.publish(ChangeEvent::new("listings", ChangeKind::Update));
    }
    h.feed.publish(ChangeEvent::new("listings", ChangeKind::Delete));
    tokio::time::sleep(DEBOUNCE * 4).await;

    assert!(!h.cache.exists(&listing.build()).await);
    assert!(!h.cache.exists(&page.build()).await);
    assert!(h.cache.exists(&profile.build()).await);

    // One execution per rule; each entry lived in both tiers but counts once
    let executions = h.observer.executions.lock().clone();
    assert_eq!(
        executions,
        vec![
            ("listing-edits".to_string(), 1),
            ("listing-removals".to_string(), 1),
        ]
    );

    let recent = h.manager.recent_invalidations(10);
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|r| matches!(
        &r.trigger,
        InvalidationTrigger::Debounced { resource, .. } if resource == "listings"
    )));

    h.manager.stop().await;
}

#[tokio::test]
async fn test_resources_are_debounced_independently() {
    let h = harness(MultiLayerCache::memory_only(CacheConfig::default()));
    h.manager
        .add_rule(InvalidationRule::new("listings", "listings").on_any().purge_tag("listings"))
        .await;
    h.manager
        .add_rule(InvalidationRule::new("posts", "forum_posts").on_any().purge_tag("forum_posts"))
        .await;
    h.manager.start().await;

    put(&h.cache, "listing:1", "listings").await;
    put(&h.cache, "post:1:page-1", "forum_posts").await;

    h.feed.publish(ChangeEvent::new("forum_posts", ChangeKind::Insert));
    // Keep the listings resource busy past the posts window
    for _ in 0..6 {
        h.feed.publish(ChangeEvent::new("listings", ChangeKind::Update));
        tokio::time::sleep(Duration::from_millis(40)).await;
    }

    assert!(!h.cache.exists("post:1:page-1").await);
    assert!(h.cache.exists("listing:1").await);

    tokio::time::sleep(DEBOUNCE * 3).await;
    assert!(!h.cache.exists("listing:1").await);

    h.manager.stop().await;
}

#[tokio::test]
async fn test_stop_leaves_cache_usable() {
    let h = harness(MultiLayerCache::memory_only(CacheConfig::default()));
    h.manager
        .add_rule(InvalidationRule::new("r1", "products").on_any().purge_tag("products"))
        .await;
    h.manager.start().await;
    h.manager.stop().await;

    put(&h.cache, "product:1", "products").await;
    h.feed.publish(ChangeEvent::new("products", ChangeKind::Update));
    tokio::time::sleep(DEBOUNCE * 3).await;

    assert!(h.cache.exists("product:1").await);
    assert!(h.observer.executions.lock().is_empty());

    // Restart resubscribes from the registry
    h.manager.start().await;
    assert_eq!(h.manager.subscribed_resources().await, vec!["products"]);
    h.manager.stop().await;
}
