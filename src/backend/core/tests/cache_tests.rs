//! End-to-end behaviour of the multi-tier cache.

use bazaar_cache::cache::{
    CacheConfig, CacheKey, DurableTier, FastTier, FetchOptions, MemoryDurableTier, MultiLayerCache,
    SetOptions,
};
use bazaar_cache::error::{BazaarError, ErrorCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Utilities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    name: String,
}

fn product(name: &str) -> Product {
    Product {
        name: name.to_string(),
    }
}

fn layered_cache() -> (MultiLayerCache, Arc<MemoryDurableTier>) {
    let durable = Arc::new(MemoryDurableTier::new(1_000));
    let cache = MultiLayerCache::with_durable(CacheConfig::default(), durable.clone());
    (cache, durable)
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_tag_purge_scenario() {
    let cache = MultiLayerCache::memory_only(CacheConfig::default());
    let options = SetOptions::new()
        .ttl(Duration::from_millis(1000))
        .tag("products");

    cache.set("product:1", product("Apple"), options).await.unwrap();
    assert_eq!(cache.get::<Product>("product:1").await, Some(product("Apple")));

    assert_eq!(cache.delete_by_tag("products").await, 1);
    assert_eq!(cache.get::<Product>("product:1").await, None);
}

#[tokio::test]
async fn test_ttl_round_trip() {
    let (cache, _) = layered_cache();
    cache
        .set("product:1", product("Apple"), SetOptions::new().ttl(Duration::from_millis(200)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cache.get::<Product>("product:1").await, Some(product("Apple")));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(cache.get::<Product>("product:1").await, None);
    assert!(!cache.exists("product:1").await);
}

#[tokio::test]
async fn test_tag_purge_is_precise_across_tiers() {
    let (cache, durable) = layered_cache();

    for i in 0..5 {
        let key = CacheKey::listing(i.to_string());
        cache
            .set(&key.build(), product("listing"), SetOptions::for_key(&key))
            .await
            .unwrap();
    }
    let thread = CacheKey::forum_thread("9");
    cache
        .set(&thread.build(), product("thread"), SetOptions::for_key(&thread))
        .await
        .unwrap();

    assert_eq!(cache.delete_by_tag("listings").await, 5);
    for i in 0..5 {
        let key = CacheKey::listing(i.to_string()).build();
        assert_eq!(cache.get::<Product>(&key).await, None);
    }
    assert_eq!(cache.get::<Product>(&thread.build()).await, Some(product("thread")));
    assert_eq!(durable.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_pattern_purge() {
    let (cache, _) = layered_cache();
    for page in 1..=3 {
        let key = CacheKey::listings_in_category("bikes", page);
        cache.set(&key.build(), page, SetOptions::for_key(&key)).await.unwrap();
    }
    let other = CacheKey::listings_in_category("books", 1);
    cache.set(&other.build(), 1u32, SetOptions::for_key(&other)).await.unwrap();

    let pattern = Regex::new("^category-bikes:").unwrap();
    assert_eq!(cache.delete_by_pattern(&pattern).await, 3);
    assert!(cache.exists(&other.build()).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_deduplication() {
    let (cache, _) = layered_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = CacheKey::listing("42");

    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let calls = calls.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_fetch(
                    &key.build(),
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, BazaarError>(product("Bike"))
                    },
                    FetchOptions::for_key(&key),
                )
                .await
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), product("Bike"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.etag(&key.build()).await.map(|e| e.starts_with("W/")), Some(true));
}

#[tokio::test]
async fn test_fetch_survives_dropped_caller() {
    let cache = MultiLayerCache::memory_only(CacheConfig::default());

    let caller = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_fetch(
                    "slow",
                    || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, BazaarError>(5u32)
                    },
                    FetchOptions::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    caller.abort();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(cache.get::<u32>("slow").await, Some(5));
}

#[tokio::test]
async fn test_stale_while_revalidate_failure_is_invisible() {
    let cache = MultiLayerCache::memory_only(CacheConfig::default());
    cache.set("k", product("old"), SetOptions::new()).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let value = cache
        .get_or_fetch(
            "k",
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Product, _>(BazaarError::fetch_failed("k", "upstream down"))
            },
            FetchOptions::new().stale_while_revalidate(true),
        )
        .await
        .unwrap();
    assert_eq!(value, product("old"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get::<Product>("k").await, Some(product("old")));
}

#[tokio::test]
async fn test_pending_fetch_of_another_type_is_a_mismatch() {
    let cache = MultiLayerCache::memory_only(CacheConfig::default());

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .get_or_fetch(
                    "k",
                    || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, BazaarError>(1u32)
                    },
                    FetchOptions::new(),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = cache
        .get_or_fetch(
            "k",
            || async { Ok::<_, BazaarError>("text".to_string()) },
            FetchOptions::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::TypeMismatch);
    assert_eq!(first.await.unwrap().unwrap(), 1);
}

#[test]
fn test_eviction_bound() {
    let tier: FastTier<u32> = FastTier::new(3);
    for i in 0..4u32 {
        let entry = bazaar_cache::cache::CacheEntry::new(i, Duration::from_secs(60)).unwrap();
        tier.set(&format!("k{}", i), entry);
    }

    let stats = tier.stats();
    assert_eq!(stats.size, 3);
    assert_eq!(stats.evictions, 1);
    assert!(!tier.contains("k0"));
    assert!(tier.contains("k3"));
}
