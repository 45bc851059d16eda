//! Benchmarks for the caching layer.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use bazaar_cache::cache::{CacheConfig, CacheEntry, CacheKey, FastTier, KeyType, MemoryDurableTier, MultiLayerCache, SetOptions};
use bazaar_cache::cache::key::{hash_for_key, hash_composite_key};
use regex::Regex;
use std::sync::Arc;

fn bench_cache_key_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key_construction");
    group.bench_function("simple", |b| { b.iter(|| black_box(CacheKey::new(KeyType::Listing).with_id("listing-123"))); });
    group.bench_function("namespaced", |b| { b.iter(|| black_box(CacheKey::new(KeyType::ListingFeed).with_namespace("category-bikes").with_id("page-2"))); });
    group.bench_function("full", |b| { b.iter(|| black_box(CacheKey::new(KeyType::ForumPost).with_namespace("board-7").with_id("thread-789").with_segment("page-3").with_tag("forum_posts").with_tag("thread:789").with_version(2).with_ttl(Duration::from_secs(120)))); });
    group.bench_function("convenience_listing", |b| { b.iter(|| black_box(CacheKey::listing("123"))); });
    group.bench_function("convenience_forum_posts", |b| { b.iter(|| black_box(CacheKey::forum_posts("456", 3))); });
    group.finish();
}

fn bench_cache_key_build_string(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key_build_string");
    let simple_key = CacheKey::listing("123");
    let complex_key = CacheKey::new(KeyType::ForumPost).with_namespace("board-7").with_id("thread-789").with_segment("page-3").with_segment("newest").with_version(3);
    group.bench_function("simple", |b| { b.iter(|| black_box(simple_key.build())); });
    group.bench_function("complex", |b| { b.iter(|| black_box(complex_key.build())); });
    group.bench_function("display_format", |b| { b.iter(|| black_box(format!("{}", simple_key))); });
    group.finish();
}

fn bench_cache_key_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key_hashing");
    group.bench_function("hash_for_key_str", |b| { b.iter(|| black_box(hash_for_key(&"category=bikes&sort=newest"))); });
    group.bench_function("hash_for_key_int", |b| { b.iter(|| black_box(hash_for_key(&42u64))); });
    group.bench_function("hash_composite_3", |b| { b.iter(|| black_box(hash_composite_key(["listings", "bikes", "newest"]))); });
    group.bench_function("hash_composite_6", |b| { b.iter(|| black_box(hash_composite_key(["listings", "bikes", "newest", "page=1", "limit=50", "min_price=100"]))); });
    group.finish();
}

fn bench_fast_tier_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("fast_tier_set");
    for cap in [100, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::from_parameter(cap), &cap, |b, &capacity| {
            let tier: FastTier<String> = FastTier::new(capacity);
            let mut i = 0u64;
            b.iter(|| { i += 1; let entry = CacheEntry::new(format!("value-{i}"), Duration::from_secs(60)).unwrap(); tier.set(&format!("listing:{i}"), entry); });
        });
    }
    group.finish();
}

fn bench_multi_layer_get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_layer_get_hit");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = MultiLayerCache::with_durable(CacheConfig::default(), Arc::new(MemoryDurableTier::new(10_000)));
    rt.block_on(async { cache.set("listing:1", "bench-value".to_string(), SetOptions::new()).await.unwrap(); });
    group.bench_function("fast_hit", |b| { b.iter(|| { rt.block_on(async { let val: Option<String> = cache.get("listing:1").await; black_box(val); }); }); });
    rt.block_on(async { cache.set("listing:2", "bench-value".to_string(), SetOptions::new().skip_fast()).await.unwrap(); });
    group.bench_function("durable_hit_with_promotion", |b| { b.iter(|| { rt.block_on(async { let val: Option<String> = cache.get("listing:2").await; black_box(val); cache.delete("listing:2").await; cache.set("listing:2", "bench-value".to_string(), SetOptions::new().skip_fast()).await.unwrap(); }); }); });
    group.finish();
}

fn bench_multi_layer_get_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_layer_get_miss");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = MultiLayerCache::with_durable(CacheConfig::default(), Arc::new(MemoryDurableTier::new(10_000)));
    group.bench_function("get_miss", |b| { b.iter(|| { rt.block_on(async { let val: Option<String> = cache.get("nonexistent-key").await; black_box(val); }); }); });
    group.finish();
}

fn bench_multi_layer_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi_layer_throughput");
    let rt = tokio::runtime::Runtime::new().unwrap();
    for ops in [100, 1_000] {
        group.throughput(Throughput::Elements(ops as u64));
        group.bench_with_input(BenchmarkId::from_parameter(ops), &ops, |b, &n| {
            let cache = MultiLayerCache::with_durable(CacheConfig::default(), Arc::new(MemoryDurableTier::new(10_000)));
            b.iter(|| { rt.block_on(async {
                for i in 0..n { let key = CacheKey::listing(i.to_string()); cache.set(&key.build(), format!("value-{i}"), SetOptions::for_key(&key)).await.unwrap(); }
                for i in 0..n { let key = CacheKey::listing(i.to_string()); let _: Option<String> = cache.get(&key.build()).await; }
            }); });
        });
    }
    group.finish();
}

fn bench_purges(c: &mut Criterion) {
    let mut group = c.benchmark_group("purges");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = MultiLayerCache::with_durable(CacheConfig::default(), Arc::new(MemoryDurableTier::new(10_000)));
    let pattern = Regex::new("^category-bikes:").unwrap();
    group.bench_function("tag_100", |b| { b.iter(|| { rt.block_on(async {
        for i in 0..100 { cache.set(&format!("listing:{i}"), i, SetOptions::new().tag("listings")).await.unwrap(); }
        black_box(cache.delete_by_tag("listings").await);
    }); }); });
    group.bench_function("pattern_100", |b| { b.iter(|| { rt.block_on(async {
        for i in 0..100 { let key = CacheKey::listings_in_category("bikes", i); cache.set(&key.build(), i, SetOptions::new()).await.unwrap(); }
        black_box(cache.delete_by_pattern(&pattern).await);
    }); }); });
    group.finish();
}

criterion_group!(benches, bench_cache_key_construction, bench_cache_key_build_string, bench_cache_key_hashing, bench_fast_tier_set, bench_multi_layer_get_hit, bench_multi_layer_get_miss, bench_multi_layer_throughput, bench_purges);
criterion_main!(benches);
