use conduit::cache_key::cache_key;
use conduit_core_resilience::{CacheConfig, ResponseCache};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::hint::black_box;
use std::time::Duration;

fn sample_params(width: usize) -> Vec<Value> {
    (0..width)
        .map(|i| json!({ "account": format!("addr-{i}"), "commitment": "finalized", "slot": i }))
        .collect()
}

/// Key derivation cost grows with parameter size
fn bench_cache_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_key");

    for width in [0usize, 4, 32] {
        let params = sample_params(width);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(width), &params, |b, params| {
            b.iter(|| black_box(cache_key("getMultipleAccounts", params)));
        });
    }

    group.finish();
}

/// Lookup and insert against a warm cache of each capacity
fn bench_cache_ops(c: &mut Criterion) {
    let mut group = c.benchmark_group("response_cache");

    for capacity in [100usize, 1_000, 10_000] {
        let cache = ResponseCache::new(CacheConfig {
            capacity,
            default_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        });
        let keys: Vec<String> = (0..capacity)
            .map(|i| cache_key("getBalance", &[json!(format!("addr-{i}"))]))
            .collect();
        for key in &keys {
            cache.set(key.clone(), json!({ "value": 1 }), None);
        }

        group.bench_with_input(BenchmarkId::new("get_hit", capacity), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(cache.get(&keys[i]))
            });
        });

        group.bench_with_input(BenchmarkId::new("get_miss", capacity), &capacity, |b, _| {
            b.iter(|| black_box(cache.get("absent")));
        });

        // Every insert past capacity evicts the oldest entry
        group.bench_with_input(BenchmarkId::new("set_evicting", capacity), &capacity, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                cache.set(format!("fresh-{i}"), json!(i), None);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cache_key, bench_cache_ops);
criterion_main!(benches);
