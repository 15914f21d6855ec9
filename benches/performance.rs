use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures_util::future::join_all;
use llm_relay::fingerprint::{jaccard_similarity, Fingerprint, GenerationParams};
use llm_relay::{CacheConfig, DedupConfig, MemoryStore, RequestDeduplicator, ResponseCache, StoreBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn memory_cache(capacity: usize) -> ResponseCache {
    let config = CacheConfig {
        backend: StoreBackend::Memory,
        memory_capacity: capacity,
        ..CacheConfig::default()
    };
    ResponseCache::with_store(config, Arc::new(MemoryStore::new(capacity)))
}

fn benchmark_fingerprint(c: &mut Criterion) {
    let params = GenerationParams::new(1000, 0.7);

    let mut group = c.benchmark_group("fingerprint");
    for words in [8, 64, 512].iter() {
        let prompt = "Explain the borrow checker in plain words ".repeat(words / 8);
        group.bench_with_input(BenchmarkId::new("keys", words), &prompt, |b, prompt| {
            b.iter(|| black_box(Fingerprint::new(prompt, "gpt-4", &params)));
        });
    }
    group.finish();
}

fn benchmark_jaccard(c: &mut Criterion) {
    let left = "what is the capital of france and why was it chosen";
    let right = "why was paris chosen as the capital city of france";

    c.bench_function("jaccard_similarity", |b| {
        b.iter(|| black_box(jaccard_similarity(black_box(left), black_box(right))));
    });
}

fn benchmark_cache_operations(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("cache_operations");
    for size in [100, 1000, 10000].iter() {
        let cache = memory_cache(*size);
        group.bench_with_input(BenchmarkId::new("set_get", size), size, |b, _| {
            b.to_async(&rt).iter(|| async {
                for i in 0..100 {
                    let prompt = format!("test_prompt_{}", i);
                    cache.set(&prompt, "cached response", "test_model", None).await;
                    black_box(cache.get(&prompt, "test_model").await);
                }
            });
        });
    }
    group.finish();

    // Similarity lookups scan every stored record
    let mut group = c.benchmark_group("similarity_scan");
    for records in [10, 100, 1000].iter() {
        let cache = memory_cache(records * 2 + 10);
        rt.block_on(async {
            for i in 0..*records {
                let prompt = format!("question number {} about rust ownership rules", i);
                cache.set(&prompt, "answer", "test_model", None).await;
            }
        });
        group.bench_with_input(BenchmarkId::new("get_similar", records), records, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    cache
                        .get_similar("question about rust ownership rules", "test_model", 5)
                        .await,
                )
            });
        });
    }
    group.finish();
}

fn benchmark_coalescing(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let params = GenerationParams::default();

    let mut group = c.benchmark_group("coalescing");
    for callers in [1, 10, 100].iter() {
        group.bench_with_input(BenchmarkId::new("identical_callers", callers), callers, |b, &callers| {
            b.to_async(&rt).iter(|| async {
                let dedup: RequestDeduplicator<String, String> = RequestDeduplicator::new(DedupConfig {
                    max_pending: 1000,
                    janitor_interval: Duration::from_secs(3600),
                    ..DedupConfig::default()
                });

                let calls = (0..callers).map(|_| {
                    dedup.execute_or_join("shared prompt", "test_model", &params, || async {
                        tokio::task::yield_now().await;
                        Ok::<_, String>("response".to_string())
                    })
                });
                let results = join_all(calls).await;
                dedup.shutdown().await;
                black_box(results)
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_fingerprint,
    benchmark_jaccard,
    benchmark_cache_operations,
    benchmark_coalescing
);
criterion_main!(benches);
