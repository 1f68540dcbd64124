//! Request-path benchmarks — overhead contracts for the per-request stages.
//!
//! Reference budgets:
//! - Route filter membership test:   < 1μs  (pure function)
//! - Cache lookup (hit):             < 5μs
//! - Latency forecast, 500 samples:  < 50μs
//! - Full `wrap` on a warm cache:    < 100μs

use std::time::Instant;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;
use tokio_request_optimizer::bloom::RouteFilter;
use tokio_request_optimizer::cache::AdaptiveCache;
use tokio_request_optimizer::predictor::{LatencyPredictor, PredictionContext};
use tokio_request_optimizer::{
    EngineConfig, EngineResponse, HttpMethod, MetricSample, OptimizationEngine, RequestContext,
};

fn bench_route_filter_test(c: &mut Criterion) {
    let mut filter = RouteFilter::with_defaults();
    for i in 0..200 {
        filter.add(&format!("/api/resource/{i}"));
    }

    c.bench_function("route_filter_test", |b| {
        b.iter(|| black_box(filter.test(black_box("/api/resource/42"))))
    });
}

fn bench_cache_hit(c: &mut Criterion) {
    let cache = AdaptiveCache::new();
    cache.store(
        "GET:/api/items",
        EngineResponse::ok(vec![b'x'; 4096]),
        100.0,
    );

    c.bench_function("cache_hit", |b| {
        b.iter(|| black_box(cache.get(black_box("GET:/api/items"))))
    });
}

fn bench_predict_500_samples(c: &mut Criterion) {
    let predictor = LatencyPredictor::new();
    let history: Vec<MetricSample> = (0..500)
        .map(|i| MetricSample {
            recorded_at: Instant::now(),
            method: HttpMethod::Get,
            path: "/api/items".to_string(),
            duration_ms: 20.0 + (i % 10) as f64,
            status: 200,
            memory_delta_bytes: 1024,
            cpu_micros: 20_000,
            response_size_bytes: 4096,
            query_count: 1,
            cache_hit: false,
        })
        .collect();
    let ctx = PredictionContext {
        cache_hit_rate: 0.5,
        hour_of_day: 3,
        prefetching_enabled: false,
    };

    c.bench_function("predict_500_samples", |b| {
        b.iter(|| black_box(predictor.predict(black_box("GET /api/items"), &history, ctx)))
    });
}

fn bench_wrap_warm_cache(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let engine = OptimizationEngine::new(EngineConfig::default()).expect("valid config");

    // Prime the cache so the benchmark measures the hit path.
    rt.block_on(async {
        let _ = engine
            .wrap(RequestContext::new(HttpMethod::Get, "/api/items"), || async {
                Ok::<_, std::convert::Infallible>(EngineResponse::ok(vec![b'x'; 4096]))
            })
            .await;
    });

    c.bench_function("wrap_warm_cache", |b| {
        b.to_async(&rt).iter(|| async {
            let result = engine
                .wrap(RequestContext::new(HttpMethod::Get, "/api/items"), || async {
                    Ok::<_, std::convert::Infallible>(EngineResponse::ok(vec![b'x'; 4096]))
                })
                .await;
            black_box(result)
        })
    });
}

criterion_group!(
    benches,
    bench_route_filter_test,
    bench_cache_hit,
    bench_predict_500_samples,
    bench_wrap_warm_cache
);
criterion_main!(benches);
