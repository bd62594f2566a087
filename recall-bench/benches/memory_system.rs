//! recall benchmark suite
//!
//!   rrf_fuse_2x100 ................... reciprocal rank fusion of two streams
//!   graph_traverse_depth3_500 ........ BFS over a 500-node ring graph
//!   hybrid_search_top10_1000 ......... lexical + vector search and fusion
//!   decay_preview_1000 ............... dry-run decay over every entity

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use recall_bench::{node_id, ranked_streams, seeded_engine};
use recall_core::retrieval::fusion::{DEFAULT_RRF_K, reciprocal_rank_fusion};
use recall_core::{CallContext, SearchQuery};

fn runtime() -> Runtime {
    Runtime::new().expect("tokio runtime")
}

/// Fusion alone, no I/O.
fn bench_fusion(c: &mut Criterion) {
    let (lexical, vector) = ranked_streams(100);
    c.bench_function("rrf_fuse_2x100", |b| {
        b.iter(|| {
            let fused = reciprocal_rank_fusion(
                vec![lexical.clone(), vector.clone()],
                DEFAULT_RRF_K,
                black_box(10),
                |s: &String| s.as_str(),
            );
            black_box(fused);
        });
    });
}

fn bench_traverse(c: &mut Criterion) {
    let rt = runtime();
    let engine = rt.block_on(seeded_engine(500, 3)).expect("seed");
    let ctx = CallContext::background();
    let start = node_id(0);
    c.bench_function("graph_traverse_depth3_500", |b| {
        b.to_async(&rt).iter(|| async {
            let t = engine
                .traverse(&ctx, black_box(&start), Some(3), &[])
                .await
                .expect("traverse");
            black_box(t);
        });
    });
}

fn bench_hybrid_search(c: &mut Criterion) {
    let rt = runtime();
    let engine = rt.block_on(seeded_engine(1000, 1)).expect("seed");
    let ctx = CallContext::background();
    let query = SearchQuery::new("scheduler retries", 10);
    c.bench_function("hybrid_search_top10_1000", |b| {
        b.to_async(&rt).iter(|| async {
            let hits = engine
                .search_entities(&ctx, black_box(&query))
                .await
                .expect("search");
            black_box(hits);
        });
    });
}

fn bench_decay_preview(c: &mut Criterion) {
    let rt = runtime();
    let engine = rt.block_on(seeded_engine(1000, 0)).expect("seed");
    let ctx = CallContext::background();
    c.bench_function("decay_preview_1000", |b| {
        b.to_async(&rt).iter(|| async {
            let report = engine
                .decay(&ctx, Some(0), None, true)
                .await
                .expect("decay");
            black_box(report);
        });
    });
}

criterion_group!(
    benches,
    bench_fusion,
    bench_traverse,
    bench_hybrid_search,
    bench_decay_preview,
);
criterion_main!(benches);
