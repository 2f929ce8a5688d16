//! Benchmarks for the digest and the injector
//!
//! Run with: cargo bench

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use canopy_core::inject::{InjectorBuilder, Registrar};
use canopy_core::scope::{ManualScheduler, Scope};

fn root() -> Scope {
    Scope::builder()
        .scheduler(Arc::new(ManualScheduler::new()))
        .build()
}

// =============================================================================
// DIGEST BENCHMARKS
// =============================================================================

fn bench_clean_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("clean_digest");
    for watches in [10usize, 100, 1000] {
        let root = root();
        root.set("n", 0);
        for _ in 0..watches {
            root.watch(|scope| scope.get("n"), |_, _, _| {});
        }
        group.bench_with_input(BenchmarkId::from_parameter(watches), &root, |b, root| {
            b.iter(|| root.digest().unwrap())
        });
    }
    group.finish();
}

fn bench_dirty_apply(c: &mut Criterion) {
    let root = root();
    root.set("n", 0);
    for _ in 0..100 {
        root.watch(|scope| scope.get("n"), |_, _, _| {});
    }
    let mut n = 0i64;
    c.bench_function("dirty_apply_100_watches", |b| {
        b.iter(|| {
            n += 1;
            root.apply(|scope| scope.set("n", black_box(n))).unwrap()
        })
    });
}

fn bench_deep_tree(c: &mut Criterion) {
    let root = root();
    let mut leaf = root.clone();
    for _ in 0..50 {
        leaf = leaf.new_child(false);
        leaf.watch(|scope| scope.get("n"), |_, _, _| {});
    }
    let mut n = 0i64;
    c.bench_function("deep_tree_50_levels", |b| {
        b.iter(|| {
            n += 1;
            root.apply(|scope| scope.set("n", black_box(n))).unwrap()
        })
    });
}

fn bench_deep_watch(c: &mut Criterion) {
    let root = root();
    root.set("doc", json!({"items": (0..100).collect::<Vec<_>>(), "title": "bench"}));
    root.watch_deep(|scope| scope.get("doc"), |_, _, _| {});
    c.bench_function("deep_watch_equal_replacement", |b| {
        b.iter(|| {
            root.apply(|scope| {
                scope.set("doc", json!({"items": (0..100).collect::<Vec<_>>(), "title": "bench"}))
            })
            .unwrap()
        })
    });
}

// =============================================================================
// INJECTOR BENCHMARKS
// =============================================================================

fn bench_resolve_cached(c: &mut Criterion) {
    let mut builder = InjectorBuilder::new();
    builder
        .value("x", 5_i64)
        .factory("y", &["x"], |deps| Ok(deps.cloned::<i64>("x")? * 2));
    let injector = builder.build();
    let _ = injector.resolve("y");

    c.bench_function("resolve_cached", |b| {
        b.iter(|| black_box(injector.get::<i64>("y").unwrap()))
    });
}

fn bench_resolve_chain(c: &mut Criterion) {
    c.bench_function("resolve_chain_20", |b| {
        b.iter(|| {
            let mut builder = InjectorBuilder::new();
            builder.value("s0", 0_i64);
            for i in 1..20 {
                let prev = format!("s{}", i - 1);
                let key = prev.clone();
                builder.factory(&format!("s{i}"), &[prev.as_str()], move |deps| {
                    Ok(deps.cloned::<i64>(&key)? + 1)
                });
            }
            let injector = builder.build();
            black_box(injector.get::<i64>("s19").unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_clean_digest,
    bench_dirty_apply,
    bench_deep_tree,
    bench_deep_watch,
    bench_resolve_cached,
    bench_resolve_chain,
);
criterion_main!(benches);
