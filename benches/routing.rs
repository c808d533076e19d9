//! Routing hot-path benchmark.
//!
//! Measures qualified tool id parsing, chain path extraction and an
//! aggregate listing across several in-process backends using Criterion.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use toolexec_core::backend::{builtin_backend, BackendRegistry};
use toolexec_core::chain::PathExpr;
use toolexec_core::tools::parse_tool_id;
use toolexec_core::types::AggregatorConfig;
use toolexec_core::{ExecContext, ToolAggregator};

fn bench_parse_tool_id(c: &mut Criterion) {
    let ids = ["local/echo", "a-very-long-backend-name/some_tool.v2", "noslash"];

    let mut group = c.benchmark_group("parse_tool_id");
    for id in ids {
        group.bench_with_input(BenchmarkId::from_parameter(id), id, |b, id| {
            b.iter(|| parse_tool_id(black_box(id)).is_ok());
        });
    }
    group.finish();
}

fn bench_path_extract(c: &mut Criterion) {
    let doc: Value = json!({
        "result": {
            "items": (0..64).map(|i| json!({"id": i, "name": format!("item-{}", i)})).collect::<Vec<_>>(),
            "meta": {"total": 64}
        }
    });
    let exprs = ["$", "$.result.meta.total", "$.result.items[63].name", "result.items.10.id"];

    let mut group = c.benchmark_group("path_extract");
    for raw in exprs {
        let expr = PathExpr::parse(raw).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(raw), &expr, |b, expr| {
            b.iter(|| expr.extract(black_box(&doc)).is_ok());
        });
    }
    group.finish();
}

fn bench_list_all_tools(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let backend_counts: &[usize] = &[1, 4, 16];

    let mut group = c.benchmark_group("list_all_tools");
    for &count in backend_counts {
        let registry = Arc::new(BackendRegistry::new());
        for i in 0..count {
            registry
                .register(Arc::new(builtin_backend(&format!("b{:02}", i)).unwrap()))
                .unwrap();
        }
        let aggregator = ToolAggregator::new(registry, AggregatorConfig::default());
        let ctx = ExecContext::new();

        group.bench_with_input(BenchmarkId::from_parameter(count), &aggregator, |b, agg| {
            b.iter(|| rt.block_on(async { agg.list_all_tools(&ctx).await.tools.len() }));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse_tool_id, bench_path_extract, bench_list_all_tools);
criterion_main!(benches);
