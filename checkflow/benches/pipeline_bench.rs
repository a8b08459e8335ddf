//! Benchmarks for pipeline execution.

use checkflow::prelude::*;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

fn engine(driver: DriverKind) -> Engine<()> {
    Engine::builder(())
        .with_checkpointer(Arc::new(MemoryCheckpointer::new()))
        .with_config(
            EngineConfig::new()
                .with_retry(RetryPolicy::immediate(3))
                .with_driver(driver),
        )
        .build()
        .expect("valid config")
}

fn pipeline_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");

    for driver in [DriverKind::Sequential, DriverKind::Graph] {
        let engine = &engine(driver);
        c.bench_function(&format!("happy_path_{driver}"), |b| {
            b.to_async(&rt).iter(|| async move {
                let state = engine
                    .start(RunId::generate(), StartOptions::new())
                    .await
                    .expect("run succeeds");
                black_box(state.context.history.len())
            });
        });
    }

    let engine = &engine(DriverKind::Sequential);
    c.bench_function("backtrack_with_retries", |b| {
        b.to_async(&rt).iter(|| async move {
            let options = StartOptions::new()
                .with_force_qa_fail(true)
                .with_injected_failures(StepName::Design, 2);
            let state = engine
                .start(RunId::generate(), options)
                .await
                .expect("run succeeds");
            black_box(state.context.qa_attempts)
        });
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
