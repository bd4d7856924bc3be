//! Performance benchmarks for the step sequencer
//!
//! Run with: cargo bench
//!
//! These benchmarks measure:
//! - Suite decoding and validation
//! - Repeat-group flattening into step programs
//! - Cursor traversal with marker lookahead
//! - Dispatch throughput against the sim platform

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use encoder_reliability::codec::EncoderFactory;
use encoder_reliability::scenario::{ScenarioSuite, BUILTIN_SUITE};
use encoder_reliability::sequencer::{Dispatcher, ScenarioContext, ScenarioOptions, Timing};
use encoder_reliability::sim::SimPlatform;
use encoder_reliability::step::{Step, StepProgram};
use std::sync::Arc;

/// Benchmark: Parse and validate the built-in suite
fn bench_suite_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("suite");
    group.throughput(Throughput::Bytes(BUILTIN_SUITE.len() as u64));
    group.bench_function("parse_builtin", |b| {
        b.iter(|| ScenarioSuite::from_json(black_box(BUILTIN_SUITE)).unwrap())
    });

    let suite = ScenarioSuite::builtin().unwrap();
    group.bench_function("flatten_all", |b| {
        b.iter(|| {
            suite
                .scenarios
                .iter()
                .map(|s| black_box(s.program()).len())
                .sum::<usize>()
        })
    });
    group.finish();
}

/// Benchmark: Walk programs the way the dispatcher does
fn bench_cursor(c: &mut Criterion) {
    let mut group = c.benchmark_group("cursor");

    for size in [10, 100, 1000].iter() {
        let program: StepProgram = (0..*size)
            .flat_map(|i| {
                if i % 2 == 0 {
                    vec![Step::START, Step::ERROR]
                } else {
                    vec![Step::STOP]
                }
            })
            .collect();
        group.throughput(Throughput::Elements(program.len() as u64));
        group.bench_with_input(BenchmarkId::new("walk", size), &program, |b, program| {
            b.iter(|| {
                let mut cursor = program.cursor();
                let mut marked = 0usize;
                while cursor.advance().is_some() {
                    if cursor.advance_if(Step::ERROR) {
                        marked += 1;
                    }
                }
                black_box(marked)
            })
        });
    }

    group.finish();
}

/// Benchmark: Dispatch a configure/reset loop against the sim
fn bench_dispatch(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let suite = ScenarioSuite::builtin().unwrap();
    let program = suite.find("loop-configure-reset").unwrap().program();

    let mut group = c.benchmark_group("dispatch");
    group.sample_size(50);
    group.throughput(Throughput::Elements(program.len() as u64));
    group.bench_function("configure_reset_loop", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let platform = Arc::new(SimPlatform::default());
                let encoder = platform.create_by_name("avenc_mpeg4").await.unwrap();
                let (ctx, _rx) = ScenarioContext::new("bench", ScenarioOptions::default(), encoder);
                let mut dispatcher = Dispatcher::new(ctx, platform, Timing::default());
                black_box(dispatcher.run(&program).await.unwrap())
            })
        })
    });
    group.finish();
}

criterion_group!(benches, bench_suite_parsing, bench_cursor, bench_dispatch);

criterion_main!(benches);
