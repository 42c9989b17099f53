use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::thread;

use forgeexec_commands::{CommandOutcome, CommandRegistry, Invocation};
use forgeexec_core::CommandContext;
use forgeexec_infra::{Engine, ExecutorConfig, InMemoryRequestStore, WorkerStep};

fn engine() -> Engine<InMemoryRequestStore> {
    let registry = CommandRegistry::new()
        .with("noop", |_: &Invocation<'_>| CommandOutcome::success());
    Engine::new(InMemoryRequestStore::arc(), registry, ExecutorConfig::default())
        .expect("valid config")
}

fn seeded(requests: usize) -> Engine<InMemoryRequestStore> {
    let engine = engine();
    for i in 0..requests {
        engine
            .schedule("noop", CommandContext::new().with("i", i as i64))
            .expect("schedule");
    }
    engine
}

fn drain(engine: &Engine<InMemoryRequestStore>, workers: usize) {
    if workers == 1 {
        let worker = engine.worker("bench-0");
        while worker.run_once().expect("cycle") != WorkerStep::Idle {}
        return;
    }

    let handles: Vec<_> = (0..workers)
        .map(|i| {
            let worker = engine.worker(format!("bench-{i}"));
            thread::spawn(move || while worker.run_once().expect("cycle") != WorkerStep::Idle {})
        })
        .collect();
    for h in handles {
        h.join().expect("worker thread");
    }
}

fn bench_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("schedule");
    group.throughput(Throughput::Elements(1));

    let engine = engine();
    group.bench_function("in_memory", |b| {
        b.iter(|| black_box(engine.schedule("noop", CommandContext::new()).expect("schedule")))
    });

    group.finish();
}

fn bench_claim_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_execute");

    for requests in [10usize, 100, 500].iter() {
        group.throughput(Throughput::Elements(*requests as u64));
        for workers in [1usize, 4].iter() {
            group.bench_with_input(
                BenchmarkId::new(format!("workers_{workers}"), requests),
                requests,
                |b, &requests| {
                    b.iter_batched(
                        || seeded(requests),
                        |engine| {
                            drain(&engine, *workers);
                            black_box(Arc::strong_count(engine.store()))
                        },
                        BatchSize::SmallInput,
                    )
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_schedule, bench_claim_execute);
criterion_main!(benches);
