use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowrun_core::{Clock, ExecutionId, ManualClock};
use flowrun_infra::jobs::{
    AcquisitionFilter, FailureRecorder, FailureReport, InMemoryJobStore, Job, JobExecutor,
    JobExecutorConfig, JobStore, LocalTransactionManager, LockOutcome, LockScope, RetryCycle,
};

const LEASE: Duration = Duration::from_secs(300);

fn seeded_store(clock: &ManualClock, jobs: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    for i in 0..jobs {
        store
            .insert(
                Job::async_continuation(ExecutionId::new(), clock.now()).with_priority((i % 5) as i64),
            )
            .unwrap();
    }
    store
}

fn bench_acquire_and_lock(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_and_lock");

    for backlog in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(16));
        group.bench_with_input(BenchmarkId::new("batch_of_16", backlog), backlog, |b, &n| {
            let clock = ManualClock::new(Utc::now());
            let store = seeded_store(&clock, n);
            let filter = AcquisitionFilter::all();

            b.iter(|| {
                let now = clock.now();
                let candidates = store.acquirable(now, 16, &filter).unwrap();
                for job in &candidates {
                    if let LockOutcome::Locked(job) =
                        store.lock(job.id, "bench", LEASE, now, LockScope::Acquisition).unwrap()
                    {
                        store.release(job.id, "bench").unwrap();
                    }
                }
                black_box(candidates.len());
            });
        });
    }

    group.finish();
}

fn bench_failure_recording(c: &mut Criterion) {
    let clock = ManualClock::arc(Utc::now());
    let store = InMemoryJobStore::arc();
    let recorder = FailureRecorder::new(store.clone(), clock.clone());
    let err = anyhow::anyhow!("connection reset").context("service task failed");
    let report = FailureReport::from_error(&err);

    c.bench_function("record_failure", |b| {
        b.iter(|| {
            let id = store
                .insert(Job::async_continuation(ExecutionId::new(), clock.now()))
                .unwrap();
            let LockOutcome::Locked(job) = store
                .lock(id, "bench", LEASE, clock.now(), LockScope::Acquisition)
                .unwrap()
            else {
                panic!("fresh job should lock");
            };
            black_box(recorder.record(&job, "bench", &report).unwrap());
        });
    });
}

fn bench_executor_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("executor_cycle");

    for concurrency in [1, 4, 8].iter() {
        group.throughput(Throughput::Elements(*concurrency as u64));
        group.bench_with_input(
            BenchmarkId::new("succeeding_jobs", concurrency),
            concurrency,
            |b, &max| {
                let clock = ManualClock::arc(Utc::now());
                let store = InMemoryJobStore::arc();
                let mut executor = JobExecutor::new(
                    store.clone(),
                    LocalTransactionManager,
                    JobExecutorConfig::default().with_max_concurrent(max),
                )
                .unwrap()
                .with_clock(clock.clone());
                executor.register_handler("async-continuation", |_, _| Ok(()));
                let mut worker = executor.into_worker();

                b.iter(|| {
                    for _ in 0..max {
                        store
                            .insert(Job::async_continuation(ExecutionId::new(), clock.now()))
                            .unwrap();
                    }
                    black_box(worker.run_cycle());
                });
            },
        );
    }

    group.finish();
}

fn bench_retry_cycle_parsing(c: &mut Criterion) {
    c.bench_function("parse_retry_cycle", |b| {
        b.iter(|| {
            black_box("R5/PT10M".parse::<RetryCycle>().unwrap());
            black_box("PT1M,PT5M,PT1H30M".parse::<RetryCycle>().unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_acquire_and_lock,
    bench_failure_recording,
    bench_executor_cycle,
    bench_retry_cycle_parsing
);
criterion_main!(benches);
