//! End-to-end executor scenarios against the in-memory store.
//!
//! Covers: acquisition -> dispatch -> commit/rollback -> failure bookkeeping,
//! driven cycle by cycle with a manual clock, plus the threaded lifecycle.

use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;

use flowrun_core::{Clock, ExecutionId, ManualClock, ProcessInstanceId};

use super::config::{BackoffPolicy, JobExecutorConfig};
use super::dispatcher::{ExecutionOutcome, FailurePhase};
use super::executor::{ExecutorWorker, JobExecutor};
use super::failure::COMMIT_FAILURE_MESSAGE;
use super::retry::RetryCycle;
use super::store::{InMemoryJobStore, JobQuery, JobStore, LockOutcome, LockScope};
use super::tx::{LocalTransactionManager, TransactionHandle};
use super::types::{Job, JobId};
use super::workflow::ExecutionContext;

type Executor = JobExecutor<InMemoryJobStore, LocalTransactionManager>;

struct Harness {
    store: Arc<InMemoryJobStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        flowrun_observability::init_for_tests();
        Self {
            store: InMemoryJobStore::arc(),
            clock: ManualClock::arc(Utc::now()),
        }
    }

    fn config(&self, name: &str) -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_name(name)
            .with_max_concurrent(4)
            .with_lock_duration(Duration::from_secs(300))
            .with_backoff(BackoffPolicy {
                base: Duration::from_millis(5),
                max: Duration::from_millis(50),
                factor: 2.0,
            })
    }

    fn executor(&self, name: &str) -> Executor {
        JobExecutor::new(self.store.clone(), LocalTransactionManager, self.config(name))
            .expect("valid executor config")
            .with_clock(self.clock.clone())
    }

    fn insert(&self, job: Job) -> JobId {
        self.store.insert(job).unwrap()
    }

    fn job(&self, id: JobId) -> Job {
        self.store.get(id).unwrap().expect("job should still exist")
    }

    fn detail(&self, id: JobId) -> String {
        self.store.exception_detail(id).unwrap().unwrap_or_default()
    }
}

fn always_fails(_: &ExecutionContext, _: &mut dyn TransactionHandle) -> anyhow::Result<()> {
    Err(anyhow::anyhow!("boom"))
}

/// Run cycles until one acquires nothing.
fn drain(worker: &mut ExecutorWorker<InMemoryJobStore, LocalTransactionManager>) -> usize {
    let mut executed = 0;
    loop {
        let report = worker.run_cycle();
        if report.acquired == 0 {
            return executed;
        }
        executed += report.acquired;
    }
}

#[test]
fn failing_continuation_exhausts_default_retries() {
    let h = Harness::new();
    let mut executor = h.executor("node-a");
    executor.register_handler("async-continuation", always_fails);
    let id = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()));
    let mut worker = executor.into_worker();

    let mut retries_seen = Vec::new();
    for _ in 0..3 {
        let report = worker.run_cycle();
        assert_eq!(report.acquired, 1);
        retries_seen.push(h.job(id).retries);
    }

    assert_eq!(retries_seen, vec![2, 1, 0]);
    let job = h.job(id);
    assert_eq!(job.exception_message.as_deref(), Some("boom"));
    assert!(job.is_incident());
    assert_eq!(job.failed_attempts, 3);
    assert_eq!(h.detail(id), "boom");

    // Incidents are never acquired again.
    assert_eq!(worker.run_cycle().acquired, 0);
    let stats = worker.stats();
    assert_eq!(stats.jobs_failed, 3);
    assert_eq!(stats.incidents, 1);
}

#[test]
fn rollback_only_with_single_retry_becomes_incident() {
    let h = Harness::new();
    let mut executor = h.executor("node-a");
    executor.register_handler("async-continuation", |_, tx| {
        tx.set_rollback_only("setRollbackOnly");
        Ok(())
    });
    let id = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()).with_retries(1));
    let mut worker = executor.into_worker();

    let report = worker.run_cycle();
    assert_eq!(
        report.outcomes,
        vec![ExecutionOutcome::Failed {
            phase: FailurePhase::Commit,
            retries: 0,
            incident: true
        }]
    );

    let job = h.job(id);
    assert_eq!(job.retries, 0);
    assert_eq!(job.exception_message.as_deref(), Some(COMMIT_FAILURE_MESSAGE));
    assert!(job.lock.is_none());

    h.clock.advance(chrono::Duration::days(1));
    assert_eq!(drain(&mut worker), 0);
}

#[test]
fn custom_retry_cycle_spaces_retries_and_stops_after_sequence() {
    let h = Harness::new();
    let mut executor = h.executor("node-a");
    executor.register_handler("async-continuation", always_fails);
    let cycle: RetryCycle = "R2/PT5M".parse().unwrap();
    let id = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()).with_retry_cycle(cycle));
    assert_eq!(h.job(id).retries, 3);
    let mut worker = executor.into_worker();

    // First failure: retry in five minutes.
    let failed_at = h.clock.now();
    worker.run_cycle();
    let job = h.job(id);
    assert_eq!(job.retries, 2);
    assert_eq!(job.due_date, failed_at + chrono::Duration::minutes(5));
    assert_eq!(worker.run_cycle().acquired, 0);

    // Second failure.
    h.clock.advance(chrono::Duration::minutes(5));
    let failed_at = h.clock.now();
    assert_eq!(worker.run_cycle().acquired, 1);
    let job = h.job(id);
    assert_eq!(job.retries, 1);
    assert_eq!(job.due_date, failed_at + chrono::Duration::minutes(5));

    // Third failure is terminal and leaves the due date alone.
    h.clock.advance(chrono::Duration::minutes(5));
    let due_before = h.job(id).due_date;
    assert_eq!(worker.run_cycle().acquired, 1);
    let job = h.job(id);
    assert_eq!(job.retries, 0);
    assert!(job.is_incident());
    assert_eq!(job.due_date, due_before);

    h.clock.advance(chrono::Duration::hours(1));
    assert_eq!(drain(&mut worker), 0);
}

#[test]
fn failing_transaction_listener_is_recorded_with_cause_chain() {
    let h = Harness::new();
    let effects = Arc::new(Mutex::new(0_u32));
    let mut executor = h.executor("node-a");
    let staged = effects.clone();
    executor.register_handler("async-continuation", move |_, tx| {
        let staged = staged.clone();
        tx.on_commit(Box::new(move || *staged.lock().unwrap() += 1));
        tx.before_commit(
            "history-listener",
            Box::new(|| -> anyhow::Result<()> {
                anyhow::bail!("exception in transaction listener")
            }),
        );
        Ok(())
    });
    let id = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()).with_retries(5));
    let mut worker = executor.into_worker();

    worker.run_cycle();

    let job = h.job(id);
    assert_eq!(job.retries, 4);
    assert_eq!(job.exception_message.as_deref(), Some(COMMIT_FAILURE_MESSAGE));
    let detail = h.detail(id);
    assert!(detail.starts_with("Unable to commit transaction\nCaused by: "));
    assert!(detail.contains("Caused by: exception in transaction listener"));
    assert_eq!(*effects.lock().unwrap(), 0);
}

#[test]
fn successful_job_is_deleted_and_never_reacquired() {
    let h = Harness::new();
    let executed = Arc::new(Mutex::new(Vec::new()));
    let mut executor = h.executor("node-a");
    let log = executed.clone();
    executor.register_handler("async-continuation", move |ctx, tx| {
        let log = log.clone();
        let execution_id = ctx.execution_id;
        tx.on_commit(Box::new(move || log.lock().unwrap().push(execution_id)));
        Ok(())
    });
    let execution_id = ExecutionId::new();
    let id = h.insert(Job::async_continuation(execution_id, h.clock.now()));
    let mut worker = executor.into_worker();

    assert_eq!(drain(&mut worker), 1);
    assert!(h.store.get(id).unwrap().is_none());
    assert_eq!(*executed.lock().unwrap(), vec![execution_id]);

    h.clock.advance(chrono::Duration::hours(1));
    assert_eq!(drain(&mut worker), 0);
}

#[test]
fn timers_wait_for_due_date() {
    let h = Harness::new();
    let mut executor = h.executor("node-a");
    executor.register_handler("timer-transition", |_, _| Ok(()));
    let now = h.clock.now();
    let id = h.insert(Job::timer(ExecutionId::new(), now + chrono::Duration::minutes(10), now));
    let mut worker = executor.into_worker();

    assert_eq!(drain(&mut worker), 0);
    h.clock.advance(chrono::Duration::minutes(10));
    assert_eq!(drain(&mut worker), 1);
    assert!(h.store.get(id).unwrap().is_none());
}

#[test]
fn expired_lease_of_crashed_executor_is_taken_over() {
    let h = Harness::new();
    let id = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()));

    // An executor that locked the job and died.
    let locked = h
        .store
        .lock(id, "crashed-node", Duration::from_secs(300), h.clock.now(), LockScope::Acquisition)
        .unwrap();
    assert!(matches!(locked, LockOutcome::Locked(_)));

    let mut executor = h.executor("survivor");
    executor.register_handler("*", |_, _| Ok(()));
    let mut worker = executor.into_worker();

    assert_eq!(drain(&mut worker), 0);
    h.clock.advance(chrono::Duration::seconds(301));
    assert_eq!(drain(&mut worker), 1);
    assert!(h.store.get(id).unwrap().is_none());
}

#[test]
fn operator_resolves_incident_by_setting_retries() {
    let h = Harness::new();
    let healthy = Arc::new(Mutex::new(false));
    let mut executor = h.executor("node-a");
    let flag = healthy.clone();
    executor.register_handler("async-continuation", move |_, _| {
        if *flag.lock().unwrap() {
            Ok(())
        } else {
            anyhow::bail!("downstream unavailable")
        }
    });
    let instance = ProcessInstanceId::new();
    let id = h.insert(
        Job::async_continuation(ExecutionId::new(), h.clock.now())
            .in_process_instance(instance)
            .with_retries(1),
    );
    let mut worker = executor.into_worker();

    worker.run_cycle();
    let incidents = h.store.query(&JobQuery::incidents()).unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].id, id);
    assert_eq!(
        h.store
            .query(&JobQuery::new().process_instance(instance).with_exception())
            .unwrap()
            .len(),
        1
    );

    *healthy.lock().unwrap() = true;
    h.store.set_retries(id, 1).unwrap();
    assert_eq!(drain(&mut worker), 1);
    assert!(h.store.get(id).unwrap().is_none());
    assert!(h.store.query(&JobQuery::incidents()).unwrap().is_empty());
}

#[test]
fn suspended_jobs_wait_for_activation() {
    let h = Harness::new();
    let mut executor = h.executor("node-a");
    executor.register_handler("*", |_, _| Ok(()));
    let id = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()).suspended());
    let mut worker = executor.into_worker();

    assert_eq!(drain(&mut worker), 0);
    h.store.set_suspended(id, false).unwrap();
    assert_eq!(drain(&mut worker), 1);
}

#[test]
fn execute_now_runs_a_future_timer_immediately() {
    let h = Harness::new();
    let mut executor = h.executor("node-a");
    executor.register_handler("timer-transition", |_, _| Ok(()));
    let now = h.clock.now();
    let id = h.insert(Job::timer(ExecutionId::new(), now + chrono::Duration::days(7), now));

    let handle = executor.spawn().unwrap();
    assert_eq!(handle.execute_now(id).unwrap(), ExecutionOutcome::Completed);
    assert!(h.store.get(id).unwrap().is_none());
    assert_eq!(handle.stats().jobs_succeeded, 1);
    handle.shutdown();
}

#[test]
fn executors_sharing_a_store_execute_every_job_exactly_once() {
    let h = Harness::new();
    let executed = Arc::new(Mutex::new(Vec::new()));

    let spawn = |name: &str| {
        let mut executor = h.executor(name);
        let log = executed.clone();
        executor.register_handler("async-continuation", move |ctx, tx| {
            let log = log.clone();
            let job_id = ctx.job_id;
            tx.on_commit(Box::new(move || log.lock().unwrap().push(job_id)));
            Ok(())
        });
        executor.spawn().unwrap()
    };

    let ids: HashSet<JobId> = (0..40)
        .map(|_| h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now())))
        .collect();
    let a = spawn("node-a");
    let b = spawn("node-b");

    let deadline = Instant::now() + Duration::from_secs(10);
    while h.store.stats(h.clock.now()).unwrap().total > 0 && Instant::now() < deadline {
        a.trigger();
        b.trigger();
        thread::sleep(Duration::from_millis(5));
    }
    a.shutdown();
    b.shutdown();

    let executed = executed.lock().unwrap();
    assert_eq!(executed.len(), ids.len(), "every job runs exactly once");
    assert_eq!(executed.iter().copied().collect::<HashSet<_>>(), ids);
}

#[test]
fn shutdown_waits_for_in_flight_jobs() {
    let h = Harness::new();
    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let mut executor = h.executor("node-a");
    let (s, r) = (started.clone(), release.clone());
    executor.register_handler("async-continuation", move |_, _| {
        s.wait();
        r.wait();
        Ok(())
    });
    let id = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()));

    let handle = executor.spawn().unwrap();
    started.wait();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        release.wait();
    });

    handle.shutdown();
    releaser.join().unwrap();

    assert!(h.store.get(id).unwrap().is_none());

    // Nothing acquires after shutdown.
    let late = h.insert(Job::async_continuation(ExecutionId::new(), h.clock.now()));
    thread::sleep(Duration::from_millis(30));
    assert!(h.job(late).lock.is_none());
}
