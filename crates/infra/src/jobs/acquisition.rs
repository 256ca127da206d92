//! Acquisition scheduler: selects due jobs, leases them, fans them out.
//!
//! One cycle walks `Idle -> Acquiring -> Dispatching -> Idle`. The wait before
//! the next cycle follows [`BackoffPolicy`]: empty cycles back off, any
//! acquisition resets the wait and a full batch re-acquires immediately.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, trace};

use flowrun_core::Clock;

use super::config::{BackoffPolicy, JobExecutorConfig};
use super::store::{AcquisitionFilter, JobStore, LockOutcome, LockScope};
use super::types::{Job, JobId};

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Idle,
    Acquiring,
    Dispatching,
}

/// Current wait between acquisition cycles.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.base,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grow the wait after a cycle that acquired nothing.
    pub fn on_empty(&mut self) -> Duration {
        self.current = self.policy.next(self.current);
        self.current
    }

    /// Reset the wait after a cycle that acquired at least one job.
    pub fn on_acquired(&mut self) -> Duration {
        self.current = self.policy.base;
        self.current
    }
}

/// Jobs leased in one acquisition cycle.
#[derive(Debug, Default)]
pub struct AcquiredBatch {
    pub jobs: Vec<Job>,
    /// Candidates returned by the store.
    pub candidates: usize,
    /// Candidates someone else locked (or changed) first.
    pub contended: usize,
    /// Whether the batch filled the requested capacity.
    pub full: bool,
}

impl AcquiredBatch {
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Leases due jobs for one executor instance.
pub struct AcquisitionScheduler<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    owner: String,
    lock_duration: Duration,
    max_jobs_per_acquisition: usize,
    filter: AcquisitionFilter,
    state: SchedulerState,
    backoff: Backoff,
}

impl<S: JobStore> AcquisitionScheduler<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        owner: impl Into<String>,
        config: &JobExecutorConfig,
    ) -> Self {
        let filter = match config.tenant_id {
            Some(tenant) => AcquisitionFilter::for_tenant(tenant),
            None => AcquisitionFilter::all(),
        };
        Self {
            store,
            clock,
            owner: owner.into(),
            lock_duration: config.lock_duration,
            max_jobs_per_acquisition: config.max_jobs_per_acquisition.max(1),
            filter,
            state: SchedulerState::Idle,
            backoff: Backoff::new(config.backoff),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn current_wait(&self) -> Duration {
        self.backoff.current()
    }

    /// Lease up to `capacity` acquirable jobs.
    ///
    /// Leaves the scheduler in `Dispatching` when something was acquired,
    /// `Idle` otherwise.
    pub fn acquire(&mut self, capacity: usize) -> AcquiredBatch {
        self.state = SchedulerState::Acquiring;

        let wanted = capacity.min(self.max_jobs_per_acquisition);
        let mut batch = AcquiredBatch::default();
        if wanted == 0 {
            self.state = SchedulerState::Idle;
            return batch;
        }

        let now = self.clock.now();
        let candidates = match self
            .store
            .acquirable(now, self.max_jobs_per_acquisition, &self.filter)
        {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(owner = %self.owner, error = %e, "failed to query acquirable jobs");
                self.state = SchedulerState::Idle;
                return batch;
            }
        };
        batch.candidates = candidates.len();

        for candidate in candidates {
            if batch.jobs.len() == wanted {
                break;
            }
            match self.store.lock(
                candidate.id,
                &self.owner,
                self.lock_duration,
                now,
                LockScope::Acquisition,
            ) {
                Ok(LockOutcome::Locked(job)) => batch.jobs.push(job),
                Ok(LockOutcome::AlreadyLocked { .. } | LockOutcome::NotAcquirable) => {
                    trace!(owner = %self.owner, job_id = %candidate.id, "job taken by someone else");
                    batch.contended += 1;
                }
                Err(e) => {
                    error!(
                        owner = %self.owner,
                        job_id = %candidate.id,
                        error = %e,
                        "failed to lock job"
                    );
                }
            }
        }

        batch.full = batch.jobs.len() == wanted;
        if batch.is_empty() {
            self.state = SchedulerState::Idle;
        } else {
            debug!(
                owner = %self.owner,
                acquired = batch.len(),
                candidates = batch.candidates,
                contended = batch.contended,
                "acquired jobs"
            );
            self.state = SchedulerState::Dispatching;
        }
        batch
    }

    /// Run every job of a batch concurrently and wait for all of them.
    ///
    /// Each job gets its own scoped worker thread; the batch never exceeds
    /// the capacity passed to [`acquire`](Self::acquire). Results come back in
    /// batch order, minus jobs whose worker died.
    pub fn dispatch<F, R>(&self, jobs: Vec<Job>, run: F) -> Vec<R>
    where
        F: Fn(Job) -> R + Sync,
        R: Send,
    {
        let run = &run;
        thread::scope(|scope| {
            let pending: Vec<Pending<'_, R>> = jobs
                .into_iter()
                .enumerate()
                .map(|(n, job)| {
                    let fallback = job.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("{}-worker-{n}", self.owner))
                        .spawn_scoped(scope, move || run(job));
                    match spawned {
                        Ok(handle) => Pending::Worker(fallback.id, handle),
                        Err(e) => {
                            error!(
                                owner = %self.owner,
                                job_id = %fallback.id,
                                error = %e,
                                "failed to spawn worker thread, running inline"
                            );
                            Pending::Inline(fallback)
                        }
                    }
                })
                .collect();

            pending
                .into_iter()
                .filter_map(|p| match p {
                    Pending::Worker(job_id, handle) => match handle.join() {
                        Ok(result) => Some(result),
                        Err(_) => {
                            error!(owner = %self.owner, job_id = %job_id, "worker thread panicked");
                            None
                        }
                    },
                    Pending::Inline(job) => Some(run(job)),
                })
                .collect()
        })
    }

    /// Finish a cycle and return the wait before the next one.
    pub fn complete_cycle(&mut self, acquired: usize, full: bool) -> Duration {
        self.state = SchedulerState::Idle;
        if acquired == 0 {
            self.backoff.on_empty()
        } else {
            self.backoff.on_acquired();
            if full { Duration::ZERO } else { self.backoff.current() }
        }
    }
}

enum Pending<'scope, R> {
    Worker(JobId, thread::ScopedJoinHandle<'scope, R>),
    Inline(Job),
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use flowrun_core::{ExecutionId, ManualClock, TenantId};

    use super::*;
    use crate::jobs::store::InMemoryJobStore;

    fn config() -> JobExecutorConfig {
        JobExecutorConfig::default()
            .with_max_jobs_per_acquisition(10)
            .with_backoff(BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(80),
                factor: 2.0,
            })
    }

    fn scheduler(
        store: &Arc<InMemoryJobStore>,
        clock: &Arc<ManualClock>,
        owner: &str,
        config: &JobExecutorConfig,
    ) -> AcquisitionScheduler<InMemoryJobStore> {
        AcquisitionScheduler::new(store.clone(), clock.clone(), owner, config)
    }

    fn seed(store: &InMemoryJobStore, clock: &ManualClock, n: usize) {
        for _ in 0..n {
            store
                .insert(Job::async_continuation(ExecutionId::new(), clock.now()))
                .unwrap();
        }
    }

    #[test]
    fn acquires_up_to_capacity_and_locks_for_owner() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        seed(&store, &clock, 5);
        let mut scheduler = scheduler(&store, &clock, "node-a", &config());

        let batch = scheduler.acquire(3);

        assert_eq!(batch.len(), 3);
        assert!(batch.full);
        assert_eq!(scheduler.state(), SchedulerState::Dispatching);
        for job in &batch.jobs {
            let lock = job.lock.as_ref().unwrap();
            assert_eq!(lock.owner, "node-a");
        }
        assert_eq!(store.stats(clock.now()).unwrap().locked, 3);
    }

    #[test]
    fn empty_store_returns_to_idle() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let mut scheduler = scheduler(&store, &clock, "node-a", &config());

        let batch = scheduler.acquire(4);
        assert!(batch.is_empty());
        assert!(!batch.full);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[test]
    fn two_schedulers_never_lease_the_same_job() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        seed(&store, &clock, 4);
        let mut a = scheduler(&store, &clock, "node-a", &config());
        let mut b = scheduler(&store, &clock, "node-b", &config());

        let first = a.acquire(10);
        let second = b.acquire(10);

        assert_eq!(first.len(), 4);
        assert!(second.is_empty());
        assert_eq!(second.candidates, 0);
    }

    #[test]
    fn tenant_restricted_scheduler_skips_other_tenants() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let tenant = TenantId::new();
        store
            .insert(Job::async_continuation(ExecutionId::new(), clock.now()).with_tenant(tenant))
            .unwrap();
        store
            .insert(Job::async_continuation(ExecutionId::new(), clock.now()).with_tenant(TenantId::new()))
            .unwrap();
        let mut scheduler = scheduler(&store, &clock, "node-a", &config().with_tenant(tenant));

        let batch = scheduler.acquire(10);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.jobs[0].tenant_id, Some(tenant));
    }

    #[test]
    fn expired_leases_are_reacquired() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        seed(&store, &clock, 1);
        let config = config().with_lock_duration(Duration::from_secs(60));
        let mut crashed = scheduler(&store, &clock, "crashed", &config);
        let mut survivor = scheduler(&store, &clock, "survivor", &config);

        assert_eq!(crashed.acquire(1).len(), 1);
        assert!(survivor.acquire(1).is_empty());

        clock.advance(chrono::Duration::seconds(61));
        let batch = survivor.acquire(1);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.jobs[0].lock.as_ref().unwrap().owner, "survivor");
    }

    #[test]
    fn dispatch_runs_batch_concurrently_and_collects_results() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        seed(&store, &clock, 3);
        let mut scheduler = scheduler(&store, &clock, "node-a", &config());
        let batch = scheduler.acquire(3);
        let expected: Vec<_> = batch.jobs.iter().map(|j| j.id).collect();

        let threads = Mutex::new(Vec::new());
        let results = scheduler.dispatch(batch.jobs, |job| {
            let name = thread::current().name().map(str::to_string);
            threads.lock().unwrap().push(name);
            job.id
        });

        assert_eq!(results, expected);
        let threads = threads.into_inner().unwrap();
        assert_eq!(threads.len(), 3);
        assert!(
            threads
                .iter()
                .all(|n| n.as_deref().is_some_and(|n| n.starts_with("node-a-worker-")))
        );
    }

    #[test]
    fn wait_backs_off_on_empty_cycles_and_resets_on_acquisition() {
        let store = InMemoryJobStore::arc();
        let clock = ManualClock::arc(Utc::now());
        let mut scheduler = scheduler(&store, &clock, "node-a", &config());

        let waits: Vec<_> = (0..5).map(|_| scheduler.complete_cycle(0, false)).collect();
        assert_eq!(waits, [20, 40, 80, 80, 80].map(Duration::from_millis).to_vec());

        assert_eq!(scheduler.complete_cycle(2, false), Duration::from_millis(10));
        assert_eq!(scheduler.complete_cycle(4, true), Duration::ZERO);
        assert_eq!(scheduler.current_wait(), Duration::from_millis(10));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }
}
