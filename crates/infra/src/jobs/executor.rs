//! Job executor lifecycle: start, trigger, stop.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use flowrun_core::{Clock, SystemClock};

use super::acquisition::{AcquisitionScheduler, SchedulerState};
use super::config::{ConfigError, JobExecutorConfig};
use super::dispatcher::{ExecuteNowError, ExecutionDispatcher, ExecutionOutcome};
use super::store::JobStore;
use super::tx::{TransactionHandle, TransactionManager};
use super::types::{Job, JobId};
use super::workflow::{
    ExecutionContext, ExecutionResolver, HandlerRegistry, JobHandler, JobRowResolver,
};

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExecutorStats {
    pub acquisition_cycles: u64,
    pub empty_cycles: u64,
    pub jobs_acquired: u64,
    pub lock_contentions: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub incidents: u64,
    pub jobs_vanished: u64,
    pub bookkeeping_failures: u64,
    pub current_running: usize,
    pub current_wait_ms: u64,
    pub state: SchedulerState,
    pub uptime_secs: u64,
}

impl ExecutorStats {
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed + self.jobs_vanished + self.bookkeeping_failures
    }

    fn record(&mut self, outcome: &ExecutionOutcome) {
        match outcome {
            ExecutionOutcome::Completed => self.jobs_succeeded += 1,
            ExecutionOutcome::Failed { incident, .. } => {
                self.jobs_failed += 1;
                if *incident {
                    self.incidents += 1;
                }
            }
            ExecutionOutcome::FailureNotRecorded { .. } => self.bookkeeping_failures += 1,
            ExecutionOutcome::Vanished => self.jobs_vanished += 1,
        }
    }
}

type SharedStats = Arc<Mutex<ExecutorStats>>;

fn lock_stats(stats: &SharedStats) -> MutexGuard<'_, ExecutorStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shutdown flag plus a single-slot wakeup; triggers never queue up behind
/// a shutdown request.
#[derive(Clone)]
struct Control {
    shutdown: Arc<AtomicBool>,
    wake: mpsc::SyncSender<()>,
}

impl Control {
    fn new() -> (Self, mpsc::Receiver<()>) {
        let (wake, wakeups) = mpsc::sync_channel(1);
        let control = Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            wake,
        };
        (control, wakeups)
    }

    fn wake(&self) {
        // A full slot already guarantees a wakeup.
        let _ = self.wake.try_send(());
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }
}

/// Handle to control a running executor.
pub struct JobExecutorHandle<S, T> {
    control: Control,
    join: Option<thread::JoinHandle<()>>,
    stats: SharedStats,
    dispatcher: Arc<ExecutionDispatcher<S, Arc<T>>>,
}

impl<S, T> JobExecutorHandle<S, T>
where
    S: JobStore,
    T: TransactionManager,
{
    /// Wake the executor if it is waiting between acquisition cycles.
    pub fn trigger(&self) {
        self.control.wake();
    }

    /// Run one job now on the calling thread, outside the acquisition cycle.
    pub fn execute_now(&self, job_id: JobId) -> Result<ExecutionOutcome, ExecuteNowError> {
        let outcome = self.dispatcher.execute_now(job_id)?;
        lock_stats(&self.stats).record(&outcome);
        Ok(outcome)
    }

    /// Get current executor statistics.
    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }

    /// Stop acquiring and wait for in-flight jobs to finish.
    pub fn shutdown(mut self) {
        self.control.stop();
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("job executor thread panicked");
            }
        }
    }
}

impl<S, T> Drop for JobExecutorHandle<S, T> {
    fn drop(&mut self) {
        if let Some(j) = self.join.take() {
            self.control.stop();
            let _ = j.join();
        }
    }
}

/// Background job executor.
///
/// Acquires due jobs from a shared store, runs them with the registered
/// handlers and records failures. Several executors may share one store;
/// they coordinate only through job locks.
pub struct JobExecutor<S, T> {
    store: Arc<S>,
    transactions: Arc<T>,
    config: JobExecutorConfig,
    clock: Arc<dyn Clock>,
    resolver: Arc<dyn ExecutionResolver>,
    handlers: HandlerRegistry,
}

impl<S, T> JobExecutor<S, T>
where
    S: JobStore + 'static,
    T: TransactionManager + 'static,
{
    /// Build an executor; the configuration is validated first.
    pub fn new(
        store: Arc<S>,
        transactions: T,
        config: JobExecutorConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            transactions: Arc::new(transactions),
            config,
            clock: Arc::new(SystemClock),
            resolver: Arc::new(JobRowResolver),
            handlers: HandlerRegistry::new(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ExecutionResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn config(&self) -> &JobExecutorConfig {
        &self.config
    }

    /// Register a handler for a handler type (`exact`, `prefix.*` or `*`).
    pub fn register_handler<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&ExecutionContext, &mut dyn TransactionHandle) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.register(pattern, handler);
    }

    pub fn register_shared_handler(
        &mut self,
        pattern: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) {
        self.handlers.register_handler(pattern, handler);
    }

    fn owner(&self) -> String {
        format!("{}-{}", self.config.name, uuid::Uuid::now_v7())
    }

    fn dispatcher(&self, owner: &str) -> ExecutionDispatcher<S, Arc<T>> {
        ExecutionDispatcher::new(
            self.store.clone(),
            self.transactions.clone(),
            self.resolver.clone(),
            self.handlers.clone(),
            self.clock.clone(),
            owner,
            self.config.lock_duration,
        )
    }

    /// Execute one already locked job (for testing or synchronous use).
    pub fn execute_one(&self, job: Job) -> ExecutionOutcome {
        let owner = job
            .lock
            .as_ref()
            .map(|l| l.owner.clone())
            .unwrap_or_else(|| self.owner());
        self.dispatcher(&owner).execute(job)
    }

    /// Lock and execute one job immediately, ignoring due date and retries.
    pub fn execute_now(&self, job_id: JobId) -> Result<ExecutionOutcome, ExecuteNowError> {
        self.dispatcher(&self.owner()).execute_now(job_id)
    }

    /// Build the acquisition loop without starting a thread.
    pub fn into_worker(self) -> ExecutorWorker<S, T> {
        let owner = self.owner();
        let dispatcher = Arc::new(self.dispatcher(&owner));
        let scheduler =
            AcquisitionScheduler::new(self.store.clone(), self.clock.clone(), owner, &self.config);
        ExecutorWorker {
            scheduler,
            dispatcher,
            config: self.config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    /// Spawn the executor in a background thread.
    pub fn spawn(self) -> io::Result<JobExecutorHandle<S, T>> {
        let worker = self.into_worker();
        let (control, wakeups) = Control::new();
        let shutdown = control.shutdown.clone();
        let stats = worker.stats.clone();
        let dispatcher = worker.dispatcher.clone();

        let join = thread::Builder::new()
            .name(worker.config.name.clone())
            .spawn(move || executor_loop(worker, &shutdown, wakeups))?;

        Ok(JobExecutorHandle {
            control,
            join: Some(join),
            stats,
            dispatcher,
        })
    }
}

/// Result of one acquisition cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub acquired: usize,
    pub outcomes: Vec<ExecutionOutcome>,
    /// Wait before the next cycle (zero after a full batch).
    pub wait: Duration,
}

/// The acquisition loop of one executor, driven one cycle at a time.
pub struct ExecutorWorker<S, T> {
    scheduler: AcquisitionScheduler<S>,
    dispatcher: Arc<ExecutionDispatcher<S, Arc<T>>>,
    config: JobExecutorConfig,
    stats: SharedStats,
}

impl<S, T> ExecutorWorker<S, T>
where
    S: JobStore,
    T: TransactionManager,
{
    pub fn owner(&self) -> &str {
        self.scheduler.owner()
    }

    pub fn stats(&self) -> ExecutorStats {
        lock_stats(&self.stats).clone()
    }

    /// Acquire, dispatch and wait for one batch.
    pub fn run_cycle(&mut self) -> CycleReport {
        let batch = self.scheduler.acquire(self.config.max_concurrent);
        let acquired = batch.len();
        let full = batch.full;

        {
            let mut s = lock_stats(&self.stats);
            s.acquisition_cycles += 1;
            s.jobs_acquired += acquired as u64;
            s.lock_contentions += batch.contended as u64;
            if acquired == 0 {
                s.empty_cycles += 1;
            }
            s.current_running = acquired;
            s.state = self.scheduler.state();
        }

        let dispatcher = &self.dispatcher;
        let stats = &self.stats;
        let outcomes = self.scheduler.dispatch(batch.jobs, |job| {
            let outcome = dispatcher.execute(job);
            let mut s = lock_stats(stats);
            s.record(&outcome);
            s.current_running = s.current_running.saturating_sub(1);
            outcome
        });

        let wait = self.scheduler.complete_cycle(acquired, full);
        {
            let mut s = lock_stats(&self.stats);
            s.current_running = 0;
            s.current_wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
            s.state = self.scheduler.state();
        }

        CycleReport {
            acquired,
            outcomes,
            wait,
        }
    }
}

fn executor_loop<S, T>(
    mut worker: ExecutorWorker<S, T>,
    shutdown: &AtomicBool,
    wakeups: mpsc::Receiver<()>,
) where
    S: JobStore,
    T: TransactionManager,
{
    let name = worker.config.name.clone();
    info!(executor = %name, owner = %worker.owner(), "job executor started");
    let start_time = Instant::now();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let report = worker.run_cycle();
        lock_stats(&worker.stats).uptime_secs = start_time.elapsed().as_secs();

        if report.acquired > 0 {
            debug!(
                executor = %name,
                acquired = report.acquired,
                wait_ms = report.wait.as_millis() as u64,
                "acquisition cycle finished"
            );
        }
        if report.wait.is_zero() {
            continue;
        }

        if let Err(mpsc::RecvTimeoutError::Disconnected) = wakeups.recv_timeout(report.wait) {
            break;
        }
    }

    info!(executor = %name, "job executor stopped");
}
