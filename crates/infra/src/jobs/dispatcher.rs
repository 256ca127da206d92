//! Execution of leased jobs inside a transaction boundary.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::Serialize;
use tracing::{debug, error, warn};

use flowrun_core::Clock;

use super::failure::{FailureRecorder, FailureReport};
use super::store::{JobStore, JobStoreError, LockOutcome, LockScope};
use super::tx::{Transaction, TransactionManager};
use super::types::{Job, JobId};
use super::workflow::{ExecutionResolver, HandlerRegistry};

/// Where an execution attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    /// Business logic (or context resolution) failed before commit.
    Execution,
    /// The transaction could not be committed.
    Commit,
}

/// Observable outcome of dispatching one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Committed; the job is gone.
    Completed,
    /// The failure was recorded; `incident` when retries are exhausted.
    Failed {
        phase: FailurePhase,
        retries: u32,
        incident: bool,
    },
    /// Recording the failure itself failed. The lock was still released.
    FailureNotRecorded { phase: FailurePhase, error: String },
    /// The job was deleted, or another executor took it over after the
    /// lease expired, before the outcome could be written. Nothing was
    /// written and the other owner's state is untouched.
    Vanished,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed)
    }
}

/// Failure to run a job on operator request.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteNowError {
    #[error("job not found or suspended: {0}")]
    NotExecutable(JobId),
    #[error("job {job_id} is locked by '{owner}'")]
    Locked { job_id: JobId, owner: String },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Runs leased jobs.
///
/// One attempt is: begin a transaction, resolve the execution, run the
/// handler, commit. The transaction is consumed by commit or rollback before
/// any failure is recorded.
pub struct ExecutionDispatcher<S, T> {
    store: Arc<S>,
    transactions: T,
    resolver: Arc<dyn ExecutionResolver>,
    handlers: HandlerRegistry,
    recorder: FailureRecorder<S>,
    clock: Arc<dyn Clock>,
    owner: String,
    lock_duration: Duration,
}

impl<S, T> ExecutionDispatcher<S, T>
where
    S: JobStore,
    T: TransactionManager,
{
    pub fn new(
        store: Arc<S>,
        transactions: T,
        resolver: Arc<dyn ExecutionResolver>,
        handlers: HandlerRegistry,
        clock: Arc<dyn Clock>,
        owner: impl Into<String>,
        lock_duration: Duration,
    ) -> Self {
        Self {
            recorder: FailureRecorder::new(store.clone(), clock.clone()),
            store,
            transactions,
            resolver,
            handlers,
            clock,
            owner: owner.into(),
            lock_duration,
        }
    }

    /// Lock owner name used for this dispatcher's jobs.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Execute a job this dispatcher's owner has locked.
    pub fn execute(&self, job: Job) -> ExecutionOutcome {
        let job_id = job.id;
        debug!(job_id = %job_id, handler_type = %job.handler_type, "executing job");

        let mut tx = match self.transactions.begin() {
            Ok(tx) => tx,
            Err(e) => {
                let err = anyhow::Error::new(e).context("unable to start transaction");
                return self.fail(&job, FailurePhase::Execution, FailureReport::from_error(&err));
            }
        };

        match self.run_continuation(&job, &mut tx) {
            Ok(()) => match tx.commit() {
                Ok(()) => self.complete(&job),
                Err(e) => self.fail(&job, FailurePhase::Commit, FailureReport::commit_failure(&e)),
            },
            Err(err) => {
                tx.rollback();
                self.fail(&job, FailurePhase::Execution, FailureReport::from_error(&err))
            }
        }
    }

    /// Lock and execute one job right away, ignoring its due date and retries.
    pub fn execute_now(&self, job_id: JobId) -> Result<ExecutionOutcome, ExecuteNowError> {
        let now = self.clock.now();
        match self
            .store
            .lock(job_id, &self.owner, self.lock_duration, now, LockScope::Manual)?
        {
            LockOutcome::Locked(job) => Ok(self.execute(job)),
            LockOutcome::AlreadyLocked { owner, .. } => Err(ExecuteNowError::Locked { job_id, owner }),
            LockOutcome::NotAcquirable => Err(ExecuteNowError::NotExecutable(job_id)),
        }
    }

    fn run_continuation(&self, job: &Job, tx: &mut T::Tx) -> anyhow::Result<()> {
        let handler = self.handlers.get(&job.handler_type).with_context(|| {
            format!("no handler registered for job type '{}'", job.handler_type)
        })?;

        let ctx = self
            .resolver
            .resolve(job)
            .with_context(|| format!("unable to resolve execution {}", job.execution_id))?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx, tx))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "job handler panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }

    fn complete(&self, job: &Job) -> ExecutionOutcome {
        match self.store.delete_completed(job.id, &self.owner) {
            Ok(()) => debug!(job_id = %job.id, "job completed"),
            Err(JobStoreError::NotFound(_)) => {
                debug!(job_id = %job.id, "job completed but was already removed")
            }
            Err(JobStoreError::LockLost(_)) => {
                warn!(
                    job_id = %job.id,
                    owner = %self.owner,
                    "job completed after its lock was taken over; it will run again"
                );
                return ExecutionOutcome::Vanished;
            }
            Err(e) => {
                // The business effects are committed; a lingering job would run them again.
                error!(job_id = %job.id, error = %e, "job completed but could not be deleted");
                self.release(job);
            }
        }
        ExecutionOutcome::Completed
    }

    fn fail(&self, job: &Job, phase: FailurePhase, report: FailureReport) -> ExecutionOutcome {
        warn!(
            job_id = %job.id,
            execution_id = %job.execution_id,
            phase = ?phase,
            error = %report.message,
            "job execution failed"
        );

        match self.recorder.record(job, &self.owner, &report) {
            Ok(recorded) => ExecutionOutcome::Failed {
                phase,
                retries: recorded.job.retries,
                incident: recorded.is_incident(),
            },
            Err(JobStoreError::NotFound(_)) => {
                debug!(job_id = %job.id, "job removed while executing, failure dropped");
                ExecutionOutcome::Vanished
            }
            Err(JobStoreError::LockLost(_)) => {
                warn!(
                    job_id = %job.id,
                    owner = %self.owner,
                    "job lock taken over while executing, failure dropped"
                );
                ExecutionOutcome::Vanished
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    phase = ?phase,
                    error = %e,
                    failure = %report.message,
                    "unable to record job failure; job state may be inconsistent"
                );
                self.release(job);
                ExecutionOutcome::FailureNotRecorded {
                    phase,
                    error: e.to_string(),
                }
            }
        }
    }

    fn release(&self, job: &Job) {
        if let Err(e) = self.store.release(job.id, &self.owner) {
            error!(
                job_id = %job.id,
                error = %e,
                "unable to release job lock; it is held until the lease expires"
            );
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
