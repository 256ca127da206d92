//! Failure recording: message, cause chain, retry bookkeeping.
//!
//! The recorder never receives a transaction. It writes through
//! [`JobStore::persist_failure`], which is its own atomic unit, so a rolled
//! back business transaction cannot take the failure state down with it.

use std::error::Error as StdError;
use std::sync::Arc;

use tracing::warn;

use flowrun_core::Clock;

use super::retry::RetryDecision;
use super::store::{JobStore, JobStoreError};
use super::types::{FailureUpdate, Job};

/// Message recorded for every failure that happens while committing.
pub const COMMIT_FAILURE_MESSAGE: &str = "Unable to commit transaction";

/// Prefix of each nested cause in a formatted trace.
pub const CAUSED_BY: &str = "Caused by: ";

/// A failure ready to be persisted against a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// User-visible summary (the outermost error's message).
    pub message: String,
    /// The full cause chain.
    pub detail: String,
}

impl FailureReport {
    pub fn new(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: detail.into(),
        }
    }

    /// Failure thrown by business logic (or while resolving its context).
    pub fn from_error(err: &anyhow::Error) -> Self {
        let root: &(dyn StdError + 'static) = err.as_ref();
        Self {
            message: err.to_string(),
            detail: format_cause_chain(root),
        }
    }

    /// Failure while committing: always reported as
    /// [`COMMIT_FAILURE_MESSAGE`], with the originating error as first cause.
    pub fn commit_failure(cause: &(dyn StdError + 'static)) -> Self {
        Self {
            message: COMMIT_FAILURE_MESSAGE.to_string(),
            detail: format!(
                "{COMMIT_FAILURE_MESSAGE}\n{CAUSED_BY}{}",
                format_cause_chain(cause)
            ),
        }
    }
}

/// Render an error and its `source()` chain, one `Caused by:` line per cause.
pub fn format_cause_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push('\n');
        out.push_str(CAUSED_BY);
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// Result of recording a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFailure {
    pub job: Job,
    pub decision: RetryDecision,
}

impl RecordedFailure {
    /// The failure exhausted the job's retries.
    pub fn is_incident(&self) -> bool {
        self.decision.is_terminal()
    }
}

/// Re-reads after a concurrent change before giving up.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Applies the retry cycle and persists failure state.
pub struct FailureRecorder<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: JobStore> FailureRecorder<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Compute the job's next state and persist it with the failure.
    ///
    /// The decision is made from the job as currently stored, so an operator
    /// change made while the job ran is not overwritten. Fails with
    /// [`JobStoreError::LockLost`] once another executor has taken the job
    /// over. A terminal decision keeps the job's current due date.
    pub fn record(
        &self,
        job: &Job,
        owner: &str,
        report: &FailureReport,
    ) -> Result<RecordedFailure, JobStoreError> {
        let mut conflicts = 0;
        loop {
            let current = self
                .store
                .get(job.id)?
                .ok_or(JobStoreError::NotFound(job.id))?;
            if !current.is_locked_by(owner) {
                return Err(JobStoreError::LockLost(job.id));
            }

            let now = self.clock.now();
            let decision = current
                .retry_cycle
                .next_state(current.retries, current.failed_attempts, now);
            let due_date = match decision {
                RetryDecision::Retry { due_date, .. } => due_date,
                RetryDecision::Terminal => current.due_date,
            };

            let update = FailureUpdate {
                expected_revision: current.revision,
                retries: decision.retries(),
                due_date,
                message: report.message.clone(),
                detail: report.detail.clone(),
            };
            let updated = match self.store.persist_failure(job.id, owner, update) {
                Err(JobStoreError::Conflict(_)) if conflicts < MAX_CONFLICT_RETRIES => {
                    conflicts += 1;
                    continue;
                }
                result => result?,
            };

            if decision.is_terminal() {
                warn!(
                    job_id = %job.id,
                    execution_id = %job.execution_id,
                    message = %report.message,
                    "job retries exhausted, incident created"
                );
            }

            return Ok(RecordedFailure {
                job: updated,
                decision,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use flowrun_core::{ExecutionId, ManualClock};

    use super::*;
    use crate::jobs::store::{InMemoryJobStore, LockOutcome, LockScope};
    use crate::jobs::tx::TransactionError;

    #[derive(Debug, thiserror::Error)]
    #[error("service call failed")]
    struct ServiceError {
        #[source]
        source: std::io::Error,
    }

    #[test]
    fn formats_nested_causes_verbatim() {
        let err = ServiceError {
            source: std::io::Error::other("connection reset"),
        };
        assert_eq!(
            format_cause_chain(&err),
            "service call failed\nCaused by: connection reset"
        );
    }

    #[test]
    fn business_failure_uses_outermost_message() {
        let err = anyhow::anyhow!("socket closed").context("boom");
        let report = FailureReport::from_error(&err);
        assert_eq!(report.message, "boom");
        assert_eq!(report.detail, "boom\nCaused by: socket closed");
    }

    #[test]
    fn commit_failure_wraps_originating_error() {
        let err = TransactionError::ListenerFailed {
            listener: "audit".to_string(),
            source: anyhow::anyhow!("exception in transaction listener").into(),
        };
        let report = FailureReport::commit_failure(&err);

        assert_eq!(report.message, COMMIT_FAILURE_MESSAGE);
        assert_eq!(
            report.detail,
            "Unable to commit transaction\n\
             Caused by: before-commit listener 'audit' failed\n\
             Caused by: exception in transaction listener"
        );
    }

    const OWNER: &str = "node-a";
    const LEASE: std::time::Duration = std::time::Duration::from_secs(60);

    fn locked(store: &InMemoryJobStore, job: Job, now: chrono::DateTime<chrono::Utc>) -> Job {
        let id = store.insert(job).unwrap();
        match store.lock(id, OWNER, LEASE, now, LockScope::Acquisition).unwrap() {
            LockOutcome::Locked(job) => job,
            other => panic!("unexpected lock outcome: {other:?}"),
        }
    }

    #[test]
    fn records_failure_and_decrements_retries() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryJobStore::arc();
        let job = locked(&store, Job::async_continuation(ExecutionId::new(), clock.now()), clock.now());

        let recorder = FailureRecorder::new(store.clone(), clock.clone());
        let recorded = recorder
            .record(&job, OWNER, &FailureReport::new("boom", "boom\nCaused by: io"))
            .unwrap();

        assert!(!recorded.is_incident());
        assert_eq!(recorded.job.retries, 2);
        assert_eq!(recorded.job.failed_attempts, 1);
        assert_eq!(recorded.job.exception_message.as_deref(), Some("boom"));
        assert!(recorded.job.lock.is_none());
        assert_eq!(
            store.exception_detail(job.id).unwrap().as_deref(),
            Some("boom\nCaused by: io")
        );
    }

    #[test]
    fn terminal_failure_keeps_due_date() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryJobStore::arc();
        let job = Job::async_continuation(ExecutionId::new(), clock.now())
            .with_retry_cycle("PT10M".parse().unwrap())
            .with_retries(1);
        let due = job.due_date;
        let job = locked(&store, job, clock.now());

        clock.advance(chrono::Duration::seconds(30));
        let recorded = FailureRecorder::new(store.clone(), clock.clone())
            .record(&job, OWNER, &FailureReport::new("boom", "boom"))
            .unwrap();

        assert!(recorded.is_incident());
        assert_eq!(recorded.job.retries, 0);
        assert_eq!(recorded.job.due_date, due);
        assert!(recorded.job.is_incident());
    }

    #[test]
    fn operator_retries_set_during_execution_are_respected() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryJobStore::arc();
        let job = locked(&store, Job::async_continuation(ExecutionId::new(), clock.now()), clock.now());

        store.set_retries(job.id, 10).unwrap();
        let recorded = FailureRecorder::new(store.clone(), clock.clone())
            .record(&job, OWNER, &FailureReport::new("boom", "boom"))
            .unwrap();

        assert_eq!(recorded.job.retries, 9);
    }

    #[test]
    fn failure_after_takeover_leaves_new_owner_alone() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryJobStore::arc();
        let job = locked(&store, Job::async_continuation(ExecutionId::new(), clock.now()), clock.now());

        clock.advance(chrono::Duration::seconds(61));
        assert!(matches!(
            store.lock(job.id, "node-b", LEASE, clock.now(), LockScope::Acquisition).unwrap(),
            LockOutcome::Locked(_)
        ));

        let err = FailureRecorder::new(store.clone(), clock.clone())
            .record(&job, OWNER, &FailureReport::new("boom", "boom"))
            .unwrap_err();
        assert!(matches!(err, JobStoreError::LockLost(_)));

        let current = store.get(job.id).unwrap().unwrap();
        assert!(current.is_locked_by("node-b"));
        assert_eq!(current.retries, 3);
    }

    #[test]
    fn missing_job_is_reported() {
        let clock = ManualClock::arc(chrono::Utc::now());
        let store = InMemoryJobStore::arc();
        let job = Job::async_continuation(ExecutionId::new(), clock.now());

        let err = FailureRecorder::new(store, clock)
            .record(&job, OWNER, &FailureReport::new("boom", "boom"))
            .unwrap_err();
        assert!(matches!(err, JobStoreError::NotFound(_)));
    }
}
