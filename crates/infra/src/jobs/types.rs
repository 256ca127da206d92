//! Core job types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowrun_core::{ExecutionId, ProcessInstanceId, TenantId};

use super::retry::RetryCycle;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Well-known handler types emitted by the workflow engine.
///
/// The executor treats handler types as opaque routing keys; these are the
/// ones the engine creates out of the box.
pub mod handler_types {
    /// Asynchronous continuation before/after an activity.
    pub const ASYNC_CONTINUATION: &str = "async-continuation";
    /// Timer attached to an activity or intermediate event.
    pub const TIMER_TRANSITION: &str = "timer-transition";
    /// Timer start event of a process definition.
    pub const TIMER_START_EVENT: &str = "timer-start-event";
    /// Asynchronous event subscription delivery.
    pub const EVENT: &str = "event";
}

/// Exclusive, time-bounded claim on a job by one executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl JobLock {
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, lease: Duration) -> Self {
        Self {
            owner: owner.into(),
            expires_at: add_std_duration(now, lease),
        }
    }

    /// An expired lock is treated as absent.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `owner` took this lock, expired or not. An expired lock that
    /// nobody has taken over still belongs to its last owner.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// A persisted continuation of a process or case execution.
///
/// The exception detail (full cause chain) is not a field: it is
/// stored alongside the job and fetched on demand through
/// [`JobStore::exception_detail`](super::store::JobStore::exception_detail).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Execution this job continues.
    pub execution_id: ExecutionId,
    pub process_instance_id: Option<ProcessInstanceId>,
    /// Tenant resolved when the owning instance was started.
    pub tenant_id: Option<TenantId>,
    /// Routing key for the continuation handler.
    pub handler_type: String,
    /// Handler-specific configuration (activity id, timer declaration, ...).
    pub configuration: serde_json::Value,
    /// The job must not be acquired before this instant.
    pub due_date: DateTime<Utc>,
    /// Remaining executions; zero means the job is no longer acquired.
    pub retries: u32,
    pub retry_cycle: RetryCycle,
    /// Number of recorded failures (indexes custom retry intervals).
    pub failed_attempts: u32,
    pub lock: Option<JobLock>,
    pub exception_message: Option<String>,
    pub suspended: bool,
    /// Higher priorities are acquired first.
    pub priority: i64,
    /// Bumped on every write.
    pub revision: u64,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Create a job due immediately, using the default retry cycle.
    pub fn new(
        execution_id: ExecutionId,
        handler_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let retry_cycle = RetryCycle::default();
        Self {
            id: JobId::new(),
            execution_id,
            process_instance_id: None,
            tenant_id: None,
            handler_type: handler_type.into(),
            configuration: serde_json::Value::Null,
            due_date: now,
            retries: retry_cycle.initial_retries(),
            retry_cycle,
            failed_attempts: 0,
            lock: None,
            exception_message: None,
            suspended: false,
            priority: 0,
            revision: 1,
            created_at: now,
        }
    }

    /// Asynchronous continuation of `execution_id`, due now.
    pub fn async_continuation(execution_id: ExecutionId, now: DateTime<Utc>) -> Self {
        Self::new(execution_id, handler_types::ASYNC_CONTINUATION, now)
    }

    /// Timer firing for `execution_id` at `due_date`.
    pub fn timer(execution_id: ExecutionId, due_date: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self::new(execution_id, handler_types::TIMER_TRANSITION, now).due_at(due_date)
    }

    /// Set the retry cycle; retries are reset to the cycle's initial count.
    pub fn with_retry_cycle(mut self, cycle: RetryCycle) -> Self {
        self.retries = cycle.initial_retries();
        self.retry_cycle = cycle;
        self
    }

    /// Override the remaining retries without touching the cycle.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn due_at(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = due_date;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn in_process_instance(mut self, process_instance_id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn with_configuration(mut self, configuration: serde_json::Value) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    /// Whether some executor holds a lock that has not yet expired.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock.as_ref().is_some_and(|l| !l.is_expired(now))
    }

    /// Not suspended, due, has retries left and is not validly locked.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended && self.due_date <= now && self.retries > 0 && !self.is_locked(now)
    }

    /// Retries exhausted by a failure: needs operator intervention.
    pub fn is_incident(&self) -> bool {
        self.retries == 0 && self.exception_message.is_some()
    }

    /// Whether `owner` holds the job's lock (see [`JobLock::is_owned_by`]).
    pub fn is_locked_by(&self, owner: &str) -> bool {
        self.lock.as_ref().is_some_and(|l| l.is_owned_by(owner))
    }

    pub(crate) fn touch(&mut self) {
        self.revision += 1;
    }
}

/// Failure-tracking fields written by the failure recorder in one store write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    /// Revision the retry decision was computed from; the write is rejected
    /// if the job changed since.
    pub expected_revision: u64,
    pub retries: u32,
    pub due_date: DateTime<Utc>,
    pub message: String,
    pub detail: String,
}

/// `now + lease`, saturating at `now` for durations chrono cannot represent.
pub(crate) fn add_std_duration(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}
