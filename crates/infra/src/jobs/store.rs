//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use flowrun_core::{ExecutionId, ProcessInstanceId, TenantId};

use super::types::{FailureUpdate, Job, JobId, JobLock};

/// Job store abstraction.
///
/// `lock` is the only mutual-exclusion primitive: several executors may read
/// the same candidates from `acquirable`, only one of them wins the lock.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Up to `limit` acquirable jobs, priority descending then due date ascending.
    fn acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        filter: &AcquisitionFilter,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Atomically set the lock fields if no valid lock exists.
    fn lock(
        &self,
        job_id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
        scope: LockScope,
    ) -> Result<LockOutcome, JobStoreError>;

    /// Clear `owner`'s lock. Idempotent; locks held by others are left alone.
    fn release(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError>;

    /// Write retries, due date and exception fields in one atomic write,
    /// clearing the lock and counting the failure.
    ///
    /// Only applies while `owner` still holds the lock
    /// ([`JobStoreError::LockLost`] otherwise) and the job is still at
    /// `update.expected_revision` ([`JobStoreError::Conflict`] otherwise).
    fn persist_failure(
        &self,
        job_id: JobId,
        owner: &str,
        update: FailureUpdate,
    ) -> Result<Job, JobStoreError>;

    /// Remove a successfully executed job, provided `owner` still holds its
    /// lock ([`JobStoreError::LockLost`] otherwise).
    fn delete_completed(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError>;

    /// Remove a job regardless of its lock (e.g. its process instance was
    /// cancelled). Returns whether it existed.
    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Full cause chain of the job's last failure.
    fn exception_detail(&self, job_id: JobId) -> Result<Option<String>, JobStoreError>;

    /// Jobs matching `query`, oldest first.
    fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError>;

    /// Operator override of the remaining retries (resolves incidents).
    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError>;

    /// Suspend or activate a job.
    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError>;

    /// Move a job's due date (e.g. to run a timer early).
    fn set_due_date(&self, job_id: JobId, due_date: DateTime<Utc>) -> Result<Job, JobStoreError>;

    /// Job statistics at `now`.
    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("lock on job {0} is no longer held by this executor")]
    LockLost(JobId),
    #[error("job {0} was modified concurrently")]
    Conflict(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Which checks `lock` applies besides the lock itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Regular acquisition: the job must be acquirable.
    Acquisition,
    /// Operator-triggered execution: due date and retries are ignored,
    /// suspension is not.
    Manual,
}

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// The caller now holds the lock; the job as persisted.
    Locked(Job),
    /// Another executor holds a valid lock.
    AlreadyLocked {
        owner: String,
        expires_at: DateTime<Utc>,
    },
    /// Gone, suspended, not due or out of retries.
    NotAcquirable,
}

/// Restricts which jobs an executor acquires.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AcquisitionFilter {
    /// Only this tenant's jobs.
    pub tenant_id: Option<TenantId>,
}

impl AcquisitionFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant_id),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.tenant_id.is_none_or(|t| job.tenant_id == Some(t))
    }
}

/// Tooling query over jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQuery {
    pub execution_id: Option<ExecutionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub tenant_id: Option<TenantId>,
    pub handler_type: Option<String>,
    /// Only jobs that recorded a failure.
    pub with_exception: bool,
    /// Only jobs whose retries are exhausted by a failure.
    pub incidents_only: bool,
    pub limit: Option<usize>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents() -> Self {
        Self {
            incidents_only: true,
            ..Self::default()
        }
    }

    pub fn execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn process_instance(mut self, process_instance_id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    pub fn tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn handler_type(mut self, handler_type: impl Into<String>) -> Self {
        self.handler_type = Some(handler_type.into());
        self
    }

    pub fn with_exception(mut self) -> Self {
        self.with_exception = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.execution_id.is_none_or(|e| job.execution_id == e)
            && self
                .process_instance_id
                .is_none_or(|p| job.process_instance_id == Some(p))
            && self.tenant_id.is_none_or(|t| job.tenant_id == Some(t))
            && self
                .handler_type
                .as_ref()
                .is_none_or(|h| &job.handler_type == h)
            && (!self.with_exception || job.exception_message.is_some())
            && (!self.incidents_only || job.is_incident())
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub total: usize,
    /// Could be acquired right now.
    pub acquirable: usize,
    /// Held by a lock that has not expired.
    pub locked: usize,
    /// Not yet due.
    pub scheduled: usize,
    pub suspended: usize,
    /// Failed at least once, retries left.
    pub failing: usize,
    pub incidents: usize,
}

impl JobStats {
    fn count(&mut self, job: &Job, now: DateTime<Utc>) {
        self.total += 1;
        if job.is_acquirable(now) {
            self.acquirable += 1;
        }
        if job.is_locked(now) {
            self.locked += 1;
        }
        if job.due_date > now {
            self.scheduled += 1;
        }
        if job.suspended {
            self.suspended += 1;
        }
        if job.is_incident() {
            self.incidents += 1;
        } else if job.exception_message.is_some() {
            self.failing += 1;
        }
    }
}

/// Acquisition order: priority descending, then due date, then id.
pub(crate) fn acquisition_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.due_date.cmp(&b.due_date))
        .then(a.id.0.cmp(&b.id.0))
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    exception_details: HashMap<JobId, String>,
}

/// In-memory job store for tests/dev.
///
/// One `RwLock` guards both the job rows and the exception details, so a
/// failure write and a lock attempt are each a single critical section.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn update<F>(&self, job_id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job),
    {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        f(job);
        job.touch();
        Ok(job.clone())
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        tables.jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        filter: &AcquisitionFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut candidates: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now) && filter.matches(j))
            .cloned()
            .collect();

        candidates.sort_by(acquisition_order);
        candidates.truncate(limit);
        Ok(candidates)
    }

    fn lock(
        &self,
        job_id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
        scope: LockScope,
    ) -> Result<LockOutcome, JobStoreError> {
        let mut tables = self.write()?;
        let Some(job) = tables.jobs.get_mut(&job_id) else {
            return Ok(LockOutcome::NotAcquirable);
        };

        if let Some(lock) = job.lock.as_ref().filter(|l| !l.is_expired(now)) {
            return Ok(LockOutcome::AlreadyLocked {
                owner: lock.owner.clone(),
                expires_at: lock.expires_at,
            });
        }

        let eligible = match scope {
            LockScope::Acquisition => job.is_acquirable(now),
            LockScope::Manual => !job.suspended,
        };
        if !eligible {
            return Ok(LockOutcome::NotAcquirable);
        }

        job.lock = Some(JobLock::new(owner, now, lease));
        job.touch();
        Ok(LockOutcome::Locked(job.clone()))
    }

    fn release(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        if let Some(job) = tables.jobs.get_mut(&job_id) {
            if job.is_locked_by(owner) {
                job.lock = None;
                job.touch();
            }
        }
        Ok(())
    }

    fn persist_failure(
        &self,
        job_id: JobId,
        owner: &str,
        update: FailureUpdate,
    ) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_locked_by(owner) {
            return Err(JobStoreError::LockLost(job_id));
        }
        if job.revision != update.expected_revision {
            return Err(JobStoreError::Conflict(job_id));
        }

        job.retries = update.retries;
        job.due_date = update.due_date;
        job.exception_message = Some(update.message);
        job.failed_attempts = job.failed_attempts.saturating_add(1);
        job.lock = None;
        job.touch();
        let job = job.clone();

        tables.exception_details.insert(job_id, update.detail);
        Ok(job)
    }

    fn delete_completed(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        let job = tables.jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !job.is_locked_by(owner) {
            return Err(JobStoreError::LockLost(job_id));
        }
        tables.jobs.remove(&job_id);
        tables.exception_details.remove(&job_id);
        Ok(())
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut tables = self.write()?;
        tables.exception_details.remove(&job_id);
        Ok(tables.jobs.remove(&job_id).is_some())
    }

    fn exception_detail(&self, job_id: JobId) -> Result<Option<String>, JobStoreError> {
        Ok(self.read()?.exception_details.get(&job_id).cloned())
    }

    fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables
            .jobs
            .values()
            .filter(|j| query.matches(j))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id.0));
        if let Some(limit) = query.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| job.retries = retries)
    }

    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| job.suspended = suspended)
    }

    fn set_due_date(&self, job_id: JobId, due_date: DateTime<Utc>) -> Result<Job, JobStoreError> {
        self.update(job_id, |job| job.due_date = due_date)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let tables = self.read()?;
        let mut stats = JobStats::default();
        for job in tables.jobs.values() {
            stats.count(job, now);
        }
        Ok(stats)
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        filter: &AcquisitionFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).acquirable(now, limit, filter)
    }

    fn lock(
        &self,
        job_id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
        scope: LockScope,
    ) -> Result<LockOutcome, JobStoreError> {
        (**self).lock(job_id, owner, lease, now, scope)
    }

    fn release(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        (**self).release(job_id, owner)
    }

    fn persist_failure(
        &self,
        job_id: JobId,
        owner: &str,
        update: FailureUpdate,
    ) -> Result<Job, JobStoreError> {
        (**self).persist_failure(job_id, owner, update)
    }

    fn delete_completed(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        (**self).delete_completed(job_id, owner)
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).delete(job_id)
    }

    fn exception_detail(&self, job_id: JobId) -> Result<Option<String>, JobStoreError> {
        (**self).exception_detail(job_id)
    }

    fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        (**self).query(query)
    }

    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        (**self).set_retries(job_id, retries)
    }

    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        (**self).set_suspended(job_id, suspended)
    }

    fn set_due_date(&self, job_id: JobId, due_date: DateTime<Utc>) -> Result<Job, JobStoreError> {
        (**self).set_due_date(job_id, due_date)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        (**self).stats(now)
    }
}
