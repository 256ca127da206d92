//! Postgres-backed job store.
//!
//! ## Locking
//!
//! `lock` is a single conditional `UPDATE ... RETURNING`: the row is only
//! written when no valid lock exists (and, for acquisition, the job is due,
//! not suspended and has retries left). Postgres row locking makes the
//! compare-and-set atomic across executors; no `SELECT ... FOR UPDATE` is
//! needed. Acquisition reads (`acquirable`) take no locks at all.
//!
//! Outcome writes (`record_failure`, `delete_completed_job`) are scoped to
//! the lock owner, and failures also to the revision the decision was made
//! from. When such a write matches no row, a follow-up read tells
//! `NotFound`, `LockLost` and `Conflict` apart.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | Other | N/A | `Storage` |
//!
//! ## Runtime
//!
//! [`JobStore`] is synchronous and called from executor worker threads. The
//! store keeps a tokio runtime handle and blocks on it; it must not be called
//! from inside an async task.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{Span, instrument};

use flowrun_core::{ExecutionId, ProcessInstanceId, TenantId};

use super::retry::RetryCycle;
use super::store::{
    AcquisitionFilter, JobQuery, JobStats, JobStore, JobStoreError, LockOutcome, LockScope,
};
use super::types::{FailureUpdate, Job, JobId, JobLock};

/// Schema statements, applied in order by [`PostgresJobStore::ensure_schema`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS flowrun_jobs (
        id                  UUID PRIMARY KEY,
        execution_id        UUID NOT NULL,
        process_instance_id UUID NULL,
        tenant_id           UUID NULL,
        handler_type        TEXT NOT NULL,
        configuration       JSONB NOT NULL DEFAULT 'null'::jsonb,
        due_date            TIMESTAMPTZ NOT NULL,
        retries             INTEGER NOT NULL CHECK (retries >= 0),
        retry_cycle         JSONB NOT NULL,
        failed_attempts     INTEGER NOT NULL DEFAULT 0,
        lock_owner          TEXT NULL,
        lock_expires_at     TIMESTAMPTZ NULL,
        exception_message   TEXT NULL,
        exception_detail    TEXT NULL,
        suspended           BOOLEAN NOT NULL DEFAULT FALSE,
        priority            BIGINT NOT NULL DEFAULT 0,
        revision            BIGINT NOT NULL DEFAULT 0,
        created_at          TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS flowrun_jobs_acquisition_idx
        ON flowrun_jobs (priority DESC, due_date ASC)
        WHERE retries > 0 AND NOT suspended
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS flowrun_jobs_execution_idx
        ON flowrun_jobs (execution_id)
    "#,
];

/// Columns of a job row. `exception_detail` is not among them; it is only
/// read through [`JobStore::exception_detail`].
const JOB_COLUMNS: &str = "id, execution_id, process_instance_id, tenant_id, handler_type, \
     configuration, due_date, retries, retry_cycle, failed_attempts, lock_owner, \
     lock_expires_at, exception_message, suspended, priority, revision, created_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Use the runtime the caller is running in.
    pub fn from_current(pool: PgPool) -> Result<Self, JobStoreError> {
        let handle = Handle::try_current().map_err(|_| {
            JobStoreError::Storage(
                "PostgresJobStore requires a tokio runtime handle".to_string(),
            )
        })?;
        Ok(Self::new(pool, handle))
    }

    /// Create the job table and indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    fn block_on<F: Future>(&self, f: F) -> F::Output {
        self.handle.block_on(f)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, handler_type = %job.handler_type), err)]
    pub async fn insert_job(&self, job: &Job) -> Result<JobId, JobStoreError> {
        let retry_cycle = serde_json::to_value(&job.retry_cycle)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode retry cycle: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO flowrun_jobs (
                id, execution_id, process_instance_id, tenant_id, handler_type,
                configuration, due_date, retries, retry_cycle, failed_attempts,
                lock_owner, lock_expires_at, exception_message, suspended,
                priority, revision, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.0)
        .bind(job.execution_id.as_uuid())
        .bind(job.process_instance_id.map(|p| *p.as_uuid()))
        .bind(job.tenant_id.map(|t| *t.as_uuid()))
        .bind(&job.handler_type)
        .bind(&job.configuration)
        .bind(job.due_date)
        .bind(to_i32("retries", job.retries)?)
        .bind(retry_cycle)
        .bind(to_i32("failed_attempts", job.failed_attempts)?)
        .bind(job.lock.as_ref().map(|l| l.owner.as_str()))
        .bind(job.lock.as_ref().map(|l| l.expires_at))
        .bind(job.exception_message.as_deref())
        .bind(job.suspended)
        .bind(job.priority)
        .bind(to_i64("revision", job.revision)?)
        .bind(job.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM flowrun_jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self, filter), fields(candidates), err)]
    pub async fn acquirable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        filter: &AcquisitionFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM flowrun_jobs
            WHERE NOT suspended
                AND retries > 0
                AND due_date <= $1
                AND (lock_owner IS NULL OR lock_expires_at <= $1)
                AND ($2::uuid IS NULL OR tenant_id = $2)
            ORDER BY priority DESC, due_date ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(now)
        .bind(filter.tenant_id.map(|t| *t.as_uuid()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquirable_jobs", e))?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Span::current().record("candidates", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, lease), fields(job_id = %job_id, owner = %owner, scope = ?scope), err)]
    pub async fn lock_job(
        &self,
        job_id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
        scope: LockScope,
    ) -> Result<LockOutcome, JobStoreError> {
        let lock = JobLock::new(owner, now, lease);
        let manual = matches!(scope, LockScope::Manual);

        let row = sqlx::query(&format!(
            r#"
            UPDATE flowrun_jobs
            SET lock_owner = $2, lock_expires_at = $3, revision = revision + 1
            WHERE id = $1
                AND NOT suspended
                AND (lock_owner IS NULL OR lock_expires_at <= $4)
                AND ($5 OR (retries > 0 AND due_date <= $4))
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(&lock.owner)
        .bind(lock.expires_at)
        .bind(now)
        .bind(manual)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        if let Some(row) = row {
            return Ok(LockOutcome::Locked(job_from_row(&row)?));
        }

        // Lost the compare-and-set: report who holds it, if anyone.
        let holder = sqlx::query(
            r#"
            SELECT lock_owner, lock_expires_at
            FROM flowrun_jobs
            WHERE id = $1 AND lock_owner IS NOT NULL AND lock_expires_at > $2
            "#,
        )
        .bind(job_id.0)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        match holder {
            Some(row) => Ok(LockOutcome::AlreadyLocked {
                owner: row.try_get("lock_owner").map_err(row_error)?,
                expires_at: row.try_get("lock_expires_at").map_err(row_error)?,
            }),
            None => Ok(LockOutcome::NotAcquirable),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn release_job(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            UPDATE flowrun_jobs
            SET lock_owner = NULL, lock_expires_at = NULL, revision = revision + 1
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(job_id.0)
        .bind(owner)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_job", e))?;
        Ok(())
    }

    #[instrument(skip(self, update), fields(job_id = %job_id, owner = %owner, retries = update.retries), err)]
    pub async fn record_failure(
        &self,
        job_id: JobId,
        owner: &str,
        update: FailureUpdate,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE flowrun_jobs
            SET retries = $2,
                due_date = $3,
                exception_message = $4,
                exception_detail = $5,
                failed_attempts = failed_attempts + 1,
                lock_owner = NULL,
                lock_expires_at = NULL,
                revision = revision + 1
            WHERE id = $1 AND lock_owner = $6 AND revision = $7
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(to_i32("retries", update.retries)?)
        .bind(update.due_date)
        .bind(&update.message)
        .bind(&update.detail)
        .bind(owner)
        .bind(to_i64("revision", update.expected_revision)?)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.missed_write(job_id, owner).await?),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id, owner = %owner), err)]
    pub async fn delete_completed_job(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM flowrun_jobs WHERE id = $1 AND lock_owner = $2")
            .bind(job_id.0)
            .bind(owner)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_completed_job", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        Err(self.missed_write(job_id, owner).await?)
    }

    /// Why an owner-scoped write matched no row: the job is gone, someone
    /// else holds it, or it changed since it was read.
    async fn missed_write(&self, job_id: JobId, owner: &str) -> Result<JobStoreError, JobStoreError> {
        let row = sqlx::query("SELECT lock_owner FROM flowrun_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("missed_write", e))?;

        let Some(row) = row else {
            return Ok(JobStoreError::NotFound(job_id));
        };
        let holder: Option<String> = row.try_get("lock_owner").map_err(row_error)?;
        if holder.as_deref() == Some(owner) {
            Ok(JobStoreError::Conflict(job_id))
        } else {
            Ok(JobStoreError::LockLost(job_id))
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn delete_job(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query("DELETE FROM flowrun_jobs WHERE id = $1")
            .bind(job_id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn load_exception_detail(&self, job_id: JobId) -> Result<Option<String>, JobStoreError> {
        let row = sqlx::query("SELECT exception_detail FROM flowrun_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_exception_detail", e))?;

        match row {
            Some(row) => row.try_get("exception_detail").map_err(row_error),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, query), err)]
    pub async fn query_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM flowrun_jobs
            WHERE ($1::uuid IS NULL OR execution_id = $1)
                AND ($2::uuid IS NULL OR process_instance_id = $2)
                AND ($3::uuid IS NULL OR tenant_id = $3)
                AND ($4::text IS NULL OR handler_type = $4)
                AND (NOT $5 OR exception_message IS NOT NULL)
                AND (NOT $6 OR (retries = 0 AND exception_message IS NOT NULL))
            ORDER BY created_at ASC, id ASC
            LIMIT $7
            "#
        ))
        .bind(query.execution_id.map(|e| *e.as_uuid()))
        .bind(query.process_instance_id.map(|p| *p.as_uuid()))
        .bind(query.tenant_id.map(|t| *t.as_uuid()))
        .bind(query.handler_type.as_deref())
        .bind(query.with_exception)
        .bind(query.incidents_only)
        .bind(query.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX)))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    /// Apply an operator update to one column set and return the job.
    async fn update_job(
        &self,
        operation: &str,
        job_id: JobId,
        set_clause: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Job, JobStoreError> {
        let sql = format!(
            "UPDATE flowrun_jobs SET {set_clause}, revision = revision + 1 \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        );
        let row = bind(sqlx::query(&sql).bind(job_id.0))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn update_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        let retries = to_i32("retries", retries)?;
        self.update_job("update_retries", job_id, "retries = $2", |q| q.bind(retries))
            .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn update_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        self.update_job("update_suspended", job_id, "suspended = $2", |q| q.bind(suspended))
            .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn update_due_date(
        &self,
        job_id: JobId,
        due_date: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.update_job("update_due_date", job_id, "due_date = $2", |q| q.bind(due_date))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn load_stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (
                    WHERE NOT suspended AND retries > 0 AND due_date <= $1
                        AND (lock_owner IS NULL OR lock_expires_at <= $1)
                ) AS acquirable,
                COUNT(*) FILTER (
                    WHERE lock_owner IS NOT NULL AND lock_expires_at > $1
                ) AS locked,
                COUNT(*) FILTER (WHERE due_date > $1) AS scheduled,
                COUNT(*) FILTER (WHERE suspended) AS suspended,
                COUNT(*) FILTER (
                    WHERE retries > 0 AND exception_message IS NOT NULL
                ) AS failing,
                COUNT(*) FILTER (
                    WHERE retries = 0 AND exception_message IS NOT NULL
                ) AS incidents
            FROM flowrun_jobs
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stats", e))?;

        let count = |column: &str| -> Result<usize, JobStoreError> {
            let n: i64 = row.try_get(column).map_err(row_error)?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        Ok(JobStats {
            total: count("total")?,
            acquirable: count("acquirable")?,
            locked: count("locked")?,
            scheduled: count("scheduled")?,
            suspended: count("suspended")?,
            failing: count("failing")?,
            incidents: count("incidents")?,
        })
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        self.block_on(self.insert_job(&job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.get_job(job_id))
    }

    fn acquirable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        filter: &AcquisitionFilter,
    ) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.acquirable_jobs(now, limit, filter))
    }

    fn lock(
        &self,
        job_id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
        scope: LockScope,
    ) -> Result<LockOutcome, JobStoreError> {
        self.block_on(self.lock_job(job_id, owner, lease, now, scope))
    }

    fn release(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        self.block_on(self.release_job(job_id, owner))
    }

    fn persist_failure(
        &self,
        job_id: JobId,
        owner: &str,
        update: FailureUpdate,
    ) -> Result<Job, JobStoreError> {
        self.block_on(self.record_failure(job_id, owner, update))
    }

    fn delete_completed(&self, job_id: JobId, owner: &str) -> Result<(), JobStoreError> {
        self.block_on(self.delete_completed_job(job_id, owner))
    }

    fn delete(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        self.block_on(self.delete_job(job_id))
    }

    fn exception_detail(&self, job_id: JobId) -> Result<Option<String>, JobStoreError> {
        self.block_on(self.load_exception_detail(job_id))
    }

    fn query(&self, query: &JobQuery) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.query_jobs(query))
    }

    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        self.block_on(self.update_retries(job_id, retries))
    }

    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        self.block_on(self.update_suspended(job_id, suspended))
    }

    fn set_due_date(&self, job_id: JobId, due_date: DateTime<Utc>) -> Result<Job, JobStoreError> {
        self.block_on(self.update_due_date(job_id, due_date))
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        self.block_on(self.load_stats(now))
    }
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn row_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {err}"))
}

fn to_i32(column: &str, n: u32) -> Result<i32, JobStoreError> {
    i32::try_from(n)
        .map_err(|_| JobStoreError::Storage(format!("{column} out of range for INTEGER: {n}")))
}

fn to_i64(column: &str, n: u64) -> Result<i64, JobStoreError> {
    i64::try_from(n)
        .map_err(|_| JobStoreError::Storage(format!("{column} out of range for BIGINT: {n}")))
}

/// Read back a non-negative column; a negative value means a corrupt row.
fn non_negative<T, U>(job_id: uuid::Uuid, column: &str, value: T) -> Result<U, JobStoreError>
where
    T: Copy + std::fmt::Display,
    U: TryFrom<T>,
{
    U::try_from(value).map_err(|_| {
        JobStoreError::Storage(format!("invalid {column} {value} for job {job_id}"))
    })
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    execution_id: uuid::Uuid,
    process_instance_id: Option<uuid::Uuid>,
    tenant_id: Option<uuid::Uuid>,
    handler_type: String,
    configuration: serde_json::Value,
    due_date: DateTime<Utc>,
    retries: i32,
    retry_cycle: serde_json::Value,
    failed_attempts: i32,
    lock_owner: Option<String>,
    lock_expires_at: Option<DateTime<Utc>>,
    exception_message: Option<String>,
    suspended: bool,
    priority: i64,
    revision: i64,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            tenant_id: row.try_get("tenant_id")?,
            handler_type: row.try_get("handler_type")?,
            configuration: row.try_get("configuration")?,
            due_date: row.try_get("due_date")?,
            retries: row.try_get("retries")?,
            retry_cycle: row.try_get("retry_cycle")?,
            failed_attempts: row.try_get("failed_attempts")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
            exception_message: row.try_get("exception_message")?,
            suspended: row.try_get("suspended")?,
            priority: row.try_get("priority")?,
            revision: row.try_get("revision")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let retry_cycle: RetryCycle = serde_json::from_value(row.retry_cycle).map_err(|e| {
            JobStoreError::Storage(format!("invalid retry cycle for job {}: {e}", row.id))
        })?;
        let lock = match (row.lock_owner, row.lock_expires_at) {
            (Some(owner), Some(expires_at)) => Some(JobLock { owner, expires_at }),
            _ => None,
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            execution_id: ExecutionId::from_uuid(row.execution_id),
            process_instance_id: row.process_instance_id.map(ProcessInstanceId::from_uuid),
            tenant_id: row.tenant_id.map(TenantId::from_uuid),
            handler_type: row.handler_type,
            configuration: row.configuration,
            due_date: row.due_date,
            retries: non_negative(row.id, "retries", row.retries)?,
            retry_cycle,
            failed_attempts: non_negative(row.id, "failed_attempts", row.failed_attempts)?,
            lock,
            exception_message: row.exception_message,
            suspended: row.suspended,
            priority: row.priority,
            revision: non_negative(row.id, "revision", row.revision)?,
            created_at: row.created_at,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let row = <JobRow as sqlx::FromRow<'_, _>>::from_row(row).map_err(row_error)?;
    Job::try_from(row)
}
