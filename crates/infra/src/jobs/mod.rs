//! Asynchronous job executor for the process engine.
//!
//! ## Design
//!
//! - Jobs are persisted continuations of a process execution
//! - Executors lease jobs through time-bounded store locks
//! - Failed jobs are retried per their retry cycle; exhausted jobs become incidents
//! - Failure bookkeeping never shares the business transaction
//!
//! ## Components
//!
//! - `JobStore`: persistence with lock/lease primitives (in-memory or Postgres)
//! - `RetryCycle`: next retry count and due date after a failure
//! - `FailureRecorder`: message + cause chain, persisted against the job
//! - `AcquisitionScheduler`: leases due jobs and fans them out to workers
//! - `ExecutionDispatcher`: transaction boundary around one execution attempt
//! - `JobExecutor`: lifecycle, concurrency limits and backoff

pub mod acquisition;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod failure;
pub mod postgres;
pub mod retry;
pub mod store;
pub mod tx;
pub mod types;
pub mod workflow;

#[cfg(test)]
mod scenarios;

pub use acquisition::{AcquiredBatch, AcquisitionScheduler, Backoff, SchedulerState};
pub use config::{BackoffPolicy, ConfigError, JobExecutorConfig};
pub use dispatcher::{ExecuteNowError, ExecutionDispatcher, ExecutionOutcome, FailurePhase};
pub use executor::{CycleReport, ExecutorStats, ExecutorWorker, JobExecutor, JobExecutorHandle};
pub use failure::{
    CAUSED_BY, COMMIT_FAILURE_MESSAGE, FailureRecorder, FailureReport, RecordedFailure,
    format_cause_chain,
};
pub use postgres::PostgresJobStore;
pub use retry::{DEFAULT_RETRIES, RetryCycle, RetryCycleParseError, RetryDecision};
pub use store::{
    AcquisitionFilter, InMemoryJobStore, JobQuery, JobStats, JobStore, JobStoreError,
    LockOutcome, LockScope,
};
pub use tx::{
    LocalTransaction, LocalTransactionManager, Transaction, TransactionError, TransactionHandle,
    TransactionManager,
};
pub use types::{FailureUpdate, Job, JobId, JobLock, handler_types};
pub use workflow::{
    ExecutionContext, ExecutionResolver, HandlerRegistry, JobHandler, JobRowResolver,
};
