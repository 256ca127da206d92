//! Seams to the workflow engine.
//!
//! The executor does not interpret process models. It asks an
//! [`ExecutionResolver`] for the execution a job continues and hands that
//! context to the [`JobHandler`] registered for the job's handler type.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use flowrun_core::{ExecutionId, ProcessInstanceId, TenantId};

use super::tx::TransactionHandle;
use super::types::{Job, JobId};

/// What a continuation needs to resume an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub tenant_id: Option<TenantId>,
    pub handler_type: String,
    pub configuration: serde_json::Value,
    /// Engine-specific execution state (variables, current activity, ...).
    pub state: serde_json::Value,
}

impl ExecutionContext {
    /// Context built from the job row alone, without engine state.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            execution_id: job.execution_id,
            process_instance_id: job.process_instance_id,
            tenant_id: job.tenant_id,
            handler_type: job.handler_type.clone(),
            configuration: job.configuration.clone(),
            state: serde_json::Value::Null,
        }
    }
}

/// Loads the execution a job continues.
pub trait ExecutionResolver: Send + Sync {
    fn resolve(&self, job: &Job) -> anyhow::Result<ExecutionContext>;
}

/// Resolver that only uses the job row.
#[derive(Debug, Default, Clone, Copy)]
pub struct JobRowResolver;

impl ExecutionResolver for JobRowResolver {
    fn resolve(&self, job: &Job) -> anyhow::Result<ExecutionContext> {
        Ok(ExecutionContext::from_job(job))
    }
}

impl<R> ExecutionResolver for Arc<R>
where
    R: ExecutionResolver + ?Sized,
{
    fn resolve(&self, job: &Job) -> anyhow::Result<ExecutionContext> {
        (**self).resolve(job)
    }
}

/// Continuation logic for one handler type.
///
/// Returning an error (or marking the transaction rollback-only) fails the
/// execution attempt; the job is retried according to its retry cycle.
pub trait JobHandler: Send + Sync {
    fn execute(&self, ctx: &ExecutionContext, tx: &mut dyn TransactionHandle) -> anyhow::Result<()>;
}

impl<F> JobHandler for F
where
    F: Fn(&ExecutionContext, &mut dyn TransactionHandle) -> anyhow::Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &ExecutionContext, tx: &mut dyn TransactionHandle) -> anyhow::Result<()> {
        self(ctx, tx)
    }
}

/// Handlers keyed by handler type.
///
/// Lookup order: exact match, then `prefix.*` patterns, then `*`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a closure for a handler type pattern.
    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&ExecutionContext, &mut dyn TransactionHandle) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
    }

    /// Register a shared handler for a handler type pattern.
    pub fn register_handler(&mut self, pattern: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(pattern.into(), handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn get(&self, handler_type: &str) -> Option<&Arc<dyn JobHandler>> {
        if let Some(h) = self.handlers.get(handler_type) {
            return Some(h);
        }

        // Longest matching prefix wins ("timer.start.*" beats "timer.*").
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = handler_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), handler))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler);
        if category.is_some() {
            return category;
        }

        self.handlers.get("*")
    }
}
