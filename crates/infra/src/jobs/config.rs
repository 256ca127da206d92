//! Job executor configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use flowrun_core::TenantId;

/// Invalid executor configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: String, reason: String },
}

impl ConfigError {
    fn invalid(var: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            var: var.to_string(),
            reason: reason.into(),
        }
    }
}

/// Exponential wait between empty acquisition cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BackoffPolicy {
    /// Wait after a cycle that acquired something (and the starting wait).
    pub base: Duration,
    /// Upper bound of the wait.
    pub max: Duration,
    /// Multiplier applied after each empty cycle.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Wait following `current` after an empty cycle.
    pub fn next(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.factor;
        if !next.is_finite() || next >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::try_from_secs_f64(next)
            .unwrap_or(self.base)
            .max(self.base)
    }
}

/// Job executor configuration.
#[derive(Debug, Clone, Serialize)]
pub struct JobExecutorConfig {
    /// Name for logging; also the lock owner prefix.
    pub name: String,
    /// Jobs executed concurrently.
    pub max_concurrent: usize,
    /// Candidates fetched per acquisition cycle.
    pub max_jobs_per_acquisition: usize,
    /// Lease granted to each locked job.
    pub lock_duration: Duration,
    /// Wait between acquisition cycles.
    pub backoff: BackoffPolicy,
    /// Only acquire this tenant's jobs.
    pub tenant_id: Option<TenantId>,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            name: "job-executor".to_string(),
            max_concurrent: 4,
            max_jobs_per_acquisition: 8,
            lock_duration: Duration::from_secs(300),
            backoff: BackoffPolicy::default(),
            tenant_id: None,
        }
    }
}

pub const ENV_NAME: &str = "FLOWRUN_EXECUTOR_NAME";
pub const ENV_MAX_CONCURRENT: &str = "FLOWRUN_EXECUTOR_MAX_CONCURRENT";
pub const ENV_MAX_JOBS_PER_ACQUISITION: &str = "FLOWRUN_EXECUTOR_MAX_JOBS_PER_ACQUISITION";
pub const ENV_LOCK_DURATION_MS: &str = "FLOWRUN_EXECUTOR_LOCK_DURATION_MS";
pub const ENV_BASE_WAIT_MS: &str = "FLOWRUN_EXECUTOR_BASE_WAIT_MS";
pub const ENV_MAX_WAIT_MS: &str = "FLOWRUN_EXECUTOR_MAX_WAIT_MS";
pub const ENV_BACKOFF_FACTOR: &str = "FLOWRUN_EXECUTOR_BACKOFF_FACTOR";
pub const ENV_TENANT_ID: &str = "FLOWRUN_EXECUTOR_TENANT_ID";

impl JobExecutorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.max_jobs_per_acquisition = max;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Load configuration from `FLOWRUN_EXECUTOR_*` environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `FLOWRUN_EXECUTOR_NAME` (default "job-executor")
    /// - `FLOWRUN_EXECUTOR_MAX_CONCURRENT` (default 4)
    /// - `FLOWRUN_EXECUTOR_MAX_JOBS_PER_ACQUISITION` (default 8)
    /// - `FLOWRUN_EXECUTOR_LOCK_DURATION_MS` (default 300000)
    /// - `FLOWRUN_EXECUTOR_BASE_WAIT_MS` / `FLOWRUN_EXECUTOR_MAX_WAIT_MS` (100 / 60000)
    /// - `FLOWRUN_EXECUTOR_BACKOFF_FACTOR` (default 2.0)
    /// - `FLOWRUN_EXECUTOR_TENANT_ID` (UUID, default unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup(ENV_NAME) {
            config.name = name;
        }
        if let Some(v) = parsed::<usize>(&lookup, ENV_MAX_CONCURRENT)? {
            config.max_concurrent = v;
        }
        if let Some(v) = parsed::<usize>(&lookup, ENV_MAX_JOBS_PER_ACQUISITION)? {
            config.max_jobs_per_acquisition = v;
        }
        if let Some(ms) = parsed::<u64>(&lookup, ENV_LOCK_DURATION_MS)? {
            config.lock_duration = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>(&lookup, ENV_BASE_WAIT_MS)? {
            config.backoff.base = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>(&lookup, ENV_MAX_WAIT_MS)? {
            config.backoff.max = Duration::from_millis(ms);
        }
        if let Some(factor) = parsed::<f64>(&lookup, ENV_BACKOFF_FACTOR)? {
            config.backoff.factor = factor;
        }
        if let Some(raw) = lookup(ENV_TENANT_ID) {
            let tenant = raw
                .trim()
                .parse::<TenantId>()
                .map_err(|e| ConfigError::invalid(ENV_TENANT_ID, e.to_string()))?;
            config.tenant_id = Some(tenant);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the executor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid(ENV_NAME, "must not be empty"));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid(ENV_MAX_CONCURRENT, "must be at least 1"));
        }
        if self.max_jobs_per_acquisition == 0 {
            return Err(ConfigError::invalid(
                ENV_MAX_JOBS_PER_ACQUISITION,
                "must be at least 1",
            ));
        }
        if self.lock_duration.is_zero() {
            return Err(ConfigError::invalid(ENV_LOCK_DURATION_MS, "must be positive"));
        }
        if self.backoff.base.is_zero() {
            return Err(ConfigError::invalid(ENV_BASE_WAIT_MS, "must be positive"));
        }
        if self.backoff.max < self.backoff.base {
            return Err(ConfigError::invalid(
                ENV_MAX_WAIT_MS,
                "must not be below the base wait",
            ));
        }
        if !(self.backoff.factor.is_finite() && self.backoff.factor >= 1.0) {
            return Err(ConfigError::invalid(ENV_BACKOFF_FACTOR, "must be a number >= 1"));
        }
        Ok(())
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(var, format!("'{raw}': {e}")))
        })
        .transpose()
}
