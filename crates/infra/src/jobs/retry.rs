//! Retry cycles and the retry decision.
//!
//! A job's retry cycle comes from the workflow model. Three shapes exist:
//!
//! - **Default**: a fixed number of executions; a failed job is due again
//!   immediately.
//! - **Repeating**: an ISO-8601 repeating interval (`R5/PT1H`: five retries
//!   one hour apart).
//! - **Intervals**: an ordered sequence of waits written as a comma separated
//!   list of durations (`PT1M,PT5M,PT10M`). The Nth failure schedules the next
//!   execution after the Nth interval; once the sequence is used up the next
//!   failure is terminal.
//!
//! [`RetryCycle::next_state`] is pure: it never touches the store or the clock.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::add_std_duration;

/// Executions granted by the default retry cycle.
pub const DEFAULT_RETRIES: u32 = 3;

/// How many times, and at what spacing, a failed job is retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCycle {
    /// Fixed execution count, immediate re-due.
    Default { retries: u32 },
    /// `count` retries, each `interval` after the failure.
    Repeating { count: u32, interval: Duration },
    /// One wait per retry, consumed in order.
    Intervals { intervals: Vec<Duration> },
}

impl Default for RetryCycle {
    fn default() -> Self {
        Self::Default {
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Outcome of consulting the retry cycle after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Execute again at `due_date`, with `retries` executions left.
    Retry {
        retries: u32,
        due_date: DateTime<Utc>,
    },
    /// Retries exhausted: the job becomes an incident.
    Terminal,
}

impl RetryDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryDecision::Terminal)
    }

    /// Retries remaining after applying this decision.
    pub fn retries(&self) -> u32 {
        match self {
            RetryDecision::Retry { retries, .. } => *retries,
            RetryDecision::Terminal => 0,
        }
    }
}

impl RetryCycle {
    /// Fixed execution count with immediate re-due.
    pub fn fixed(retries: u32) -> Self {
        Self::Default { retries }
    }

    /// `retries` retries spaced `interval` apart (`R<retries>/<interval>`).
    pub fn repeating(retries: u32, interval: Duration) -> Self {
        Self::Repeating {
            count: retries,
            interval,
        }
    }

    /// Explicit interval sequence.
    pub fn intervals(intervals: impl Into<Vec<Duration>>) -> Self {
        Self::Intervals {
            intervals: intervals.into(),
        }
    }

    /// Retries a freshly created job starts with.
    ///
    /// Never less than one: a zero-retry cycle still executes once.
    pub fn initial_retries(&self) -> u32 {
        let retries = match self {
            RetryCycle::Default { retries } => *retries,
            RetryCycle::Repeating { count, .. } => count.saturating_add(1),
            RetryCycle::Intervals { intervals } => {
                u32::try_from(intervals.len()).unwrap_or(u32::MAX - 1) + 1
            }
        };
        retries.max(1)
    }

    /// Decide what happens after a failure.
    ///
    /// `retries_remaining` is the job's count before this failure,
    /// `failures_so_far` the number of failures recorded before this one.
    /// Retries set by an operator beyond the end of an interval sequence reuse
    /// the last interval.
    pub fn next_state(
        &self,
        retries_remaining: u32,
        failures_so_far: u32,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        let retries = retries_remaining.saturating_sub(1);
        if retries == 0 {
            return RetryDecision::Terminal;
        }

        let due_date = match self {
            RetryCycle::Default { .. } => now,
            RetryCycle::Repeating { interval, .. } => add_std_duration(now, *interval),
            RetryCycle::Intervals { intervals } => intervals
                .get(failures_so_far as usize)
                .or_else(|| intervals.last())
                .map_or(now, |interval| add_std_duration(now, *interval)),
        };

        RetryDecision::Retry { retries, due_date }
    }
}

/// Failure to parse a retry cycle expression.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryCycleParseError {
    #[error("empty retry cycle expression")]
    Empty,
    #[error("invalid repetition count in '{0}'")]
    InvalidRepetition(String),
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
    #[error("unsupported duration unit '{unit}' in '{input}' (years and months have no fixed length)")]
    UnsupportedUnit { unit: char, input: String },
}

impl FromStr for RetryCycle {
    type Err = RetryCycleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RetryCycleParseError::Empty);
        }

        if let Some(rest) = s.strip_prefix('R') {
            let (count, duration) = rest
                .split_once('/')
                .ok_or_else(|| RetryCycleParseError::InvalidRepetition(s.to_string()))?;
            let count: u32 = count
                .parse()
                .map_err(|_| RetryCycleParseError::InvalidRepetition(s.to_string()))?;
            let interval = parse_iso_duration(duration)?;
            return Ok(RetryCycle::repeating(count, interval));
        }

        let intervals = s
            .split(',')
            .map(parse_iso_duration)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RetryCycle::intervals(intervals))
    }
}

/// Parse an ISO-8601 duration limited to fixed-length units
/// (`PnW`, `PnDTnHnMnS`, fractional seconds allowed).
pub fn parse_iso_duration(input: &str) -> Result<Duration, RetryCycleParseError> {
    let raw = input.trim();
    let invalid = || RetryCycleParseError::InvalidDuration(raw.to_string());

    let body = raw.strip_prefix('P').ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((date, time)) if !time.is_empty() => (date, Some(time)),
        Some(_) => return Err(invalid()),
        None => (body, None),
    };

    let mut total = 0f64;
    for (value, unit) in components(date_part).ok_or_else(invalid)? {
        total += match unit {
            'W' => value * 604_800.0,
            'D' => value * 86_400.0,
            'Y' | 'M' => {
                return Err(RetryCycleParseError::UnsupportedUnit {
                    unit,
                    input: raw.to_string(),
                });
            }
            _ => return Err(invalid()),
        };
    }
    if let Some(time_part) = time_part {
        for (value, unit) in components(time_part).ok_or_else(invalid)? {
            total += match unit {
                'H' => value * 3_600.0,
                'M' => value * 60.0,
                'S' => value,
                _ => return Err(invalid()),
            };
        }
    }

    let duration = Duration::try_from_secs_f64(total).map_err(|_| invalid())?;
    if chrono::Duration::from_std(duration).is_err() {
        return Err(invalid());
    }
    Ok(duration)
}

/// Split `1DT` style segments into `(value, unit)` pairs.
fn components(part: &str) -> Option<Vec<(f64, char)>> {
    let mut out = Vec::new();
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' || c == ',' {
            number.push(if c == ',' { '.' } else { c });
        } else {
            if number.is_empty() {
                return None;
            }
            let value: f64 = number.parse().ok()?;
            out.push((value, c.to_ascii_uppercase()));
            number.clear();
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(out)
}
