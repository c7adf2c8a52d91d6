//! Scheduler configuration.
//!
//! Every setting has a default and can be overridden from the environment with
//! [`SchedulerConfig::from_env`]:
//!
//! | Variable                                | Default |
//! |-----------------------------------------|---------|
//! | `SCHEDULER_ENABLED`                     | `true`  |
//! | `SCHEDULER_CHECK_INTERVAL_MS`           | `60000` |
//! | `SCHEDULER_MAX_CONCURRENT`              | `5`     |
//! | `SCHEDULER_AUTO_START`                  | `false` |
//! | `SCHEDULER_STUCK_JOB_THRESHOLD_MINUTES` | `30`    |
use std::{str::FromStr, time::Duration};

use chrono::TimeDelta;
use thiserror::Error;

use crate::backoff::Backoff;

pub const ENABLED: &str = "SCHEDULER_ENABLED";
pub const CHECK_INTERVAL_MS: &str = "SCHEDULER_CHECK_INTERVAL_MS";
pub const MAX_CONCURRENT: &str = "SCHEDULER_MAX_CONCURRENT";
pub const AUTO_START: &str = "SCHEDULER_AUTO_START";
pub const STUCK_JOB_THRESHOLD_MINUTES: &str = "SCHEDULER_STUCK_JOB_THRESHOLD_MINUTES";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
}

/// Configuration of a [`crate::Scheduler`].
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// When `false`, [`crate::Scheduler::start`] does nothing.
    pub enabled: bool,
    /// How often to scan the repository for due jobs.
    pub check_interval: Duration,
    /// The maximum number of jobs executing at once, manual runs excluded.
    pub max_concurrent: usize,
    /// Whether [`crate::Scheduler::auto_start`] should start the scheduler.
    pub auto_start: bool,
    /// How long a job may be marked as running before it is considered stuck.
    pub stuck_job_threshold: TimeDelta,
    /// How the delay between attempts grows from a job's `retry_delay_seconds`.
    pub retry_backoff: Backoff,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: Self::DEFAULT_CHECK_INTERVAL,
            max_concurrent: Self::DEFAULT_MAX_CONCURRENT,
            auto_start: false,
            stuck_job_threshold: Self::DEFAULT_STUCK_JOB_THRESHOLD,
            retry_backoff: Backoff::constant(),
        }
    }
}

impl SchedulerConfig {
    pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(60_000);
    pub const DEFAULT_MAX_CONCURRENT: usize = 5;
    pub const DEFAULT_STUCK_JOB_THRESHOLD: TimeDelta = TimeDelta::minutes(30);
    /// The stuck job sweep always runs at this interval.
    pub const STUCK_JOB_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

    /// The defaults overridden by any `SCHEDULER_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// The defaults overridden by the values `lookup` returns.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: parse(&lookup, ENABLED, parse_bool)?.unwrap_or(defaults.enabled),
            check_interval: parse(&lookup, CHECK_INTERVAL_MS, parse_positive)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.check_interval),
            max_concurrent: parse(&lookup, MAX_CONCURRENT, parse_positive)?
                .map(|n| n as usize)
                .unwrap_or(defaults.max_concurrent),
            auto_start: parse(&lookup, AUTO_START, parse_bool)?.unwrap_or(defaults.auto_start),
            stuck_job_threshold: parse(&lookup, STUCK_JOB_THRESHOLD_MINUTES, parse_positive)?
                .map(|minutes| TimeDelta::minutes(minutes as i64))
                .unwrap_or(defaults.stuck_job_threshold),
            retry_backoff: defaults.retry_backoff,
        })
    }

    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub const fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub const fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub const fn with_stuck_job_threshold(mut self, stuck_job_threshold: TimeDelta) -> Self {
        self.stuck_job_threshold = stuck_job_threshold;
        self
    }

    pub const fn with_retry_backoff(mut self, retry_backoff: Backoff) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    parser: fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError> {
    lookup(key)
        .map(|value| {
            parser(value.trim()).ok_or_else(|| ConfigError::InvalidValue {
                key,
                value: value.clone(),
            })
        })
        .transpose()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_positive(value: &str) -> Option<u64> {
    u64::from_str(value).ok().filter(|n| *n > 0)
}
