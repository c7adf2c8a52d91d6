//! The persisted job record and the shapes used to create and update it.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The identifier of a job record.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// The status of the most recent execution of a job.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// The job has never been executed.
    #[default]
    Pending,
    Running,
    Success,
    Error,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to the code a job executes.
///
/// The `service` and optional `path` identify a service registered with a
/// [`crate::executor::registry::TargetLoader`], the `method` names the handler on that service.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub service: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl TargetRef {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            path: None,
        }
    }

    pub fn with_path(self, path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            ..self
        }
    }
}

impl Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}::{}@{}", self.service, self.method, path),
            None => write!(f, "{}::{}", self.service, self.method),
        }
    }
}

/// A schedulable unit of work together with its execution state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub description: Option<String>,
    pub target: TargetRef,
    pub params: serde_json::Value,
    /// A 5 field cron expression: `minute hour day month weekday`.
    pub schedule: String,
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub timeout_seconds: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: RunStatus,
    pub last_run_error: Option<String>,
    pub last_run_duration_ms: Option<u64>,
    /// When [`None`] the job has never been scheduled and is eligible immediately.
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
}

impl JobRecord {
    /// Whether the job should be picked up by a scan at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.map_or(true, |next| next <= now)
    }

    pub fn is_running(&self) -> bool {
        self.last_run_status == RunStatus::Running
    }

    /// Total number of attempts the retry loop will make for one execution.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Applies a partial update, bumping `updated_at`.
    ///
    /// Repository implementations can use this to get the counter semantics of
    /// [`JobUpdate::outcome`] right.
    pub fn apply(&mut self, update: JobUpdate) {
        let JobUpdate {
            name,
            description,
            target,
            params,
            schedule,
            enabled,
            max_retries,
            retry_delay_seconds,
            timeout_seconds,
            last_run_at,
            last_run_status,
            last_run_error,
            last_run_duration_ms,
            next_run_at,
            outcome,
            updated_by,
        } = update;

        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(value) = $field {
                    self.$field = value;
                })*
            };
        }
        set!(
            name,
            description,
            target,
            params,
            schedule,
            enabled,
            max_retries,
            retry_delay_seconds,
            timeout_seconds,
            last_run_status,
            last_run_error,
            next_run_at
        );
        if let Some(last_run_at) = last_run_at {
            self.last_run_at = Some(last_run_at);
        }
        if let Some(duration) = last_run_duration_ms {
            self.last_run_duration_ms = Some(duration);
        }
        if updated_by.is_some() {
            self.updated_by = updated_by;
        }
        match outcome {
            Some(Outcome::Success) => {
                self.run_count += 1;
                self.success_count += 1;
            }
            Some(Outcome::Failure) => {
                self.run_count += 1;
                self.error_count += 1;
            }
            None => {}
        }
        self.updated_at = Utc::now();
    }
}

/// The result of a completed attempt-set, used to bump the run counters.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Outcome {
    Success,
    /// Errors and timeouts both count as failures.
    Failure,
}

/// A partial update of a [`JobRecord`].
///
/// Fields left as [`None`] are not touched. Nullable fields use a nested [`Option`] so they can
/// be cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub target: Option<TargetRef>,
    pub params: Option<serde_json::Value>,
    pub schedule: Option<String>,
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_error: Option<Option<String>>,
    pub last_run_duration_ms: Option<u64>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub outcome: Option<Outcome>,
    pub updated_by: Option<String>,
}

impl JobUpdate {
    /// The update persisted when an execution is admitted.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            last_run_status: Some(RunStatus::Running),
            last_run_at: Some(at),
            ..Default::default()
        }
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..self
        }
    }

    pub fn with_next_run_at(self, next_run_at: DateTime<Utc>) -> Self {
        Self {
            next_run_at: Some(Some(next_run_at)),
            ..self
        }
    }

    pub fn with_updated_by(self, updated_by: Option<String>) -> Self {
        Self { updated_by, ..self }
    }
}

/// A job to be inserted into the repository.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub description: Option<String>,
    pub target: TargetRef,
    pub params: serde_json::Value,
    pub schedule: String,
    pub enabled: bool,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub timeout_seconds: u64,
    pub created_by: Option<String>,
}

impl NewJob {
    pub const DEFAULT_RETRY_DELAY_SECONDS: u64 = 60;
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

    pub fn new(name: impl Into<String>, target: TargetRef, schedule: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            target,
            params: serde_json::Value::Object(Default::default()),
            schedule: schedule.into(),
            enabled: true,
            max_retries: 0,
            retry_delay_seconds: Self::DEFAULT_RETRY_DELAY_SECONDS,
            timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
            created_by: None,
        }
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }

    pub fn with_params(self, params: serde_json::Value) -> Self {
        Self { params, ..self }
    }

    pub fn with_enabled(self, enabled: bool) -> Self {
        Self { enabled, ..self }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_retry_delay_seconds(self, retry_delay_seconds: u64) -> Self {
        Self {
            retry_delay_seconds,
            ..self
        }
    }

    pub fn with_timeout_seconds(self, timeout_seconds: u64) -> Self {
        Self {
            timeout_seconds,
            ..self
        }
    }

    pub fn with_created_by(self, created_by: impl Into<String>) -> Self {
        Self {
            created_by: Some(created_by.into()),
            ..self
        }
    }

    /// Builds the record as stored by a repository that assigned it `id`.
    pub fn into_record(self, id: JobId) -> JobRecord {
        let now = Utc::now();
        JobRecord {
            id,
            name: self.name,
            description: self.description,
            target: self.target,
            params: self.params,
            schedule: self.schedule,
            enabled: self.enabled,
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            timeout_seconds: self.timeout_seconds,
            last_run_at: None,
            last_run_status: RunStatus::Pending,
            last_run_error: None,
            last_run_duration_ms: None,
            next_run_at: None,
            run_count: 0,
            success_count: 0,
            error_count: 0,
            created_at: now,
            updated_at: now,
            updated_by: self.created_by.clone(),
            created_by: self.created_by,
        }
    }
}
