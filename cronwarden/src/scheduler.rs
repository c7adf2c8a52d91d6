//! The scheduler core.
//!
//! A [`Scheduler`] drives job execution from three sources:
//!
//! - a cron trigger per enabled job, firing at the instants its schedule matches,
//! - a periodic scan for jobs whose `next_run_at` has elapsed, every
//!   [`SchedulerConfig::check_interval`],
//! - [`Scheduler::run_job_now`].
//!
//! All three go through the same admission: a job is only executed when no other execution of
//! it is in flight in this process, when the concurrency cap allows it (manual runs bypass the
//! cap), and when the freshly read record is enabled and not marked as running. An admitted job
//! is marked as running in the repository, executed with retries, and its outcome and next run
//! time are persisted in a single update.
//!
//! Independently, a sweep runs every [`SchedulerConfig::STUCK_JOB_SWEEP_INTERVAL`] resetting
//! jobs which have been marked as running for longer than
//! [`SchedulerConfig::stuck_job_threshold`].
//!
//! # Example
//!
//! ```
//! use cronwarden::prelude::*;
//!
//! # tokio_test();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test() {
//! let registry = TargetRegistry::new().with_handler("reports", "nightly", |_ctx: JobContext| async {
//!     Ok::<_, HandlerError>(serde_json::json!({ "rows": 10 }))
//! });
//! let repository = InMemoryRepository::new();
//! let job = repository
//!     .insert(NewJob::new("nightly report", TargetRef::new("reports", "nightly"), "0 2 * * *"))
//!     .await
//!     .unwrap();
//!
//! let scheduler = Scheduler::new(repository, registry, SchedulerConfig::default());
//! scheduler.start().await.unwrap();
//!
//! let result = scheduler.run_job_now(job.id).await.unwrap();
//! assert!(result.success);
//!
//! scheduler.stop().await;
//! # }
//! ```
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use fxhash::FxHashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::Instrument;

use crate::{
    backoff,
    config::SchedulerConfig,
    executor::{registry::TargetLoader, ExecutionResult, JobExecutor},
    job::{JobId, JobRecord, JobUpdate, Outcome, RunStatus},
    repository::JobRepository,
    schedule::{self, CronSchedule},
    SchedulerError,
};

mod admission;
mod trigger;

pub use admission::{Rejection, Trigger};
use admission::{RunningGuard, RunningJobs};
use trigger::TaskHandle;

/// The error recorded on a job reset by the stuck job sweep.
pub const STUCK_JOB_ERROR: &str =
    "Job exceeded the stuck job threshold and was reset by the scheduler";

/// A point in time view of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub running: bool,
    pub running_job_ids: Vec<JobId>,
    pub scheduled_job_count: usize,
    pub max_concurrent: usize,
}

/// Handle to a job scheduler.
///
/// Cloning is cheap and every clone controls the same scheduler.
pub struct Scheduler<R: JobRepository> {
    inner: Arc<Inner<R>>,
}

impl<R: JobRepository> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: JobRepository> std::fmt::Debug for Scheduler<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

struct Inner<R> {
    repository: R,
    executor: JobExecutor,
    config: SchedulerConfig,
    state: Mutex<State>,
    running: Arc<RunningJobs>,
}

#[derive(Debug, Default)]
struct State {
    started: bool,
    timers: Vec<TaskHandle>,
    triggers: FxHashMap<JobId, TaskHandle>,
}

impl<R: JobRepository> Scheduler<R> {
    pub fn new(repository: R, loader: impl TargetLoader + 'static, config: SchedulerConfig) -> Self {
        Self::with_executor(repository, JobExecutor::new(loader), config)
    }

    pub fn with_executor(repository: R, executor: JobExecutor, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                executor,
                config,
                state: Default::default(),
                running: RunningJobs::new(),
            }),
        }
    }

    pub fn repository(&self) -> &R {
        &self.inner.repository
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.inner.executor
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().started
    }

    /// Starts the scheduler.
    ///
    /// Registers a cron trigger for every enabled job and starts the scan and stuck job sweep
    /// timers. Does nothing if the scheduler is already running or disabled by configuration.
    ///
    /// Fails if the enabled jobs cannot be loaded, in which case the scheduler stays stopped.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        if !self.inner.config.enabled {
            tracing::warn!("Scheduler is disabled by configuration, not starting");
            return Ok(());
        }
        if self.is_running() {
            tracing::warn!("Scheduler is already running");
            return Ok(());
        }

        let jobs = self.inner.repository.find_enabled().await.inspect_err(|error| {
            tracing::error!(?error, "Failed to load enabled jobs: {error}");
        })?;

        let mut state = self.inner.state();
        if state.started {
            tracing::warn!("Scheduler is already running");
            return Ok(());
        }
        state.started = true;
        for job in &jobs {
            self.register_trigger(&mut state, job);
        }
        state.timers = vec![
            trigger::spawn_periodic("scan", self.inner.config.check_interval, {
                let inner = self.inner.clone();
                move || {
                    let inner = inner.clone();
                    async move { inner.scan_due_jobs().await }
                }
            }),
            trigger::spawn_periodic("stuck job sweep", SchedulerConfig::STUCK_JOB_SWEEP_INTERVAL, {
                let inner = self.inner.clone();
                move || {
                    let inner = inner.clone();
                    async move { inner.sweep_stuck_jobs().await }
                }
            }),
        ];
        tracing::info!(
            scheduled_jobs = state.triggers.len(),
            check_interval_ms = self.inner.config.check_interval.as_millis() as u64,
            max_concurrent = self.inner.config.max_concurrent,
            "Scheduler started with {} scheduled jobs",
            state.triggers.len()
        );
        Ok(())
    }

    /// Starts the scheduler if [`SchedulerConfig::auto_start`] is set.
    pub async fn auto_start(&self) -> Result<(), SchedulerError> {
        if self.inner.config.auto_start {
            self.start().await
        } else {
            tracing::debug!("Scheduler auto start is disabled");
            Ok(())
        }
    }

    /// Stops the timers and every cron trigger, waiting for their tasks to exit.
    ///
    /// Executions already in flight are not interrupted.
    pub async fn stop(&self) {
        let (timers, triggers) = {
            let mut state = self.inner.state();
            if !state.started {
                tracing::debug!("Scheduler is not running");
            }
            state.started = false;
            (
                std::mem::take(&mut state.timers),
                std::mem::take(&mut state.triggers),
            )
        };
        tracing::debug!("Shutting down scheduler tasks");
        futures::future::join_all(
            timers
                .into_iter()
                .chain(triggers.into_values())
                .map(TaskHandle::shutdown),
        )
        .await;
        tracing::info!("Scheduler stopped");
    }

    /// Re-reads a job, replacing its cron trigger and persisting its next run time.
    ///
    /// A disabled job only has its trigger cancelled. A trigger is only registered while the
    /// scheduler is running.
    #[tracing::instrument(skip(self))]
    pub async fn reload_job(&self, id: JobId) -> Result<JobRecord, SchedulerError> {
        let job = self
            .inner
            .repository
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::JobNotFound(id))?;

        self.unschedule(id);
        if !job.enabled {
            tracing::info!(%id, "Job {id} is disabled, trigger removed");
            return Ok(job);
        }

        let next_run_at = schedule::next_run_or_fallback(&job.schedule, Utc::now());
        let job = self
            .inner
            .repository
            .update(id, JobUpdate::default().with_next_run_at(next_run_at))
            .await?;

        let mut state = self.inner.state();
        if state.started {
            self.register_trigger(&mut state, &job);
        }
        tracing::info!(%id, %next_run_at, "Reloaded job {id}");
        Ok(job)
    }

    /// Cancels every cron trigger and registers them again from the enabled jobs.
    ///
    /// The scan and sweep timers are left alone. Does nothing when the scheduler is stopped.
    pub async fn reload_all_jobs(&self) -> Result<(), SchedulerError> {
        if !self.is_running() {
            tracing::debug!("Scheduler is not running, nothing to reload");
            return Ok(());
        }
        let jobs = self.inner.repository.find_enabled().await.inspect_err(|error| {
            tracing::error!(?error, "Failed to load enabled jobs: {error}");
        })?;

        let mut state = self.inner.state();
        for (_, handle) in state.triggers.drain() {
            handle.cancel();
        }
        if state.started {
            for job in &jobs {
                self.register_trigger(&mut state, job);
            }
        }
        tracing::info!(
            scheduled_jobs = state.triggers.len(),
            "Reloaded {} scheduled jobs",
            state.triggers.len()
        );
        Ok(())
    }

    /// Cancels the cron trigger of a job, returning whether it had one.
    pub fn unschedule(&self, id: JobId) -> bool {
        match self.inner.state().triggers.remove(&id) {
            Some(handle) => {
                handle.cancel();
                tracing::debug!(%id, "Removed cron trigger for job {id}");
                true
            }
            None => false,
        }
    }

    /// Executes a job immediately, regardless of its schedule.
    ///
    /// The concurrency cap does not apply, the in-flight checks do.
    pub async fn run_job_now(&self, id: JobId) -> Result<ExecutionResult, SchedulerError> {
        tracing::info!(%id, "Manually running job {id}");
        self.inner.clone().execute_job(id, Trigger::Manual).await
    }

    pub fn status(&self) -> StatusSnapshot {
        let (running, scheduled_job_count) = {
            let state = self.inner.state();
            (state.started, state.triggers.len())
        };
        StatusSnapshot {
            running,
            running_job_ids: self.inner.running.ids(),
            scheduled_job_count,
            max_concurrent: self.inner.config.max_concurrent,
        }
    }

    fn register_trigger(&self, state: &mut State, job: &JobRecord) {
        let id = job.id;
        if !schedule::is_valid(&job.schedule) {
            tracing::error!(
                %id,
                schedule = %job.schedule,
                "Invalid schedule '{}' for job {id}, not scheduling it",
                job.schedule
            );
            return;
        }
        let schedule = match job.schedule.parse::<CronSchedule>() {
            Ok(schedule) => schedule,
            Err(error) => {
                tracing::error!(%id, %error, "Failed to parse schedule for job {id}: {error}");
                return;
            }
        };

        let handle = trigger::spawn_cron_trigger(id, schedule, {
            let inner = self.inner.clone();
            move |_| {
                let inner = inner.clone();
                async move {
                    tokio::spawn(inner.execute_job(id, Trigger::Cron).in_current_span());
                }
            }
        });
        if let Some(previous) = state.triggers.insert(id, handle) {
            previous.cancel();
        }
        tracing::debug!(%id, schedule = %job.schedule, "Scheduled job {id}");
    }
}

impl<R: JobRepository> Inner<R> {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reserve(&self, id: JobId, trigger: Trigger) -> Result<RunningGuard, Rejection> {
        self.running
            .reserve(id, trigger, self.config.max_concurrent)
            .inspect_err(|reason| {
                tracing::debug!(%id, %trigger, %reason, "Job {id} not admitted: {reason}");
            })
    }

    async fn execute_job(
        self: Arc<Self>,
        id: JobId,
        trigger: Trigger,
    ) -> Result<ExecutionResult, SchedulerError> {
        let guard = self
            .reserve(id, trigger)
            .map_err(|reason| SchedulerError::Rejected { id, reason })?;
        self.execute_reserved(guard, trigger).await
    }

    /// Runs the job holding `guard` to completion, retries included.
    #[tracing::instrument(skip(self, guard), fields(job_id = %guard.id()))]
    async fn execute_reserved(
        &self,
        guard: RunningGuard,
        trigger: Trigger,
    ) -> Result<ExecutionResult, SchedulerError> {
        let id = guard.id();
        let job = self
            .repository
            .find_by_id(id)
            .await
            .inspect_err(|error| {
                tracing::error!(%id, ?error, "Failed to read job {id}: {error}");
            })?
            .ok_or(SchedulerError::JobNotFound(id))?;

        let rejection = if !job.enabled {
            Some(Rejection::Disabled)
        } else if job.is_running() {
            Some(Rejection::RunningInStorage)
        } else {
            None
        };
        if let Some(reason) = rejection {
            tracing::debug!(%id, %trigger, %reason, "Job {id} not admitted: {reason}");
            return Err(SchedulerError::Rejected { id, reason });
        }

        let started_at = Utc::now();
        self.repository
            .update(id, JobUpdate::started(started_at))
            .await
            .inspect_err(|error| {
                tracing::error!(%id, ?error, "Failed to mark job {id} as running: {error}");
            })?;
        tracing::info!(%id, %trigger, name = %job.name, "Starting job {id}");

        let start = Instant::now();
        let mut result = self.run_attempts(&job).await;
        result.duration_ms = start.elapsed().as_millis() as u64;

        let status = if result.success {
            RunStatus::Success
        } else if result.is_timeout() {
            RunStatus::Timeout
        } else {
            RunStatus::Error
        };
        let finished_at = Utc::now();
        let next_run_at = schedule::next_run_or_fallback(&job.schedule, finished_at);
        let update = JobUpdate {
            last_run_at: Some(started_at),
            last_run_status: Some(status),
            last_run_error: Some(result.error_message()),
            last_run_duration_ms: Some(result.duration_ms),
            next_run_at: Some(Some(next_run_at)),
            outcome: Some(if result.success {
                Outcome::Success
            } else {
                Outcome::Failure
            }),
            ..Default::default()
        };
        self.repository
            .update(id, update)
            .await
            .inspect_err(|error| {
                tracing::error!(%id, ?error, "Failed to record the outcome of job {id}: {error}");
            })?;

        match &result.error {
            None => tracing::info!(
                %id,
                duration_ms = result.duration_ms,
                %next_run_at,
                "Job {id} completed successfully"
            ),
            Some(error) => tracing::error!(
                %id,
                %status,
                duration_ms = result.duration_ms,
                %next_run_at,
                "Job {id} failed after {} attempts: {error}",
                job.max_attempts()
            ),
        }
        drop(guard);
        Ok(result)
    }

    async fn run_attempts(&self, job: &JobRecord) -> ExecutionResult {
        let id = job.id;
        let max_attempts = job.max_attempts();
        let base = i64::try_from(job.retry_delay_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .map_or(backoff::MAX_DELAY, |base| base.min(backoff::MAX_DELAY));
        let mut attempt = 1;
        loop {
            let result = self.executor.execute(job, attempt).await;
            if result.success || attempt >= max_attempts {
                return result;
            }
            let delay = self.config.retry_backoff.delay(base, attempt);
            tracing::warn!(
                %id,
                attempt,
                max_attempts,
                delay_ms = delay.num_milliseconds(),
                "Attempt {attempt}/{max_attempts} of job {id} failed, retrying in {delay}"
            );
            tokio::time::sleep(delay.to_std().unwrap_or(Duration::ZERO)).await;
            attempt += 1;
        }
    }

    /// Admits every due job the concurrency cap allows, executing each on its own task.
    pub(crate) async fn scan_due_jobs(self: &Arc<Self>) {
        let jobs = match self.repository.find_ready_to_run().await {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::error!(?error, "Failed to find jobs ready to run: {error}");
                return;
            }
        };
        tracing::debug!(ready = jobs.len(), "Found {} jobs ready to run", jobs.len());

        for job in jobs {
            let Ok(guard) = self.reserve(job.id, Trigger::Scan) else {
                continue;
            };
            tokio::spawn({
                let inner = self.clone();
                async move {
                    let _ = inner.execute_reserved(guard, Trigger::Scan).await;
                }
                .in_current_span()
            });
        }
    }

    /// Resets jobs which have been running for longer than the stuck job threshold.
    pub(crate) async fn sweep_stuck_jobs(&self) {
        let threshold = self.config.stuck_job_threshold;
        let jobs = match self.repository.find_stuck_jobs(threshold).await {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::error!(?error, "Failed to find stuck jobs: {error}");
                return;
            }
        };

        for job in jobs {
            let id = job.id;
            // The job may have finished and started again since it was found.
            match self.repository.find_by_id(id).await {
                Ok(Some(current))
                    if current.is_running() && current.last_run_at == job.last_run_at => {}
                Ok(_) => {
                    tracing::debug!(%id, "Job {id} is no longer stuck, leaving it alone");
                    continue;
                }
                Err(error) => {
                    tracing::error!(%id, ?error, "Failed to re-read stuck job {id}: {error}");
                    continue;
                }
            }
            let update = JobUpdate {
                last_run_status: Some(RunStatus::Timeout),
                last_run_error: Some(Some(STUCK_JOB_ERROR.to_owned())),
                ..Default::default()
            };
            match self.repository.update(id, update).await {
                Ok(_) => {
                    self.running.release(id);
                    tracing::warn!(
                        %id,
                        last_run_at = ?job.last_run_at,
                        "Reset job {id} which exceeded the stuck job threshold of {threshold}"
                    );
                }
                Err(error) => {
                    tracing::error!(%id, ?error, "Failed to reset stuck job {id}: {error}");
                }
            }
        }
    }
}
