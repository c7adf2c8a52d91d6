//! Operations for managing jobs while the scheduler runs.
//!
//! [`JobControl`] is the surface an administrative API would call. It keeps the repository and
//! the live scheduler consistent: creating or enabling a job registers its cron trigger, deleting
//! a job removes it.
use crate::{
    executor::ExecutionResult,
    job::{JobId, JobRecord, JobUpdate, NewJob},
    repository::JobRepository,
    schedule,
    scheduler::{Scheduler, StatusSnapshot},
    SchedulerError,
};

/// Job management on top of a [`Scheduler`].
#[derive(Debug)]
pub struct JobControl<R: JobRepository> {
    scheduler: Scheduler<R>,
}

impl<R: JobRepository> Clone for JobControl<R> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<R: JobRepository> JobControl<R> {
    pub fn new(scheduler: Scheduler<R>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &Scheduler<R> {
        &self.scheduler
    }

    /// Stores a new job and schedules it.
    ///
    /// The returned record has its first `next_run_at` computed.
    pub async fn create_job(&self, job: NewJob) -> Result<JobRecord, SchedulerError> {
        if !schedule::is_valid(&job.schedule) {
            return Err(SchedulerError::InvalidSchedule(job.schedule));
        }
        let job = self.scheduler.repository().insert(job).await?;
        tracing::info!(id = %job.id, name = %job.name, "Created job {}", job.id);
        self.scheduler.reload_job(job.id).await
    }

    /// Enables or disables a job, registering or removing its cron trigger.
    pub async fn set_enabled(
        &self,
        id: JobId,
        enabled: bool,
        updated_by: Option<String>,
    ) -> Result<JobRecord, SchedulerError> {
        self.scheduler
            .repository()
            .update(
                id,
                JobUpdate::default()
                    .with_enabled(enabled)
                    .with_updated_by(updated_by),
            )
            .await?;
        tracing::info!(%id, enabled, "Set job {id} enabled to {enabled}");
        self.scheduler.reload_job(id).await
    }

    /// Removes a job's cron trigger and deletes it.
    ///
    /// An execution already in flight runs to completion, but its outcome is not recorded.
    pub async fn delete_job(&self, id: JobId) -> Result<(), SchedulerError> {
        self.scheduler.unschedule(id);
        if !self.scheduler.repository().delete(id).await? {
            return Err(SchedulerError::JobNotFound(id));
        }
        tracing::info!(%id, "Deleted job {id}");
        Ok(())
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobRecord, SchedulerError> {
        self.scheduler
            .repository()
            .find_by_id(id)
            .await?
            .ok_or(SchedulerError::JobNotFound(id))
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>, SchedulerError> {
        Ok(self.scheduler.repository().find_all().await?)
    }

    pub async fn run_now(&self, id: JobId) -> Result<ExecutionResult, SchedulerError> {
        self.scheduler.run_job_now(id).await
    }

    pub async fn reload(&self, id: JobId) -> Result<JobRecord, SchedulerError> {
        self.scheduler.reload_job(id).await
    }

    pub async fn reload_all(&self) -> Result<(), SchedulerError> {
        self.scheduler.reload_all_jobs().await
    }

    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.scheduler.start().await
    }

    pub async fn stop(&self) {
        self.scheduler.stop().await
    }

    pub fn status(&self) -> StatusSnapshot {
        self.scheduler.status()
    }
}
