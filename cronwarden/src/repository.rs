//! The storage the scheduler reads and updates job records through.
//!
//! The repository is the single source of truth for job state: the scheduler re-reads a record
//! before every state changing decision and never keeps a long lived copy.
//!
//! An in memory implementation is provided in [`memory`]. Implementors of [`JobRepository`]
//! can check their implementation against the [`testing::test_suite`] macro.
use async_trait::async_trait;
use chrono::TimeDelta;
use thiserror::Error;

use crate::job::{JobId, JobRecord, JobUpdate, NewJob, RunStatus};

pub mod memory;
pub mod testing;

/// Storage for [`JobRecord`]s.
#[async_trait]
pub trait JobRepository: Send + Sync + 'static {
    /// All jobs, ordered by id.
    async fn find_all(&self) -> Result<Vec<JobRecord>, RepositoryError>;
    /// All enabled jobs.
    async fn find_enabled(&self) -> Result<Vec<JobRecord>, RepositoryError>;
    /// Enabled jobs whose `next_run_at` has elapsed or was never set.
    async fn find_ready_to_run(&self) -> Result<Vec<JobRecord>, RepositoryError>;
    async fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>, RepositoryError>;
    /// Applies `update` to the job, returning the updated record.
    ///
    /// Must return [`RepositoryError::JobNotFound`] if there is no such job. The counters
    /// described by [`JobUpdate::outcome`] must be applied atomically with the rest of the
    /// update, see [`JobRecord::apply`].
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<JobRecord, RepositoryError>;
    async fn find_by_last_status(
        &self,
        status: RunStatus,
    ) -> Result<Vec<JobRecord>, RepositoryError>;
    /// Jobs marked as running which were started longer than `threshold` ago.
    async fn find_stuck_jobs(&self, threshold: TimeDelta)
        -> Result<Vec<JobRecord>, RepositoryError>;
    async fn insert(&self, job: NewJob) -> Result<JobRecord, RepositoryError>;
    /// Deletes the job, returning whether it existed.
    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("System in bad state")]
    BadState,
    #[error("Repository unavailable: {0}")]
    Unavailable(String),
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
}
