//! A persisted cron job scheduler for tokio applications.
//!
//! Jobs are stored as [`job::JobRecord`]s in a [`repository::JobRepository`], each with a five
//! field cron expression and a reference to the code to execute. A [`Scheduler`] loads them,
//! fires them at the instants their schedule matches, admits them under a concurrency cap,
//! executes them with a timeout and retries, and writes the outcome back to the repository.
//!
//! Job code is registered at startup in a [`executor::registry::TargetRegistry`] as named
//! services with named methods.
//!
//! # Example
//!
//! ```
//! use cronwarden::prelude::*;
//!
//! # tokio_test();
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn tokio_test() {
//! let registry = TargetRegistry::new().with_handler("cleanup", "sessions", |ctx: JobContext| async move {
//!     let older_than = ctx.params["olderThanDays"].as_u64().unwrap_or(30);
//!     Ok::<_, HandlerError>(serde_json::json!({ "olderThanDays": older_than }))
//! });
//!
//! let scheduler = Scheduler::new(InMemoryRepository::new(), registry, SchedulerConfig::default());
//! let control = JobControl::new(scheduler);
//! control.start().await.unwrap();
//!
//! let job = control
//!     .create_job(
//!         NewJob::new("expire sessions", TargetRef::new("cleanup", "sessions"), "*/15 * * * *")
//!             .with_params(serde_json::json!({ "olderThanDays": 7 }))
//!             .with_max_retries(2),
//!     )
//!     .await
//!     .unwrap();
//! assert!(job.next_run_at.is_some());
//!
//! let result = control.run_now(job.id).await.unwrap();
//! assert_eq!(result.result, Some(serde_json::json!({ "olderThanDays": 7 })));
//!
//! control.stop().await;
//! # }
//! ```
use thiserror::Error;

pub mod backoff;
pub mod config;
pub mod control;
pub mod executor;
pub mod job;
pub mod prelude;
pub mod repository;
pub mod schedule;
pub mod scheduler;

pub use control::JobControl;
pub use scheduler::Scheduler;

use config::ConfigError;
use job::JobId;
use repository::RepositoryError;
use scheduler::Rejection;

/// Errors returned by the [`Scheduler`] and [`JobControl`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("{id} was not run: {reason}")]
    Rejected { id: JobId, reason: Rejection },
    #[error("Invalid cron expression '{0}'")]
    InvalidSchedule(String),
    #[error("Error communicating with the repository")]
    Repository(#[source] RepositoryError),
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
}

impl From<RepositoryError> for SchedulerError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::JobNotFound(id) => Self::JobNotFound(id),
            error => Self::Repository(error),
        }
    }
}
