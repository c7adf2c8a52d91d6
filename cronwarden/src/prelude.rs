//! The purpose of this module is to alleviate the need to import many of the `[cronwarden]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use cronwarden::prelude::*;
//! ```
pub use crate::backoff::{Backoff, Growth, Jitter};
pub use crate::config::SchedulerConfig;
pub use crate::control::JobControl;
pub use crate::executor::registry::{Service, TargetLoader, TargetRegistry};
pub use crate::executor::{
    ExecutionError, ExecutionResult, HandlerError, HandlerResult, JobContext, JobHandler,
};
pub use crate::job::{JobId, JobRecord, JobUpdate, NewJob, RunStatus, TargetRef};
pub use crate::repository::{memory::InMemoryRepository, JobRepository, RepositoryError};
pub use crate::scheduler::{Rejection, Scheduler, StatusSnapshot, Trigger};
pub use crate::SchedulerError;
