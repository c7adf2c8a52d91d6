//! Provides an in memory implementation of [`JobRepository`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and small single process deployments where job state does not need to survive a restart.
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use crate::job::{JobId, JobRecord, JobUpdate, NewJob, RunStatus};

use super::{JobRepository, RepositoryError};

/// An in memory implementation of [`JobRepository`].
///
/// Cloning shares the underlying storage.
#[derive(Clone, Default, Debug)]
pub struct InMemoryRepository {
    jobs: Arc<RwLock<Vec<JobRecord>>>,
    id_counter: Arc<AtomicI64>,
}

impl InMemoryRepository {
    /// Creates a new instance of [`InMemoryRepository`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `job` as is, keeping its id.
    ///
    /// Useful for seeding records with execution state, such as a job left running by a crashed
    /// process.
    pub fn put(&self, job: JobRecord) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::BadState)?;
        self.id_counter.fetch_max(job.id.into(), Ordering::SeqCst);
        match jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => {
                jobs.push(job);
                jobs.sort_by_key(|job| job.id);
            }
        }
        Ok(())
    }

    fn matching_jobs(
        &self,
        predicate: impl Fn(&JobRecord) -> bool,
    ) -> Result<Vec<JobRecord>, RepositoryError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| RepositoryError::BadState)?
            .iter()
            .filter(|job| predicate(job))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl JobRepository for InMemoryRepository {
    async fn find_all(&self) -> Result<Vec<JobRecord>, RepositoryError> {
        self.matching_jobs(|_| true)
    }

    async fn find_enabled(&self) -> Result<Vec<JobRecord>, RepositoryError> {
        self.matching_jobs(|job| job.enabled)
    }

    async fn find_ready_to_run(&self) -> Result<Vec<JobRecord>, RepositoryError> {
        let now = Utc::now();
        self.matching_jobs(|job| job.is_due(now))
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<JobRecord>, RepositoryError> {
        Ok(self.matching_jobs(|job| job.id == id)?.pop())
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<JobRecord, RepositoryError> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(RepositoryError::JobNotFound(id)),
            Some(job) => {
                job.apply(update);
                Ok(job.clone())
            }
        }
    }

    async fn find_by_last_status(
        &self,
        status: RunStatus,
    ) -> Result<Vec<JobRecord>, RepositoryError> {
        self.matching_jobs(|job| job.last_run_status == status)
    }

    async fn find_stuck_jobs(
        &self,
        threshold: TimeDelta,
    ) -> Result<Vec<JobRecord>, RepositoryError> {
        let cutoff = Utc::now() - threshold;
        self.matching_jobs(|job| {
            job.is_running() && job.last_run_at.map_or(true, |started| started < cutoff)
        })
    }

    async fn insert(&self, job: NewJob) -> Result<JobRecord, RepositoryError> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::BadState)?;
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let record = job.into_record(id.into());
        jobs.push(record.clone());
        Ok(record)
    }

    async fn delete(&self, id: JobId) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().map_err(|_| RepositoryError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        Ok(jobs.len() != before)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::test_suite;

    test_suite!(for: InMemoryRepository::new());

    #[tokio::test]
    async fn put_keeps_id_and_advances_counter() {
        let repository = InMemoryRepository::new();
        let mut job = JobRecord::raw_job();
        job.id = JobId::from(10_i64);
        repository.put(job).unwrap();

        let inserted = repository.insert(NewJob::mock_job()).await.unwrap();
        assert_eq!(inserted.id, JobId::from(11_i64));
        assert_eq!(repository.find_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn put_replaces_existing() {
        let repository = InMemoryRepository::new();
        let mut job = repository.insert(NewJob::mock_job()).await.unwrap();
        job.name = "renamed".to_owned();
        repository.put(job.clone()).unwrap();

        assert_eq!(repository.find_by_id(job.id).await.unwrap(), Some(job));
        assert_eq!(repository.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clones_share_storage() {
        let repository = InMemoryRepository::new();
        let job = repository
            .clone()
            .insert(NewJob::mock_job())
            .await
            .unwrap();
        assert!(repository.find_by_id(job.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn badstate_errors() {
        let repository = InMemoryRepository::new();
        let job = repository.insert(NewJob::mock_job()).await.unwrap();

        tokio::task::spawn({
            let repository = repository.clone();
            async move {
                let _guard = repository.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            repository.insert(NewJob::mock_job()).await,
            Err(RepositoryError::BadState)
        );
        assert_matches!(repository.find_all().await, Err(RepositoryError::BadState));
        assert_matches!(
            repository.find_by_id(job.id).await,
            Err(RepositoryError::BadState)
        );
        assert_matches!(
            repository.update(job.id, JobUpdate::default()).await,
            Err(RepositoryError::BadState)
        );
        assert_matches!(
            repository.find_stuck_jobs(TimeDelta::minutes(30)).await,
            Err(RepositoryError::BadState)
        );
        assert_matches!(repository.delete(job.id).await, Err(RepositoryError::BadState));
        assert_matches!(repository.put(job), Err(RepositoryError::BadState));
    }
}
