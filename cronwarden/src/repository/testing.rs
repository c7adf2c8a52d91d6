//! Test suite for ensuring a correct implementation of a repository.
use chrono::{TimeDelta, Utc};

use crate::job::{JobId, JobUpdate, NewJob, Outcome, RunStatus, TargetRef};

use super::{JobRepository, RepositoryError};

/// Create test suite for a cronwarden repository.
///
/// For repository implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use cronwarden::test_suite;
/// use cronwarden::repository::memory::InMemoryRepository;
/// test_suite!(for: InMemoryRepository::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use cronwarden::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     repository: RepositoryImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $repository:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), repository: $repository);
    };
    (attr: $attr:meta, args: $args:tt, repository: $repository:expr) => {
        #[$attr]
        async fn insert_assigns_distinct_ids $args {
          let repository = $repository;
          $crate::repository::testing::insert_assigns_distinct_ids(repository).await;
        }
        #[$attr]
        async fn find_by_id $args {
          let repository = $repository;
          $crate::repository::testing::find_by_id(repository).await;
        }
        #[$attr]
        async fn find_enabled $args {
          let repository = $repository;
          $crate::repository::testing::find_enabled(repository).await;
        }
        #[$attr]
        async fn find_ready_to_run $args {
          let repository = $repository;
          $crate::repository::testing::find_ready_to_run(repository).await;
        }
        #[$attr]
        async fn update $args {
          let repository = $repository;
          $crate::repository::testing::update(repository).await;
        }
        #[$attr]
        async fn update_applies_outcome $args {
          let repository = $repository;
          $crate::repository::testing::update_applies_outcome(repository).await;
        }
        #[$attr]
        async fn update_not_found $args {
          let repository = $repository;
          $crate::repository::testing::update_not_found(repository).await;
        }
        #[$attr]
        async fn find_by_last_status $args {
          let repository = $repository;
          $crate::repository::testing::find_by_last_status(repository).await;
        }
        #[$attr]
        async fn find_stuck_jobs $args {
          let repository = $repository;
          $crate::repository::testing::find_stuck_jobs(repository).await;
        }
        #[$attr]
        async fn delete $args {
          let repository = $repository;
          $crate::repository::testing::delete(repository).await;
        }
    };
}

pub use test_suite;

fn mock_job(name: &str) -> NewJob {
    NewJob::new(name, TargetRef::new("service", "method"), "*/5 * * * *")
}

#[doc(hidden)]
pub async fn insert_assigns_distinct_ids(repository: impl JobRepository) {
    let first = repository.insert(mock_job("first")).await.unwrap();
    let second = repository.insert(mock_job("second")).await.unwrap();

    assert_ne!(first.id, second.id);
    assert_eq!(first.name, "first");
    assert_eq!(first.last_run_status, RunStatus::Pending);
    assert_eq!(first.next_run_at, None);
    assert_eq!(
        (first.run_count, first.success_count, first.error_count),
        (0, 0, 0)
    );
}

#[doc(hidden)]
pub async fn find_by_id(repository: impl JobRepository) {
    let job = repository.insert(mock_job("job")).await.unwrap();

    assert_eq!(repository.find_by_id(job.id).await.unwrap(), Some(job));
    assert_eq!(repository.find_by_id(JobId::from(-1)).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn find_enabled(repository: impl JobRepository) {
    let enabled = repository.insert(mock_job("enabled")).await.unwrap();
    repository
        .insert(mock_job("disabled").with_enabled(false))
        .await
        .unwrap();

    let jobs = repository.find_enabled().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, enabled.id);
    assert_eq!(repository.find_all().await.unwrap().len(), 2);
}

#[doc(hidden)]
pub async fn find_ready_to_run(repository: impl JobRepository) {
    let never_run = repository.insert(mock_job("never run")).await.unwrap();
    let due = repository.insert(mock_job("due")).await.unwrap();
    let future = repository.insert(mock_job("future")).await.unwrap();
    let disabled = repository
        .insert(mock_job("disabled").with_enabled(false))
        .await
        .unwrap();

    let now = Utc::now();
    repository
        .update(
            due.id,
            JobUpdate::default().with_next_run_at(now - TimeDelta::minutes(1)),
        )
        .await
        .unwrap();
    repository
        .update(
            future.id,
            JobUpdate::default().with_next_run_at(now + TimeDelta::hours(1)),
        )
        .await
        .unwrap();
    repository
        .update(
            disabled.id,
            JobUpdate::default().with_next_run_at(now - TimeDelta::minutes(1)),
        )
        .await
        .unwrap();

    let mut ready = repository
        .find_ready_to_run()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect::<Vec<_>>();
    ready.sort();
    assert_eq!(ready, vec![never_run.id, due.id]);
}

#[doc(hidden)]
pub async fn update(repository: impl JobRepository) {
    let job = repository.insert(mock_job("job")).await.unwrap();
    let started = Utc::now();

    let updated = repository
        .update(
            job.id,
            JobUpdate::started(started).with_updated_by(Some("tester".to_owned())),
        )
        .await
        .unwrap();

    assert_eq!(updated.last_run_status, RunStatus::Running);
    assert_eq!(updated.last_run_at, Some(started));
    assert_eq!(updated.updated_by.as_deref(), Some("tester"));
    assert_eq!(updated.name, job.name);
    assert!(updated.updated_at >= job.updated_at);
    assert_eq!(
        repository.find_by_id(job.id).await.unwrap(),
        Some(updated)
    );
}

#[doc(hidden)]
pub async fn update_applies_outcome(repository: impl JobRepository) {
    let job = repository.insert(mock_job("job")).await.unwrap();

    repository
        .update(
            job.id,
            JobUpdate {
                last_run_status: Some(RunStatus::Error),
                last_run_error: Some(Some("boom".to_owned())),
                outcome: Some(Outcome::Failure),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let job = repository
        .update(
            job.id,
            JobUpdate {
                last_run_status: Some(RunStatus::Success),
                last_run_error: Some(None),
                outcome: Some(Outcome::Success),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(job.run_count, 2);
    assert_eq!(job.success_count, 1);
    assert_eq!(job.error_count, 1);
    assert_eq!(job.last_run_status, RunStatus::Success);
    assert_eq!(job.last_run_error, None);
}

#[doc(hidden)]
pub async fn update_not_found(repository: impl JobRepository) {
    let id = JobId::from(-1);
    let result = repository.update(id, JobUpdate::default()).await;
    assert!(
        matches!(&result, Err(RepositoryError::JobNotFound(missing)) if *missing == id),
        "Expected JobNotFound, got {result:?}"
    );
}

#[doc(hidden)]
pub async fn find_by_last_status(repository: impl JobRepository) {
    let running = repository.insert(mock_job("running")).await.unwrap();
    repository.insert(mock_job("pending")).await.unwrap();
    repository
        .update(running.id, JobUpdate::started(Utc::now()))
        .await
        .unwrap();

    let jobs = repository
        .find_by_last_status(RunStatus::Running)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, running.id);
    assert_eq!(
        repository
            .find_by_last_status(RunStatus::Pending)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[doc(hidden)]
pub async fn find_stuck_jobs(repository: impl JobRepository) {
    let stuck = repository.insert(mock_job("stuck")).await.unwrap();
    let recent = repository.insert(mock_job("recent")).await.unwrap();
    let finished = repository.insert(mock_job("finished")).await.unwrap();
    let now = Utc::now();

    repository
        .update(stuck.id, JobUpdate::started(now - TimeDelta::hours(1)))
        .await
        .unwrap();
    repository
        .update(recent.id, JobUpdate::started(now - TimeDelta::minutes(5)))
        .await
        .unwrap();
    repository
        .update(
            finished.id,
            JobUpdate {
                last_run_at: Some(now - TimeDelta::hours(1)),
                last_run_status: Some(RunStatus::Success),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let jobs = repository
        .find_stuck_jobs(TimeDelta::minutes(30))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, stuck.id);
}

#[doc(hidden)]
pub async fn delete(repository: impl JobRepository) {
    let job = repository.insert(mock_job("job")).await.unwrap();

    assert!(repository.delete(job.id).await.unwrap());
    assert!(!repository.delete(job.id).await.unwrap());
    assert_eq!(repository.find_by_id(job.id).await.unwrap(), None);
}
