//! The in-process running set.
//!
//! Admission reserves a slot for a job id before any storage is touched. The check for an
//! existing execution, the concurrency cap and the insertion happen under a single lock, so of two
//! near simultaneous triggers for the same id exactly one wins.
use std::{
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard},
};

use fxhash::FxHashMap;
use serde::Serialize;
use thiserror::Error;

use crate::job::JobId;

/// What caused an execution to be requested.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// The job's own cron trigger fired.
    Cron,
    /// A periodic scan found the job due.
    Scan,
    /// An operator asked for the job to run now. Not subject to the concurrency cap.
    Manual,
}

impl Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Cron => "cron",
            Self::Scan => "scan",
            Self::Manual => "manual",
        })
    }
}

/// Why an execution was not admitted.
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
pub enum Rejection {
    #[error("job is already running in this process")]
    AlreadyRunning,
    #[error("the maximum number of concurrent jobs ({0}) is running")]
    AtCapacity(usize),
    #[error("job is disabled")]
    Disabled,
    #[error("job is marked as running in storage")]
    RunningInStorage,
}

#[derive(Debug, Default)]
struct Slots {
    jobs: FxHashMap<JobId, u64>,
    generation: u64,
}

/// The set of job ids currently executing in this process.
#[derive(Debug, Default)]
pub(crate) struct RunningJobs {
    slots: Mutex<Slots>,
}

impl RunningJobs {
    pub(crate) fn new() -> Arc<Self> {
        Arc::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserves a slot for `id`, applying `max_concurrent` unless the trigger is manual.
    pub(crate) fn reserve(
        self: &Arc<Self>,
        id: JobId,
        trigger: Trigger,
        max_concurrent: usize,
    ) -> Result<RunningGuard, Rejection> {
        let mut slots = self.slots();
        if slots.jobs.contains_key(&id) {
            return Err(Rejection::AlreadyRunning);
        }
        if trigger != Trigger::Manual && slots.jobs.len() >= max_concurrent {
            return Err(Rejection::AtCapacity(max_concurrent));
        }
        slots.generation += 1;
        let generation = slots.generation;
        slots.jobs.insert(id, generation);
        Ok(RunningGuard {
            running: self.clone(),
            id,
            generation,
        })
    }

    /// Frees the slot held for `id`, whoever holds it.
    pub(crate) fn release(&self, id: JobId) -> bool {
        self.slots().jobs.remove(&id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.slots().jobs.contains_key(&id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots().jobs.len()
    }

    /// The running ids in ascending order.
    pub(crate) fn ids(&self) -> Vec<JobId> {
        let mut ids = self.slots().jobs.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

/// A reservation in [`RunningJobs`], released when dropped.
///
/// Only the reservation this guard made is released: if the slot was freed by the stuck job
/// sweep and taken by a new execution in the meantime, the new reservation is left alone.
#[derive(Debug)]
pub(crate) struct RunningGuard {
    running: Arc<RunningJobs>,
    id: JobId,
    generation: u64,
}

impl RunningGuard {
    pub(crate) fn id(&self) -> JobId {
        self.id
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut slots = self.running.slots();
        if slots.jobs.get(&self.id) == Some(&self.generation) {
            slots.jobs.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    fn id(n: i64) -> JobId {
        JobId::from(n)
    }

    #[test]
    fn reserve_and_release_on_drop() {
        let running = RunningJobs::new();
        let guard = running.reserve(id(1), Trigger::Scan, 5).unwrap();
        assert!(running.contains(id(1)));
        assert_eq!(guard.id(), id(1));

        drop(guard);
        assert!(!running.contains(id(1)));
        assert_eq!(running.len(), 0);
    }

    #[test]
    fn rejects_duplicate_for_every_trigger() {
        let running = RunningJobs::new();
        let _guard = running.reserve(id(1), Trigger::Cron, 5).unwrap();

        for trigger in [Trigger::Cron, Trigger::Scan, Trigger::Manual] {
            assert_matches!(
                running.reserve(id(1), trigger, 5),
                Err(Rejection::AlreadyRunning)
            );
        }
        assert_eq!(running.len(), 1);
    }

    #[test]
    fn cap_applies_to_non_manual_triggers() {
        let running = RunningJobs::new();
        let _first = running.reserve(id(1), Trigger::Scan, 2).unwrap();
        let _second = running.reserve(id(2), Trigger::Cron, 2).unwrap();

        assert_matches!(
            running.reserve(id(3), Trigger::Scan, 2),
            Err(Rejection::AtCapacity(2))
        );
        assert_matches!(
            running.reserve(id(3), Trigger::Cron, 2),
            Err(Rejection::AtCapacity(2))
        );
        let _manual = running.reserve(id(3), Trigger::Manual, 2).unwrap();
        assert_eq!(running.ids(), vec![id(1), id(2), id(3)]);
    }

    #[test]
    fn stale_guard_leaves_new_reservation() {
        let running = RunningJobs::new();
        let stale = running.reserve(id(1), Trigger::Scan, 5).unwrap();

        assert!(running.release(id(1)));
        let fresh = running.reserve(id(1), Trigger::Scan, 5).unwrap();

        drop(stale);
        assert!(running.contains(id(1)));
        drop(fresh);
        assert!(!running.contains(id(1)));
        assert!(!running.release(id(1)));
    }

    #[test]
    fn concurrent_reservations_admit_one() {
        let running = RunningJobs::new();
        let admitted = std::thread::scope(|scope| {
            let handles = (0..8)
                .map(|_| {
                    let running = running.clone();
                    scope.spawn(move || {
                        running
                            .reserve(id(7), Trigger::Manual, 5)
                            .map(std::mem::forget)
                            .is_ok()
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|admitted| *admitted)
                .count()
        });
        assert_eq!(admitted, 1);
    }
}
