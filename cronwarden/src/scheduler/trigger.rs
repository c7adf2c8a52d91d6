//! Background tasks owned by the scheduler: per-job cron triggers and the periodic timers.
use std::{future::Future, ops::Sub, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{job::JobId, schedule::CronSchedule};

/// Fire slightly early and then wait out the remainder, so timer coarseness never makes a
/// trigger late.
const EARLY_WAKE: TimeDelta = TimeDelta::milliseconds(10);

/// A spawned background task which can be cancelled and awaited.
#[derive(Debug)]
pub(crate) struct TaskHandle {
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub(crate) fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Cancels the task and waits for it to exit.
    pub(crate) async fn shutdown(self) {
        self.cancel();
        let _ = self.handle.await.inspect_err(|error| {
            tracing::error!(?error, "Background task did not shut down cleanly: {error}");
        });
    }
}

/// Spawns a task calling `on_fire` at every instant matching `schedule`.
///
/// `on_fire` must not block for long: the next instant is only computed once it returns.
pub(crate) fn spawn_cron_trigger<F, Fut>(
    id: JobId,
    schedule: CronSchedule,
    on_fire: F,
) -> TaskHandle
where
    F: Fn(DateTime<Utc>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let cancellation = CancellationToken::new();
    let handle = tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            let mut previous = Utc::now();
            loop {
                let next = schedule.next_after(previous.max(Utc::now()));
                tokio::select! {
                    _ = tokio::time::sleep(early_delay(next, Utc::now())) => {
                        let delay = next - Utc::now();
                        if let Ok(delay) = delay.to_std() {
                            tokio::time::sleep(delay).await;
                        }
                        tracing::debug!(%id, %next, "Cron trigger fired for job {id}");
                        on_fire(next).await;
                        previous = next;
                    },
                    _ = cancellation.cancelled() => {
                        break;
                    },
                }
            }
            tracing::debug!(%id, "Shutting down cron trigger for job {id}");
        }
    });

    TaskHandle {
        cancellation,
        handle,
    }
}

/// Spawns a task calling `on_tick` every `period`, starting one period from now.
///
/// Ticks never overlap: a slow tick delays the following ones.
pub(crate) fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, on_tick: F) -> TaskHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let cancellation = CancellationToken::new();
    let handle = tokio::spawn({
        let cancellation = cancellation.clone();
        async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tracing::debug!(timer = name, "Running the {name} timer");
                        on_tick().await;
                    }
                    _ = cancellation.cancelled() => {
                        tracing::debug!(timer = name, "Shutting down the {name} timer");
                        break;
                    },
                }
            }
        }
    });

    TaskHandle {
        cancellation,
        handle,
    }
}

fn early_delay(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    next.sub(now)
        .sub(EARLY_WAKE)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
