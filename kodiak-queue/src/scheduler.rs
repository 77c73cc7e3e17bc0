//! The Scheduler (component C): promotes due delayed jobs to waiting on a
//! periodic sweep, plus an event-driven fast path so an individual job
//! doesn't have to wait out the full sweep interval to become runnable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use kodiak_graceful_shutdown::GracefulShutdownConsumer;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::Queue;

const SCHEDULER_INTERVAL: Duration = Duration::from_secs(5);
const PROMOTE_LIMIT: u32 = 50;

impl Queue {
    /// Start this queue's background scheduler: a periodic sweep that
    /// promotes due delayed jobs and recovers stalled ones, started and
    /// torn down the same way the rest of this codebase manages its
    /// background tasks. Idempotent; calling this twice on a queue that
    /// already has a running scheduler is a no-op.
    pub fn start_scheduler(&self, mut shutdown: GracefulShutdownConsumer) {
        if self.0.scheduler_task.lock().unwrap().is_some() {
            return;
        }

        event!(Level::INFO, queue = %self.0.name, "starting queue scheduler");

        let queue = self.clone();
        let (closer_tx, closer_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown_fut = shutdown.wait_for_shutdown();
            tokio::pin!(shutdown_fut);
            tokio::pin!(closer_rx);

            let mut interval = tokio::time::interval(SCHEDULER_INTERVAL);

            loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown_fut => break,
                    _ = &mut closer_rx => break,
                    _ = interval.tick() => {},
                };

                queue.run_scheduler_sweep().await;
            }
        });

        *self.0.scheduler_task.lock().unwrap() = Some((closer_tx, task));
    }

    /// Stop the scheduler task, if one was started. Not required before
    /// dropping the queue; the last `Queue` handle going away drops the
    /// closer sender and the task exits on its own.
    pub fn stop_scheduler(&self) -> Option<JoinHandle<()>> {
        let (_, task) = self.0.scheduler_task.lock().unwrap().take()?;
        Some(task)
    }

    async fn run_scheduler_sweep(&self) {
        match self.promote_delayed_jobs(PROMOTE_LIMIT).await {
            Ok(moved) if !moved.is_empty() => {
                event!(Level::DEBUG, queue = %self.0.name, count = moved.len(), "promoted delayed jobs");
            }
            Ok(_) => {}
            Err(e) => {
                event!(Level::ERROR, queue = %self.0.name, error = %e, "error promoting delayed jobs");
            }
        }

        // recover_stalled_jobs is mutually exclusive with itself: a slow
        // sweep (large backlog, store hiccup) must not overlap with the
        // next tick's attempt.
        if self
            .0
            .recovering_stalled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let result = self.recover_stalled_jobs(PROMOTE_LIMIT).await;
            self.0.recovering_stalled.store(false, Ordering::SeqCst);

            match result {
                Ok(recovered) if !recovered.is_empty() => {
                    event!(Level::INFO, queue = %self.0.name, count = recovered.len(), "recovered stalled jobs");
                }
                Ok(_) => {}
                Err(e) => {
                    event!(Level::ERROR, queue = %self.0.name, error = %e, "error recovering stalled jobs");
                }
            }
        }
    }

    /// Arm (or replace) the in-process timer that wakes promotion for a
    /// single delayed job as soon as it's due, rather than waiting for the
    /// next periodic sweep. A real deployment additionally sets the
    /// `P:delayed:timer:<id>` key with a matching TTL so that a store-side
    /// keyspace-notification subscriber (out of process, or a second
    /// queue instance) gets the same wakeup; this in-process timer is the
    /// part of that design this crate implements directly.
    pub(crate) fn arm_delay_timer(&self, id: String, delay: Duration) {
        let queue = self.clone();
        let timer_id = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match queue.promote_delayed_jobs(PROMOTE_LIMIT).await {
                Ok(_) => {}
                Err(e) => {
                    event!(Level::ERROR, queue = %queue.0.name, job = %timer_id, error = %e, "error promoting after delay timer fired");
                }
            }
        });

        let mut timers = self.0.delay_timers.lock().unwrap();
        if let Some(previous) = timers.insert(id, handle) {
            previous.abort();
        }
    }

    pub(crate) fn set_delay_timer_key(&self, id: &str, delay: Duration) {
        let queue = self.clone();
        let key = self.0.keys.delay_timer_key(id);
        tokio::spawn(async move {
            if let Ok(mut conn) = queue.0.pool.get().await {
                let _: Result<(), _> = redis::cmd("SET")
                    .arg(&key)
                    .arg(1)
                    .arg("PX")
                    .arg(delay.as_millis().max(1) as i64)
                    .query_async(&mut *conn)
                    .await;
            }
        });
    }

    pub(crate) fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }
}
