//! The Worker Loop (component W): per-slot job processing, lock
//! heartbeats, and completion/failure reporting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use kodiak_graceful_shutdown::GracefulShutdownConsumer;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::entity::JobEntity;
use crate::job::BackoffKind;
use crate::retry::BackoffStrategies;
use crate::Queue;

/// Implemented by callers to process one job's payload. Mirrors the
/// existing queue crate's processor trait, generalized to this crate's
/// richer job entity.
#[async_trait]
pub trait JobProcessor: Clone + Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + Sync + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    async fn process(&self, job: &JobEntity<Self::Payload>) -> Result<(), Self::Error>;
}

#[derive(Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub prefetch: usize,
    pub lock_duration: Duration,
    pub graceful_shutdown_timeout: Duration,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval: Duration,
    pub backoff_strategies: BackoffStrategies,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        let lock_duration = Duration::from_millis(30_000);
        let heartbeat_interval = std::cmp::max(Duration::from_secs(1), lock_duration / 2);
        WorkerOptions {
            concurrency: 1,
            prefetch: 10,
            lock_duration,
            graceful_shutdown_timeout: Duration::from_millis(30_000),
            heartbeat_enabled: false,
            heartbeat_interval,
            backoff_strategies: BackoffStrategies::new(),
        }
    }
}

fn empty_fetch_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(100),
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_millis(1000),
        max_elapsed_time: None,
        ..Default::default()
    }
}

/// Separate, larger-capped backoff for store errors, so a degraded or
/// overloaded store isn't hammered at the same rate as a merely-idle queue.
fn store_error_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: Duration::from_millis(100),
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..Default::default()
    }
}

pub struct Worker {
    queue: Queue,
    options: Arc<WorkerOptions>,
    running: Arc<AtomicBool>,
    slots: StdMutex<Option<(oneshot::Sender<()>, Vec<JoinHandle<()>>)>>,
}

impl Worker {
    pub fn new(queue: Queue, options: WorkerOptions) -> Self {
        Worker {
            queue,
            options: Arc::new(options),
            running: Arc::new(AtomicBool::new(false)),
            slots: StdMutex::new(None),
        }
    }

    /// Start processing. Fails with `Error::AlreadyRunning` if this worker
    /// was already started and not yet stopped.
    pub fn start<P>(
        &self,
        shutdown: GracefulShutdownConsumer,
        processor: P,
    ) -> Result<(), crate::error::Error>
    where
        P: JobProcessor,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(crate::error::Error::AlreadyRunning);
        }

        event!(Level::INFO, queue = %self.queue.0.name, concurrency = self.options.concurrency, "worker starting");

        let buffer = Arc::new(StdMutex::new(VecDeque::new()));
        let refill_lock = Arc::new(AsyncMutex::new(()));
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let pid = std::process::id();
        let (closer_tx, closer_rx) = oneshot::channel::<()>();
        let closer_rx = Arc::new(AsyncMutex::new(Some(closer_rx)));

        let mut handles = Vec::with_capacity(self.options.concurrency);
        for i in 0..self.options.concurrency {
            let owner_token = format!("{}-{}:{}", pid, uuid::Uuid::new_v4(), i);
            let queue = self.queue.clone();
            let options = self.options.clone();
            let running = self.running.clone();
            let processor = processor.clone();
            let buffer = buffer.clone();
            let refill_lock = refill_lock.clone();
            let semaphore = semaphore.clone();
            let mut shutdown = shutdown.clone();
            let closer_rx = closer_rx.clone();

            handles.push(tokio::spawn(async move {
                let mut backoff = empty_fetch_backoff();
                let mut error_backoff = store_error_backoff();

                loop {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }

                    let stop_signal = async {
                        let mut guard = closer_rx.lock().await;
                        if let Some(rx) = guard.as_mut() {
                            let _ = rx.await;
                        }
                    };

                    tokio::select! {
                        biased;
                        _ = shutdown.wait_for_shutdown() => break,
                        _ = stop_signal => break,
                        job = fetch_for_slot(&queue, &buffer, &refill_lock, &options, &owner_token) => {
                            match job {
                                Ok(Some(job)) => {
                                    backoff.reset();
                                    error_backoff.reset();
                                    run_job(&queue, &options, &semaphore, &processor, job, &owner_token).await;
                                }
                                Ok(None) => {
                                    error_backoff.reset();
                                    if let Some(sleep_time) = backoff.next_backoff() {
                                        tokio::time::sleep(sleep_time).await;
                                    }
                                }
                                Err(e) => {
                                    event!(Level::ERROR, queue = %queue.0.name, error = %e, "error fetching job");
                                    if let Some(sleep_time) = error_backoff.next_backoff() {
                                        tokio::time::sleep(sleep_time).await;
                                    }
                                }
                            }
                        }
                    }
                }
            }));
        }

        *self.slots.lock().unwrap() = Some((closer_tx, handles));
        Ok(())
    }

    /// Signal all slots to stop and wait (bounded by
    /// `graceful_shutdown_timeout`) for in-flight processors to drain.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let taken = self.slots.lock().unwrap().take();
        let Some((closer_tx, handles)) = taken else {
            return;
        };
        let _ = closer_tx.send(());

        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.options.graceful_shutdown_timeout, drain)
            .await
            .is_err()
        {
            event!(Level::WARN, queue = %self.queue.0.name, "graceful shutdown timed out waiting for worker slots");
        }
    }
}

async fn fetch_for_slot(
    queue: &Queue,
    buffer: &Arc<StdMutex<VecDeque<(String, std::collections::HashMap<String, Vec<u8>>)>>>,
    refill_lock: &Arc<AsyncMutex<()>>,
    options: &WorkerOptions,
    owner_token: &str,
) -> crate::error::Result<Option<(String, std::collections::HashMap<String, Vec<u8>>)>> {
    if let Some(job) = buffer.lock().unwrap().pop_front() {
        return Ok(Some(job));
    }

    let _guard = refill_lock.lock().await;
    // Another slot may have refilled the buffer while we waited for the lock.
    if let Some(job) = buffer.lock().unwrap().pop_front() {
        return Ok(Some(job));
    }

    let prefetch = options.prefetch.max(1) as u32;
    let fetched = queue
        .fetch_next_jobs_raw(prefetch, options.lock_duration, Some(owner_token))
        .await?;

    let mut items: VecDeque<_> = fetched.into_iter().collect();
    let first = items.pop_front();
    buffer.lock().unwrap().extend(items);
    Ok(first)
}

async fn run_job<P: JobProcessor>(
    queue: &Queue,
    options: &WorkerOptions,
    semaphore: &Arc<Semaphore>,
    processor: &P,
    (id, hash): (String, std::collections::HashMap<String, Vec<u8>>),
    owner_token: &str,
) {
    let permit = match semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    let lock_expires_at = Utc::now() + chrono::Duration::from_std(options.lock_duration).unwrap_or_default();
    let entity = match JobEntity::<P::Payload>::from_hash(
        queue.clone(),
        &id,
        lock_expires_at,
        Some(owner_token.to_string()),
        &hash,
    ) {
        Ok(entity) => entity,
        Err(e) => {
            event!(Level::DEBUG, queue = %queue.0.name, job = %id, error = %e, "skipping corrupt job");
            drop(permit);
            return;
        }
    };

    let heartbeat_stop = if options.heartbeat_enabled {
        Some(spawn_heartbeat(queue.clone(), id.clone(), owner_token.to_string(), options.heartbeat_interval, options.lock_duration))
    } else {
        None
    };

    let result = processor.process(&entity).await;

    if let Some(stop) = heartbeat_stop {
        let _ = stop.send(());
    }

    match result {
        Ok(()) => match queue.mark_completed(&id).await {
            Ok(outcome) => {
                event!(Level::INFO, queue = %queue.0.name, job = %id, outcome = ?outcome, "job completed");
            }
            Err(e) => {
                event!(Level::ERROR, queue = %queue.0.name, job = %id, error = %e, "error marking job completed");
            }
        },
        Err(e) => {
            let message = e.to_string();
            let forced_next_attempt_at = match &entity.backoff {
                Some(backoff) if matches!(backoff.kind, BackoffKind::Custom(_)) => {
                    let delay = options
                        .backoff_strategies
                        .resolve(&backoff.kind, backoff.delay, entity.retry_count + 1)
                        .unwrap_or(Duration::from_millis(0));
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default())
                }
                _ => None,
            };

            match queue.mark_failed(&id, &message, forced_next_attempt_at).await {
                Ok(outcome) => {
                    event!(Level::INFO, queue = %queue.0.name, job = %id, outcome = ?outcome, "job failed");
                }
                Err(e) => {
                    event!(Level::ERROR, queue = %queue.0.name, job = %id, error = %e, "error marking job failed");
                }
            }
        }
    }

    drop(permit);
}

fn spawn_heartbeat(
    queue: Queue,
    id: String,
    owner_token: String,
    interval: Duration,
    lock_duration: Duration,
) -> oneshot::Sender<()> {
    let (tx, mut rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = &mut rx => break,
                _ = ticker.tick() => {
                    let new_expiry = Utc::now() + chrono::Duration::from_std(lock_duration).unwrap_or_default();
                    if let Err(e) = queue.extend_lock(&id, new_expiry, Some(&owner_token)).await {
                        event!(Level::WARN, queue = %queue.0.name, job = %id, error = %e, "heartbeat failed to extend lock");
                    }
                }
            }
        }
    });
    tx
}
