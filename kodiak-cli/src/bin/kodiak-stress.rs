use std::time::Duration;

use futures::future::try_join_all;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use kodiak_database::RedisPool;
use kodiak_graceful_shutdown::{GracefulShutdown, GracefulShutdownConsumer};
use kodiak_queue::{Job, JobId, Queue};
use serde::{Deserialize, Serialize};
use structopt::StructOpt;
use tokio::{sync::watch, task::JoinHandle};

#[derive(Debug, thiserror::Error)]
enum StressError {
    #[error(transparent)]
    Database(#[from] kodiak_database::Error),
    #[error(transparent)]
    Queue(#[from] kodiak_queue::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    RedisPool(#[from] deadpool::managed::PoolError<redis::RedisError>),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, StructOpt)]
#[structopt(about = "Throw load at a kodiak queue to exercise ordering, retries, and recovery")]
struct Args {
    #[structopt(
        long,
        required_unless = "num-jobs",
        help = "The amount of time, in seconds, to spend producing jobs"
    )]
    time: Option<u64>,
    #[structopt(
        short,
        long,
        required_unless = "time",
        conflicts_with = "time",
        help = "The number of jobs to produce"
    )]
    num_jobs: Option<usize>,
    #[structopt(short, long, default_value = "4", help = "Number of job-producing workers")]
    producers: usize,
    #[structopt(short, long, default_value = "4", help = "Number of job-consuming workers")]
    consumers: usize,
    #[structopt(
        short,
        long,
        help = "Produce all the jobs first and then consume them, instead of doing them concurrently"
    )]
    staged: bool,
    #[structopt(
        long,
        help = "The queue to run against. Normally you should omit this and let the tool generate its own"
    )]
    queue: Option<String>,
}

enum JobLimit {
    Num(usize),
    Time(Duration),
}

#[derive(Debug, Serialize, Deserialize)]
struct StressPayload {
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), StressError> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::from_args();
    let pool_size = args.consumers + args.producers + 1;
    let pool = RedisPool::with_pool_size(None, None, Some(pool_size))?;

    let queue_name = args
        .queue
        .unwrap_or_else(|| format!("stress-{}", uuid::Uuid::new_v4()));
    let queue = Queue::new(pool.clone(), &queue_name);

    let job_limit = match (args.num_jobs, args.time) {
        (Some(n), _) => JobLimit::Num(n),
        (_, Some(d)) => JobLimit::Time(Duration::from_secs(d)),
        _ => return Err(StressError::Other("neither num_jobs nor time were set".into())),
    };

    let mut shutdown = GracefulShutdown::new();

    let status_task = {
        let queue = queue.clone();
        let consumer = shutdown.consumer();
        tokio::spawn(async move { queue_status(queue, consumer).await })
    };

    let (close_consumers_tx, close_consumers_rx) = watch::channel::<bool>(false);
    if args.staged {
        let generators = generate_jobs(
            queue.clone(),
            args.producers,
            shutdown.consumer(),
            close_consumers_tx,
            job_limit,
        );
        generators.await??;

        let consumers = consume_jobs(
            queue.clone(),
            args.consumers,
            shutdown.consumer(),
            close_consumers_rx,
            true,
        );
        consumers.await??;
    } else {
        let generators = generate_jobs(
            queue.clone(),
            args.producers,
            shutdown.consumer(),
            close_consumers_tx,
            job_limit,
        );
        let consumers = consume_jobs(
            queue.clone(),
            args.consumers,
            shutdown.consumer(),
            close_consumers_rx,
            false,
        );

        let (gen_result, consumer_result) = tokio::try_join!(generators, consumers)?;
        gen_result?;
        consumer_result?;
    }

    shutdown.shutdown();
    status_task.await??;

    cleanup(pool, &queue_name).await?;

    Ok(())
}

async fn cleanup(pool: RedisPool, queue_name: &str) -> Result<(), StressError> {
    let mut conn = pool.get().await?;
    let key_pattern = format!("kodiak:{}:*", queue_name);
    let mut cmd = deadpool_redis::cmd("SCAN");
    let mut iter: redis::AsyncIter<String> = cmd
        .cursor_arg(0)
        .arg("MATCH")
        .arg(&key_pattern)
        .arg("COUNT")
        .arg(100)
        .clone()
        .iter_async(&mut *conn)
        .await?;

    let mut del_cmd = deadpool_redis::cmd("DEL");
    let mut any = false;
    while let Some(key) = iter.next_item().await {
        del_cmd.arg(&key);
        any = true;
    }
    drop(iter);

    if any {
        let _: () = del_cmd.query_async(&mut *conn).await?;
    }

    Ok(())
}

fn job_generator(
    queue: Queue,
    index: usize,
    num_jobs: usize,
    mut shutdown: GracefulShutdownConsumer,
    close: watch::Receiver<bool>,
) -> JoinHandle<Result<(), StressError>> {
    tokio::spawn(async move {
        let data = serde_json::to_vec(&StressPayload {
            data: format!("payload from generator {}", index),
        })?;

        for i in 0..num_jobs {
            let job_id = format!("w-{}-{}", index, i);
            let job = Job::from_bytes(JobId::Value(job_id.as_str()), data.as_slice());
            queue.add(&job).await?;

            if shutdown.shutting_down() || *close.borrow() {
                break;
            }
        }

        Ok(())
    })
}

fn generate_jobs(
    queue: Queue,
    num_workers: usize,
    mut shutdown: GracefulShutdownConsumer,
    done_generating: watch::Sender<bool>,
    limit: JobLimit,
) -> JoinHandle<Result<(), StressError>> {
    tokio::spawn(async move {
        let total_num_jobs = match limit {
            JobLimit::Num(n) => n,
            _ => usize::MAX,
        };

        let jobs_per_worker = total_num_jobs / num_workers.max(1);
        let round_up = total_num_jobs % num_workers.max(1);

        let (close_workers_tx, close_workers_rx) = watch::channel(false);

        let workers = (0..num_workers)
            .map(|i| {
                let mut num_jobs = jobs_per_worker;
                if i < round_up {
                    num_jobs += 1;
                }

                job_generator(
                    queue.clone(),
                    i,
                    num_jobs,
                    shutdown.clone(),
                    close_workers_rx.clone(),
                )
            })
            .collect::<Vec<_>>();

        match limit {
            JobLimit::Time(t) => {
                tokio::select! {
                    _ = tokio::time::sleep(t) => {},
                    _ = shutdown.wait_for_shutdown() => {}
                };

                close_workers_tx
                    .send(true)
                    .map_err(|_| StressError::Other("closing producer workers".to_string()))?;
                try_join_all(workers).await?.into_iter().collect::<Result<Vec<()>, StressError>>()?;
            }
            JobLimit::Num(_) => {
                tokio::select! {
                    result = try_join_all(workers) => {
                        result?.into_iter().collect::<Result<Vec<()>, StressError>>()?;
                    },
                    _ = shutdown.wait_for_shutdown() => {}
                };
            }
        };

        done_generating
            .send(true)
            .map_err(|_| StressError::Other("closing consumer channel".to_string()))?;

        Ok(())
    })
}

fn consume_jobs(
    queue: Queue,
    num_workers: usize,
    shutdown: GracefulShutdownConsumer,
    close_consumers: watch::Receiver<bool>,
    close_on_idle: bool,
) -> JoinHandle<Result<(), StressError>> {
    tokio::spawn(async move {
        let workers = (0..num_workers)
            .map(|_| {
                job_consumer(
                    queue.clone(),
                    shutdown.clone(),
                    close_consumers.clone(),
                    close_on_idle,
                )
            })
            .collect::<Vec<_>>();

        try_join_all(workers)
            .await?
            .into_iter()
            .collect::<Result<Vec<()>, StressError>>()?;

        Ok(())
    })
}

fn job_consumer(
    queue: Queue,
    mut shutdown: GracefulShutdownConsumer,
    close_consumers: watch::Receiver<bool>,
    mut close_on_idle: bool,
) -> JoinHandle<Result<(), StressError>> {
    tokio::spawn(async move {
        loop {
            match queue.fetch_next::<StressPayload>(Duration::from_millis(50)).await? {
                Some(job) => {
                    queue.mark_completed(&job.id).await?;
                }
                None => {
                    if close_on_idle {
                        break;
                    } else {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            };

            if shutdown.shutting_down() {
                break;
            } else if *close_consumers.borrow() {
                close_on_idle = true;
            }
        }

        Ok(())
    })
}

async fn queue_status(queue: Queue, mut shutdown: GracefulShutdownConsumer) -> Result<(), StressError> {
    let bars = MultiProgress::new();

    let waiting_bar = ProgressBar::new(u64::MAX)
        .with_style(ProgressStyle::default_spinner().template("{spinner} {pos} jobs waiting"));
    let active_bar = ProgressBar::new(u64::MAX)
        .with_style(ProgressStyle::default_spinner().template("{spinner} {pos} jobs active"));
    let enqueued_bar = ProgressBar::new(u64::MAX).with_style(
        ProgressStyle::default_spinner().template("{spinner} {pos} jobs enqueued ({per_sec})"),
    );
    let retrieved_bar = ProgressBar::new(u64::MAX).with_style(
        ProgressStyle::default_spinner().template("{spinner} {pos} jobs retrieved ({per_sec})"),
    );
    let done_bar = ProgressBar::new(u64::MAX).with_style(
        ProgressStyle::default_spinner().template("{spinner} {pos} jobs finished ({per_sec})"),
    );
    let error_bar = ProgressBar::new(u64::MAX).with_style(
        ProgressStyle::default_spinner().template("{spinner} {pos} jobs errored ({per_sec})"),
    );

    bars.add(waiting_bar.clone());
    bars.add(active_bar.clone());
    bars.add(enqueued_bar.clone());
    bars.add(retrieved_bar.clone());
    bars.add(done_bar.clone());
    bars.add(error_bar.clone());

    let update_task = tokio::task::spawn(async move {
        let mut exit = false;
        let mut interval = tokio::time::interval(Duration::from_millis(500));

        while !exit {
            tokio::select! {
                _ = interval.tick() => {},
                _ = shutdown.wait_for_shutdown() => {
                    exit = true;
                },
            };

            match queue.status().await {
                Ok(status) => {
                    waiting_bar.set_position(status.waiting as u64);
                    active_bar.set_position(status.active as u64);
                    enqueued_bar.set_position(status.enqueued as u64);
                    retrieved_bar.set_position(status.retrieved as u64);
                    done_bar.set_position(status.succeeded as u64);
                    error_bar.set_position(status.errored as u64);
                }
                Err(_) => break,
            };
        }

        waiting_bar.finish_at_current_pos();
        active_bar.finish_at_current_pos();
        enqueued_bar.finish_at_current_pos();
        retrieved_bar.finish_at_current_pos();
        done_bar.finish_at_current_pos();
        error_bar.finish_at_current_pos();

        Ok::<(), StressError>(())
    });

    tokio::task::spawn_blocking(move || {
        bars.join().expect("progress bars join");
    })
    .await
    .map_err(StressError::from)?;

    update_task.await??;

    Ok(())
}
