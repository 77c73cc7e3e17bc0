use std::time::Duration;

use kodiak_database::RedisPool;
use kodiak_queue::{Job, JobId, Queue};
use structopt::StructOpt;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Database(#[from] kodiak_database::Error),
    #[error(transparent)]
    Queue(#[from] kodiak_queue::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("job {0} not found")]
    NotFound(String),
}

#[derive(Debug, StructOpt)]
#[structopt(about = "Inspect and drive a kodiak queue from the command line")]
struct Args {
    queue: String,
    #[structopt(subcommand)]
    cmd: QueueCmd,
}

#[derive(Debug, StructOpt)]
enum QueueCmd {
    /// Enqueue a job with a raw JSON payload.
    Add {
        id: String,
        data: String,
        #[structopt(long)]
        priority: Option<i64>,
        #[structopt(long, help = "Delay in seconds before the job becomes waiting")]
        delay: Option<u64>,
        #[structopt(long, default_value = "1")]
        attempts: u32,
    },
    /// Print queue-wide counters.
    Status,
    /// Print one job's stored metadata.
    ShowJob { id: String },
    /// Mark a job completed, as if a worker had finished it successfully.
    Finish { id: String },
    /// Mark a job failed with the given error message.
    Error { id: String, err: String },
    /// Force an immediate sweep of due delayed jobs.
    PromoteDelayed {
        #[structopt(long, default_value = "100")]
        limit: u32,
    },
    /// Force an immediate sweep of stalled active jobs.
    RecoverStalled {
        #[structopt(long, default_value = "100")]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let args = Args::from_args();
    let pool = RedisPool::new(None, None)?;
    let queue = Queue::new(pool, &args.queue);

    match args.cmd {
        QueueCmd::Add {
            id,
            data,
            priority,
            delay,
            attempts,
        } => {
            let mut job = Job::from_bytes(JobId::Value(&id), data.as_bytes()).attempts(attempts);
            if let Some(p) = priority {
                job = job.priority(p);
            }
            if let Some(d) = delay {
                job = job.delay(Duration::from_secs(d));
            }
            queue.add(&job).await?;
            println!("added job {}", id);
        }
        QueueCmd::Status => {
            let status = queue.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        QueueCmd::ShowJob { id } => {
            let record = queue.job_info(&id).await?.ok_or(CliError::NotFound(id))?;
            println!("{:#?}", record);
        }
        QueueCmd::Finish { id } => {
            let outcome = queue.mark_completed(&id).await?;
            println!("{:?}", outcome);
        }
        QueueCmd::Error { id, err } => {
            let outcome = queue.mark_failed(&id, &err, None).await?;
            println!("{:?}", outcome);
        }
        QueueCmd::PromoteDelayed { limit } => {
            let moved = queue.promote_delayed_jobs(limit).await?;
            println!("promoted {} jobs: {:?}", moved.len(), moved);
        }
        QueueCmd::RecoverStalled { limit } => {
            let recovered = queue.recover_stalled_jobs(limit).await?;
            println!("recovered {} jobs: {:?}", recovered.len(), recovered);
        }
    }

    Ok(())
}
