//! loreforge CLI — operator interface to the job engine.
//!
//! `serve` runs the scheduler daemon: migrates, ensures the pgmq queues and
//! the recurring sweep registrations exist, then ticks the recurring-job
//! scheduler. Vendor-bound workers (conjuration, image, transcription) are
//! bound by the backend service embedding this crate; this binary owns the
//! shared durable state and the cron roster.

use clap::{Parser, Subcommand};
use loreforge::config::Config;
use loreforge::db::Db;
use loreforge::db::queue::PgQueue;
use loreforge::model::{NewJob, State};
use loreforge::queue::{EnqueueResult, Queue};
use loreforge::schedule::Scheduler;
use loreforge::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;

/// Queues the backend enqueues onto. Created idempotently at startup so
/// producers never race queue creation.
const QUEUES: &[&str] = &["conjure", "image", "transcribe", "sweeps"];

/// Recurring sweeps, registered idempotently on every start.
/// `sec min hour dom month dow` cron form, UTC.
const RECURRING: &[(&str, &str)] = &[
    ("trial-expiration-sweep", "0 0 * * * *"),
    ("expired-subscription-sweep", "0 0 2 * * *"),
    ("daily-context-resync", "0 0 4 * * *"),
    ("plan-cutover-sweep", "0 30 4 * * *"),
];

#[derive(Parser)]
#[command(name = "loreforge", about = "Durable job engine for the Loreforge backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler daemon
    Serve {
        /// Scheduler tick interval in seconds
        #[arg(long, default_value_t = 30)]
        tick_secs: u64,
    },
    /// Job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Show recurring registrations
    Schedule,
}

#[derive(Subcommand)]
enum JobAction {
    /// Enqueue a job
    Submit {
        /// Target queue
        queue: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Maximum attempts
        #[arg(long, default_value_t = 1)]
        max_attempts: u32,
        /// Dedupe identity
        #[arg(long)]
        dedupe_id: Option<String>,
        /// Delay in seconds before the job becomes claimable
        #[arg(long)]
        delay_secs: Option<u64>,
    },
    /// List jobs
    List {
        /// Filter by state
        #[arg(long)]
        state: Option<String>,
        /// Filter by queue
        #[arg(long)]
        queue: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a job
    Show {
        /// Job ID (full UUID)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { tick_secs } => cmd_serve(tick_secs).await,
        Command::Job { action } => {
            let queue = connect().await?;
            match action {
                JobAction::Submit {
                    queue: queue_name,
                    payload,
                    max_attempts,
                    dedupe_id,
                    delay_secs,
                } => {
                    cmd_job_submit(&queue, queue_name, payload, max_attempts, dedupe_id, delay_secs)
                        .await
                }
                JobAction::List {
                    state,
                    queue: queue_name,
                    limit,
                } => cmd_job_list(&queue, state, queue_name, limit).await,
                JobAction::Show { id } => cmd_job_show(&queue, id).await,
            }
        }
        Command::Schedule => {
            let queue = connect().await?;
            cmd_schedule_list(&queue).await
        }
    }
}

async fn connect() -> anyhow::Result<PgQueue> {
    let config = Config::from_env()?;
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(PgQueue::new(Arc::new(db)))
}

async fn cmd_serve(tick_secs: u64) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "loreforge".to_string(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let queue = Arc::new(PgQueue::new(Arc::new(db)));
    for name in QUEUES {
        queue.ensure_queue(name).await?;
    }

    let scheduler = Arc::new(
        Scheduler::new(queue.clone()).with_tick(Duration::from_secs(tick_secs)),
    );
    for (job_id, cron) in RECURRING {
        scheduler
            .ensure_scheduled(job_id, "sweeps", cron, serde_json::json!({ "sweep": job_id }))
            .await?;
    }

    let sched = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sched.shutdown();
    });

    scheduler.run().await?;
    Ok(())
}

async fn cmd_job_submit(
    queue: &PgQueue,
    queue_name: String,
    payload: Option<String>,
    max_attempts: u32,
    dedupe_id: Option<String>,
    delay_secs: Option<u64>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let mut new = NewJob::new(&queue_name)
        .payload(payload)
        .max_attempts(max_attempts);
    if let Some(ref id) = dedupe_id {
        new = new.dedupe_id(id);
    }
    if let Some(secs) = delay_secs {
        new = new.delay(Duration::from_secs(secs));
    }

    match queue.enqueue(new).await? {
        EnqueueResult::Created(job) => {
            println!("Created: {} (state: {})", job.id, job.state);
        }
        EnqueueResult::Deduplicated { existing } => {
            println!("Deduplicated against existing job {existing}");
        }
    }
    Ok(())
}

async fn cmd_job_list(
    queue: &PgQueue,
    state: Option<String>,
    queue_name: Option<String>,
    limit: i64,
) -> anyhow::Result<()> {
    let state_filter: Option<State> = match state {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid state: {s}"))?,
        ),
        None => None,
    };

    let jobs = queue
        .list_jobs(state_filter, queue_name.as_deref(), limit)
        .await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<12}  {:<10}  {:<8}  CREATED",
        "ID", "QUEUE", "STATE", "ATTEMPTS"
    );
    println!("{}", "-".repeat(72));
    for job in &jobs {
        println!(
            "{:<8}  {:<12}  {:<10}  {:<8}  {}",
            job.id,
            job.queue_name,
            job.state,
            format!("{}/{}", job.attempts_made, job.options.max_attempts),
            job.created_at.format("%Y-%m-%d %H:%M")
        );
    }
    println!("\n{} job(s)", jobs.len());
    Ok(())
}

async fn cmd_job_show(queue: &PgQueue, id_str: String) -> anyhow::Result<()> {
    let uuid = uuid::Uuid::parse_str(&id_str)?;
    let job = queue
        .get(loreforge::model::JobId(uuid))
        .await?
        .ok_or_else(|| anyhow::anyhow!("no job {id_str}"))?;

    println!("ID:         {}", job.id.0);
    println!("Queue:      {}", job.queue_name);
    println!("State:      {}", job.state);
    println!("Attempts:   {}/{}", job.attempts_made, job.options.max_attempts);
    println!(
        "Dedupe:     {}",
        job.options.dedupe_id.as_deref().unwrap_or("-")
    );
    println!("Payload:    {}", serde_json::to_string_pretty(&job.payload)?);
    println!("Created:    {}", job.created_at);
    println!("Updated:    {}", job.updated_at);
    if let Some(finished) = job.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(ref err) = job.last_error {
        println!("Last Error: {err}");
    }
    if let Some(ref outcome) = job.outcome {
        println!("Outcome:    {}", serde_json::to_string_pretty(outcome)?);
    }
    Ok(())
}

async fn cmd_schedule_list(queue: &PgQueue) -> anyhow::Result<()> {
    let regs = queue.list_repeatable().await?;
    if regs.is_empty() {
        println!("No recurring registrations.");
        return Ok(());
    }
    println!("{:<32}  {:<10}  {:<16}  NEXT RUN", "JOB ID", "QUEUE", "CRON");
    println!("{}", "-".repeat(90));
    for reg in &regs {
        println!(
            "{:<32}  {:<10}  {:<16}  {}",
            reg.job_id,
            reg.queue_name,
            reg.cron,
            reg.next_run_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}
