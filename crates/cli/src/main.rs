use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use queuectl_core::{Config, Job, JobId, JobState};
use queuectl_infra::{
    ConfigStore, DeadLetterRetry, EnqueueRequest, QueueService, ShellExecutor, SqliteJobStore,
    WorkerPool,
};

#[derive(Parser, Debug)]
#[command(name = "queuectl")]
#[command(
    about = "Persistent shell-command job queue with retries and a dead-letter queue",
    long_about = None
)]
struct Cli {
    /// SQLite database path. Created if missing.
    #[arg(long, global = true, env = "QUEUECTL_DB_PATH")]
    db: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Add a command to the queue
    Enqueue {
        /// Shell command to run, e.g. 'echo hello'
        command: String,
        /// Job id; generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Attempt ceiling for this job
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// Job counts per state
    Status,
    /// List jobs, oldest first
    List {
        #[arg(long, value_enum)]
        state: Option<StateArg>,
    },
    /// Print one job as JSON
    Show { id: String },
    /// Dead-letter queue
    Dlq {
        #[command(subcommand)]
        cmd: DlqCmd,
    },
    /// Persisted configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Run workers in the foreground until Ctrl-C
    Worker {
        #[arg(
            short,
            long,
            default_value_t = 1,
            value_parser = clap::value_parser!(u32).range(1..)
        )]
        count: u32,
    },
}

#[derive(Subcommand, Debug)]
enum DlqCmd {
    List,
    /// Move a dead job back to pending with its attempts reset
    Retry { id: String },
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    Show,
    Set {
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        backoff_base: Option<u32>,
    },
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum StateArg {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl From<StateArg> for JobState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Pending => JobState::Pending,
            StateArg::Processing => JobState::Processing,
            StateArg::Completed => JobState::Completed,
            StateArg::Failed => JobState::Failed,
            StateArg::Dead => JobState::Dead,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    queuectl_observability::init();
    let cli = Cli::parse();

    let db_path = cli
        .db
        .unwrap_or_else(|| PathBuf::from(Config::DEFAULT_DB_PATH));
    let store = SqliteJobStore::open(&db_path)
        .await
        .with_context(|| format!("failed to open queue database {}", db_path.display()))?;

    // Defaults, then persisted values, then the environment.
    let persisted = store.load_config(Config::default()).await?;
    let mut config = persisted
        .clone()
        .with_env_overrides(|key| std::env::var(key).ok())?;
    config.db_path = db_path;

    match cli.cmd {
        Cmd::Enqueue {
            command,
            id,
            max_retries,
        } => {
            let queue = QueueService::new(store, config);
            let mut request = EnqueueRequest::new(command);
            if let Some(id) = id {
                request = request.with_id(id.parse::<JobId>()?);
            }
            if let Some(max_retries) = max_retries {
                request = request.with_max_retries(max_retries);
            }
            let job = queue.enqueue(request).await?;
            println!("enqueued {}", job.id);
        }
        Cmd::Status => {
            let status = QueueService::new(store, config).status().await?;
            for state in JobState::ALL {
                println!("{:<11} {}", state.as_str(), status.count(state));
            }
            println!("{:<11} {}", "total", status.total);
        }
        Cmd::List { state } => {
            let queue = QueueService::new(store, config);
            print_jobs(&queue.list(state.map(JobState::from)).await?);
        }
        Cmd::Show { id } => {
            let queue = QueueService::new(store, config);
            let id: JobId = id.parse()?;
            let Some(job) = queue.get(&id).await? else {
                bail!("job not found: {id}");
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Cmd::Dlq { cmd: DlqCmd::List } => {
            let queue = QueueService::new(store, config);
            print_jobs(&queue.dead_letters().await?);
        }
        Cmd::Dlq {
            cmd: DlqCmd::Retry { id },
        } => {
            let queue = QueueService::new(store, config);
            let id: JobId = id.parse()?;
            match queue.retry_dead_letter(&id).await? {
                DeadLetterRetry::Requeued(job) => println!("requeued {}", job.id),
                DeadLetterRetry::NotFound => bail!("job not found: {id}"),
                DeadLetterRetry::NotDead(state) => {
                    bail!("job {id} is {state}, only dead jobs can be retried")
                }
            }
        }
        Cmd::Config {
            cmd: ConfigCmd::Show,
        } => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Cmd::Config {
            cmd:
                ConfigCmd::Set {
                    max_retries,
                    backoff_base,
                },
        } => {
            if max_retries.is_none() && backoff_base.is_none() {
                bail!("nothing to set; pass --max-retries and/or --backoff-base");
            }
            // Only persisted values are written back; env overrides stay out.
            let mut updated = persisted;
            if let Some(v) = max_retries {
                updated.max_retries = v;
            }
            if let Some(v) = backoff_base {
                updated.backoff_base = v;
            }
            updated.validate()?;
            store.save_config(&updated).await?;
            println!(
                "max_retries = {}, backoff_base = {}",
                updated.max_retries, updated.backoff_base
            );
        }
        Cmd::Worker { count } => {
            let queue = Arc::new(QueueService::new(store, config));
            let pool = WorkerPool::spawn(count as usize, queue, Arc::new(ShellExecutor::new()));
            println!("started {count} worker(s); press Ctrl-C to stop");

            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;
            tracing::info!("shutdown requested; waiting for running jobs");

            let stats = pool.shutdown().await;
            println!(
                "processed {} (succeeded {}, retrying {}, dead {})",
                stats.processed, stats.succeeded, stats.failed, stats.dead_lettered
            );
        }
    }

    Ok(())
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }
    println!(
        "{:<18} {:<11} {:>8}  {:<27}  COMMAND",
        "ID", "STATE", "ATTEMPTS", "UPDATED"
    );
    for job in jobs {
        println!(
            "{:<18} {:<11} {:>8}  {:<27}  {}",
            job.id.as_str(),
            job.state.as_str(),
            format!("{}/{}", job.attempts, job.max_retries),
            queuectl_core::format_timestamp(job.updated_at),
            job.command
        );
        if let Some(error) = &job.error_message {
            println!("{:<18} last error: {error}", "");
        }
    }
}
