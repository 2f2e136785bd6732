use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use gazette_core::config::OrchestratorConfig;
use gazette_core::contract::SourceIndexEntry;
use gazette_core::routing::Profile;
use gazette_core::task::{EnqueueRequest, RoutingRequest, TaskId, TaskKind, TaskPayload};
use gazette_core::telemetry::{TelemetryConfig, init_telemetry};
use gazette_db::attempt_store::AttemptStore;
use gazette_db::event_store::EventStore;
use gazette_db::task_store::{CancelOutcome, TaskStore};
use gazette_runner::backend::AgentBackend;
use gazette_runner::bench_backend::BenchmarkBackend;
use gazette_runner::cli_backend::CliProcessBackend;
use gazette_runner::echo_backend::EchoBackend;
use gazette_runner::workdir::WorkdirManager;
use gazette_runner::worker::{Worker, WorkerOptions};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "gazette", about = "Durable task orchestration for news content agents")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "gazette.toml")]
    config: PathBuf,

    /// Override the database path from the config.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Override the workdir root from the config.
    #[arg(long)]
    workdir_root: Option<PathBuf>,

    /// Output JSON-structured logs to console.
    #[arg(long)]
    json_logs: bool,

    /// Log filter (e.g., "gazette=debug").
    #[arg(long, default_value = "gazette=info")]
    log_filter: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue a content-generation task.
    Enqueue {
        /// Task kind: highlights, story-details, monitor-answer, qa.
        #[arg(long)]
        kind: TaskKind,
        /// Prompt text for the agent.
        #[arg(long)]
        prompt: String,
        /// JSON file holding the source index entries for this task.
        #[arg(long)]
        sources_file: Option<PathBuf>,
        /// Higher priority is claimed first.
        #[arg(long, default_value = "0")]
        priority: i32,
        #[arg(long, default_value = "3")]
        max_attempts: u32,
        /// Per-attempt timeout in seconds.
        #[arg(long, default_value = "600")]
        timeout_secs: u64,
        /// Agent routing hint (defaults to the configured default agent).
        #[arg(long)]
        agent: Option<String>,
        /// Profile routing hint: fast or quality.
        #[arg(long)]
        profile: Option<Profile>,
        /// Explicit model override (wins over profile mapping).
        #[arg(long)]
        model: Option<String>,
        /// Task-type specific parameters as inline JSON.
        #[arg(long)]
        params_json: Option<String>,
    },
    /// Run the worker loop.
    Worker {
        /// Stop after processing this many tasks.
        #[arg(long)]
        max_tasks: Option<u32>,
        /// Keep polling when the queue is idle instead of exiting.
        #[arg(long)]
        follow: bool,
        /// Backend: cli, benchmark, or echo.
        #[arg(long, default_value = "cli")]
        backend: String,
        /// Worker identity recorded on claims.
        #[arg(long)]
        worker_id: Option<String>,
    },
    /// Inspect and manage tasks.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Show per-status task counts.
    Status,
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks, optionally filtered by status.
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one task with its event history and attempts.
    Show { id: String },
    /// Re-queue a failed/timeout/canceled task with a fresh budget.
    Retry { id: String },
    /// Cancel a queued or claimed task.
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        json_logs: cli.json_logs,
        log_filter: cli.log_filter.clone(),
        log_dir: None,
    })?;

    let mut config = OrchestratorConfig::load(&cli.config)?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }
    if let Some(workdir_root) = cli.workdir_root {
        config.workdir_root = workdir_root;
    }

    let db = Arc::new(gazette_db::open_db(&config.db_path)?);

    match cli.command {
        Commands::Enqueue {
            kind,
            prompt,
            sources_file,
            priority,
            max_attempts,
            timeout_secs,
            agent,
            profile,
            model,
            params_json,
        } => {
            let sources = match sources_file {
                Some(path) => load_sources(&path)?,
                None => Vec::new(),
            };
            let mut payload = TaskPayload::new(prompt, sources);
            if let Some(raw) = params_json {
                payload.params =
                    serde_json::from_str(&raw).context("invalid --params-json value")?;
            }
            let request = EnqueueRequest::new(kind, payload)
                .with_priority(priority)
                .with_max_attempts(max_attempts)
                .with_timeout_secs(timeout_secs)
                .with_routing(RoutingRequest {
                    agent,
                    profile,
                    model,
                });
            let task = TaskStore::new(&db).enqueue(request)?;
            println!("enqueued {} ({})", task.id, task.kind);
        }

        Commands::Worker {
            max_tasks,
            follow,
            backend,
            worker_id,
        } => {
            let backend: Arc<dyn AgentBackend> = match backend.as_str() {
                "cli" => Arc::new(CliProcessBackend::new()),
                "benchmark" => Arc::new(BenchmarkBackend::new()),
                "echo" => Arc::new(EchoBackend::new()),
                other => bail!("unknown backend: {other} (use cli, benchmark, or echo)"),
            };
            let worker_id = worker_id.unwrap_or_else(|| format!("worker-{}", std::process::id()));

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown requested");
                    signal_token.cancel();
                }
            });

            let mut worker = Worker::new(
                Arc::clone(&db),
                backend,
                WorkdirManager::new(&config.workdir_root),
                config.routing.clone(),
                config.worker.clone(),
                worker_id,
                shutdown,
            );
            let options = WorkerOptions {
                max_tasks,
                max_idle_polls: if follow {
                    None
                } else {
                    Some(config.worker.max_idle_polls)
                },
            };
            let summary = worker.run(options).await?;
            println!(
                "processed {} | succeeded {} | retried {} | failed {} | timeouts {} | canceled {} | released {}",
                summary.processed,
                summary.succeeded,
                summary.retried,
                summary.failed,
                summary.timeouts,
                summary.canceled,
                summary.released,
            );
        }

        Commands::Task { action } => run_task_action(&db, action)?,

        Commands::Status => {
            let counts = TaskStore::new(&db).status_counts()?;
            if counts.is_empty() {
                println!("no tasks");
            } else {
                let mut rows: Vec<_> = counts.into_iter().collect();
                rows.sort();
                for (status, count) in rows {
                    println!("{status:<12} {count}");
                }
            }
        }
    }

    Ok(())
}

fn run_task_action(db: &redb::Database, action: TaskAction) -> Result<()> {
    let store = TaskStore::new(db);
    match action {
        TaskAction::List { status } => {
            let tasks = store.list(status.as_deref())?;
            if tasks.is_empty() {
                println!("no tasks");
                return Ok(());
            }
            println!(
                "{:<12} {:<16} {:<10} {:>4} {:>9} {:<20}",
                "ID", "KIND", "STATUS", "PRI", "ATTEMPTS", "LAST FAILURE"
            );
            for task in tasks {
                println!(
                    "{:<12} {:<16} {:<10} {:>4} {:>5}/{:<3} {:<20}",
                    task.id.to_string(),
                    task.kind.label(),
                    task.status.label(),
                    task.priority,
                    task.attempt_count,
                    task.max_attempts,
                    task.last_failure_class
                        .map(|c| c.label())
                        .unwrap_or("-"),
                );
            }
        }

        TaskAction::Show { id } => {
            let id = parse_task_id(&id)?;
            let Some(task) = store.get(id)? else {
                bail!("task not found: {id}");
            };
            println!("{}  {}  {}", task.id, task.kind, task.status.label());
            println!("  priority:     {}", task.priority);
            println!("  attempts:     {}/{}", task.attempt_count, task.max_attempts);
            println!("  timeout:      {}s", task.timeout_secs);
            if let Some(routing) = &task.routing {
                println!(
                    "  routing:      {} / {} -> {}",
                    routing.agent, routing.profile, routing.model
                );
            }
            if let Some(class) = task.last_failure_class {
                println!("  failure:      {class}");
            }
            if let Some(summary) = &task.error_summary {
                println!("  error:        {summary}");
            }
            if let Some(result_path) = &task.result_path {
                println!("  result:       {result_path}");
            }
            println!("  created:      {}", task.created_at.to_rfc3339());

            let events = EventStore::new(db).for_task(id)?;
            if !events.is_empty() {
                println!("events:");
                for event in events {
                    println!("  {event}");
                }
            }
            let attempts = AttemptStore::new(db).for_task(id)?;
            if !attempts.is_empty() {
                println!("attempts:");
                for attempt in attempts {
                    println!(
                        "  #{} {} {} ({}/{}) exit={:?} {:.1}s {}",
                        attempt.attempt_no,
                        attempt.outcome,
                        attempt.model,
                        attempt.agent,
                        attempt.profile,
                        attempt.exit_code,
                        attempt.wall_time_secs,
                        attempt
                            .failure_class
                            .map(|c| c.label())
                            .unwrap_or(""),
                    );
                }
            }
        }

        TaskAction::Retry { id } => {
            let id = parse_task_id(&id)?;
            let task = store.retry(id)?;
            println!("re-queued {}", task.id);
        }

        TaskAction::Cancel { id } => {
            let id = parse_task_id(&id)?;
            match store.cancel(id)? {
                CancelOutcome::Canceled => println!("canceled {id}"),
                CancelOutcome::CancelRequested => {
                    println!("cancel requested for {id}; the owning worker will honor it")
                }
            }
        }
    }
    Ok(())
}

fn load_sources(path: &std::path::Path) -> Result<Vec<SourceIndexEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read sources file {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid sources file {}", path.display()))
}

/// Accepts both "task-000042" and "42".
fn parse_task_id(raw: &str) -> Result<TaskId> {
    let digits = raw.strip_prefix("task-").unwrap_or(raw);
    let id: i64 = digits
        .trim_start_matches('0')
        .parse()
        .or_else(|_| digits.parse())
        .with_context(|| format!("invalid task id: {raw}"))?;
    Ok(TaskId(id))
}
