//! overseer CLI - tick dispatch and liveness for worker processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use overseer_core::{GoalId, Priority, Task, TaskFilter, TaskId, TaskStatus};
use overseer_execution::{
    CommandLauncher, DispatchStatsRecorder, Orchestrator, OrchestratorConfig, TickRunner,
};
use overseer_storage::{MemoryStore, SqliteStore, TaskStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment fallback for `--worker-command`.
const WORKER_COMMAND_ENV: &str = "OVERSEER_WORKER_COMMAND";

/// Gap between the CPU baseline and the sample a one-shot tick reads.
const CPU_BASELINE_WAIT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "overseer")]
#[command(about = "Tick-driven task dispatch with worker liveness checks", long_about = None)]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, default_value = ".overseer/overseer.db")]
    db: PathBuf,

    /// Use a throwaway in-memory store
    #[arg(long, global = true)]
    memory: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Shell command started for each dispatched task
    #[arg(long, global = true)]
    worker_command: Option<String>,

    /// Override the seat cap
    #[arg(long, global = true)]
    max_seats: Option<usize>,

    /// Restrict dispatch to these goals
    #[arg(long = "goal-scope", global = true, value_delimiter = ',')]
    goal_scope: Vec<GoalId>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue a new task
    Add {
        /// Task title
        title: String,
        /// Task description
        #[arg(long, default_value = "")]
        description: String,
        /// Priority tier (P0, P1, P2)
        #[arg(long, default_value = "P2")]
        priority: Priority,
        /// Task type tag
        #[arg(long = "type", default_value = "dev")]
        task_type: String,
        /// Skill the worker should load
        #[arg(long)]
        skill: Option<String>,
        /// Owning goal
        #[arg(long)]
        goal: Option<GoalId>,
        /// Requirements document, used when the description is empty
        #[arg(long)]
        prd: Option<String>,
    },
    /// List tasks
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<TaskStatus>,
        /// Maximum rows
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show task details
    Show {
        /// Task ID
        id: TaskId,
    },
    /// Run a single tick
    Tick {
        /// Print the tick report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Tick on the configured interval until Ctrl-C
    Run,
    /// Show queue counts and dispatch statistics
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Mark an in-progress task completed
    Complete {
        /// Task ID
        id: TaskId,
    },
    /// Mark an in-progress task failed
    Fail {
        /// Task ID
        id: TaskId,
        /// Failure reason
        #[arg(long, default_value = "reported failed by worker")]
        reason: String,
    },
    /// Show the most recent tick decisions
    Decisions {
        /// Maximum rows
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    // Logs go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let store = open_store(&cli).await?;
    let config = build_config(&cli);

    match cli.command {
        Commands::Add {
            title,
            description,
            priority,
            task_type,
            skill,
            goal,
            prd,
        } => {
            let mut task = Task::new(title, description)
                .with_priority(priority.as_str())
                .with_task_type(task_type);
            if let Some(skill) = skill {
                task = task.with_skill(skill);
            }
            if let Some(goal) = goal {
                task = task.with_goal(goal);
            }
            if let Some(prd) = prd {
                task = task.with_prd(prd);
            }
            store.save_task(&task).await?;
            println!("Added task: {} - {}", task.id, task.title);
        }
        Commands::List { status, limit } => {
            let filter = TaskFilter {
                status: status.map(|s| vec![s]),
                limit,
                ..Default::default()
            };
            let tasks = store.list_tasks(&filter).await?;

            println!("Tasks ({})", tasks.len());
            for task in tasks {
                println!(
                    "  {} | {:<11} | {} | {}",
                    task.id, task.status, task.priority, task.title,
                );
            }
        }
        Commands::Show { id } => {
            let Some(task) = store.load_task(id).await? else {
                println!("Task not found");
                return Ok(());
            };

            println!("Task: {}", task.id);
            println!("  Title: {}", task.title);
            println!("  Status: {}", task.status);
            println!("  Priority: {}", task.priority);
            println!("  Type: {}", task.task_type);
            if let Some(skill) = &task.skill {
                println!("  Skill: {}", skill);
            }
            if let Some(goal) = task.goal_id {
                println!("  Goal: {}", goal);
            }
            if let Some(run_id) = task.current_run_id() {
                println!("  Run: {}", run_id);
            }
            if let Some(error) = &task.error {
                println!("  Error: {}", error);
            }
            println!("  Created: {}", task.created_at);
            println!("  Metadata: {}", serde_json::to_string_pretty(&task.metadata)?);
        }
        Commands::Tick { json } => {
            let mut orchestrator =
                build_orchestrator(config, store, cli.worker_command.as_deref())?;
            orchestrator.restore_suspects().await;
            orchestrator.prime_sampler();
            tokio::time::sleep(CPU_BASELINE_WAIT).await;
            let report = orchestrator.tick(chrono::Utc::now()).await?;
            orchestrator.save_suspects().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Action: {}", report.action);
                if let Some(task_id) = report.task_id {
                    println!("  Task: {}", task_id);
                }
                if let Some(reason) = &report.reason {
                    println!("  Reason: {}", reason);
                }
                println!(
                    "  Slots: {}/{}",
                    report.active_processes, report.pressure.effective_slots
                );
                for action in &report.auto_failed {
                    println!("  Auto-failed: {} ({})", action.task_id, action.reason);
                }
            }
        }
        Commands::Run => {
            let mut orchestrator =
                build_orchestrator(config, store, cli.worker_command.as_deref())?;
            orchestrator.restore_suspects().await;
            let runner = TickRunner::new(orchestrator);

            runner
                .run_until(async {
                    // A failed signal handler just means we run until killed.
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;

            runner.orchestrator().lock().await.save_suspects().await;
            let status = runner.status().await;
            info!("Stopped after {} ticks", status.tick_count);
            if let Some(error) = status.last_error {
                info!("Last tick error: {}", error);
            }
        }
        Commands::Status { json } => {
            let now = chrono::Utc::now();
            let all_tasks = store.list_tasks(&TaskFilter::default()).await?;
            let mut by_status: BTreeMap<&'static str, usize> = BTreeMap::new();
            for task in &all_tasks {
                *by_status.entry(task.status.as_str()).or_default() += 1;
            }

            let window = DispatchStatsRecorder::new(store.clone(), config.stats_window())
                .current(now)
                .await;
            let last = store.list_decisions(1).await?.into_iter().next();

            if json {
                let value = serde_json::json!({
                    "tasks": by_status,
                    "window": window,
                    "max_seats": config.max_seats,
                    "last_decision": last,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("overseer status");
                for status in [
                    TaskStatus::Queued,
                    TaskStatus::InProgress,
                    TaskStatus::Completed,
                    TaskStatus::Failed,
                    TaskStatus::Quarantined,
                ] {
                    if let Some(count) = by_status.get(status.as_str()) {
                        println!("  {}: {}", status, count);
                    }
                }
                match window.rate {
                    Some(rate) => println!(
                        "  Dispatch rate: {:.0}% ({} of {})",
                        rate * 100.0,
                        window.success,
                        window.total
                    ),
                    None => println!("  Dispatch rate: n/a"),
                }
                for (reason, count) in &window.failure_reasons {
                    println!("    {}: {}", reason, count);
                }
                if let Some(decision) = last {
                    println!("  Last decision: {} at {}", decision.action, decision.created_at);
                }
            }
        }
        Commands::Complete { id } => {
            if store.mark_completed(id, chrono::Utc::now()).await? {
                println!("Completed task: {}", id);
            } else {
                bail!("task {} is not in progress", id);
            }
        }
        Commands::Fail { id, reason } => {
            if store.mark_failed(id, &reason, chrono::Utc::now()).await? {
                println!("Failed task: {}", id);
            } else {
                bail!("task {} is not in progress", id);
            }
        }
        Commands::Decisions { limit } => {
            let decisions = store.list_decisions(limit).await?;
            println!("Decisions ({})", decisions.len());
            for decision in decisions {
                let task = decision.task_id.map(|id| id.to_string()).unwrap_or_default();
                println!(
                    "  {} | {:<20} | {} | {}",
                    decision.created_at.format("%Y-%m-%d %H:%M:%S"),
                    decision.action,
                    task,
                    decision.reason.unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}

async fn open_store(cli: &Cli) -> Result<Arc<dyn TaskStore>> {
    if cli.memory {
        return Ok(Arc::new(MemoryStore::new()));
    }
    let store = SqliteStore::open(&cli.db)
        .await
        .with_context(|| format!("opening {}", cli.db.display()))?;
    Ok(Arc::new(store))
}

fn build_config(cli: &Cli) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::from_env();
    if let Some(max_seats) = cli.max_seats {
        config.max_seats = max_seats;
    }
    if !cli.goal_scope.is_empty() {
        config = config.with_goal_scope(cli.goal_scope.clone());
    }
    config.normalized()
}

fn build_orchestrator(
    config: OrchestratorConfig,
    store: Arc<dyn TaskStore>,
    worker_command: Option<&str>,
) -> Result<Orchestrator> {
    let command = match worker_command {
        Some(command) => command.to_string(),
        None => std::env::var(WORKER_COMMAND_ENV).with_context(|| {
            format!("no worker command: pass --worker-command or set {}", WORKER_COMMAND_ENV)
        })?,
    };
    let launcher = Arc::new(CommandLauncher::new(command, config.max_seats));
    Ok(Orchestrator::builder(config, store, launcher).build())
}
