//! PlanDaemon - plan task graph CLI
//!
//! Operator entry point: plan and task CRUD against the store, plus
//! decomposition and execution jobs whose logs are streamed to the terminal.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result, bail};
use planstore::{AnchorKind, NewTask, NodeStatus, PlanStore, TaskUpdate};
use tracing::{debug, info};

use plandaemon::cli::{Cli, Command, JobCommand, OutputFormat, PlanCommand, TaskCommand};
use plandaemon::config::Config;
use plandaemon::generate::{GenerateConfig, create_generator};
use plandaemon::jobs::{JobManager, JobRunner, JobSnapshot, JobStatus, StreamKind, SubmittedJob};
use plandaemon::planning::DecomposeOptions;
use plandaemon::prompts::DefaultPromptBuilder;

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("plandaemon")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("pd.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());

    // Setup logging with priority: CLI > config > INFO default
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let store = PlanStore::open(&config.store.root_dir)
        .with_context(|| format!("Failed to open plan store at {}", config.store.root_dir.display()))?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Plan { command } => cmd_plan(&config, &store, command).await,
        Command::Task { command } => cmd_task(&store, command),
        Command::Decompose {
            plan_id,
            node,
            max_depth,
            budget,
            allow_existing,
        } => {
            let options = DecomposeOptions::from(&config.decomposer)
                .with_max_depth(max_depth)
                .with_node_budget(budget)
                .with_allow_existing(allow_existing.then_some(true));
            let runner = build_runner(&config, &store)?;
            let submitted = runner.submit_decomposition(plan_id, node, options)?;
            follow(&config, runner.manager(), submitted).await.map(|_| ())
        }
        Command::Execute { plan_id, task } => {
            let runner = build_runner(&config, &store)?;
            let submitted = match task {
                Some(task_id) => runner.submit_task_execution(plan_id, task_id)?,
                None => runner.submit_plan_execution(plan_id)?,
            };
            follow(&config, runner.manager(), submitted).await.map(|_| ())
        }
        Command::Job { command } => cmd_job(&config, &store, command),
    }
}

/// Runner wired to the configured generator
fn build_runner(config: &Config, store: &PlanStore) -> Result<JobRunner> {
    config.validate()?;
    let generator = create_generator(&config.llm).context("Failed to create generator")?;
    let manager = Arc::new(JobManager::new(
        store.clone(),
        config.jobs.log_capacity,
        config.jobs.ttl(),
    ));
    Ok(JobRunner::new(
        store.clone(),
        generator,
        Arc::new(DefaultPromptBuilder::new()),
        manager,
    )
    .with_scheduler_config(config.scheduler.clone())
    .with_generate_config(GenerateConfig::from_llm(&config.llm)))
}

async fn cmd_plan(config: &Config, store: &PlanStore, command: PlanCommand) -> Result<()> {
    debug!(?command, "cmd_plan: called");
    match command {
        PlanCommand::Create {
            title,
            description,
            decompose,
        } => {
            if decompose {
                let runner = build_runner(config, store)?;
                let options = DecomposeOptions::from(&config.decomposer);
                let submitted = runner.submit_plan_bootstrap(&title, description.as_deref(), options)?;
                let job = follow(config, runner.manager(), submitted).await?;
                if let Some(plan_id) = job.plan_id {
                    println!("Created plan {}", plan_id.to_string().bold());
                }
                return Ok(());
            }
            let plan = store.create_plan(&title, description.as_deref(), serde_json::Map::new())?;
            println!("Created plan {}: {}", plan.id.to_string().bold(), plan.title);
        }
        PlanCommand::List { format } => {
            let plans = store.list_plans()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&plans)?),
                OutputFormat::Text => {
                    if plans.is_empty() {
                        println!("{}", "No plans.".dimmed());
                    }
                    for plan in plans {
                        println!(
                            "{:>4}  {}  {}",
                            plan.id.to_string().cyan(),
                            plan.title,
                            format!("({} tasks)", plan.task_count).dimmed()
                        );
                    }
                }
            }
        }
        PlanCommand::Show { plan_id, format } => {
            let tree = store.get_tree(plan_id)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tree)?),
                OutputFormat::Text => {
                    println!("{} {}", format!("#{}", tree.id).cyan(), tree.title.bold());
                    if let Some(description) = &tree.description {
                        println!("{}", description.dimmed());
                    }
                    let outline = tree.outline(None);
                    if outline.is_empty() {
                        println!("{}", "No tasks.".dimmed());
                    } else {
                        println!("{}", outline);
                    }
                }
            }
        }
        PlanCommand::Delete { plan_id } => {
            store.delete_plan(plan_id)?;
            println!("Deleted plan {}", plan_id);
        }
    }
    Ok(())
}

fn cmd_task(store: &PlanStore, command: TaskCommand) -> Result<()> {
    debug!(?command, "cmd_task: called");
    match command {
        TaskCommand::Add {
            plan_id,
            name,
            parent,
            instruction,
            before,
            after,
            first_child,
            last_child,
            position,
            depends_on,
        } => {
            let mut task = NewTask::new(name).with_dependencies(depends_on);
            if let Some(parent_id) = parent {
                task = task.with_parent(parent_id);
            }
            if let Some(instruction) = instruction {
                task = task.with_instruction(instruction);
            }
            let anchor = [
                (AnchorKind::Before, before),
                (AnchorKind::After, after),
                (AnchorKind::FirstChild, first_child),
                (AnchorKind::LastChild, last_child),
            ]
            .into_iter()
            .find_map(|(kind, id)| id.map(|id| (kind, id)));
            if let Some((kind, target)) = anchor {
                task = task.with_anchor(kind, target);
            } else if let Some(position) = position {
                task = task.with_position(position);
            }
            let node = store.create_task(plan_id, task)?;
            println!(
                "Added task {} at {} (position {})",
                node.id.to_string().bold(),
                node.path,
                node.position
            );
        }
        TaskCommand::Update {
            plan_id,
            task_id,
            name,
            instruction,
            status,
            depends_on,
        } => {
            let status = status.map(|s| s.parse::<NodeStatus>()).transpose()?;
            let update = TaskUpdate {
                name,
                status,
                instruction,
                dependencies: depends_on,
                ..Default::default()
            };
            if update.is_empty() {
                bail!("Nothing to update");
            }
            let node = store.update_task(plan_id, task_id, update)?;
            println!("Updated task {} [{}]", node.id.to_string().bold(), node.status);
        }
        TaskCommand::Move {
            plan_id,
            task_id,
            parent,
            root,
            position,
        } => {
            let new_parent = if root {
                None
            } else {
                match parent {
                    Some(parent_id) => Some(parent_id),
                    None => store.get_node(plan_id, task_id)?.parent_id,
                }
            };
            let node = store.move_task(plan_id, task_id, new_parent, position)?;
            println!(
                "Moved task {} to {} (position {})",
                node.id.to_string().bold(),
                node.path,
                node.position
            );
        }
        TaskCommand::Rm { plan_id, task_id } => {
            let removed = store.delete_task(plan_id, task_id)?;
            println!("Deleted {} task(s)", removed.len());
        }
        TaskCommand::Deps {
            plan_id,
            task_id,
            add,
            remove,
        } => {
            for dep in add {
                let added = store.add_dependency(plan_id, task_id, dep)?;
                let note = if added { "added" } else { "already present" };
                println!("#{} -> #{} {}", task_id, dep, note);
            }
            for dep in remove {
                let removed = store.remove_dependency(plan_id, task_id, dep)?;
                let note = if removed { "removed" } else { "not present" };
                println!("#{} -> #{} {}", task_id, dep, note);
            }
            let node = store.get_node(plan_id, task_id)?;
            let deps: Vec<String> = node.dependencies.iter().map(|d| format!("#{}", d)).collect();
            println!("Task {} depends on: {}", task_id, if deps.is_empty() { "-".to_string() } else { deps.join(", ") });
        }
    }
    Ok(())
}

fn cmd_job(config: &Config, store: &PlanStore, command: JobCommand) -> Result<()> {
    debug!(?command, "cmd_job: called");
    match command {
        JobCommand::Show { job_id, format } => {
            let manager = JobManager::new(store.clone(), config.jobs.log_capacity, config.jobs.ttl());
            let job = manager.get_job_payload(&job_id)?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&job)?),
                OutputFormat::Text => {
                    print_job_header(&job);
                    for log in &job.logs {
                        print_log(&log.level, &log.message);
                    }
                    if let Some(error) = &job.error {
                        println!("{} {}", "Error:".red(), error);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_job_header(job: &JobSnapshot) {
    let plan = job.plan_id.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
    println!(
        "Job {} [{}] plan {} mode {}",
        job.job_id.bold(),
        status_label(job.status),
        plan,
        job.mode.as_str()
    );
}

fn status_label(status: JobStatus) -> String {
    match status {
        JobStatus::Succeeded => status.as_str().green().to_string(),
        JobStatus::Failed => status.as_str().red().to_string(),
        JobStatus::Running => status.as_str().cyan().to_string(),
        JobStatus::Queued => status.as_str().dimmed().to_string(),
    }
}

fn print_log(level: &str, message: &str) {
    let tag = format!("[{}]", level);
    let tag = match level {
        "error" => tag.red(),
        "warn" => tag.yellow(),
        "debug" => tag.dimmed(),
        _ => tag.normal(),
    };
    println!("{} {}", tag, message);
}

/// Stream a job's logs until it ends; a failed job is an error
async fn follow(config: &Config, manager: &Arc<JobManager>, submitted: SubmittedJob) -> Result<JobSnapshot> {
    let job_id = submitted.job.job_id.clone();
    debug!(%job_id, "follow: called");
    println!("Submitted job {}", job_id.bold());

    let mut subscription = manager.subscribe(&job_id)?;
    let mut last_seq = 0;
    let mut last = submitted.job.clone();
    while let Some(message) = subscription.next(config.jobs.heartbeat()).await {
        if message.kind == StreamKind::Heartbeat {
            debug!(%job_id, "follow: heartbeat");
            continue;
        }
        let since = last_seq;
        for log in message.job.logs.iter().filter(|l| l.seq > since) {
            print_log(&log.level, &log.message);
            last_seq = log.seq;
        }
        let terminal = message.is_terminal();
        last = message.job;
        if terminal {
            break;
        }
    }

    submitted.handle.await.context("Job worker failed")?;
    let job = manager.get_job_payload(&job_id).unwrap_or(last);
    print_job_header(&job);
    if job.status == JobStatus::Failed {
        bail!("Job {} failed: {}", job_id, job.error.as_deref().unwrap_or("unknown error"));
    }
    Ok(job)
}
