//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// PlanDaemon - LLM-driven plan task graphs
#[derive(Parser)]
#[command(
    name = "pd",
    about = "Build, decompose and execute plan task graphs",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Manage plans
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },

    /// Manage tasks within a plan
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Expand a plan (or one task) into subtasks and wait for the job
    Decompose {
        /// Plan id
        plan_id: i64,

        /// Expand only this task
        #[arg(short, long)]
        node: Option<i64>,

        /// Maximum relative depth to expand
        #[arg(long)]
        max_depth: Option<u32>,

        /// Maximum number of tasks to create
        #[arg(short, long)]
        budget: Option<usize>,

        /// Expand tasks that already have subtasks
        #[arg(long)]
        allow_existing: bool,
    },

    /// Execute a plan (or one task) and wait for the job
    Execute {
        /// Plan id
        plan_id: i64,

        /// Execute only this task
        #[arg(short, long)]
        task: Option<i64>,
    },

    /// Inspect background jobs
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
}

/// Plan subcommands
#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    /// Create a plan
    Create {
        /// Plan title
        title: String,

        /// Plan description
        #[arg(short, long)]
        description: Option<String>,

        /// Decompose the new plan right away (runs as a job)
        #[arg(long)]
        decompose: bool,
    },

    /// List plans
    List {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a plan outline
    Show {
        /// Plan id
        plan_id: i64,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete a plan and its database
    Delete {
        /// Plan id
        plan_id: i64,
    },
}

/// Task subcommands
#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// Add a task
    Add {
        /// Plan id
        plan_id: i64,

        /// Task name
        name: String,

        /// Parent task id (root level when omitted)
        #[arg(short, long)]
        parent: Option<i64>,

        /// Instruction text
        #[arg(short, long)]
        instruction: Option<String>,

        /// Insert before this sibling
        #[arg(long, conflicts_with_all = ["after", "first_child", "last_child", "position"])]
        before: Option<i64>,

        /// Insert after this sibling
        #[arg(long, conflicts_with_all = ["first_child", "last_child", "position"])]
        after: Option<i64>,

        /// Insert as the first subtask of this task
        #[arg(long, value_name = "ID", conflicts_with_all = ["last_child", "position"])]
        first_child: Option<i64>,

        /// Insert as the last subtask of this task
        #[arg(long, value_name = "ID", conflicts_with = "position")]
        last_child: Option<i64>,

        /// Explicit sibling position
        #[arg(long)]
        position: Option<i64>,

        /// Tasks this one depends on (comma separated)
        #[arg(short = 'd', long = "depends-on", value_delimiter = ',')]
        depends_on: Vec<i64>,
    },

    /// Update task fields
    Update {
        /// Plan id
        plan_id: i64,

        /// Task id
        task_id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(short, long)]
        instruction: Option<String>,

        /// pending, running, completed, failed, skipped
        #[arg(short, long)]
        status: Option<String>,

        /// Replace the dependency set (comma separated)
        #[arg(short = 'd', long = "depends-on", value_delimiter = ',')]
        depends_on: Option<Vec<i64>>,
    },

    /// Move a task under a new parent and/or position
    Move {
        /// Plan id
        plan_id: i64,

        /// Task id
        task_id: i64,

        /// New parent task id
        #[arg(short, long, conflicts_with = "root")]
        parent: Option<i64>,

        /// Move to the root level
        #[arg(long)]
        root: bool,

        /// New sibling position (appends when omitted)
        #[arg(long)]
        position: Option<i64>,
    },

    /// Delete a task and its subtree
    Rm {
        /// Plan id
        plan_id: i64,

        /// Task id
        task_id: i64,
    },

    /// Add or remove dependency edges
    Deps {
        /// Plan id
        plan_id: i64,

        /// Task id
        task_id: i64,

        /// Dependencies to add (comma separated)
        #[arg(long, value_delimiter = ',')]
        add: Vec<i64>,

        /// Dependencies to remove (comma separated)
        #[arg(long, value_delimiter = ',')]
        remove: Vec<i64>,
    },
}

/// Job subcommands
#[derive(Debug, Subcommand)]
pub enum JobCommand {
    /// Show a job with its logs
    Show {
        /// Job id
        job_id: String,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Output format for commands that print data
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
