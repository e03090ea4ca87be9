//! PlanDaemon - LLM-driven plan task graphs
//!
//! A plan is a tree of tasks with cross-cutting dependency edges, persisted
//! by [`planstore`]. This crate expands plans with a generator, executes them
//! leaf-and-dependency-first, and runs both as background jobs with streamed
//! logs.
//!
//! # Modules
//!
//! - [`scheduler`] - run order and per-task execution with retries
//! - [`planning`] - breadth-first decomposition under depth and budget limits
//! - [`jobs`] - job registry, log buffers, subscriptions and workers
//! - [`generate`] - the `Generator` capability and an OpenAI-compatible client
//! - [`prompts`] - prompt templates
//! - [`config`] - configuration types and loading
//! - [`storage`] - store calls from async workers
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod generate;
pub mod jobs;
pub mod planning;
pub mod prompts;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{Config, DecomposerConfig, JobsConfig, LlmConfig, StoreConfig};
pub use generate::{GenerateConfig, GenerateError, Generation, Generator, OpenAiGenerator, create_generator};
pub use jobs::{
    JobError, JobLogger, JobManager, JobMode, JobOutput, JobRunner, JobSnapshot, JobStatus, JobSubscription, LogLevel,
    NewJob, StreamKind, StreamMessage, SubmittedJob,
};
pub use planning::{DecomposeError, DecomposeOptions, Decomposer, DecompositionResult, FailedExpansion, StopReason};
pub use prompts::{DefaultPromptBuilder, PromptBuilder, PromptError};
pub use scheduler::{
    ExecutionSummary, Scheduler, SchedulerConfig, SchedulerError, TaskOutcome, compute_run_order,
};
