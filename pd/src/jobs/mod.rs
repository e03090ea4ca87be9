//! Background jobs
//!
//! The `JobManager` is the in-process registry of jobs: lifecycle, bounded
//! log buffers, subscriber streams and the durable mirror. `JobRunner`
//! spawns one worker per submitted scheduler or decomposer call.

mod logger;
mod manager;
mod runner;
mod types;

pub use logger::JobLogger;
pub use manager::{JobManager, JobSubscription};
pub use runner::{JobOutput, JobRunner, SubmittedJob};
pub use types::{JobMode, JobSnapshot, JobStatus, LogLevel, NewJob, StreamKind, StreamMessage};

use planstore::StoreError;
use thiserror::Error;

/// Job manager errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    Duplicate(String),

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Corrupt job record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}
