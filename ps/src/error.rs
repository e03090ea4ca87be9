//! Store errors

use thiserror::Error;

/// Errors from PlanStore operations
///
/// `NotFound` and `InvalidArgument` are caller-recoverable. The remaining
/// variants are persistence failures and must be propagated.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// True for errors the caller can surface as a 404-equivalent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for durable persistence failures (I/O, SQL, serialization)
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Sqlite(_) | Self::Io(_) | Self::Json(_))
    }

    pub(crate) fn plan_not_found(plan_id: i64) -> Self {
        Self::NotFound(format!("Plan {}", plan_id))
    }

    pub(crate) fn task_not_found(plan_id: i64, task_id: i64) -> Self {
        Self::NotFound(format!("Task {} in plan {}", task_id, plan_id))
    }
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
