//! JobLogger - job-scoped log handle
//!
//! Handed to the scheduler and the decomposer so nested code can write to a
//! job's log without threading the job id through every call.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::manager::JobManager;
use super::types::LogLevel;

/// Cheap-to-clone handle bound to one job
#[derive(Clone)]
pub struct JobLogger {
    manager: Arc<JobManager>,
    job_id: String,
}

impl std::fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLogger").field("job_id", &self.job_id).finish()
    }
}

fn as_map(metadata: Value) -> Map<String, Value> {
    match metadata {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

impl JobLogger {
    pub fn new(manager: Arc<JobManager>, job_id: impl Into<String>) -> Self {
        Self {
            manager,
            job_id: job_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Append a line to the job log and mirror it to tracing
    ///
    /// Persistence failures are reported and swallowed so a logging hiccup
    /// never aborts the worker.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, metadata: Value) {
        let message = message.into();
        let job_id = self.job_id.as_str();
        match level {
            LogLevel::Debug => debug!(%job_id, "{}", message),
            LogLevel::Info => info!(%job_id, "{}", message),
            LogLevel::Warn => warn!(%job_id, "{}", message),
            LogLevel::Error => error!(%job_id, "{}", message),
        }
        if let Err(e) = self.manager.append_log(job_id, level, message, as_map(metadata)) {
            error!(%job_id, error = %e, "JobLogger: failed to append job log");
        }
    }

    pub fn debug(&self, message: impl Into<String>, metadata: Value) {
        self.log(LogLevel::Debug, message, metadata);
    }

    pub fn info(&self, message: impl Into<String>, metadata: Value) {
        self.log(LogLevel::Info, message, metadata);
    }

    pub fn warn(&self, message: impl Into<String>, metadata: Value) {
        self.log(LogLevel::Warn, message, metadata);
    }

    pub fn error(&self, message: impl Into<String>, metadata: Value) {
        self.log(LogLevel::Error, message, metadata);
    }

    /// Record a structured action; sensitive payload keys are redacted by the store
    pub fn action(&self, action: &str, payload: &Value) {
        if let Err(e) = self.manager.append_action(&self.job_id, action, payload) {
            error!(job_id = %self.job_id, %action, error = %e, "JobLogger: failed to record action");
        }
    }
}
