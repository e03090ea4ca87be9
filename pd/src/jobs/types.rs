//! Job types shared by the manager, the logger and the stream

use std::fmt;
use std::str::FromStr;

use planstore::{JobLogRecord, JobRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::JobError;

/// Job lifecycle: queued -> running -> succeeded | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Transitions only move forward
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Succeeded)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(JobError::Corrupt(format!("unknown job status '{}'", other))),
        }
    }
}

/// Scope of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    PlanWide,
    SingleNode,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PlanWide => "plan_wide",
            Self::SingleNode => "single_node",
        }
    }
}

impl FromStr for JobMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan_wide" => Ok(Self::PlanWide),
            "single_node" => Ok(Self::SingleNode),
            other => Err(JobError::Corrupt(format!("unknown job mode '{}'", other))),
        }
    }
}

/// Severity of a job log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Input for `JobManager::create_job`
#[derive(Debug, Clone)]
pub struct NewJob {
    pub plan_id: Option<i64>,
    pub task_id: Option<i64>,
    pub mode: JobMode,
    pub params: Map<String, Value>,
    pub metadata: Map<String, Value>,
    /// Explicit id; a v7 UUID is generated when absent
    pub job_id: Option<String>,
}

impl NewJob {
    pub fn new(mode: JobMode) -> Self {
        Self {
            plan_id: None,
            task_id: None,
            mode,
            params: Map::new(),
            metadata: Map::new(),
            job_id: None,
        }
    }

    pub fn for_plan(mut self, plan_id: i64) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn for_task(mut self, task_id: i64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub plan_id: Option<i64>,
    pub task_id: Option<i64>,
    pub mode: JobMode,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
    pub result: Option<Value>,
    #[serde(default)]
    pub stats: Map<String, Value>,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub logs: Vec<JobLogRecord>,
}

impl JobSnapshot {
    /// Same snapshot without log lines
    pub fn summary(&self) -> Self {
        Self {
            logs: Vec::new(),
            ..self.clone()
        }
    }

    pub fn to_record(&self) -> JobRecord {
        JobRecord {
            job_id: self.job_id.clone(),
            plan_id: self.plan_id,
            task_id: self.task_id,
            mode: self.mode.as_str().to_string(),
            status: self.status.as_str().to_string(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
            result: self.result.clone(),
            stats: self.stats.clone(),
            params: self.params.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuild a snapshot from the durable mirror
    pub fn from_record(record: JobRecord, logs: Vec<JobLogRecord>) -> Result<Self, JobError> {
        Ok(Self {
            mode: record.mode.parse()?,
            status: record.status.parse()?,
            job_id: record.job_id,
            plan_id: record.plan_id,
            task_id: record.task_id,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            error: record.error,
            result: record.result,
            stats: record.stats,
            params: record.params,
            metadata: record.metadata,
            logs,
        })
    }
}

/// Kind of stream message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Full state with buffered logs, sent first
    Snapshot,
    /// A state change or new log lines
    Event,
    /// Keep-alive after a quiet period
    Heartbeat,
}

/// One message on a job subscription, serialized as one JSON object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: StreamKind,
    pub job: JobSnapshot,
}

impl StreamMessage {
    pub fn snapshot(job: JobSnapshot) -> Self {
        Self {
            kind: StreamKind::Snapshot,
            job,
        }
    }

    pub fn event(job: JobSnapshot) -> Self {
        Self {
            kind: StreamKind::Event,
            job,
        }
    }

    pub fn heartbeat(job: JobSnapshot) -> Self {
        Self {
            kind: StreamKind::Heartbeat,
            job: job.summary(),
        }
    }

    /// True once the job has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.job.status.is_terminal()
    }
}
