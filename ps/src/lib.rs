//! PlanStore - persistent hierarchical task graphs
//!
//! A plan is a tree of tasks (materialized-path hierarchy) with cross-cutting
//! dependency edges that must form a DAG. Every plan lives in its own SQLite
//! database; a shared registry database holds the plan catalogue, the global
//! job index and the mirror of jobs not yet bound to a plan.
//!
//! # Layout
//!
//! ```text
//! <root>/registry.sqlite          plans, job_index, unbound job mirror
//! <root>/plans/plan_<id>.sqlite   tasks, task_dependencies, snapshots, job mirror
//! ```
//!
//! # Modules
//!
//! - [`model`] - PlanNode / PlanTree and friends
//! - [`store`] - the repository operations
//! - [`jobs`] - durable mirror for background jobs
//! - [`error`] - StoreError

pub mod error;
pub mod jobs;
pub mod model;
mod schema;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use jobs::{ActionLogRecord, JobLogRecord, JobRecord, redact_sensitive};
pub use model::{
    Anchor, AnchorKind, ContextSection, NewTask, NodeContext, NodeStatus, PlanNode, PlanSummary, PlanTree, TaskUpdate,
};
pub use store::{DroppedEdges, PlanStore, SnapshotRecord, UpsertReport};

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
