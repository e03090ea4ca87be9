//! Execution scheduler
//!
//! Turns a plan into a leaf-and-dependency-first run order and drives the
//! generator over it, writing every attempt back to the plan store.

mod config;
mod core;
mod order;

pub use config::SchedulerConfig;
pub use core::{ExecutionSummary, Scheduler, TaskOutcome};
pub use order::compute_run_order;

use planstore::StoreError;
use thiserror::Error;

use crate::prompts::PromptError;

/// Errors that abort a scheduler call
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Dependency cycle in plan {plan_id}: {}", format_cycle(.cycle))]
    CycleDetected { plan_id: i64, cycle: Vec<i64> },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

fn format_cycle(cycle: &[i64]) -> String {
    cycle.iter().map(|id| format!("#{}", id)).collect::<Vec<_>>().join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_display() {
        let err = SchedulerError::CycleDetected {
            plan_id: 3,
            cycle: vec![4, 5, 4],
        };
        assert_eq!(err.to_string(), "Dependency cycle in plan 3: #4 -> #5 -> #4");
    }
}
