//! Decomposition engine
//!
//! Breadth-first expansion of plan nodes into subtasks proposed by the
//! generator, bounded by a relative depth and a per-run node budget.

mod decomposer;

pub use decomposer::{DecompositionResult, Decomposer, FailedExpansion, StopReason};

use planstore::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::DecomposerConfig;
use crate::prompts::PromptError;

/// Errors that abort a decomposition run
///
/// Generation failures are not here: they are recorded per node in
/// `DecompositionResult::failed`.
#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Prompt(#[from] PromptError),
}

/// Limits for one decomposition run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecomposeOptions {
    pub max_depth: u32,
    pub node_budget: usize,
    pub max_children: usize,
    pub stop_on_empty: bool,
    pub allow_existing_children: bool,
}

impl Default for DecomposeOptions {
    fn default() -> Self {
        Self::from(&DecomposerConfig::default())
    }
}

impl From<&DecomposerConfig> for DecomposeOptions {
    fn from(config: &DecomposerConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            node_budget: config.node_budget,
            max_children: config.max_children,
            stop_on_empty: config.stop_on_empty,
            allow_existing_children: config.allow_existing_children,
        }
    }
}

impl DecomposeOptions {
    pub fn with_max_depth(mut self, max_depth: Option<u32>) -> Self {
        if let Some(max_depth) = max_depth {
            self.max_depth = max_depth;
        }
        self
    }

    pub fn with_node_budget(mut self, node_budget: Option<usize>) -> Self {
        if let Some(node_budget) = node_budget {
            self.node_budget = node_budget;
        }
        self
    }

    pub fn with_allow_existing(mut self, allow: Option<bool>) -> Self {
        if let Some(allow) = allow {
            self.allow_existing_children = allow;
        }
        self
    }
}
