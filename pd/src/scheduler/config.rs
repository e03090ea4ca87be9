//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Generation attempts per task (errors only; a returned failure is final)
    #[serde(rename = "max-retries", default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before a retry, doubled on each further attempt
    #[serde(rename = "retry-backoff-ms", default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Stop the plan at the first failed task
    #[serde(rename = "dependency-throttle", default = "default_dependency_throttle")]
    pub dependency_throttle: bool,

    /// Put the whole plan outline into every execution prompt
    #[serde(rename = "include-plan-outline", default)]
    pub include_plan_outline: bool,

    /// Timeout for a single generation call
    #[serde(rename = "generate-timeout-ms", default = "default_generate_timeout_ms")]
    pub generate_timeout_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_dependency_throttle() -> bool {
    true
}

fn default_generate_timeout_ms() -> u64 {
    180_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_backoff_ms: 500,
            dependency_throttle: true,
            include_plan_outline: false,
            generate_timeout_ms: 180_000,
        }
    }
}

impl SchedulerConfig {
    /// At least one attempt is always made
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_millis(self.generate_timeout_ms)
    }

    /// Backoff before attempt `attempt` (1-based; none before the first)
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(2u64.saturating_pow(attempt - 2)))
    }
}
