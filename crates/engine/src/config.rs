//! Engine tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Configuration for [`Engine`](crate::Engine).
///
/// Every field has a default, so an empty `[engine]` table is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay_ms: u64,
    /// Upper bound on any single back-off.
    pub retry_max_delay_ms: u64,
    /// Per-invoke bound for tasks that set no `timeout_seconds`.
    pub default_task_timeout_ms: u64,
    /// When `false`, a workflow with a live run refuses a second start.
    pub allow_overlapping_runs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_base_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            default_task_timeout_ms: 300_000,
            allow_overlapping_runs: true,
        }
    }
}

impl EngineConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn retry_policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, self.retry_base_delay(), self.retry_max_delay())
    }
}
