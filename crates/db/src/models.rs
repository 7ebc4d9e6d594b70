//! Row structs that map 1-to-1 onto database tables, plus the status enums
//! and transition rules every write path enforces.
//!
//! These are *persistence* models: the typed workflow definition lives in the
//! `engine` crate and is stored here as opaque JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Implements `Display`/`FromStr` for a status enum using its wire names.
macro_rules! status_strings {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Active,
    Archived,
}

status_strings!(WorkflowStatus {
    Active => "active",
    Archived => "archived",
});

/// A persisted workflow definition row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Full JSON workflow definition (`{"tasks": [...]}`).
    pub definition: Value,
    pub owner_id: String,
    pub status: WorkflowStatus,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub cron_schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`create_workflow`](crate::repository::workflows::create_workflow).
#[derive(Debug, Clone)]
pub struct NewWorkflowRow {
    pub name: String,
    pub definition: Value,
    pub owner_id: String,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub cron_schedule: Option<String>,
}

// ---------------------------------------------------------------------------
// executions
// ---------------------------------------------------------------------------

/// Execution state machine: `pending → running → {completed, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

status_strings!(ExecutionStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal, forward transition.
    ///
    /// Same-status writes are handled separately as no-ops.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled)
                | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

/// How an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Scheduled,
    Webhook,
}

status_strings!(TriggerType {
    Manual => "manual",
    Scheduled => "scheduled",
    Webhook => "webhook",
});

/// A persisted execution row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    /// Trigger input the run was started with.
    pub variables: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    /// Task outputs keyed by task name.
    pub output: Map<String, Value>,
    pub error_message: Option<String>,
}

/// Input for [`create_execution`](crate::repository::executions::create_execution).
#[derive(Debug, Clone, Default)]
pub struct NewExecution {
    pub workflow_id: Uuid,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    pub variables: Map<String, Value>,
}

/// A status write for an execution. `None` fields keep the stored value.
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub output: Option<Map<String, Value>>,
    pub error_message: Option<String>,
}

impl ExecutionUpdate {
    pub fn status(status: ExecutionStatus) -> Self {
        Self { status, output: None, error_message: None }
    }

    pub fn with_output(mut self, output: Map<String, Value>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

// ---------------------------------------------------------------------------
// tasks
// ---------------------------------------------------------------------------

/// Task state machine: `queued → running → {completed, failed}`.
///
/// Retries stay inside `running`; only `retry_count` moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

status_strings!(TaskStatus {
    Queued => "queued",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running) | (Queued, Failed)
                | (Running, Running) | (Running, Completed) | (Running, Failed)
        )
    }
}

/// A persisted task row (one TaskDef instance inside one execution).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: Uuid,
    pub execution_id: Uuid,
    /// Index of the task in the workflow definition.
    pub position: u32,
    pub name: String,
    pub agent_type: String,
    pub action: String,
    /// Parameters after variable resolution.
    pub parameters: Map<String, Value>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<Map<String, Value>>,
    pub error_message: Option<String>,
}

/// Input for [`create_task`](crate::repository::tasks::create_task).
#[derive(Debug, Clone)]
pub struct NewTask {
    pub execution_id: Uuid,
    pub position: u32,
    pub name: String,
    pub agent_type: String,
    pub action: String,
    pub parameters: Map<String, Value>,
}

/// A status write for a task. `None` fields keep the stored value.
#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub retry_count: Option<u32>,
    pub output: Option<Map<String, Value>>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn running() -> Self {
        Self { status: TaskStatus::Running, retry_count: None, output: None, error_message: None }
    }

    /// A retry attempt is starting; bumps `retry_count` only.
    pub fn retry(retry_count: u32) -> Self {
        Self { retry_count: Some(retry_count), ..Self::running() }
    }

    pub fn completed(output: Map<String, Value>) -> Self {
        Self {
            status: TaskStatus::Completed,
            retry_count: None,
            output: Some(output),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            retry_count: None,
            output: None,
            error_message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_transitions_only_move_forward() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn task_retries_stay_in_running() {
        use TaskStatus::*;
        assert!(Running.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
    }

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for status in ["pending", "running", "completed", "failed", "cancelled"] {
            let parsed: ExecutionStatus = status.parse().unwrap();
            assert_eq!(parsed.to_string(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
        assert_eq!("webhook".parse::<TriggerType>(), Ok(TriggerType::Webhook));
    }
}
