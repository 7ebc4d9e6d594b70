//! Engine-level error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use agents::{AgentError, RegistryError};

use crate::variables::VariableError;

/// Errors produced by the workflow engine (validation, setup, persistence).
///
/// Task-level failures never surface here; they end up in the Task and
/// Execution `error_message` columns as a [`TaskError`].
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors ------

    #[error("workflow name must not be empty")]
    EmptyName,

    #[error("workflow has no tasks")]
    EmptyWorkflow,

    #[error("invalid task name '{0}': use letters, digits, '_' and '-'")]
    InvalidTaskName(String),

    #[error("task name '{0}' is reserved")]
    ReservedTaskName(String),

    #[error("duplicate task name: '{0}'")]
    DuplicateTaskName(String),

    #[error("task '{task}' has an empty {field}")]
    MissingField { task: String, field: &'static str },

    #[error("{subject} timeout must be positive")]
    InvalidTimeout { subject: String },

    #[error("task '{task}': {source}")]
    InvalidReference {
        task: String,
        #[source]
        source: VariableError,
    },

    /// A placeholder names a task that is not declared before this one.
    #[error("task '{task}' references '{referenced}', which is not an earlier task")]
    ForwardReference { task: String, referenced: String },

    #[error("invalid cron schedule '{expression}': {reason}")]
    InvalidCronSchedule { expression: String, reason: String },

    // ------ Setup errors ------

    #[error("workflow '{0}' not found")]
    WorkflowNotFound(Uuid),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(Uuid),

    #[error("workflow '{0}' is archived")]
    WorkflowArchived(Uuid),

    #[error("workflow '{workflow_id}' already has a live execution ({execution_id})")]
    ExecutionInProgress { workflow_id: Uuid, execution_id: Uuid },

    #[error("stored definition of workflow '{workflow_id}' is unreadable: {source}")]
    CorruptDefinition {
        workflow_id: Uuid,
        #[source]
        source: serde_json::Error,
    },

    #[error("engine is shutting down")]
    ShuttingDown,

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}

/// Why a single task failed. Rendered into the Task row's `error_message`.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("variable resolution failed: {0}")]
    Variable(#[from] VariableError),

    #[error(transparent)]
    UnknownAgent(#[from] RegistryError),

    /// A non-retryable agent failure, or a retryable one seen on its own.
    #[error("{0}")]
    Agent(AgentError),

    /// The agent panicked inside `invoke`; never retried.
    #[error("agent panicked: {0}")]
    Panicked(String),

    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("workflow exceeded its timeout of {0}s")]
    ExecutionTimeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("interrupted by engine shutdown")]
    Interrupted,

    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}

impl TaskError {
    /// Transient failures that count against the retry budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Agent(err) => err.is_retryable(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Failures that end the execution regardless of `on_error`.
    pub fn aborts_execution(&self) -> bool {
        matches!(
            self,
            Self::ExecutionTimeout(_) | Self::Cancelled | Self::Interrupted | Self::Database(_)
        )
    }
}
