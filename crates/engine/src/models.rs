//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like
//! in memory. The definition is stored as JSON in the `definition`
//! column of the `workflows` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use db::models::{NewWorkflowRow, TriggerType, WorkflowRow, WorkflowStatus};

use crate::EngineError;

pub const DEFAULT_OWNER: &str = "system";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3_600;
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// TaskDef
// ---------------------------------------------------------------------------

/// What a task's terminal failure does to the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Abort the execution as `failed`.
    #[default]
    Stop,
    /// Record the failure and move on to the next task.
    Continue,
}

/// A single step in the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    /// Unique within the workflow; used by `${name.output...}` references.
    pub name: String,
    /// Maps to a handler registered in the `AgentRegistry`.
    pub agent_type: String,
    pub action: String,
    /// May contain `${...}` placeholders, resolved just before dispatch.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub on_error: OnError,
    /// Per-invoke bound; falls back to the engine's default task timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Overrides the workflow-level retry budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskDef {
    pub fn new(name: impl Into<String>, agent_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            agent_type: agent_type.into(),
            action: action.into(),
            parameters: Map::new(),
            on_error: OnError::Stop,
            timeout_seconds: None,
            max_retries: None,
        }
    }

    /// Non-object values are ignored.
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        if let Value::Object(map) = parameters {
            self.parameters = map;
        }
        self
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// The ordered task list of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub tasks: Vec<TaskDef>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

fn default_owner() -> String {
    DEFAULT_OWNER.to_owned()
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A workflow as submitted for creation (e.g. a JSON file on the CLI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    pub definition: WorkflowDefinition,
    #[serde(default = "default_owner")]
    pub owner_id: String,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_schedule: Option<String>,
}

impl NewWorkflow {
    /// A workflow with default owner, timeout and retry budget.
    pub fn new(name: impl Into<String>, tasks: Vec<TaskDef>) -> Self {
        Self {
            name: name.into(),
            definition: WorkflowDefinition { tasks },
            owner_id: default_owner(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            cron_schedule: None,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = owner_id.into();
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_schedule = Some(expression.into());
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        crate::validate::validate_workflow(
            &self.name,
            &self.definition,
            self.timeout_seconds,
            self.cron_schedule.as_deref(),
        )
    }

    pub(crate) fn into_row(self) -> Result<NewWorkflowRow, EngineError> {
        let definition = serde_json::to_value(&self.definition)
            .map_err(|source| EngineError::Database(db::DbError::Json(source)))?;
        Ok(NewWorkflowRow {
            name: self.name,
            definition,
            owner_id: self.owner_id,
            timeout_seconds: self.timeout_seconds,
            max_retries: self.max_retries,
            cron_schedule: self.cron_schedule,
        })
    }
}

/// A stored workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub definition: WorkflowDefinition,
    pub owner_id: String,
    pub status: WorkflowStatus,
    pub timeout_seconds: u64,
    /// Default retry budget for tasks without their own `max_retries`.
    pub max_retries: u32,
    pub cron_schedule: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn validate(&self) -> Result<(), EngineError> {
        crate::validate::validate_workflow(
            &self.name,
            &self.definition,
            self.timeout_seconds,
            self.cron_schedule.as_deref(),
        )
    }

    /// Effective retry budget for `task`.
    pub fn max_retries_for(&self, task: &TaskDef) -> u32 {
        task.max_retries.unwrap_or(self.max_retries)
    }
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = EngineError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let definition = serde_json::from_value(row.definition)
            .map_err(|source| EngineError::CorruptDefinition { workflow_id: row.id, source })?;
        Ok(Self {
            id: row.id,
            name: row.name,
            definition,
            owner_id: row.owner_id,
            status: row.status,
            timeout_seconds: row.timeout_seconds,
            max_retries: row.max_retries,
            cron_schedule: row.cron_schedule,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// ExecutionRequest
// ---------------------------------------------------------------------------

/// Trigger input for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionRequest {
    /// Visible to tasks as `${input...}`.
    pub variables: Map<String, Value>,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
}

impl ExecutionRequest {
    pub fn manual(variables: Map<String, Value>) -> Self {
        Self { variables, ..Default::default() }
    }

    pub fn scheduled(schedule: impl Into<String>) -> Self {
        Self {
            trigger_type: TriggerType::Scheduled,
            triggered_by: Some(schedule.into()),
            ..Default::default()
        }
    }

    pub fn webhook(source: impl Into<String>, variables: Map<String, Value>) -> Self {
        Self {
            variables,
            trigger_type: TriggerType::Webhook,
            triggered_by: Some(source.into()),
        }
    }

    pub fn triggered_by(mut self, who: impl Into<String>) -> Self {
        self.triggered_by = Some(who.into());
        self
    }
}
