//! `engine` crate: domain models, workflow validation, variable resolution,
//! the retry wrapper, and the orchestration engine.

pub mod config;
pub mod error;
pub mod executor;
pub mod models;
pub mod retry;
pub mod validate;
pub mod variables;

pub use config::EngineConfig;
pub use error::{EngineError, TaskError};
pub use executor::Engine;
pub use models::{ExecutionRequest, NewWorkflow, OnError, TaskDef, Workflow, WorkflowDefinition};
pub use retry::{execute_with_retry, RetryError, RetryPolicy};
pub use validate::validate_workflow;
pub use variables::{resolve_parameters, Scope, VariableError};

pub use db::models::{ExecutionRow, ExecutionStatus, TaskRow, TaskStatus, TriggerType, WorkflowStatus};
