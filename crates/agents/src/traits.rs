//! The `AgentHandler` trait: the contract every agent must fulfil.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::AgentError;

/// Resolved task parameters handed to an agent.
pub type Params = Map<String, Value>;

/// The key → value map an agent returns on success.
pub type AgentOutput = Map<String, Value>;

/// Per-call context passed to every agent invocation.
///
/// Defined here (in the agents crate) so both the engine and individual agent
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct InvokeContext {
    /// ID of the parent workflow.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    /// Name of the task being executed.
    pub task_name: String,
    /// 0 on the first attempt, incremented on every retry.
    pub attempt: u32,
}

/// Static self-description of an agent, surfaced by
/// [`AgentRegistry::list_capabilities`](crate::AgentRegistry::list_capabilities).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub description: String,
    /// Actions this agent understands. Empty means "not advertised".
    pub actions: Vec<String>,
}

/// The core agent trait.
///
/// `invoke` is the only required method. Agents that wrap asynchronous
/// external resources settle them internally and return once complete.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Perform `action` with the given (already resolved) parameters.
    async fn invoke(
        &self,
        action: &str,
        params: &Params,
        ctx: &InvokeContext,
    ) -> Result<AgentOutput, AgentError>;

    fn describe(&self) -> AgentInfo {
        AgentInfo::default()
    }

    /// Called once by [`AgentRegistry::init_all`](crate::AgentRegistry::init_all)
    /// before the first execution.
    async fn init(&self) -> Result<(), AgentError> {
        Ok(())
    }

    /// Release any held resources (browser sessions, file handles, ...).
    async fn cleanup(&self) -> Result<(), AgentError> {
        Ok(())
    }
}
