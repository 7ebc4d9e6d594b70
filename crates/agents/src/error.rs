//! Agent-level error types.

use thiserror::Error;

/// Errors returned by an agent's `invoke` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`: counts against the task's retry budget and is retried
///   with exponential back-off.
/// - `Fatal`: the task fails immediately; no retry is attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Transient failure (network blip, flaky external resource).
    #[error("retryable agent error: {0}")]
    Retryable(String),

    /// Permanent failure (bad parameters, unsupported action).
    #[error("fatal agent error: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Errors produced by the [`AgentRegistry`](crate::AgentRegistry).
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No handler is registered under the requested agent type.
    #[error("unknown agent type '{0}'")]
    UnknownAgent(String),

    /// An agent's `init` hook failed during startup.
    #[error("agent '{agent_type}' failed to initialise: {source}")]
    InitFailed {
        agent_type: String,
        #[source]
        source: AgentError,
    },
}
