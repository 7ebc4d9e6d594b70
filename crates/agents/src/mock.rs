//! `MockAgent`: a test double for `AgentHandler`.
//!
//! Useful in unit and integration tests where a real agent implementation is
//! either unavailable or irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::{AgentError, AgentHandler, AgentInfo, AgentOutput, InvokeContext, Params};

/// Behaviour injected into `MockAgent` at construction time.
pub enum MockBehaviour {
    /// Return a specific output map.
    ReturnValue(AgentOutput),
    /// Return the parameters it was called with.
    Echo,
    /// Fail with a `Retryable` error on every call.
    FailRetryable(String),
    /// Fail with a `Fatal` error on every call.
    FailFatal(String),
    /// Fail with a `Retryable` error for the first `failures` calls, then succeed.
    Flaky { failures: usize, output: AgentOutput },
    /// Sleep for `duration`, then return `output`.
    Sleep { duration: Duration, output: AgentOutput },
}

/// One recorded invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub action: String,
    pub params: Params,
    pub attempt: u32,
}

/// A mock agent that records every call it receives and returns a
/// programmer-specified result.
pub struct MockAgent {
    /// Label used in test assertions.
    pub name: String,
    /// What the agent will do when `invoke` is called.
    pub behaviour: MockBehaviour,
    /// All calls seen by this agent (in call order).
    pub calls: Arc<Mutex<Vec<MockCall>>>,
    init_error: Option<String>,
    cleanups: AtomicUsize,
}

fn into_output(value: Value) -> AgentOutput {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

impl MockAgent {
    fn with_behaviour(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            init_error: None,
            cleanups: AtomicUsize::new(0),
        }
    }

    /// Create a mock that always succeeds with the given value.
    ///
    /// Non-object values are wrapped as `{"value": ...}`.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::with_behaviour(name, MockBehaviour::ReturnValue(into_output(value)))
    }

    /// Create a mock that returns its parameters unchanged.
    pub fn echo(name: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::Echo)
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::with_behaviour(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `failures` times before returning `value`.
    pub fn flaky(name: impl Into<String>, failures: usize, value: Value) -> Self {
        Self::with_behaviour(
            name,
            MockBehaviour::Flaky { failures, output: into_output(value) },
        )
    }

    /// Create a mock that sleeps before returning `value`.
    pub fn sleeping(name: impl Into<String>, duration: Duration, value: Value) -> Self {
        Self::with_behaviour(
            name,
            MockBehaviour::Sleep { duration, output: into_output(value) },
        )
    }

    /// Make `init` fail with a `Fatal` error.
    pub fn with_init_error(mut self, msg: impl Into<String>) -> Self {
        self.init_error = Some(msg.into());
        self
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, Vec<MockCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of times this agent has been invoked.
    pub fn call_count(&self) -> usize {
        self.lock_calls().len()
    }

    /// Snapshot of every recorded call.
    pub fn recorded_calls(&self) -> Vec<MockCall> {
        self.lock_calls().clone()
    }

    /// Number of times `cleanup` has run.
    pub fn cleanup_count(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentHandler for MockAgent {
    async fn invoke(
        &self,
        action: &str,
        params: &Params,
        ctx: &InvokeContext,
    ) -> Result<AgentOutput, AgentError> {
        let call_index = {
            let mut calls = self.lock_calls();
            calls.push(MockCall {
                action: action.to_owned(),
                params: params.clone(),
                attempt: ctx.attempt,
            });
            calls.len()
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(out) => Ok(out.clone()),
            MockBehaviour::Echo => Ok(params.clone()),
            MockBehaviour::FailRetryable(msg) => Err(AgentError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(AgentError::Fatal(msg.clone())),
            MockBehaviour::Flaky { failures, output } => {
                if call_index <= *failures {
                    Err(AgentError::Retryable(format!(
                        "{} transient failure #{call_index}",
                        self.name
                    )))
                } else {
                    Ok(output.clone())
                }
            }
            MockBehaviour::Sleep { duration, output } => {
                tokio::time::sleep(*duration).await;
                Ok(output.clone())
            }
        }
    }

    fn describe(&self) -> AgentInfo {
        AgentInfo {
            description: format!("mock agent '{}'", self.name),
            actions: Vec::new(),
        }
    }

    async fn init(&self) -> Result<(), AgentError> {
        match &self.init_error {
            Some(msg) => Err(AgentError::Fatal(msg.clone())),
            None => Ok(()),
        }
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
