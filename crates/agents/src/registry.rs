//! Agent registry: maps an `agent_type` string to its handler.
//!
//! The registry is a pure lookup table: it performs no retry, no timeout
//! enforcement and no variable resolution. It is constructed at startup and
//! handed to the engine, which shares it across every running execution.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::{AgentHandler, RegistryError};

/// Introspection record for one registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentDescriptor {
    pub agent_type: String,
    pub description: String,
    pub actions: Vec<String>,
}

/// Thread-safe map of `agent_type` → handler.
///
/// `resolve` takes a shard read lock only, so concurrent executions never
/// contend with each other after the registration phase.
#[derive(Default)]
pub struct AgentRegistry {
    handlers: DashMap<String, Arc<dyn AgentHandler>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `agent_type`, returning the handler it replaced.
    pub fn register(
        &self,
        agent_type: impl Into<String>,
        handler: Arc<dyn AgentHandler>,
    ) -> Option<Arc<dyn AgentHandler>> {
        let agent_type = agent_type.into();
        info!("registering agent '{}'", agent_type);
        let previous = self.handlers.insert(agent_type.clone(), handler);
        if previous.is_some() {
            warn!("agent '{}' was already registered; replaced", agent_type);
        }
        previous
    }

    /// Builder-style registration, handy when wiring the registry at startup.
    pub fn with_agent(self, agent_type: impl Into<String>, handler: Arc<dyn AgentHandler>) -> Self {
        self.register(agent_type, handler);
        self
    }

    pub fn deregister(&self, agent_type: &str) -> Option<Arc<dyn AgentHandler>> {
        self.handlers.remove(agent_type).map(|(_, handler)| handler)
    }

    /// Look up the handler for `agent_type`.
    ///
    /// # Errors
    /// [`RegistryError::UnknownAgent`] if nothing is registered under that name.
    pub fn resolve(&self, agent_type: &str) -> Result<Arc<dyn AgentHandler>, RegistryError> {
        self.handlers
            .get(agent_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| RegistryError::UnknownAgent(agent_type.to_owned()))
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.handlers.contains_key(agent_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Describe every registered agent, sorted by `agent_type`.
    pub fn list_capabilities(&self) -> Vec<AgentDescriptor> {
        let mut descriptors: Vec<AgentDescriptor> = self
            .handlers
            .iter()
            .map(|entry| {
                let info = entry.value().describe();
                AgentDescriptor {
                    agent_type: entry.key().clone(),
                    description: info.description,
                    actions: info.actions,
                }
            })
            .collect();
        descriptors.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        descriptors
    }

    /// Snapshot the handlers so no shard lock is held across an `.await`.
    fn snapshot(&self) -> Vec<(String, Arc<dyn AgentHandler>)> {
        let mut entries: Vec<_> = self
            .handlers
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Run every agent's `init` hook in `agent_type` order.
    ///
    /// # Errors
    /// Stops at the first failing agent and returns [`RegistryError::InitFailed`].
    pub async fn init_all(&self) -> Result<(), RegistryError> {
        if self.is_empty() {
            warn!("no agents registered; every task will fail with an unknown agent");
        }
        for (agent_type, handler) in self.snapshot() {
            handler
                .init()
                .await
                .map_err(|source| RegistryError::InitFailed {
                    agent_type: agent_type.clone(),
                    source,
                })?;
            info!("agent '{}' initialised", agent_type);
        }
        info!(count = self.len(), "agent registry ready");
        Ok(())
    }

    /// Run every agent's `cleanup` hook. Failures are logged, not returned.
    pub async fn cleanup_all(&self) {
        for (agent_type, handler) in self.snapshot() {
            if let Err(e) = handler.cleanup().await {
                warn!("agent '{}' cleanup failed: {}", agent_type, e);
            }
        }
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        types.sort();
        f.debug_struct("AgentRegistry").field("agent_types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use crate::{AgentError, EchoAgent, InvokeContext, Params};
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> InvokeContext {
        InvokeContext {
            workflow_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            task_name: "t".into(),
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn resolve_returns_registered_handler() {
        let registry = AgentRegistry::new();
        registry.register("echo", Arc::new(EchoAgent));

        let handler = registry.resolve("echo").expect("echo should resolve");
        let mut params = Params::new();
        params.insert("k".into(), json!("v"));
        let out = handler.invoke("echo", &params, &ctx()).await.unwrap();
        assert_eq!(out["k"], "v");
    }

    #[test]
    fn resolve_unknown_type_fails() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.resolve("ghost"),
            Err(RegistryError::UnknownAgent(t)) if t == "ghost"
        ));
    }

    #[test]
    fn register_replaces_and_returns_previous() {
        let registry = AgentRegistry::new();
        assert!(registry.register("http", Arc::new(EchoAgent)).is_none());
        assert!(registry.register("http", Arc::new(EchoAgent)).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deregister_removes_handler() {
        let registry = AgentRegistry::new().with_agent("echo", Arc::new(EchoAgent));
        assert!(registry.deregister("echo").is_some());
        assert!(!registry.contains("echo"));
        assert!(registry.is_empty());
    }

    #[test]
    fn list_capabilities_is_sorted_and_describes_agents() {
        let registry = AgentRegistry::new()
            .with_agent("zeta", Arc::new(MockAgent::returning("z", json!({}))))
            .with_agent("echo", Arc::new(EchoAgent));

        let caps = registry.list_capabilities();
        let types: Vec<&str> = caps.iter().map(|c| c.agent_type.as_str()).collect();
        assert_eq!(types, vec!["echo", "zeta"]);
        assert_eq!(caps[0].actions, vec!["echo"]);
    }

    #[tokio::test]
    async fn init_all_reports_failing_agent() {
        let registry = AgentRegistry::new()
            .with_agent("ok", Arc::new(EchoAgent))
            .with_agent(
                "broken",
                Arc::new(MockAgent::returning("broken", json!({})).with_init_error("no driver")),
            );

        match registry.init_all().await {
            Err(RegistryError::InitFailed { agent_type, source }) => {
                assert_eq!(agent_type, "broken");
                assert_eq!(source, AgentError::Fatal("no driver".into()));
            }
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_all_visits_every_agent() {
        let a = Arc::new(MockAgent::returning("a", json!({})));
        let b = Arc::new(MockAgent::returning("b", json!({})));
        let registry = AgentRegistry::new()
            .with_agent("a", a.clone())
            .with_agent("b", b.clone());

        registry.cleanup_all().await;
        assert_eq!(a.cleanup_count(), 1);
        assert_eq!(b.cleanup_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_resolves_share_one_handler() {
        let registry = Arc::new(AgentRegistry::new().with_agent("echo", Arc::new(EchoAgent)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move { registry.resolve("echo").is_ok() }));
        }
        for h in handles {
            assert!(h.await.unwrap());
        }
    }
}
