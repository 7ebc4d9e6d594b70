//! `EchoAgent`: a built-in agent that returns its parameters.
//!
//! Handy for smoke-testing workflow definitions from the CLI: every task
//! routed to `echo` produces its resolved parameters as output, so variable
//! wiring between tasks can be inspected without any external resource.

use async_trait::async_trait;

use crate::{AgentError, AgentHandler, AgentInfo, AgentOutput, InvokeContext, Params};

pub struct EchoAgent;

#[async_trait]
impl AgentHandler for EchoAgent {
    async fn invoke(
        &self,
        action: &str,
        params: &Params,
        _ctx: &InvokeContext,
    ) -> Result<AgentOutput, AgentError> {
        match action {
            "echo" => Ok(params.clone()),
            other => Err(AgentError::Fatal(format!(
                "echo agent does not support action '{other}'"
            ))),
        }
    }

    fn describe(&self) -> AgentInfo {
        AgentInfo {
            description: "Returns its parameters as output".into(),
            actions: vec!["echo".into()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn unsupported_action_is_fatal() {
        let ctx = InvokeContext {
            workflow_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            task_name: "t".into(),
            attempt: 0,
        };
        let mut params = Params::new();
        params.insert("a".into(), json!(1));

        let err = EchoAgent.invoke("shout", &params, &ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(EchoAgent.invoke("echo", &params, &ctx).await.unwrap(), params);
    }
}
