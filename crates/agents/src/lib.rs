//! `agents` crate: the `AgentHandler` trait, the agent registry, and
//! built-in agent implementations.
//!
//! Every agent (browser driver, file reader, HTTP client, ...) must implement
//! [`AgentHandler`] and be registered under a string `agent_type`. The engine
//! crate dispatches every task through [`AgentRegistry::resolve`] followed by a
//! single [`AgentHandler::invoke`] call.

pub mod echo;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use echo::EchoAgent;
pub use error::{AgentError, RegistryError};
pub use registry::{AgentDescriptor, AgentRegistry};
pub use traits::{AgentHandler, AgentInfo, AgentOutput, InvokeContext, Params};
