//! Agents: the external units steps delegate to
//!
//! The engine only depends on [`AgentExecutor`]. [`AgentRegistry`] implements it
//! by dispatching to configured command and HTTP agents.

mod command_agent;
mod http_agent;
mod registry;
mod types;

pub use registry::{AgentRegistry, create_agent};
pub use types::{AgentContext, AgentError, AgentExecutor};

#[cfg(test)]
pub use command_agent::CommandAgent;
