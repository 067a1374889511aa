//! Configuration types and loading for agentflow

mod agent;
mod loader;
mod workflow;

pub use agent::AgentConfig;
pub use loader::{EngineConfig, load_workflow_file, load_workflows};
pub use workflow::{ErrorPolicy, RetryPolicy, StepDefinition, WorkflowDefinition};

#[cfg(test)]
pub use loader::builtin_workflows;
