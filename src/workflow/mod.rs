//! Workflow execution engine
//!
//! This module handles:
//! - Execution state and its forward-only lifecycle
//! - Step execution with retry, backoff and per-attempt timeouts
//! - Sequential step driving with conditions and error policies
//! - Cancellation, waiting and resumption of executions
//!
//! # Example
//!
//! ```ignore
//! use agentflow::workflow::{WorkflowEngine, WorkflowRegistry, EngineSettings, RequestMetadata};
//! use std::sync::Arc;
//!
//! let engine = WorkflowEngine::new(registry, store, agents, EngineSettings::default());
//! let started = engine.execute("research-analysis-summary", params, RequestMetadata::default()).await?;
//!
//! let execution = engine.wait(&started.execution_id).await?;
//! println!("{}", execution.status);
//! ```

mod cancellation;
mod error;
mod executor;
mod registry;
mod runner;
mod state;

pub use registry::WorkflowRegistry;
pub use runner::{EngineSettings, WorkflowEngine};
pub use state::{
    ExecutionReport, ExecutionStarted, ExecutionStatus, Progress, RequestMetadata, StepStatus,
    TriggerSource, WorkflowExecution,
};

#[cfg(test)]
pub use state::ErrorInfo;
