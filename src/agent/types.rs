//! Core types and traits for agent calls

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by an agent call
///
/// `retryable` is informational; the step retry policy decides whether
/// another attempt happens.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {message}")]
pub struct AgentError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl AgentError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// A single attempt exceeded its time bound
    pub fn timeout(limit: Duration) -> Self {
        Self::new("TIMEOUT", format!("agent call timed out after {:?}", limit)).with_retryable(true)
    }

    pub fn not_found(agent_id: &str) -> Self {
        Self::new("AGENT_NOT_FOUND", format!("no agent registered as '{}'", agent_id))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new("AGENT_UNAVAILABLE", message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new("NETWORK_ERROR", message).with_retryable(true)
    }

    pub fn execution_failed(exit_code: Option<i32>, stderr: &str) -> Self {
        let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        Self::new(
            "EXECUTION_FAILED",
            format!("agent exited with {}: {}", code, stderr.trim()),
        )
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("INVALID_INPUT", message)
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Identifiers passed along with every call for tracing and idempotency
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub workflow_id: String,
    pub execution_id: String,
    pub step_id: String,
    pub correlation_id: String,
    pub request_id: String,
}

/// What the engine calls: dispatch by agent id
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        agent_id: &str,
        input: &Value,
        context: &AgentContext,
    ) -> Result<Value, AgentError>;
}

/// One concrete agent
#[async_trait]
pub trait Agent: Send + Sync {
    async fn call(&self, input: &Value, context: &AgentContext) -> Result<Value, AgentError>;

    fn name(&self) -> &str;

    /// Cheap reachability check
    async fn is_available(&self) -> bool {
        true
    }
}

/// Agent output for a raw text response: JSON when it parses, `{"text": ...}` otherwise
pub fn parse_output(text: &str) -> Value {
    let trimmed = text.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| serde_json::json!({ "text": trimmed }))
}
