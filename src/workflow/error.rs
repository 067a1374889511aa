//! Engine-level errors

use crate::store::StoreError;
use thiserror::Error;

/// Errors returned by engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// No registered workflow with this id
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),

    /// No execution with this id in the store
    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    /// Operation not allowed in the execution's current state
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid workflow '{id}': {}", .errors.join("; "))]
    InvalidDefinition { id: String, errors: Vec<String> },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Stable code used on the wire
    pub fn code(&self) -> &'static str {
        match self {
            Self::WorkflowNotFound(_) => "WORKFLOW_NOT_FOUND",
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::InvalidDefinition { .. } => "INVALID_DEFINITION",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}
