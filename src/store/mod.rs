//! Durable storage for executions and workflow definitions
//!
//! The engine only sees the [`ExecutionStore`] and [`DefinitionStore`] traits.
//! [`SqliteStore`] is the durable implementation; [`MemoryStore`] keeps
//! everything in process.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::config::WorkflowDefinition;
use crate::workflow::WorkflowExecution;
use async_trait::async_trait;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored record moved on since the writer last saw it
    #[error("execution '{id}' changed concurrently (write at revision {revision} refused)")]
    Stale { id: String, revision: u64 },

    /// Blocking storage task panicked or was cancelled
    #[error("storage task failed: {0}")]
    Task(String),
}

/// Execution records keyed by execution id
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Write the record if nobody else has written it since the caller did
    ///
    /// `execution.revision` is the revision being written: a new record is
    /// accepted at revision 1, an existing one only when it is stored at
    /// `revision - 1`. Anything else fails with [`StoreError::Stale`] and
    /// leaves the stored record untouched.
    async fn save(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Most recently started first
    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError>;
}

/// Workflow definitions keyed by workflow id
#[async_trait]
pub trait DefinitionStore: Send + Sync {
    /// Insert or replace; last write wins
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn load_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError>;
}
