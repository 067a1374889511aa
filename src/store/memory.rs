//! In-process store

use super::{DefinitionStore, ExecutionStore, StoreError};
use crate::config::WorkflowDefinition;
use crate::workflow::WorkflowExecution;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Store backed by `RwLock`-guarded maps
#[derive(Debug, Default)]
pub struct MemoryStore {
    executions: RwLock<HashMap<String, WorkflowExecution>>,
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let mut executions = self
            .executions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let stored = executions.get(&execution.id).map_or(0, |e| e.revision);
        if execution.revision != stored + 1 {
            return Err(StoreError::Stale {
                id: execution.id.clone(),
                revision: execution.revision,
            });
        }
        executions.insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned())
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let executions = self
            .executions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut matching: Vec<WorkflowExecution> = executions
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    async fn load_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<WorkflowDefinition> = definitions.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}
