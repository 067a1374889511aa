//! Catalog of workflow definitions

use super::error::EngineError;
use crate::config::WorkflowDefinition;
use crate::store::DefinitionStore;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// In-memory definitions, optionally written through to a [`DefinitionStore`]
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    store: Option<Arc<dyn DefinitionStore>>,
    /// Serializes registrations so the store and the map agree on the winner
    writes: tokio::sync::Mutex<()>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: Arc<dyn DefinitionStore>) -> Self {
        Self {
            definitions: RwLock::default(),
            store: Some(store),
            writes: tokio::sync::Mutex::default(),
        }
    }

    /// Pull every persisted definition into memory; returns how many were loaded
    pub async fn load_from_store(&self) -> Result<usize, EngineError> {
        let Some(ref store) = self.store else {
            return Ok(0);
        };
        let loaded = store.load_definitions().await?;
        let count = loaded.len();

        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for definition in loaded {
            definitions.insert(definition.id.clone(), Arc::new(definition));
        }
        Ok(count)
    }

    /// Validate and upsert by id; last write wins
    pub async fn register(&self, definition: WorkflowDefinition) -> Result<(), EngineError> {
        definition
            .validate()
            .map_err(|errors| EngineError::InvalidDefinition {
                id: definition.id.clone(),
                errors,
            })?;

        let _write = self.writes.lock().await;
        if let Some(ref store) = self.store {
            store.save_definition(&definition).await?;
        }

        tracing::debug!(workflow_id = %definition.id, version = %definition.version, "Registered workflow");

        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// All definitions sorted by id
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}
