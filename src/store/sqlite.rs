//! SQLite-backed store

use super::schema::init_schema;
use super::{DefinitionStore, ExecutionStore, StoreError};
use crate::config::WorkflowDefinition;
use crate::workflow::WorkflowExecution;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Execution and definition records in one SQLite database
///
/// Each call runs on the blocking pool against a single shared connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&*guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn save(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        let state = serde_json::to_string(execution)?;
        let id = execution.id.clone();
        let workflow_id = execution.workflow_id.clone();
        let status = execution.status.as_str();
        let revision = execution.revision;
        let stored_revision = i64::try_from(revision).unwrap_or(i64::MAX);
        let start_ms = execution.start_time.timestamp_millis();
        let end_ms = execution.end_time.map(|t| t.timestamp_millis());
        let created_at = execution.created_at.to_rfc3339();
        let updated_at = execution.updated_at.to_rfc3339();

        self.with_conn(move |conn| {
            // Each statement is a single compare-and-set, so writers in other
            // processes sharing the file cannot interleave with it
            let changed = if revision == 1 {
                conn.execute(
                    "INSERT INTO workflow_executions
                        (id, workflow_id, status, execution_state, revision,
                         start_time_ms, end_time_ms, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                     ON CONFLICT(id) DO NOTHING",
                    (
                        &id,
                        &workflow_id,
                        status,
                        &state,
                        stored_revision,
                        start_ms,
                        end_ms,
                        &created_at,
                        &updated_at,
                    ),
                )?
            } else {
                conn.execute(
                    "UPDATE workflow_executions SET
                        status = ?2,
                        execution_state = ?3,
                        revision = ?4,
                        end_time_ms = ?5,
                        updated_at = ?6
                     WHERE id = ?1 AND revision = ?4 - 1",
                    (&id, status, &state, stored_revision, end_ms, &updated_at),
                )?
            };

            if changed == 0 {
                return Err(StoreError::Stale { id, revision });
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, execution_id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        let id = execution_id.to_string();
        self.with_conn(move |conn| {
            let state: Option<String> = conn
                .query_row(
                    "SELECT execution_state FROM workflow_executions WHERE id = ?1",
                    [&id],
                    |row| row.get(0),
                )
                .optional()?;
            state
                .map(|s| serde_json::from_str(&s).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, StoreError> {
        let workflow_id = workflow_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT execution_state FROM workflow_executions
                 WHERE workflow_id = ?1
                 ORDER BY start_time_ms DESC, created_at DESC
                 LIMIT ?2",
            )?;
            let states = stmt
                .query_map((&workflow_id, limit), |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            states
                .iter()
                .map(|s| serde_json::from_str(s).map_err(StoreError::from))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl DefinitionStore for SqliteStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let body = serde_json::to_string(definition)?;
        let id = definition.id.clone();
        let name = definition.name.clone();
        let version = definition.version.clone();
        let now = chrono::Utc::now().to_rfc3339();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO workflow_definitions (id, name, version, definition, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    version = excluded.version,
                    definition = excluded.definition,
                    updated_at = excluded.updated_at",
                (&id, &name, &version, &body, &now),
            )?;
            Ok(())
        })
        .await
    }

    async fn load_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT definition FROM workflow_definitions ORDER BY id")?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(StoreError::from))
                .collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepDefinition;
    use crate::workflow::{ErrorInfo, ExecutionStatus, RequestMetadata, StepStatus};
    use serde_json::json;
    use tempfile::TempDir;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "research".into(),
            name: "Research".into(),
            steps: ["research-step", "analysis-step", "summary-step"]
                .iter()
                .map(|id| StepDefinition {
                    id: id.to_string(),
                    agent_id: "agent".into(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    fn execution() -> WorkflowExecution {
        let mut input = serde_json::Map::new();
        input.insert("topic".into(), json!("X"));
        WorkflowExecution::new(&definition(), input, RequestMetadata::default().into())
    }

    #[tokio::test]
    async fn test_round_trip_preserves_step_map() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested").join("executions.db")).unwrap();

        let mut exec = execution();
        exec.transition(ExecutionStatus::Running);
        {
            let step = exec.step_mut("research-step").unwrap();
            step.status = StepStatus::Running;
            step.start_time = Some(chrono::Utc::now());
            step.input = Some(json!({"query": "X"}));
            step.output = Some(json!({"confidence": 0.5, "findings": ["a", "b"]}));
            step.retry_count = 1;
            step.finish(StepStatus::Completed);
        }
        {
            let step = exec.step_mut("analysis-step").unwrap();
            step.error = Some(ErrorInfo::new("TIMEOUT", "agent call timed out"));
            step.finish(StepStatus::Skipped);
        }
        exec.revision = 1;
        store.save(&exec).await.unwrap();

        let loaded = store.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.steps, exec.steps);
        assert_eq!(loaded, exec);

        let ids: Vec<&str> = loaded.steps.values().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["research-step", "analysis-step", "summary-step"]);
    }

    #[tokio::test]
    async fn test_upsert_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("executions.db");

        let mut exec = execution();
        {
            let store = SqliteStore::open(&path).unwrap();
            exec.revision = 1;
            store.save(&exec).await.unwrap();
            exec.transition(ExecutionStatus::Running);
            exec.transition(ExecutionStatus::Completed);
            exec.output = Some(json!({"summary": "done"}));
            exec.revision = 2;
            store.save(&exec).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert_eq!(loaded.output, Some(json!({"summary": "done"})));
        assert!(loaded.end_time.is_some());
        assert_eq!(store.list_by_workflow("research", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_by_workflow_orders_and_limits() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut older = execution();
        older.start_time -= chrono::Duration::seconds(30);
        older.revision = 1;
        let mut newer = execution();
        newer.revision = 1;
        store.save(&older).await.unwrap();
        store.save(&newer).await.unwrap();

        let listed = store.list_by_workflow("research", 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(listed[1].id, older.id);

        assert_eq!(store.list_by_workflow("research", 1).await.unwrap().len(), 1);
        assert!(store.list_by_workflow("other", 10).await.unwrap().is_empty());
        assert!(store.get("wf-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_write_is_refused_across_connections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("executions.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();

        let mut exec = execution();
        exec.transition(ExecutionStatus::Running);
        exec.revision = 1;
        first.save(&exec).await.unwrap();

        // Another writer cancels from its own copy
        let mut other = second.get(&exec.id).await.unwrap().unwrap();
        assert!(other.mark_cancelled());
        other.revision += 1;
        second.save(&other).await.unwrap();

        // The original writer still thinks it is at revision 1
        exec.transition(ExecutionStatus::Completed);
        exec.revision = 2;
        let err = first.save(&exec).await.unwrap_err();
        assert!(matches!(err, StoreError::Stale { revision: 2, .. }));

        let stored = first.get(&exec.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Cancelled);
        assert_eq!(stored.revision, 2);

        // Inserting a new record twice is refused too
        let fresh = {
            let mut e = execution();
            e.revision = 1;
            e
        };
        first.save(&fresh).await.unwrap();
        assert!(second.save(&fresh).await.is_err());
    }

    #[tokio::test]
    async fn test_definitions_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut def = definition();
        store.save_definition(&def).await.unwrap();
        def.version = "2.0.0".into();
        store.save_definition(&def).await.unwrap();

        let loaded = store.load_definitions().await.unwrap();
        assert_eq!(loaded, vec![def]);
    }
}
