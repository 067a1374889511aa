//! Workflow engine - starts, drives, cancels and resumes executions

use super::cancellation::CancellationToken;
use super::error::EngineError;
use super::executor::StepOutcome;
use super::registry::WorkflowRegistry;
use super::state::{
    ErrorInfo, ExecutionError, ExecutionReport, ExecutionStarted, ExecutionStatus,
    RequestMetadata, StepStatus, WorkflowExecution,
};
use crate::agent::AgentExecutor;
use crate::config::{EngineConfig, ErrorPolicy, RetryPolicy, StepDefinition, WorkflowDefinition};
use crate::store::{ExecutionStore, StoreError};
use crate::template::{render_value, should_execute_step};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Engine-wide defaults applied to steps that don't override them
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_retry: RetryPolicy,
    pub default_step_timeout: Option<Duration>,
    pub list_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            default_step_timeout: None,
            list_limit: 20,
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_retry: config.defaults.retry.clone(),
            default_step_timeout: config.defaults.step_timeout_ms.map(Duration::from_millis),
            list_limit: config.defaults.list_limit,
        }
    }
}

/// Bookkeeping for an execution whose driver is alive in this process
struct ActiveExecution {
    token: CancellationToken,
    done: watch::Receiver<bool>,
    /// Latest state written by the driver
    snapshot: WorkflowExecution,
}

pub(super) struct EngineInner {
    registry: Arc<WorkflowRegistry>,
    store: Arc<dyn ExecutionStore>,
    pub(super) agents: Arc<dyn AgentExecutor>,
    pub(super) settings: EngineSettings,
    active: Mutex<HashMap<String, ActiveExecution>>,
}

impl EngineInner {
    fn active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveExecution>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a driver for `execution`; at most one per execution id
    fn claim(
        self: &Arc<Self>,
        execution: &WorkflowExecution,
    ) -> Result<(CancellationToken, DriverGuard), EngineError> {
        let mut active = self.active();
        match active.entry(execution.id.clone()) {
            Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "execution '{}' is already running",
                execution.id
            ))),
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                let (done_tx, done_rx) = watch::channel(false);
                slot.insert(ActiveExecution {
                    token: token.clone(),
                    done: done_rx,
                    snapshot: execution.clone(),
                });
                let guard = DriverGuard {
                    engine: Arc::clone(self),
                    execution_id: execution.id.clone(),
                    done: done_tx,
                };
                Ok((token, guard))
            }
        }
    }

    /// Save `execution` as the next revision of its record
    ///
    /// The revision is only advanced when the store accepts the write.
    async fn commit(&self, execution: &mut WorkflowExecution) -> Result<(), StoreError> {
        execution.revision += 1;
        let result = self.store.save(execution).await;
        if result.is_err() {
            execution.revision -= 1;
        }
        result
    }

    fn update_snapshot(&self, execution: &WorkflowExecution) {
        if let Some(entry) = self.active().get_mut(&execution.id) {
            entry.snapshot = execution.clone();
        }
    }
}

/// Releases the active slot when the driver ends, however it ends
struct DriverGuard {
    engine: Arc<EngineInner>,
    execution_id: String,
    done: watch::Sender<bool>,
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.engine.active().remove(&self.execution_id);
        self.done.send_replace(true);
    }
}

/// Entry point for running workflows
///
/// Cheap to clone; clones share the registry, store, agents and the set of
/// live drivers.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        store: Arc<dyn ExecutionStore>,
        agents: Arc<dyn AgentExecutor>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                registry,
                store,
                agents,
                settings,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.inner.registry
    }

    /// Start an execution and return as soon as it is persisted as running
    ///
    /// The step loop runs on a background task.
    pub async fn execute(
        &self,
        workflow_id: &str,
        params: Map<String, Value>,
        metadata: RequestMetadata,
    ) -> Result<ExecutionStarted, EngineError> {
        let definition = self
            .inner
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let mut execution = WorkflowExecution::new(&definition, params, metadata.into());
        execution.transition(ExecutionStatus::Running);
        execution.current_step_id = definition.steps.first().map(|s| s.id.clone());
        execution.updated_at = Utc::now();

        // Nothing is stored unless the running record is
        let (token, guard) = self.inner.claim(&execution)?;
        self.inner.commit(&mut execution).await?;
        self.inner.update_snapshot(&execution);

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            request_id = %execution.metadata.request_id,
            correlation_id = %execution.metadata.correlation_id,
            steps = definition.steps.len(),
            "Execution started"
        );

        let started = execution.started();
        self.spawn(definition, execution, token, guard);
        Ok(started)
    }

    fn spawn(
        &self,
        definition: Arc<WorkflowDefinition>,
        execution: WorkflowExecution,
        token: CancellationToken,
        guard: DriverGuard,
    ) {
        let driver = Driver {
            engine: Arc::clone(&self.inner),
            definition,
            execution,
            token,
            superseded: false,
            _guard: guard,
        };
        tokio::spawn(driver.run());
    }

    /// Current state: the live snapshot when a driver is running, else the store
    pub async fn get(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
        let live = self
            .inner
            .active()
            .get(execution_id)
            .map(|a| a.snapshot.clone());
        if let Some(execution) = live {
            return Ok(execution);
        }
        self.inner
            .store
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    /// Snapshot plus computed progress
    pub async fn query(&self, execution_id: &str) -> Result<ExecutionReport, EngineError> {
        Ok(self.get(execution_id).await?.report())
    }

    /// Like [`query`](Self::query), but the execution must belong to `workflow_id`
    pub async fn query_for_workflow(
        &self,
        workflow_id: &str,
        execution_id: &str,
    ) -> Result<ExecutionReport, EngineError> {
        let execution = self.get(execution_id).await?;
        if execution.workflow_id != workflow_id {
            return Err(EngineError::Conflict(format!(
                "execution '{}' belongs to workflow '{}', not '{}'",
                execution_id, execution.workflow_id, workflow_id
            )));
        }
        Ok(execution.report())
    }

    /// Executions of a workflow, most recently started first
    pub async fn list(
        &self,
        workflow_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        let limit = limit.unwrap_or(self.inner.settings.list_limit);
        Ok(self.inner.store.list_by_workflow(workflow_id, limit).await?)
    }

    pub fn is_active(&self, execution_id: &str) -> bool {
        self.inner.active().contains_key(execution_id)
    }

    /// Cancel a non-terminal execution
    ///
    /// With a live driver this signals it and waits for it to record the
    /// cancellation. Without one the stored record is cancelled directly; a
    /// driver in another process then finds its next write refused and stops.
    pub async fn cancel(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
        let live = self
            .inner
            .active()
            .get(execution_id)
            .map(|a| (a.token.clone(), a.done.clone()));

        if let Some((token, mut done)) = live {
            let first = token.cancel();
            let _ = done.wait_for(|finished| *finished).await;
            let execution = self.get(execution_id).await?;
            if first && execution.status == ExecutionStatus::Cancelled {
                return Ok(execution);
            }
            return Err(already_terminal(&execution));
        }

        loop {
            let mut execution = self
                .inner
                .store
                .get(execution_id)
                .await?
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;

            if !execution.mark_cancelled() {
                return Err(already_terminal(&execution));
            }
            execution.updated_at = Utc::now();

            match self.inner.commit(&mut execution).await {
                Ok(()) => {
                    tracing::info!(
                        execution_id = %execution.id,
                        workflow_id = %execution.workflow_id,
                        "Cancelled execution without a live driver"
                    );
                    return Ok(execution);
                }
                // A remote driver wrote in between; look again
                Err(StoreError::Stale { revision, .. }) => {
                    tracing::debug!(
                        execution_id = %execution_id,
                        revision,
                        "Record changed while cancelling, retrying"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until the execution's driver exits, then return the final state
    ///
    /// Returns immediately when no driver is running.
    pub async fn wait(&self, execution_id: &str) -> Result<WorkflowExecution, EngineError> {
        let done = self
            .inner
            .active()
            .get(execution_id)
            .map(|a| a.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get(execution_id).await
    }

    /// Restart the driver of a stored, non-terminal execution
    ///
    /// Settled steps are kept; steps caught mid-flight run again. If a driver
    /// elsewhere is still alive, its next write is refused and it stops.
    pub async fn resume(&self, execution_id: &str) -> Result<ExecutionStarted, EngineError> {
        if self.is_active(execution_id) {
            return Err(EngineError::Conflict(format!(
                "execution '{}' is already running",
                execution_id
            )));
        }

        let mut execution = self
            .inner
            .store
            .get(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?;
        if execution.is_terminal() {
            return Err(already_terminal(&execution));
        }

        let definition = self
            .inner
            .registry
            .get(&execution.workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(execution.workflow_id.clone()))?;

        execution.align_with(&definition);
        for step in execution
            .steps
            .values_mut()
            .filter(|s| s.status == StepStatus::Running)
        {
            step.status = StepStatus::Pending;
            step.next_retry_at = None;
        }
        if execution.status == ExecutionStatus::Pending {
            execution.transition(ExecutionStatus::Running);
        }
        execution.updated_at = Utc::now();

        let (token, guard) = self.inner.claim(&execution)?;
        self.inner
            .commit(&mut execution)
            .await
            .map_err(|e| match e {
                StoreError::Stale { .. } => EngineError::Conflict(format!(
                    "execution '{}' changed while resuming",
                    execution_id
                )),
                other => other.into(),
            })?;
        self.inner.update_snapshot(&execution);

        tracing::info!(
            execution_id = %execution.id,
            workflow_id = %execution.workflow_id,
            progress = execution.progress().percentage,
            "Execution resumed"
        );

        let started = execution.started();
        self.spawn(definition, execution, token, guard);
        Ok(started)
    }
}

fn already_terminal(execution: &WorkflowExecution) -> EngineError {
    EngineError::Conflict(format!(
        "execution '{}' is already {}",
        execution.id, execution.status
    ))
}

/// Owns one execution's state for the lifetime of its background task
pub(super) struct Driver {
    pub(super) engine: Arc<EngineInner>,
    definition: Arc<WorkflowDefinition>,
    pub(super) execution: WorkflowExecution,
    pub(super) token: CancellationToken,
    /// Another writer owns the stored record; nothing more is written
    superseded: bool,
    _guard: DriverGuard,
}

impl Driver {
    async fn run(mut self) {
        let definition = Arc::clone(&self.definition);
        let steps = &definition.steps;

        let mut index = 0;
        while index < steps.len() {
            if self.token.is_cancelled() {
                self.finish_cancelled().await;
                return;
            }

            let step = &steps[index];
            let status = self
                .execution
                .step(&step.id)
                .map(|s| s.status)
                .unwrap_or(StepStatus::Pending);

            match status {
                StepStatus::Completed | StepStatus::Skipped => {
                    index += 1;
                    continue;
                }
                StepStatus::Failed => {
                    let error = self
                        .execution
                        .step(&step.id)
                        .and_then(|s| s.error.clone())
                        .unwrap_or_else(|| ErrorInfo::new("STEP_FAILED", "step failed"));
                    match self.apply_error_policy(step, index, error).await {
                        Some(next) => index = next,
                        None => return,
                    }
                    continue;
                }
                StepStatus::Pending | StepStatus::Running => {}
            }

            self.execution.current_step_id = Some(step.id.clone());

            if !should_execute_step(step.condition.as_deref(), &self.execution.template_context()) {
                if let Some(state) = self.execution.step_mut(&step.id) {
                    state.finish(StepStatus::Skipped);
                }
                tracing::info!(
                    execution_id = %self.execution.id,
                    step = %step.id,
                    "Condition not met, step skipped"
                );
                self.persist().await;
                index += 1;
                continue;
            }

            match self.execute_step(step).await {
                StepOutcome::Completed => index += 1,
                StepOutcome::Failed(error) => match self.apply_error_policy(step, index, error).await
                {
                    Some(next) => index = next,
                    None => return,
                },
                StepOutcome::Cancelled => {
                    self.finish_cancelled().await;
                    return;
                }
            }
        }

        self.finish_completed().await;
    }

    /// Decide where the forward pass goes after `step` failed for good
    ///
    /// Returns the next step index, or `None` once the execution is terminal.
    async fn apply_error_policy(
        &mut self,
        step: &StepDefinition,
        index: usize,
        error: ErrorInfo,
    ) -> Option<usize> {
        match step.on_error {
            ErrorPolicy::Fail | ErrorPolicy::Retry => {
                self.finish_failed(step, error).await;
                None
            }
            ErrorPolicy::Continue => {
                if let Some(state) = self.execution.step_mut(&step.id) {
                    state.status = StepStatus::Skipped;
                }
                tracing::info!(
                    execution_id = %self.execution.id,
                    step = %step.id,
                    error = %error,
                    policy = step.on_error.as_str(),
                    "Step failure ignored, continuing"
                );
                self.persist().await;
                Some(index + 1)
            }
            ErrorPolicy::Alternate => {
                let target = step
                    .alternate_step_id
                    .as_deref()
                    .and_then(|id| self.definition.step_index(id))
                    .filter(|&target| target > index);

                let Some(target) = target else {
                    tracing::warn!(
                        execution_id = %self.execution.id,
                        step = %step.id,
                        alternate = ?step.alternate_step_id,
                        "Alternate step is not declared after the failing step"
                    );
                    self.finish_failed(step, error).await;
                    return None;
                };

                let definition = Arc::clone(&self.definition);
                for bypassed in &definition.steps[index + 1..target] {
                    if let Some(state) = self.execution.step_mut(&bypassed.id) {
                        if !state.status.is_terminal() {
                            state.finish(StepStatus::Skipped);
                        }
                    }
                }
                tracing::info!(
                    execution_id = %self.execution.id,
                    step = %step.id,
                    alternate = %definition.steps[target].id,
                    error = %error,
                    "Step failed, jumping to alternate"
                );
                self.persist().await;
                Some(target)
            }
        }
    }

    async fn finish_completed(&mut self) {
        if self.token.is_cancelled() {
            return self.finish_cancelled().await;
        }

        let mut output = Map::new();
        for step in &self.definition.steps {
            let Some(ref path) = step.output_path else {
                continue;
            };
            let value = self
                .execution
                .step(&step.id)
                .filter(|s| s.status == StepStatus::Completed)
                .and_then(|s| s.output.clone());
            if let Some(value) = value {
                insert_at_path(&mut output, path, value);
            }
        }

        let ctx = self.execution.template_context();
        for (key, template) in &self.definition.outputs {
            output.insert(key.clone(), render_value(template, &ctx));
        }

        self.execution.output = Some(Value::Object(output));
        self.execution.transition(ExecutionStatus::Completed);

        tracing::info!(
            execution_id = %self.execution.id,
            workflow_id = %self.execution.workflow_id,
            progress = self.execution.progress().percentage,
            "Execution completed"
        );
        self.persist().await;
    }

    async fn finish_failed(&mut self, step: &StepDefinition, error: ErrorInfo) {
        if self.token.is_cancelled() {
            return self.finish_cancelled().await;
        }

        tracing::error!(
            execution_id = %self.execution.id,
            workflow_id = %self.execution.workflow_id,
            step = %step.id,
            code = %error.code,
            error = %error.message,
            "Execution failed"
        );

        self.execution.error = Some(ExecutionError {
            step_id: step.id.clone(),
            code: error.code,
            message: error.message,
        });
        self.execution.transition(ExecutionStatus::Failed);
        self.persist().await;
    }

    async fn finish_cancelled(&mut self) {
        if self.superseded || !self.execution.mark_cancelled() {
            return;
        }
        tracing::info!(
            execution_id = %self.execution.id,
            workflow_id = %self.execution.workflow_id,
            step = ?self.execution.current_step_id,
            "Execution cancelled"
        );
        self.persist().await;
    }

    /// Write the current state through the cache to the store
    ///
    /// A failed write is logged and the run carries on; the next write
    /// replaces the whole record. A refused write means the record changed
    /// under us, so the driver stops.
    pub(super) async fn persist(&mut self) {
        if self.superseded {
            return;
        }
        self.execution.updated_at = Utc::now();
        match self.engine.commit(&mut self.execution).await {
            Ok(()) => self.engine.update_snapshot(&self.execution),
            Err(StoreError::Stale { .. }) => self.stand_down().await,
            Err(e) => {
                tracing::error!(
                    execution_id = %self.execution.id,
                    error = %e,
                    "Failed to persist execution state"
                );
                self.engine.update_snapshot(&self.execution);
            }
        }
    }

    /// Give up the run and adopt whatever the store now holds
    async fn stand_down(&mut self) {
        self.superseded = true;
        self.token.cancel();

        match self.engine.store.get(&self.execution.id).await {
            Ok(Some(stored)) => {
                tracing::warn!(
                    execution_id = %self.execution.id,
                    stored_status = %stored.status,
                    revision = stored.revision,
                    "Execution record changed elsewhere, driver stopping"
                );
                self.execution = stored;
            }
            Ok(None) => {
                tracing::warn!(
                    execution_id = %self.execution.id,
                    "Execution record disappeared, driver stopping"
                );
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %self.execution.id,
                    error = %e,
                    "Execution record changed elsewhere and could not be reloaded"
                );
            }
        }
        self.engine.update_snapshot(&self.execution);
    }
}

/// Set `value` at a dotted path, creating intermediate objects
fn insert_at_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut node = root;
    for segment in segments {
        let entry = node
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => node = map,
            _ => return,
        }
    }
    node.insert(last.to_string(), value);
}
