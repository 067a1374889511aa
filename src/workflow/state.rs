//! Execution state model
//!
//! A [`WorkflowExecution`] is the single record the store persists for one run.
//! Its status only moves forward: pending, running, then one terminal state.

use crate::config::{StepDefinition, WorkflowDefinition};
use crate::template::TemplateContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle of a whole execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled executions never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` respects the forward-only lifecycle
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, s) if s.is_terminal() => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single step within an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error code and message recorded on a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Run record of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Matches the owning step definition id
    pub id: String,

    pub agent_id: String,

    pub status: StepStatus,

    /// Input after template resolution
    pub input: Option<Value>,

    pub output: Option<Value>,

    pub error: Option<ErrorInfo>,

    pub start_time: Option<DateTime<Utc>>,

    pub end_time: Option<DateTime<Utc>>,

    pub duration_ms: Option<u64>,

    /// Attempts made beyond the first
    pub retry_count: u32,

    pub next_retry_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    /// Fresh pending record for a step definition
    pub fn pending(step: &StepDefinition) -> Self {
        Self {
            id: step.id.clone(),
            agent_id: step.agent_id.clone(),
            status: StepStatus::Pending,
            input: None,
            output: None,
            error: None,
            start_time: None,
            end_time: None,
            duration_ms: None,
            retry_count: 0,
            next_retry_at: None,
        }
    }

    /// Stamp end time and duration
    pub fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.next_retry_at = None;
        self.duration_ms = self
            .start_time
            .map(|start| (now - start).num_milliseconds().max(0) as u64);
    }
}

/// Step records keyed by step id, kept in declaration order
///
/// Serializes as an array of `[step_id, StepExecution]` pairs so the order
/// survives a round trip through the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepMap(Vec<(String, StepExecution)>);

impl StepMap {
    /// Pending records for every step of a workflow
    pub fn from_definition(definition: &WorkflowDefinition) -> Self {
        Self(
            definition
                .steps
                .iter()
                .map(|s| (s.id.clone(), StepExecution::pending(s)))
                .collect(),
        )
    }

    pub fn get(&self, id: &str) -> Option<&StepExecution> {
        self.0.iter().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut StepExecution> {
        self.0.iter_mut().find(|(k, _)| k == id).map(|(_, v)| v)
    }

    /// Insert or replace, keeping the original position on replace
    pub fn insert(&mut self, step: StepExecution) {
        match self.get_mut(&step.id) {
            Some(existing) => *existing = step,
            None => self.0.push((step.id.clone(), step)),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &StepExecution> {
        self.0.iter().map(|(_, v)| v)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut StepExecution> {
        self.0.iter_mut().map(|(_, v)| v)
    }
}

/// Where an execution was started from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    #[default]
    Api,
    Cli,
    Schedule,
    Event,
}

/// Caller-supplied metadata; missing ids are generated
#[derive(Debug, Clone, Default)]
pub struct RequestMetadata {
    pub request_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub triggered_by: TriggerSource,
}

/// Metadata fixed at creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub request_id: String,
    pub correlation_id: String,
    pub user_id: Option<String>,
    pub triggered_by: TriggerSource,
}

impl From<RequestMetadata> for ExecutionMetadata {
    fn from(req: RequestMetadata) -> Self {
        let request_id = req.request_id.unwrap_or_else(|| generate_id("req"));
        let correlation_id = req.correlation_id.unwrap_or_else(|| request_id.clone());
        Self {
            request_id,
            correlation_id,
            user_id: req.user_id,
            triggered_by: req.triggered_by,
        }
    }
}

/// Failure recorded on an execution that ended in `failed`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub step_id: String,
    pub code: String,
    pub message: String,
}

/// One run of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,

    pub workflow_id: String,

    pub workflow_version: String,

    pub status: ExecutionStatus,

    /// Caller parameters, exposed to templates as `params`
    pub input: Map<String, Value>,

    /// Set only when the execution completes
    pub output: Option<Value>,

    /// Set only when the execution fails
    pub error: Option<ExecutionError>,

    pub current_step_id: Option<String>,

    pub start_time: DateTime<Utc>,

    pub end_time: Option<DateTime<Utc>>,

    pub steps: StepMap,

    pub metadata: ExecutionMetadata,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Count of accepted store writes, including the one carrying this value
    #[serde(default)]
    pub revision: u64,
}

impl WorkflowExecution {
    /// New pending execution with a pending record per step
    pub fn new(
        definition: &WorkflowDefinition,
        input: Map<String, Value>,
        metadata: ExecutionMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id("wf"),
            workflow_id: definition.id.clone(),
            workflow_version: definition.version.clone(),
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error: None,
            current_step_id: None,
            start_time: now,
            end_time: None,
            steps: StepMap::from_definition(definition),
            metadata,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`; terminal states also stamp `end_time`
    ///
    /// Returns false and leaves the record untouched when the lifecycle forbids it.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    /// Cancel the execution; steps caught mid-flight fail with `CANCELLED`
    pub fn mark_cancelled(&mut self) -> bool {
        if !self.status.can_transition_to(ExecutionStatus::Cancelled) {
            return false;
        }
        for step in self
            .steps
            .values_mut()
            .filter(|s| s.status == StepStatus::Running)
        {
            step.error = Some(ErrorInfo::new("CANCELLED", "execution cancelled"));
            step.finish(StepStatus::Failed);
        }
        self.transition(ExecutionStatus::Cancelled)
    }

    pub fn step(&self, id: &str) -> Option<&StepExecution> {
        self.steps.get(id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepExecution> {
        self.steps.get_mut(id)
    }

    /// Add pending records for steps the definition declares but the record lacks
    pub fn align_with(&mut self, definition: &WorkflowDefinition) {
        for step in &definition.steps {
            if !self.steps.contains(&step.id) {
                self.steps.insert(StepExecution::pending(step));
            }
        }
    }

    /// Snapshot that templates and conditions evaluate against
    pub fn template_context(&self) -> TemplateContext {
        let mut ctx = TemplateContext::with_params(self.input.clone());
        for step in self.steps.values() {
            ctx.add_step(
                step.id.clone(),
                step.status,
                step.output.clone(),
                step.error.as_ref().map(|e| e.message.clone()),
            );
        }
        ctx
    }

    /// Settled steps over total
    ///
    /// Once the execution has completed, a failed step it moved past through
    /// the alternate policy counts as settled too.
    pub fn progress(&self) -> Progress {
        let total = self.steps.len();
        let finished = self.status == ExecutionStatus::Completed;
        let completed = self
            .steps
            .values()
            .filter(|s| match s.status {
                StepStatus::Completed | StepStatus::Skipped => true,
                StepStatus::Failed => finished,
                _ => false,
            })
            .count();
        let percentage = if total == 0 {
            0
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u32
        };
        Progress {
            total,
            completed,
            percentage,
        }
    }

    /// Start-execution response for this record
    pub fn started(&self) -> ExecutionStarted {
        ExecutionStarted {
            execution_id: self.id.clone(),
            status: self.status,
            current_step_id: self.current_step_id.clone(),
            created_at: self.created_at,
        }
    }

    pub fn report(self) -> ExecutionReport {
        let progress = self.progress();
        ExecutionReport {
            execution: self,
            progress,
        }
    }
}

/// Completion summary; skipped steps count as done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub percentage: u32,
}

/// Returned by the start-execution operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStarted {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub current_step_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Returned by the query operation
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    #[serde(flatten)]
    pub execution: WorkflowExecution,
    pub progress: Progress,
}

/// `<prefix>-<unix millis>-<8 hex>`
pub fn generate_id(prefix: &str) -> String {
    format!(
        "{}-{}-{:08x}",
        prefix,
        Utc::now().timestamp_millis(),
        rand::random::<u32>()
    )
}
