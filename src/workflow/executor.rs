//! Step execution: template binding, agent call, retry with backoff
//!
//! Retries happen inside a single step visit. Only exhausting
//! `max_attempts` surfaces as a step failure to the runner.

use super::cancellation::with_cancellation;
use super::runner::Driver;
use super::state::{ErrorInfo, StepStatus};
use crate::agent::{AgentContext, AgentError};
use crate::config::StepDefinition;
use crate::template::resolve;
use chrono::{TimeDelta, Utc};
use serde_json::Value;
use std::time::Duration;

/// How a step visit ended
#[derive(Debug, Clone, PartialEq)]
pub(super) enum StepOutcome {
    Completed,
    /// Retries exhausted; the error of the last attempt
    Failed(ErrorInfo),
    /// The execution was cancelled during an attempt or a backoff
    Cancelled,
}

enum AttemptError {
    Agent(AgentError),
    Cancelled,
}

impl Driver {
    /// Run one step to a terminal status, mutating its record in place
    pub(super) async fn execute_step(&mut self, step: &StepDefinition) -> StepOutcome {
        let policy = step.effective_retry_policy(&self.engine.settings.default_retry);
        let max_attempts = policy.max_attempts.max(1);
        let timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.engine.settings.default_step_timeout);

        let mut attempt: u32 = 1;
        loop {
            let input = resolve(&step.input, &self.execution.template_context());
            if let Some(state) = self.execution.step_mut(&step.id) {
                state.status = StepStatus::Running;
                state.start_time = Some(Utc::now());
                state.end_time = None;
                state.duration_ms = None;
                state.retry_count = attempt - 1;
                state.next_retry_at = None;
                state.input = Some(input.clone());
            }
            self.persist().await;

            tracing::info!(
                execution_id = %self.execution.id,
                step = %step.id,
                agent = %step.agent_id,
                attempt,
                max_attempts,
                "Step started"
            );

            let context = self.agent_context(&step.id);
            let error = match self.call_agent(&step.agent_id, &input, &context, timeout).await {
                Ok(output) => {
                    let mut duration_ms = None;
                    if let Some(state) = self.execution.step_mut(&step.id) {
                        state.output = Some(output);
                        state.error = None;
                        state.finish(StepStatus::Completed);
                        duration_ms = state.duration_ms;
                    }
                    tracing::info!(
                        execution_id = %self.execution.id,
                        step = %step.id,
                        attempt,
                        duration_ms,
                        "Step completed"
                    );
                    self.persist().await;
                    return StepOutcome::Completed;
                }
                Err(AttemptError::Cancelled) => return StepOutcome::Cancelled,
                Err(AttemptError::Agent(error)) => error,
            };

            let info = ErrorInfo::new(error.code.clone(), error.message.clone());

            if attempt >= max_attempts {
                if let Some(state) = self.execution.step_mut(&step.id) {
                    state.error = Some(info.clone());
                    state.finish(StepStatus::Failed);
                }
                tracing::warn!(
                    execution_id = %self.execution.id,
                    step = %step.id,
                    attempts = attempt,
                    error = %error,
                    "Step failed"
                );
                self.persist().await;
                return StepOutcome::Failed(info);
            }

            let delay = policy.delay_for_attempt(attempt);
            if let Some(state) = self.execution.step_mut(&step.id) {
                state.error = Some(info);
                state.next_retry_at = TimeDelta::from_std(delay)
                    .ok()
                    .and_then(|d| Utc::now().checked_add_signed(d));
            }
            tracing::warn!(
                execution_id = %self.execution.id,
                step = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                retryable = error.is_retryable(),
                "Step attempt failed, retrying"
            );
            self.persist().await;

            if with_cancellation(&self.token, tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return StepOutcome::Cancelled;
            }
            attempt += 1;
        }
    }

    fn agent_context(&self, step_id: &str) -> AgentContext {
        AgentContext {
            workflow_id: self.execution.workflow_id.clone(),
            execution_id: self.execution.id.clone(),
            step_id: step_id.to_string(),
            correlation_id: self.execution.metadata.correlation_id.clone(),
            request_id: self.execution.metadata.request_id.clone(),
        }
    }

    /// One attempt, bounded by `timeout` and abandoned on cancellation
    async fn call_agent(
        &self,
        agent_id: &str,
        input: &Value,
        context: &AgentContext,
        timeout: Option<Duration>,
    ) -> Result<Value, AttemptError> {
        let call = self.engine.agents.execute(agent_id, input, context);
        let bounded = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, call)
                    .await
                    .unwrap_or_else(|_| Err(AgentError::timeout(limit))),
                None => call.await,
            }
        };

        match with_cancellation(&self.token, bounded).await {
            Some(result) => result.map_err(AttemptError::Agent),
            None => Err(AttemptError::Cancelled),
        }
    }
}
