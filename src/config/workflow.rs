//! Workflow and step definitions

use crate::template::{condition_references, step_references, suggest_correction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

/// How a step's ultimate failure affects the owning execution
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Fail the whole execution
    #[default]
    Fail,
    /// Mark the step skipped and move on
    Continue,
    /// Retries are already exhausted inside the step, so this fails the execution
    Retry,
    /// Jump forward to `alternate_step_id`
    Alternate,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Continue => "continue",
            Self::Retry => "retry",
            Self::Alternate => "alternate",
        }
    }
}

/// Per-step retry policy
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay in milliseconds
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Double the delay after every failed attempt instead of growing linearly
    #[serde(default = "default_exponential")]
    pub exponential: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_exponential() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            exponential: default_exponential(),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` (1-based) failed, before the next one
    ///
    /// Exponential: `backoff * 2^(attempt-1)`. Linear: `backoff * attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = if self.exponential {
            let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
            self.backoff_ms.saturating_mul(factor)
        } else {
            self.backoff_ms.saturating_mul(u64::from(attempt))
        };
        Duration::from_millis(ms)
    }
}

/// One step of a workflow
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    /// Step id (unique within the workflow)
    pub id: String,

    /// External agent this step delegates to
    pub agent_id: String,

    /// Input object; string fields may contain `{{ ... }}` references
    #[serde(default = "empty_object")]
    pub input: serde_json::Value,

    /// Boolean expression gating execution
    pub condition: Option<String>,

    #[serde(default)]
    pub on_error: ErrorPolicy,

    /// Target step for the `alternate` policy
    pub alternate_step_id: Option<String>,

    /// Bound on a single agent call, in milliseconds
    pub timeout_ms: Option<u64>,

    /// Falls back to the engine default when absent
    pub retry_policy: Option<RetryPolicy>,

    /// Dotted path in the aggregate output tree
    pub output_path: Option<String>,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Default for StepDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            agent_id: String::new(),
            input: empty_object(),
            condition: None,
            on_error: ErrorPolicy::Fail,
            alternate_step_id: None,
            timeout_ms: None,
            retry_policy: None,
            output_path: None,
        }
    }
}

impl StepDefinition {
    /// Effective retry policy given the engine default
    pub fn effective_retry_policy(&self, default: &RetryPolicy) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_else(|| default.clone())
    }
}

/// Descriptive metadata about a workflow
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DefinitionMetadata {
    pub owner: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// Full workflow definition
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Workflow id
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Steps, executed in declaration order
    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    /// Output key -> template expression, resolved at completion
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    #[serde(default)]
    pub metadata: DefinitionMetadata,
}

fn default_version() -> String {
    "1.0.0".into()
}

impl WorkflowDefinition {
    /// Position of a step in declaration order
    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Validate the workflow definition
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id.trim().is_empty() {
            errors.push("workflow id must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                errors.push("step id must not be empty".to_string());
            }
            if !seen.insert(step.id.as_str()) {
                errors.push(format!("duplicate step id: {}", step.id));
            }
            if step.agent_id.trim().is_empty() {
                errors.push(format!("step '{}' missing 'agent_id'", step.id));
            }
        }

        let positions: HashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let known: Vec<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();

        for (idx, step) in self.steps.iter().enumerate() {
            if let Some(ref policy) = step.retry_policy {
                if policy.max_attempts == 0 {
                    errors.push(format!(
                        "step '{}' retry_policy.max_attempts must be at least 1",
                        step.id
                    ));
                }
            }

            if let Some(ref path) = step.output_path {
                if path.split('.').any(|seg| seg.trim().is_empty()) {
                    errors.push(format!(
                        "step '{}' has an invalid output_path '{}'",
                        step.id, path
                    ));
                }
            }

            if step.on_error == ErrorPolicy::Alternate {
                match step.alternate_step_id.as_deref() {
                    None => errors.push(format!(
                        "step '{}' uses on_error = \"alternate\" without 'alternate_step_id'",
                        step.id
                    )),
                    Some(target) => match positions.get(target) {
                        None => errors.push(unknown_step_message(&step.id, target, &known)),
                        Some(&pos) if pos <= idx => errors.push(format!(
                            "step '{}' alternate '{}' must be declared after it",
                            step.id, target
                        )),
                        Some(_) => {}
                    },
                }
            }

            let mut texts = Vec::new();
            collect_strings(&step.input, &mut texts);
            let mut references: Vec<String> =
                texts.into_iter().flat_map(step_references).collect();
            if let Some(ref condition) = step.condition {
                references.extend(condition_references(condition));
            }
            for reference in references {
                if !positions.contains_key(reference.as_str()) {
                    errors.push(unknown_step_message(&step.id, &reference, &known));
                }
            }
        }

        for (key, template) in &self.outputs {
            for reference in step_references(template) {
                if !positions.contains_key(reference.as_str()) {
                    errors.push(unknown_step_message(
                        &format!("outputs.{}", key),
                        &reference,
                        &known,
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn unknown_step_message(owner: &str, reference: &str, known: &[&str]) -> String {
    match suggest_correction(reference, known) {
        Some(suggestion) => format!(
            "'{}' references unknown step '{}', did you mean '{}'?",
            owner, reference, suggestion
        ),
        None => format!("'{}' references unknown step '{}'", owner, reference),
    }
}

fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn step(id: &str) -> StepDefinition {
        StepDefinition {
            id: id.into(),
            agent_id: "echo-agent".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_workflow_definition_toml() {
        let toml = r#"
            id = "research"
            name = "Research"

            [[steps]]
            id = "research-step"
            agent_id = "research-agent"
            on_error = "continue"
            output_path = "research"

            [steps.input]
            query = "{{ params.topic }}"

            [steps.retry_policy]
            max_attempts = 2
            backoff_ms = 500

            [outputs]
            topic = "{{ params.topic }}"
        "#;
        let workflow: WorkflowDefinition = toml::from_str(toml).unwrap();
        assert_eq!(workflow.id, "research");
        assert_eq!(workflow.version, "1.0.0");
        assert_eq!(workflow.steps.len(), 1);

        let step = &workflow.steps[0];
        assert_eq!(step.on_error, ErrorPolicy::Continue);
        assert_eq!(step.input["query"], "{{ params.topic }}");
        let policy = step.retry_policy.as_ref().unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert!(policy.exponential);
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_step_defaults() {
        let step: StepDefinition = toml::from_str(
            r#"
            id = "a"
            agent_id = "x"
        "#,
        )
        .unwrap();
        assert_eq!(step.on_error, ErrorPolicy::Fail);
        assert!(step.input.as_object().unwrap().is_empty());
        assert_eq!(
            step.effective_retry_policy(&RetryPolicy::default()),
            RetryPolicy::default()
        );
    }

    #[test]
    fn test_reject_unknown_fields() {
        let result: Result<StepDefinition, _> = toml::from_str(
            r#"
            id = "a"
            agent_id = "x"
            retries = 4
        "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 1000,
            exponential: true,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(8000));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_ms: 1000,
            exponential: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy {
            max_attempts: 100,
            backoff_ms: u64::MAX / 2,
            exponential: true,
        };
        assert_eq!(policy.delay_for_attempt(80), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_validation_errors() {
        let mut bad_retry = step("b");
        bad_retry.retry_policy = Some(RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        });

        let mut bad_path = step("c");
        bad_path.output_path = Some("research..findings".into());

        let mut missing_alternate = step("d");
        missing_alternate.on_error = ErrorPolicy::Alternate;

        let workflow = WorkflowDefinition {
            id: "broken".into(),
            steps: vec![step("a"), step("a"), bad_retry, bad_path, missing_alternate],
            ..Default::default()
        };

        let errors = workflow.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("duplicate step id: a")));
        assert!(errors.iter().any(|e| e.contains("max_attempts")));
        assert!(errors.iter().any(|e| e.contains("output_path")));
        assert!(errors.iter().any(|e| e.contains("alternate_step_id")));
    }

    #[test]
    fn test_alternate_must_point_forward() {
        let mut failing = step("second");
        failing.on_error = ErrorPolicy::Alternate;
        failing.alternate_step_id = Some("first".into());

        let workflow = WorkflowDefinition {
            id: "wf".into(),
            steps: vec![step("first"), failing],
            ..Default::default()
        };

        let errors = workflow.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("must be declared after")));
    }

    #[test]
    fn test_unknown_reference_suggestion() {
        let mut second = step("analysis");
        second.input = serde_json::json!({ "subject": "{{ steps.reserch.output }}" });

        let workflow = WorkflowDefinition {
            id: "wf".into(),
            steps: vec![step("research"), second],
            ..Default::default()
        };

        let errors = workflow.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("did you mean 'research'"));
    }

    #[test]
    fn test_output_template_references_checked() {
        let mut workflow = WorkflowDefinition {
            id: "wf".into(),
            steps: vec![step("research")],
            ..Default::default()
        };
        workflow
            .outputs
            .insert("summary".into(), "{{ steps.summary.output }}".into());

        let errors = workflow.validate().unwrap_err();
        assert!(errors[0].contains("outputs.summary"));
    }
}
