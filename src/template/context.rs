//! Snapshot of an execution that templates resolve against

use crate::workflow::StepStatus;
use minijinja::value::Value;
use serde::Serialize;
use std::collections::BTreeMap;

/// Values visible to `{{ ... }}` expressions
#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateContext {
    /// Top-level execution input
    pub params: serde_json::Map<String, serde_json::Value>,

    /// Step state keyed by step id
    pub steps: BTreeMap<String, StepView>,
}

/// What a template can see of one step
#[derive(Debug, Clone, Serialize)]
pub struct StepView {
    pub status: StepStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TemplateContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with execution parameters
    pub fn with_params(params: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    /// Add a step to the context
    pub fn add_step(
        &mut self,
        id: impl Into<String>,
        status: StepStatus,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) {
        self.steps.insert(
            id.into(),
            StepView {
                status,
                output,
                error,
            },
        );
    }

    /// Output of a step, only once it has completed
    pub fn completed_output(&self, id: &str) -> Option<&serde_json::Value> {
        self.steps
            .get(id)
            .filter(|s| s.status == StepStatus::Completed)
            .and_then(|s| s.output.as_ref())
    }

    /// Convert to a minijinja Value for expression evaluation
    pub fn to_value(&self) -> Value {
        Value::from_serialize(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_completed_output_only() {
        let mut ctx = TemplateContext::new();
        ctx.add_step("done", StepStatus::Completed, Some(json!({"a": 1})), None);
        ctx.add_step("running", StepStatus::Running, Some(json!({"a": 2})), None);

        assert_eq!(ctx.completed_output("done"), Some(&json!({"a": 1})));
        assert!(ctx.completed_output("running").is_none());
        assert!(ctx.completed_output("missing").is_none());
    }

    #[test]
    fn test_to_value_exposes_steps_and_params() {
        let mut params = serde_json::Map::new();
        params.insert("topic".into(), json!("rust"));
        let mut ctx = TemplateContext::with_params(params);
        ctx.add_step("research", StepStatus::Completed, Some(json!({"confidence": 0.9})), None);

        let value = ctx.to_value();
        let topic = value
            .get_attr("params")
            .and_then(|p| p.get_attr("topic"))
            .unwrap();
        assert_eq!(topic.as_str(), Some("rust"));

        let status = value
            .get_attr("steps")
            .and_then(|s| s.get_item(&Value::from("research")))
            .and_then(|s| s.get_attr("status"))
            .unwrap();
        assert_eq!(status.as_str(), Some("completed"));
    }
}
