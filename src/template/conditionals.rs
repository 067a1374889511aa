//! Expression evaluation for step conditions
//!
//! Evaluates expressions like `{{ steps.research-step.output.confidence > 0.6 }}`
//! against a template context.

use super::context::TemplateContext;
use super::errors::TemplateError;
use minijinja::value::{Value, ValueKind};
use minijinja::{Environment, UndefinedBehavior};
use regex::Regex;
use std::sync::LazyLock;

static STEP_ACCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bsteps\.([A-Za-z0-9_-]+)").expect("valid step access regex")
});

/// Strip an optional `{{ ... }}` wrapper
fn unwrap_braces(expr: &str) -> &str {
    let expr = expr.trim();
    match expr.strip_prefix("{{").and_then(|e| e.strip_suffix("}}")) {
        Some(inner) => inner.trim(),
        None => expr,
    }
}

/// Rewrite `steps.<id>` to `steps["<id>"]` so hyphenated ids parse
fn rewrite_step_access(expr: &str) -> String {
    STEP_ACCESS
        .replace_all(expr, r#"steps["${1}"]"#)
        .into_owned()
}

/// Jinja truthiness, except that strings spelling out a negative are false
fn is_truthy(value: &Value) -> bool {
    if value.kind() == ValueKind::String {
        let s = value.as_str().unwrap_or_default().trim().to_ascii_lowercase();
        return !matches!(s.as_str(), "" | "false" | "0" | "no" | "off");
    }
    value.is_true()
}

/// Evaluate an expression and return the resulting Value
pub fn evaluate_expression(expr: &str, ctx: &TemplateContext) -> Result<Value, TemplateError> {
    let source = unwrap_braces(expr);
    if source.is_empty() {
        return Ok(Value::UNDEFINED);
    }

    let rewritten = rewrite_step_access(source);

    let mut env = Environment::new();
    // References to skipped or unknown steps degrade to undefined instead of erroring
    env.set_undefined_behavior(UndefinedBehavior::Chainable);

    let compiled = env
        .compile_expression(&rewritten)
        .map_err(|e| TemplateError::syntax(source, e.to_string()))?;

    compiled
        .eval(ctx.to_value())
        .map_err(|e| TemplateError::expression(source, e.to_string()))
}

/// Evaluate a conditional expression against a context
///
/// Supports variable access (`steps.<id>.output.<path>`, `steps.<id>.status`,
/// `params.<name>`), comparisons, `and`/`or`/`not`, literals and parentheses.
/// An empty condition is true.
pub fn evaluate_condition(expr: &str, ctx: &TemplateContext) -> Result<bool, TemplateError> {
    if unwrap_braces(expr).is_empty() {
        return Ok(true);
    }
    evaluate_expression(expr, ctx).map(|v| is_truthy(&v))
}

/// Check if a step should be executed based on its condition
///
/// A condition that cannot be parsed or evaluated skips the step.
pub fn should_execute_step(condition: Option<&str>, ctx: &TemplateContext) -> bool {
    match condition {
        None => true,
        Some(cond) => match evaluate_condition(cond, ctx) {
            Ok(run) => run,
            Err(e) => {
                tracing::warn!(condition = cond, error = %e, "Condition could not be evaluated, skipping step");
                false
            }
        },
    }
}

/// Step ids referenced anywhere in a condition (braces optional)
pub fn condition_references(expr: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for caps in STEP_ACCESS.captures_iter(unwrap_braces(expr)) {
        let id = caps[1].to_string();
        if !refs.contains(&id) {
            refs.push(id);
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepStatus;
    use serde_json::json;

    fn ctx_with_research(confidence: f64) -> TemplateContext {
        let mut params = serde_json::Map::new();
        params.insert("issue".into(), json!("123"));
        params.insert("enabled".into(), json!("false"));
        let mut ctx = TemplateContext::with_params(params);
        ctx.add_step(
            "research-step",
            StepStatus::Completed,
            Some(json!({"confidence": confidence, "findings": ["a"]})),
            None,
        );
        ctx.add_step("analysis-step", StepStatus::Skipped, None, None);
        ctx
    }

    #[test]
    fn test_empty_condition() {
        let ctx = TemplateContext::new();
        assert!(evaluate_condition("", &ctx).unwrap());
        assert!(evaluate_condition("{{  }}", &ctx).unwrap());
    }

    #[test]
    fn test_literals() {
        let ctx = TemplateContext::new();
        assert!(evaluate_condition("true", &ctx).unwrap());
        assert!(!evaluate_condition("{{ false }}", &ctx).unwrap());
    }

    #[test]
    fn test_confidence_threshold() {
        let cond = "{{ steps.research-step.output.confidence > 0.6 }}";
        assert!(evaluate_condition(cond, &ctx_with_research(0.85)).unwrap());
        assert!(!evaluate_condition(cond, &ctx_with_research(0.3)).unwrap());
    }

    #[test]
    fn test_param_comparison() {
        let ctx = ctx_with_research(0.5);
        assert!(evaluate_condition("params.issue == '123'", &ctx).unwrap());
        assert!(!evaluate_condition("params.issue != '123'", &ctx).unwrap());
    }

    #[test]
    fn test_false_string_is_falsy() {
        let ctx = ctx_with_research(0.5);
        assert!(!evaluate_condition("{{ params.enabled }}", &ctx).unwrap());
    }

    #[test]
    fn test_status_access_and_boolean_ops() {
        let ctx = ctx_with_research(0.9);
        assert!(
            evaluate_condition(
                "steps.analysis-step.status == 'skipped' and steps.research-step.status == 'completed'",
                &ctx
            )
            .unwrap()
        );
        assert!(evaluate_condition("not (steps.analysis-step.status == 'completed')", &ctx).unwrap());
    }

    #[test]
    fn test_skipped_step_output_is_falsy() {
        let ctx = ctx_with_research(0.9);
        assert!(!evaluate_condition("{{ steps.analysis-step.output }}", &ctx).unwrap());
        assert!(!should_execute_step(Some("steps.unknown-step.output.ok"), &ctx));
    }

    #[test]
    fn test_syntax_error() {
        let ctx = TemplateContext::new();
        let result = evaluate_condition("{{ steps.a.output > }}", &ctx);
        assert!(matches!(result, Err(TemplateError::SyntaxError { .. })));
    }

    #[test]
    fn test_unevaluable_condition_skips() {
        let ctx = TemplateContext::new();
        assert!(!should_execute_step(Some("{{ ((( }}"), &ctx));
        assert!(should_execute_step(None, &ctx));
    }

    #[test]
    fn test_evaluate_expression_value() {
        let ctx = ctx_with_research(0.75);
        let value = evaluate_expression("steps.research-step.output.findings | length", &ctx).unwrap();
        assert_eq!(value.as_usize(), Some(1));
    }

    #[test]
    fn test_condition_references() {
        let refs = condition_references("steps.a-b.output.x > 1 and steps.c.status == 'completed'");
        assert_eq!(refs, vec!["a-b", "c"]);
    }

    #[test]
    fn test_rewrite_step_access() {
        assert_eq!(
            rewrite_step_access("steps.research-step.output.confidence > 0.6"),
            r#"steps["research-step"].output.confidence > 0.6"#
        );
    }
}
