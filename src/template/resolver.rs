//! Best-effort `{{ ... }}` substitution for step inputs and workflow outputs
//!
//! Grammar inside the braces:
//!
//! - `params.<name>`
//! - `steps.<id>.output[.<path>...]`
//! - `now()`
//!
//! optionally followed by `| default(<literal>)`. References that cannot be
//! resolved become empty strings; resolution never fails.

use super::context::TemplateContext;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.*?)\s*\}\}").expect("valid expression regex"));

static STEP_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bsteps\.([A-Za-z0-9_-]+)").expect("valid step reference regex")
});

static DEFAULT_FILTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^default\s*\(\s*(.*?)\s*\)$").expect("valid default filter regex")
});

#[derive(Debug, Clone, PartialEq)]
enum Reference {
    Param(String),
    StepOutput { step: String, path: Vec<String> },
    Now,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Expression {
    reference: Reference,
    default: Option<String>,
}

fn parse_expression(raw: &str) -> Expression {
    let (head, filter) = match raw.split_once('|') {
        Some((head, filter)) => (head.trim(), Some(filter.trim())),
        None => (raw.trim(), None),
    };

    let default = filter
        .and_then(|f| DEFAULT_FILTER.captures(f))
        .map(|caps| unquote(&caps[1]).to_string());

    let reference = if head == "now()" {
        Reference::Now
    } else if let Some(name) = head.strip_prefix("params.") {
        if is_path_segment(name) {
            Reference::Param(name.to_string())
        } else {
            Reference::Unknown(head.to_string())
        }
    } else if let Some(rest) = head.strip_prefix("steps.") {
        let mut parts = rest.split('.');
        match (parts.next(), parts.next()) {
            (Some(step), Some("output")) if is_path_segment(step) => {
                let path: Vec<String> = parts.map(str::to_string).collect();
                if path.iter().all(|p| is_path_segment(p)) {
                    Reference::StepOutput {
                        step: step.to_string(),
                        path,
                    }
                } else {
                    Reference::Unknown(head.to_string())
                }
            }
            _ => Reference::Unknown(head.to_string()),
        }
    } else {
        Reference::Unknown(head.to_string())
    };

    Expression { reference, default }
}

fn is_path_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn unquote(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Render a JSON value the way it appears inside a substituted string
fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn lookup_path<'a>(mut value: &'a Value, path: &[String]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn evaluate(expr: &Expression, ctx: &TemplateContext) -> String {
    let resolved = match &expr.reference {
        Reference::Param(name) => ctx.params.get(name).map(stringify).unwrap_or_default(),
        Reference::StepOutput { step, path } => match ctx.completed_output(step) {
            Some(output) if path.is_empty() => output.to_string(),
            Some(output) => lookup_path(output, path).map(stringify).unwrap_or_default(),
            None => String::new(),
        },
        Reference::Now => {
            chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        }
        Reference::Unknown(raw) => {
            tracing::debug!(expression = %raw, "Unsupported template expression");
            String::new()
        }
    };

    match (&expr.default, resolved.is_empty()) {
        (Some(default), true) => default.clone(),
        _ => resolved,
    }
}

/// Substitute every `{{ ... }}` occurrence in a single string
pub fn render_string(template: &str, ctx: &TemplateContext) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }

    EXPRESSION
        .replace_all(template, |caps: &regex::Captures<'_>| {
            evaluate(&parse_expression(&caps[1]), ctx)
        })
        .into_owned()
}

/// Resolve a workflow output template to a value
///
/// A template that is exactly one step-output reference yields the referenced
/// JSON value itself; anything else renders to a string.
pub fn render_value(template: &str, ctx: &TemplateContext) -> Value {
    let trimmed = template.trim();
    if let Some(caps) = EXPRESSION.captures(trimmed) {
        if caps[0].len() == trimmed.len() {
            if let Reference::StepOutput { step, path } = parse_expression(&caps[1]).reference {
                let found = ctx
                    .completed_output(&step)
                    .and_then(|output| lookup_path(output, &path))
                    .filter(|v| !v.is_null());
                if let Some(value) = found {
                    return value.clone();
                }
            }
        }
    }
    Value::String(render_string(template, ctx))
}

/// Resolve every string field of `input`, recursing into objects and arrays
///
/// Non-string values and strings without template syntax pass through unchanged.
pub fn resolve(input: &Value, ctx: &TemplateContext) -> Value {
    match input {
        Value::String(s) => Value::String(render_string(s, ctx)),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Step ids referenced by `steps.<id>` inside the `{{ ... }}` blocks of `text`
pub fn step_references(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for block in EXPRESSION.captures_iter(text) {
        for caps in STEP_REFERENCE.captures_iter(&block[1]) {
            let id = caps[1].to_string();
            if !refs.contains(&id) {
                refs.push(id);
            }
        }
    }
    refs
}
