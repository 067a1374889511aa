//! CLI command implementations

use super::output::{OutputEvent, OutputHandler};
use super::signals::cancel_on_signal;
use crate::agent::create_agent;
use crate::config::{EngineConfig, WorkflowDefinition, load_workflow_file};
use crate::workflow::{
    ExecutionStatus, RequestMetadata, StepStatus, TriggerSource, WorkflowEngine,
    WorkflowExecution,
};
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Exit code for a terminal status
fn exit_code(status: ExecutionStatus) -> i32 {
    match status {
        ExecutionStatus::Completed => 0,
        ExecutionStatus::Cancelled => 130,
        _ => 1,
    }
}

/// Start a workflow and follow it to the end
pub async fn run_workflow(
    engine: &WorkflowEngine,
    workflow_id: &str,
    args: &[String],
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let params = parse_workflow_args(args);
    let metadata = RequestMetadata {
        triggered_by: TriggerSource::Cli,
        ..Default::default()
    };

    let started = engine
        .execute(workflow_id, params, metadata)
        .await
        .with_context(|| format!("starting workflow '{}'", workflow_id))?;

    let steps = engine
        .registry()
        .get(workflow_id)
        .map(|d| d.steps.len())
        .unwrap_or_default();
    handler.emit(OutputEvent::ExecutionStarted {
        execution_id: started.execution_id.clone(),
        workflow_id: workflow_id.to_string(),
        steps,
    });

    follow(engine, &started.execution_id, handler).await
}

/// Restart a stored execution whose driver is gone, and follow it
pub async fn resume_execution(
    engine: &WorkflowEngine,
    execution_id: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let started = engine
        .resume(execution_id)
        .await
        .with_context(|| format!("resuming execution '{}'", execution_id))?;

    handler.emit(OutputEvent::Info {
        message: format!(
            "Resumed {} at step {}",
            started.execution_id,
            started.current_step_id.as_deref().unwrap_or("-")
        ),
    });

    follow(engine, execution_id, handler).await
}

/// Poll a live execution, emitting step transitions until its driver exits
async fn follow(
    engine: &WorkflowEngine,
    execution_id: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let signals = cancel_on_signal(engine.clone(), execution_id.to_string());

    let mut seen: HashMap<String, (StepStatus, u32)> = HashMap::new();
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let result = loop {
        ticker.tick().await;
        let active = engine.is_active(execution_id);
        let snapshot = match engine.get(execution_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => break Err(e),
        };
        emit_step_changes(&snapshot, &mut seen, handler);
        if !active {
            break Ok(snapshot);
        }
    };
    signals.abort();

    let execution = result.with_context(|| format!("following execution '{}'", execution_id))?;
    let code = exit_code(execution.status);
    handler.report(&execution.report());
    Ok(code)
}

fn emit_step_changes(
    execution: &WorkflowExecution,
    seen: &mut HashMap<String, (StepStatus, u32)>,
    handler: &dyn OutputHandler,
) {
    for step in execution.steps.values() {
        if step.status == StepStatus::Pending {
            continue;
        }
        let state = (step.status, step.retry_count);
        if seen.get(&step.id) == Some(&state) {
            continue;
        }
        seen.insert(step.id.clone(), state);
        handler.emit(OutputEvent::StepUpdate {
            step: step.id.clone(),
            agent_id: step.agent_id.clone(),
            status: step.status,
            retry_count: step.retry_count,
            duration_ms: step.duration_ms,
            error: step.error.as_ref().map(|e| e.to_string()),
        });
    }
}

/// Parse `key=value` workflow arguments
///
/// Values that parse as JSON keep their type (`count=5` is a number); anything
/// else is a string. Bare arguments are stored as `arg0`, `arg1`, ...
pub fn parse_workflow_args(args: &[String]) -> Map<String, Value> {
    let mut parsed = Map::new();
    let mut positional = 0;

    for arg in args {
        match arg.split_once('=') {
            Some((key, value)) => {
                let value = serde_json::from_str::<Value>(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                parsed.insert(key.to_string(), value);
            }
            None => {
                parsed.insert(format!("arg{}", positional), Value::String(arg.clone()));
                positional += 1;
            }
        }
    }

    parsed
}

/// Show one execution
pub async fn show_status(
    engine: &WorkflowEngine,
    execution_id: &str,
    workflow_id: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let report = match workflow_id {
        Some(workflow_id) => engine.query_for_workflow(workflow_id, execution_id).await?,
        None => engine.query(execution_id).await?,
    };
    handler.report(&report);
    Ok(0)
}

/// List recent executions of a workflow
pub async fn list_executions(
    engine: &WorkflowEngine,
    workflow_id: &str,
    limit: Option<usize>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let executions = engine.list(workflow_id, limit).await?;
    if executions.is_empty() {
        handler.emit(OutputEvent::Info {
            message: format!("(no executions of '{}')", workflow_id),
        });
    }
    for execution in executions {
        handler.emit(OutputEvent::ExecutionSummary {
            progress: execution.progress(),
            execution_id: execution.id,
            status: execution.status,
            start_time: execution.start_time,
        });
    }
    Ok(0)
}

/// Cancel an execution
pub async fn cancel_execution(
    engine: &WorkflowEngine,
    execution_id: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let execution = engine.cancel(execution_id).await?;
    handler.emit(OutputEvent::Info {
        message: format!("✓ Execution {} cancelled", execution.id),
    });
    Ok(0)
}

/// List registered workflows
pub fn list_workflows(engine: &WorkflowEngine, handler: &dyn OutputHandler) {
    let workflows = engine.registry().list();
    if workflows.is_empty() {
        handler.emit(OutputEvent::Info {
            message: "(no workflows registered)".into(),
        });
        return;
    }

    for workflow in workflows {
        let name = if workflow.name.is_empty() {
            String::new()
        } else {
            format!(" - {}", workflow.name)
        };
        handler.emit(OutputEvent::Info {
            message: format!(
                "{} v{}{} ({} steps)",
                workflow.id,
                workflow.version,
                name,
                workflow.steps.len()
            ),
        });
        if !workflow.description.is_empty() {
            handler.emit(OutputEvent::Info {
                message: format!("  {}", workflow.description),
            });
        }
    }
}

/// Validate a workflow file, or a registered workflow by id
pub fn validate_workflow(
    engine: &WorkflowEngine,
    target: &str,
    handler: &dyn OutputHandler,
) -> i32 {
    let path = Path::new(target);
    let loaded: Result<WorkflowDefinition> = if path.is_file() {
        load_workflow_file(path)
    } else {
        engine
            .registry()
            .get(target)
            .map(|d| (*d).clone())
            .with_context(|| format!("no workflow file or registered workflow '{}'", target))
    };

    let workflow = match loaded {
        Ok(workflow) => workflow,
        Err(e) => {
            handler.emit(OutputEvent::Error {
                message: format!("{:#}", e),
            });
            return 1;
        }
    };

    match workflow.validate() {
        Ok(()) => {
            handler.emit(OutputEvent::Info {
                message: format!(
                    "✓ Workflow '{}' is valid ({} steps)",
                    workflow.id,
                    workflow.steps.len()
                ),
            });
            0
        }
        Err(errors) => {
            handler.emit(OutputEvent::Info {
                message: format!(
                    "✗ Workflow '{}' has {} error(s):",
                    workflow.id,
                    errors.len()
                ),
            });
            for err in &errors {
                handler.emit(OutputEvent::Info {
                    message: format!("  - {}", err),
                });
            }
            1
        }
    }
}

/// List configured agents and check that enabled ones are reachable
pub async fn list_agents(config: &EngineConfig, handler: &dyn OutputHandler) -> i32 {
    if config.agents.is_empty() {
        handler.emit(OutputEvent::Info {
            message: "(no agents configured)".into(),
        });
        return 0;
    }

    let mut names: Vec<&String> = config.agents.keys().collect();
    names.sort();

    let mut all_ok = true;
    for name in names {
        let agent_config = &config.agents[name];
        let kind = if agent_config.is_http() { "http" } else { "cli" };

        let status = if !agent_config.enabled {
            "✗ disabled".to_string()
        } else {
            match create_agent(name, agent_config) {
                Ok(agent) if agent.is_available().await => "✓".to_string(),
                Ok(_) => {
                    all_ok = false;
                    "✗ unavailable".to_string()
                }
                Err(e) => {
                    all_ok = false;
                    format!("✗ {}", e)
                }
            }
        };

        handler.emit(OutputEvent::Info {
            message: format!("{} {} ({}: {})", status, name, kind, agent_config.command),
        });
        if !agent_config.description.is_empty() {
            handler.emit(OutputEvent::Info {
                message: format!("  {}", agent_config.description),
            });
        }
    }

    if all_ok { 0 } else { 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRegistry, CommandAgent};
    use crate::config::{AgentConfig, StepDefinition};
    use crate::store::MemoryStore;
    use crate::workflow::{EngineSettings, ExecutionReport, WorkflowRegistry};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockHandler {
        events: Mutex<Vec<OutputEvent>>,
        reports: Mutex<Vec<ExecutionReport>>,
    }

    impl MockHandler {
        fn events(&self) -> Vec<OutputEvent> {
            self.events.lock().unwrap().clone()
        }

        fn messages(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    OutputEvent::Info { message } | OutputEvent::Error { message } => {
                        Some(message)
                    }
                    _ => None,
                })
                .collect()
        }
    }

    impl OutputHandler for MockHandler {
        fn emit(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }

        fn report(&self, report: &ExecutionReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    async fn echo_engine() -> WorkflowEngine {
        let mut agents = AgentRegistry::new();
        agents.register("echo-agent", Arc::new(CommandAgent::new("echo-agent", "cat")));

        let engine = WorkflowEngine::new(
            Arc::new(WorkflowRegistry::new()),
            Arc::new(MemoryStore::new()),
            Arc::new(agents),
            EngineSettings::default(),
        );
        engine
            .registry()
            .register(WorkflowDefinition {
                id: "echo".into(),
                name: "Echo".into(),
                version: "1.0.0".into(),
                steps: vec![StepDefinition {
                    id: "say".into(),
                    agent_id: "echo-agent".into(),
                    input: json!({"topic": "{{ params.topic }}", "count": "{{ params.count }}"}),
                    output_path: Some("said".into()),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        engine
    }

    #[test]
    fn test_parse_workflow_args_key_value() {
        let args = vec![
            "topic=battery recycling".to_string(),
            "count=5".to_string(),
            "deep=true".to_string(),
        ];
        let parsed = parse_workflow_args(&args);

        assert_eq!(parsed["topic"], "battery recycling");
        assert_eq!(parsed["count"], 5);
        assert_eq!(parsed["deep"], true);
    }

    #[test]
    fn test_parse_workflow_args_positional() {
        let args = vec!["first".to_string(), "key=value".to_string(), "second".to_string()];
        let parsed = parse_workflow_args(&args);

        assert_eq!(parsed["arg0"], "first");
        assert_eq!(parsed["arg1"], "second");
        assert_eq!(parsed["key"], "value");
    }

    #[tokio::test]
    async fn test_run_workflow_reports_output() {
        let engine = echo_engine().await;
        let handler = MockHandler::default();

        let code = run_workflow(
            &engine,
            "echo",
            &["topic=solar".to_string(), "count=2".to_string()],
            &handler,
        )
        .await
        .unwrap();
        assert_eq!(code, 0);

        let events = handler.events();
        assert!(matches!(events[0], OutputEvent::ExecutionStarted { steps: 1, .. }));
        assert!(events.iter().any(|e| matches!(
            e,
            OutputEvent::StepUpdate { status: StepStatus::Completed, .. }
        )));

        let reports = handler.reports.lock().unwrap();
        let execution = &reports[0].execution;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(
            execution.output,
            Some(json!({"said": {"topic": "solar", "count": "2"}}))
        );
        assert_eq!(execution.metadata.triggered_by, TriggerSource::Cli);
    }

    #[tokio::test]
    async fn test_run_unknown_workflow_errors() {
        let engine = echo_engine().await;
        let handler = MockHandler::default();

        let err = run_workflow(&engine, "nope", &[], &handler).await.unwrap_err();
        assert!(format!("{:#}", err).contains("workflow 'nope' not found"));
    }

    #[tokio::test]
    async fn test_status_and_list() {
        let engine = echo_engine().await;
        let handler = MockHandler::default();
        run_workflow(&engine, "echo", &["topic=x".to_string()], &handler)
            .await
            .unwrap();
        let id = handler.reports.lock().unwrap()[0].execution.id.clone();

        let status = MockHandler::default();
        assert_eq!(show_status(&engine, &id, Some("echo"), &status).await.unwrap(), 0);
        assert_eq!(status.reports.lock().unwrap()[0].progress.percentage, 100);
        assert!(show_status(&engine, &id, Some("other"), &status).await.is_err());

        let list = MockHandler::default();
        list_executions(&engine, "echo", None, &list).await.unwrap();
        let events = list.events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            OutputEvent::ExecutionSummary { execution_id, status: ExecutionStatus::Completed, .. } if *execution_id == id
        ));

        let cancel = MockHandler::default();
        assert!(cancel_execution(&engine, &id, &cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_list_workflows() {
        let engine = echo_engine().await;
        let handler = MockHandler::default();

        list_workflows(&engine, &handler);
        assert_eq!(handler.messages(), vec!["echo v1.0.0 - Echo (1 steps)"]);
    }

    #[tokio::test]
    async fn test_validate_workflow_file() {
        let engine = echo_engine().await;
        let dir = TempDir::new().unwrap();

        let good = dir.path().join("good.toml");
        std::fs::write(
            &good,
            "id = \"good\"\n\n[[steps]]\nid = \"a\"\nagent_id = \"echo-agent\"\n",
        )
        .unwrap();
        let handler = MockHandler::default();
        assert_eq!(validate_workflow(&engine, good.to_str().unwrap(), &handler), 0);

        let bad = dir.path().join("bad.toml");
        std::fs::write(
            &bad,
            "id = \"bad\"\n\n[[steps]]\nid = \"a\"\nagent_id = \"echo-agent\"\n\n[[steps]]\nid = \"a\"\nagent_id = \"echo-agent\"\n",
        )
        .unwrap();
        let handler = MockHandler::default();
        assert_eq!(validate_workflow(&engine, bad.to_str().unwrap(), &handler), 1);
        assert!(handler.messages()[0].contains("duplicate step id"));

        let handler = MockHandler::default();
        assert_eq!(validate_workflow(&engine, "echo", &handler), 0);
        assert_eq!(validate_workflow(&engine, "missing", &handler), 1);
    }

    #[tokio::test]
    async fn test_list_agents() {
        let mut config = EngineConfig::default();
        config.agents.insert(
            "echo-agent".into(),
            AgentConfig {
                command: "cat".into(),
                ..Default::default()
            },
        );
        config.agents.insert(
            "off-agent".into(),
            AgentConfig {
                command: "cat".into(),
                enabled: false,
                ..Default::default()
            },
        );

        let handler = MockHandler::default();
        assert_eq!(list_agents(&config, &handler).await, 0);
        let messages = handler.messages();
        assert_eq!(messages[0], "✓ echo-agent (cli: cat)");
        assert_eq!(messages[1], "✗ disabled off-agent (cli: cat)");
    }
}
