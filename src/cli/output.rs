//! Output handlers for CLI commands
//!
//! Supports console (pretty), JSON, and quiet output modes.

use crate::workflow::{ExecutionReport, ExecutionStatus, Progress, StepStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Output mode for CLI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    #[default]
    Console,
    Json,
    Quiet,
}

impl OutputMode {
    /// `--json` wins over `--quiet`
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if json {
            Self::Json
        } else if quiet {
            Self::Quiet
        } else {
            Self::Console
        }
    }
}

/// Events emitted while commands run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    ExecutionStarted {
        execution_id: String,
        workflow_id: String,
        steps: usize,
    },
    StepUpdate {
        step: String,
        agent_id: String,
        status: StepStatus,
        retry_count: u32,
        duration_ms: Option<u64>,
        error: Option<String>,
    },
    ExecutionSummary {
        execution_id: String,
        status: ExecutionStatus,
        start_time: DateTime<Utc>,
        progress: Progress,
    },
    Info {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Output handler trait
pub trait OutputHandler: Send + Sync {
    /// Emit an event
    fn emit(&self, event: OutputEvent);

    /// Write the final state of an execution
    fn report(&self, report: &ExecutionReport);
}

/// Console output handler
pub struct ConsoleHandler {
    debug: bool,
}

impl ConsoleHandler {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn format_duration(ms: u64) -> String {
        if ms < 1000 {
            format!("{}ms", ms)
        } else {
            format!("{:.1}s", ms as f64 / 1000.0)
        }
    }

    fn marker(status: StepStatus) -> &'static str {
        match status {
            StepStatus::Completed => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Skipped => "-",
            StepStatus::Running => "…",
            StepStatus::Pending => " ",
        }
    }
}

impl OutputHandler for ConsoleHandler {
    fn emit(&self, event: OutputEvent) {
        match event {
            OutputEvent::ExecutionStarted {
                execution_id,
                workflow_id,
                steps,
            } => {
                eprintln!(
                    "Started {} for workflow '{}' ({} steps)",
                    execution_id, workflow_id, steps
                );
            }
            OutputEvent::StepUpdate {
                step,
                agent_id,
                status,
                retry_count,
                duration_ms,
                error,
            } => {
                let mut line = format!("  {} {} [{}] {}", Self::marker(status), step, agent_id, status);
                if let Some(ms) = duration_ms {
                    line.push_str(&format!(" ({})", Self::format_duration(ms)));
                }
                if retry_count > 0 {
                    line.push_str(&format!(" after {} retries", retry_count));
                }
                eprintln!("{}", line);
                if let Some(error) = error {
                    if self.debug || status == StepStatus::Failed {
                        eprintln!("      {}", error);
                    }
                }
            }
            OutputEvent::ExecutionSummary {
                execution_id,
                status,
                start_time,
                progress,
            } => {
                println!(
                    "{}  {:<9}  {:>3}%  {}",
                    execution_id,
                    status,
                    progress.percentage,
                    start_time.format("%Y-%m-%d %H:%M:%S")
                );
            }
            OutputEvent::Info { message } => {
                eprintln!("{}", message);
            }
            OutputEvent::Error { message } => {
                eprintln!("Error: {}", message);
            }
        }
    }

    fn report(&self, report: &ExecutionReport) {
        let execution = &report.execution;
        eprintln!();
        eprintln!("Execution {}", execution.id);
        eprintln!(
            "  workflow: {} (v{})",
            execution.workflow_id, execution.workflow_version
        );
        eprintln!(
            "  status:   {} ({}/{} steps, {}%)",
            execution.status,
            report.progress.completed,
            report.progress.total,
            report.progress.percentage
        );
        if let Some(ref step) = execution.current_step_id {
            if !execution.is_terminal() {
                eprintln!("  current:  {}", step);
            }
        }
        for step in execution.steps.values() {
            eprintln!("  {} {} {}", Self::marker(step.status), step.id, step.status);
        }
        if let Some(ref error) = execution.error {
            eprintln!(
                "  error:    step '{}' {}: {}",
                error.step_id, error.code, error.message
            );
        }

        if let Some(ref output) = execution.output {
            if let Ok(text) = serde_json::to_string_pretty(output) {
                println!("{}", text);
            }
        }
    }
}

/// JSON output handler
pub struct JsonHandler {
    pretty: bool,
}

impl JsonHandler {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }

    fn print_json<T: Serialize>(&self, value: &T) {
        let json = if self.pretty {
            serde_json::to_string_pretty(value)
        } else {
            serde_json::to_string(value)
        };

        if let Ok(s) = json {
            println!("{}", s);
        }
    }
}

impl OutputHandler for JsonHandler {
    fn emit(&self, event: OutputEvent) {
        self.print_json(&event);
    }

    fn report(&self, report: &ExecutionReport) {
        self.print_json(report);
    }
}

/// Quiet handler: only the workflow output reaches stdout
pub struct QuietHandler;

impl OutputHandler for QuietHandler {
    fn emit(&self, _event: OutputEvent) {}

    fn report(&self, report: &ExecutionReport) {
        if let Some(ref output) = report.execution.output {
            println!("{}", output);
        }
    }
}

/// Create an output handler based on mode
pub fn create_handler(mode: OutputMode, debug: bool) -> Box<dyn OutputHandler> {
    match mode {
        OutputMode::Console => Box::new(ConsoleHandler::new(debug)),
        OutputMode::Json => Box::new(JsonHandler::new(false)),
        OutputMode::Quiet => Box::new(QuietHandler),
    }
}
