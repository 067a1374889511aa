//! CLI module for agentflow
//!
//! This module provides:
//! - Command implementations (run, status, list, cancel, resume, etc.)
//! - Output handlers (console, JSON, quiet)
//! - Signal handling that cancels the followed execution
//!
//! # Example
//!
//! ```ignore
//! use agentflow::cli::{commands, output};
//!
//! let handler = output::create_handler(output::OutputMode::Console, false);
//! let exit_code = commands::run_workflow(&engine, "research-analysis-summary", &args, &*handler).await?;
//! ```

pub mod commands;
pub mod output;
pub mod signals;

pub use commands::{
    cancel_execution, list_agents, list_executions, list_workflows, resume_execution,
    run_workflow, show_status, validate_workflow,
};
pub use output::{OutputMode, create_handler};
