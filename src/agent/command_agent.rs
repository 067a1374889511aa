//! Agent backed by a local program
//!
//! The resolved input is written to stdin as JSON and stdout is parsed as the
//! output. Call identifiers are exported as `AGENTFLOW_*` environment variables.

use super::types::{Agent, AgentContext, AgentError, parse_output};
use crate::config::AgentConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,

    command: String,

    args: Vec<String>,

    /// Bound on one invocation
    timeout: Duration,

    env: Vec<(String, String)>,
}

impl CommandAgent {
    pub fn from_config(name: impl Into<String>, config: &AgentConfig) -> Self {
        let mut env: Vec<(String, String)> = config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        let mut agent = Self::new(name, config.command.clone())
            .with_args(config.args.clone())
            .with_timeout(Duration::from_secs(config.timeout));
        agent.env = env;
        agent
    }

    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(300),
            env: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_command(&self, context: &AgentContext) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd.env("AGENTFLOW_WORKFLOW_ID", &context.workflow_id)
            .env("AGENTFLOW_EXECUTION_ID", &context.execution_id)
            .env("AGENTFLOW_STEP_ID", &context.step_id)
            .env("AGENTFLOW_CORRELATION_ID", &context.correlation_id)
            .env("AGENTFLOW_REQUEST_ID", &context.request_id);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn call(&self, input: &Value, context: &AgentContext) -> Result<Value, AgentError> {
        let start = Instant::now();
        let payload =
            serde_json::to_vec(input).map_err(|e| AgentError::invalid_input(e.to_string()))?;

        tracing::debug!(agent = %self.name, command = %self.command, bytes = payload.len(), "Spawning agent");

        let mut child = self.build_command(context).spawn().map_err(|e| {
            AgentError::unavailable(format!("failed to spawn '{}': {}", self.command, e))
        })?;

        // Feed stdin concurrently so a chatty child cannot block on a full stdout pipe
        if let Some(mut stdin) = child.stdin.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    tracing::debug!(agent = %name, error = %e, "Agent closed stdin early");
                }
            });
        }

        // Dropping the child on timeout kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AgentError::unavailable(format!(
                    "failed to wait for '{}': {}",
                    self.command, e
                )));
            }
            Err(_) => return Err(AgentError::timeout(self.timeout)),
        };

        tracing::debug!(
            agent = %self.name,
            duration_ms = start.elapsed().as_millis() as u64,
            status = ?output.status.code(),
            "Agent exited"
        );

        if output.status.success() {
            Ok(parse_output(&String::from_utf8_lossy(&output.stdout)))
        } else {
            Err(AgentError::execution_failed(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        tokio::process::Command::new("which")
            .arg(&self.command)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
