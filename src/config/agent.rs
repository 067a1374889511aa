//! Agent configuration for the built-in agent adapters

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration for a single agent
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Program to execute (or HTTP URL for remote agents)
    pub command: String,

    /// Arguments to pass to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Whether this agent is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Timeout in seconds for a single call
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Extra HTTP headers (remote agents only)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Additional environment variables for the program
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub description: String,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout() -> u64 {
    300 // 5 minutes
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            enabled: true,
            timeout: default_timeout(),
            headers: HashMap::new(),
            env: HashMap::new(),
            description: String::new(),
        }
    }
}

impl AgentConfig {
    /// Returns true if this is a remote agent (command starts with http)
    pub fn is_http(&self) -> bool {
        self.command.starts_with("http://") || self.command.starts_with("https://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal() {
        let config: AgentConfig = toml::from_str(r#"command = "research-agent""#).unwrap();
        assert_eq!(config.command, "research-agent");
        assert!(config.enabled);
        assert_eq!(config.timeout, 300);
        assert!(!config.is_http());
    }

    #[test]
    fn test_deserialize_http_agent() {
        let toml = r#"
            command = "http://localhost:8080/agents/analysis"
            timeout = 90

            [headers]
            authorization = "Bearer token"
        "#;
        let config: AgentConfig = toml::from_str(toml).unwrap();
        assert!(config.is_http());
        assert_eq!(config.timeout, 90);
        assert_eq!(config.headers["authorization"], "Bearer token");
    }

    #[test]
    fn test_reject_unknown_fields() {
        let result: Result<AgentConfig, _> = toml::from_str(
            r#"
            command = "agent"
            model = "qwen"
        "#,
        );
        assert!(result.is_err());
    }
}
