//! Dispatch from agent id to a concrete agent

use super::command_agent::CommandAgent;
use super::http_agent::HttpAgent;
use super::types::{Agent, AgentContext, AgentError, AgentExecutor};
use crate::config::{AgentConfig, EngineConfig};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Agents by id
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled agent from configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self, AgentError> {
        let mut registry = Self::new();
        for (name, agent) in config.enabled_agents() {
            registry.register(name.clone(), create_agent(name, agent)?);
        }
        Ok(registry)
    }

    /// Add or replace an agent
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Agent>> {
        self.agents.get(name)
    }

    /// Registered ids, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }
}

/// HTTP agent for `http(s)://` commands, local program otherwise
pub fn create_agent(name: &str, config: &AgentConfig) -> Result<Arc<dyn Agent>, AgentError> {
    if config.is_http() {
        Ok(Arc::new(HttpAgent::from_config(name, config)?))
    } else {
        Ok(Arc::new(CommandAgent::from_config(name, config)))
    }
}

#[async_trait]
impl AgentExecutor for AgentRegistry {
    async fn execute(
        &self,
        agent_id: &str,
        input: &Value,
        context: &AgentContext,
    ) -> Result<Value, AgentError> {
        let agent = self
            .get(agent_id)
            .ok_or_else(|| AgentError::not_found(agent_id))?;
        agent.call(input, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_config_skips_disabled() {
        let mut config = EngineConfig::default();
        config.agents.insert(
            "research-agent".into(),
            AgentConfig {
                command: "cat".into(),
                ..Default::default()
            },
        );
        config.agents.insert(
            "remote-agent".into(),
            AgentConfig {
                command: "https://agents.example.com/summary".into(),
                ..Default::default()
            },
        );
        config.agents.insert(
            "disabled-agent".into(),
            AgentConfig {
                command: "cat".into(),
                enabled: false,
                ..Default::default()
            },
        );

        let registry = AgentRegistry::from_config(&config).unwrap();
        let names: Vec<&str> = registry.names().collect();
        assert_eq!(names, vec!["remote-agent", "research-agent"]);
    }

    #[tokio::test]
    async fn test_dispatch_and_unknown_agent() {
        let mut registry = AgentRegistry::new();
        registry.register("echo", Arc::new(CommandAgent::new("echo", "cat")));

        let output = registry
            .execute("echo", &json!({"a": 1}), &AgentContext::default())
            .await
            .unwrap();
        assert_eq!(output, json!({"a": 1}));

        let err = registry
            .execute("ghost", &json!({}), &AgentContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, "AGENT_NOT_FOUND");
    }
}
