//! Configuration loading with multi-layer merge

use super::{AgentConfig, RetryPolicy, WorkflowDefinition};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const BUILTIN_WORKFLOWS: &[(&str, &str)] = &[(
    "research-analysis-summary.toml",
    include_str!("../../workflows/research-analysis-summary.toml"),
)];

/// Top-level agentflow configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Global defaults
    #[serde(default)]
    pub defaults: Defaults,

    /// Execution store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Agent definitions
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

/// Global default settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    /// Retry policy for steps that don't declare one
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-attempt timeout for steps that don't declare one
    pub step_timeout_ms: Option<u64>,

    /// Default number of executions returned by listings
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

fn default_list_limit() -> usize {
    20
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_timeout_ms: None,
            list_limit: default_list_limit(),
        }
    }
}

/// Where execution state is persisted
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database path (`~` is expanded)
    pub path: Option<String>,

    /// Keep everything in memory (nothing survives the process)
    #[serde(default)]
    pub in_memory: bool,
}

impl StoreConfig {
    /// Resolve the database path, falling back to the user data directory
    pub fn resolved_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.path {
            let expanded = shellexpand::tilde(path);
            return Ok(PathBuf::from(expanded.as_ref()));
        }

        let data_dir = dirs::data_dir().context("Could not determine data directory")?;
        Ok(data_dir.join("agentflow").join("executions.db"))
    }
}

impl EngineConfig {
    /// Load configuration from the standard hierarchy
    ///
    /// Load order (later overrides earlier):
    /// 1. Built-in defaults
    /// 2. ~/.config/agentflow/config.toml
    /// 3. .agentflow/config.toml (project)
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user_config_path) = Self::user_config_path() {
            if user_config_path.exists() {
                let user_config = Self::load_file(&user_config_path)
                    .with_context(|| format!("loading {}", user_config_path.display()))?;
                config.merge(user_config);
            }
        }

        let project_config_path = project_dir
            .map(|p| p.join(".agentflow/config.toml"))
            .unwrap_or_else(|| PathBuf::from(".agentflow/config.toml"));

        if project_config_path.exists() {
            let project_config = Self::load_file(&project_config_path)
                .with_context(|| format!("loading {}", project_config_path.display()))?;
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Get the user config path (~/.config/agentflow/config.toml)
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("agentflow/config.toml"))
    }

    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: Self) {
        if other.defaults.retry != RetryPolicy::default() {
            self.defaults.retry = other.defaults.retry;
        }
        if other.defaults.step_timeout_ms.is_some() {
            self.defaults.step_timeout_ms = other.defaults.step_timeout_ms;
        }
        if other.defaults.list_limit != default_list_limit() {
            self.defaults.list_limit = other.defaults.list_limit;
        }

        if other.store.path.is_some() {
            self.store.path = other.store.path;
        }
        if other.store.in_memory {
            self.store.in_memory = true;
        }

        for (id, agent) in other.agents {
            self.agents.insert(id, agent);
        }
    }

    /// Get all enabled agents
    pub fn enabled_agents(&self) -> impl Iterator<Item = (&String, &AgentConfig)> {
        self.agents.iter().filter(|(_, a)| a.enabled)
    }
}

/// Load every workflow definition visible from `project_dir`
///
/// Sources, later ones replacing earlier ones with the same id:
/// 1. Built-in workflows (embedded)
/// 2. ~/.config/agentflow/workflows/*.toml|*.json (user)
/// 3. .agentflow/workflows/*.toml|*.json (project)
pub fn load_workflows(project_dir: Option<&Path>) -> Result<Vec<WorkflowDefinition>> {
    let mut workflows = builtin_workflows()?;

    let mut dirs_to_scan = Vec::new();
    if let Some(user_dir) = dirs::config_dir() {
        dirs_to_scan.push(user_dir.join("agentflow/workflows"));
    }
    dirs_to_scan.push(
        project_dir
            .map(|p| p.join(".agentflow/workflows"))
            .unwrap_or_else(|| PathBuf::from(".agentflow/workflows")),
    );

    for dir in dirs_to_scan {
        for workflow in load_workflow_dir(&dir)? {
            workflows.retain(|w| w.id != workflow.id);
            workflows.push(workflow);
        }
    }

    Ok(workflows)
}

/// Parse the workflows embedded in the binary
pub fn builtin_workflows() -> Result<Vec<WorkflowDefinition>> {
    BUILTIN_WORKFLOWS
        .iter()
        .map(|(name, contents)| parse_workflow(contents, WorkflowFormat::Toml, Path::new(name)))
        .collect()
}

/// Load all workflow files in a directory (missing directory yields nothing)
pub fn load_workflow_dir(dir: &Path) -> Result<Vec<WorkflowDefinition>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| WorkflowFormat::from_path(p).is_some())
        .collect();
    paths.sort();

    paths.iter().map(|p| load_workflow_file(p)).collect()
}

/// Load and validate a single workflow file
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition> {
    let format = WorkflowFormat::from_path(path)
        .with_context(|| format!("unsupported workflow file {}", path.display()))?;
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_workflow(&contents, format, path)
}

#[derive(Debug, Clone, Copy)]
enum WorkflowFormat {
    Toml,
    Json,
}

impl WorkflowFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Some(Self::Toml),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

fn parse_workflow(contents: &str, format: WorkflowFormat, path: &Path) -> Result<WorkflowDefinition> {
    let workflow: WorkflowDefinition = match format {
        WorkflowFormat::Toml => {
            toml::from_str(contents).with_context(|| format!("parsing {}", path.display()))?
        }
        WorkflowFormat::Json => serde_json::from_str(contents)
            .with_context(|| format!("parsing {}", path.display()))?,
    };

    workflow.validate().map_err(|errors| {
        anyhow::anyhow!(
            "workflow '{}' validation failed:\n  {}",
            workflow.id,
            errors.join("\n  ")
        )
    })?;

    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_load_empty_config() {
        let config = EngineConfig::default();
        assert!(config.agents.is_empty());
        assert_eq!(config.defaults.retry.max_attempts, 3);
        assert_eq!(config.defaults.list_limit, 20);
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.toml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
            [defaults]
            step_timeout_ms = 30000

            [defaults.retry]
            max_attempts = 5
            backoff_ms = 250
            exponential = false

            [store]
            path = "/tmp/agentflow.db"

            [agents.research-agent]
            command = "research"

            [agents.analysis-agent]
            command = "http://localhost:9000/analysis"
        "#
        )
        .unwrap();

        let config = EngineConfig::load_file(&config_path).unwrap();
        assert_eq!(config.defaults.retry.max_attempts, 5);
        assert!(!config.defaults.retry.exponential);
        assert_eq!(config.defaults.step_timeout_ms, Some(30000));
        assert_eq!(
            config.store.resolved_path().unwrap(),
            PathBuf::from("/tmp/agentflow.db")
        );
        assert!(config.agents["analysis-agent"].is_http());
    }

    #[test]
    fn test_config_merge() {
        let mut base = EngineConfig::default();
        base.agents.insert(
            "research-agent".into(),
            AgentConfig {
                command: "research".into(),
                timeout: 30,
                ..Default::default()
            },
        );

        let mut override_config = EngineConfig::default();
        override_config.defaults.step_timeout_ms = Some(1000);
        override_config.agents.insert(
            "research-agent".into(),
            AgentConfig {
                command: "research-v2".into(),
                timeout: 60,
                ..Default::default()
            },
        );
        override_config.agents.insert(
            "analysis-agent".into(),
            AgentConfig {
                command: "analysis".into(),
                ..Default::default()
            },
        );

        base.merge(override_config);

        assert_eq!(base.agents["research-agent"].command, "research-v2");
        assert_eq!(base.agents["research-agent"].timeout, 60);
        assert!(base.agents.contains_key("analysis-agent"));
        assert_eq!(base.defaults.step_timeout_ms, Some(1000));
        assert_eq!(base.defaults.retry, RetryPolicy::default());
    }

    #[test]
    fn test_builtin_workflows_are_valid() {
        let workflows = builtin_workflows().unwrap();
        let research = workflows
            .iter()
            .find(|w| w.id == "research-analysis-summary")
            .unwrap();
        assert_eq!(research.steps.len(), 3);
        assert_eq!(research.outputs.len(), 5);
    }

    #[test]
    fn test_load_workflow_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("a.toml"),
            r#"
            id = "toml-flow"

            [[steps]]
            id = "only"
            agent_id = "echo"
        "#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"id": "json-flow", "steps": [{"id": "only", "agent_id": "echo"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let workflows = load_workflow_dir(dir.path()).unwrap();
        let ids: Vec<_> = workflows.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["toml-flow", "json-flow"]);
    }

    #[test]
    fn test_invalid_workflow_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(
            &path,
            r#"
            id = "bad"

            [[steps]]
            id = "dup"
            agent_id = "echo"

            [[steps]]
            id = "dup"
            agent_id = "echo"
        "#,
        )
        .unwrap();

        let err = load_workflow_file(&path).unwrap_err();
        assert!(err.to_string().contains("validation failed"));
    }

    #[test]
    fn test_missing_workflow_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let workflows = load_workflow_dir(&dir.path().join("nope")).unwrap();
        assert!(workflows.is_empty());
    }
}
