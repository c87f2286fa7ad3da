// Runtime settings for agent execution and the Ralph loop
// Loaded from foreman.toml when present, otherwise defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "foreman.toml";

pub const DEFAULT_MAX_CONCURRENT_AGENTS: usize = 3;
pub const DEFAULT_RALPH_MAX_TURNS: u32 = 10;
pub const DEFAULT_RALPH_HISTORY_RETENTION: usize = 20;

/// Tool permission rules passed to the agent CLI
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub ask: Vec<String>,
    /// When set, all permission prompts are bypassed
    #[serde(default)]
    pub skip_permissions: bool,
}

/// Ralph loop defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphSettings {
    /// Most recent task runs kept per project by the retention sweep
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
    #[serde(default = "default_max_turns")]
    pub default_max_turns: u32,
    #[serde(default)]
    pub worker_model: Option<String>,
    #[serde(default)]
    pub reviewer_model: Option<String>,
    /// Default worker prompt template; `{task}`, `{history}` and
    /// `{feedback}` placeholders are substituted
    #[serde(default)]
    pub worker_prompt_template: Option<String>,
    /// Default reviewer prompt template; `{task}` and `{summary}`
    /// placeholders are substituted
    #[serde(default)]
    pub reviewer_prompt_template: Option<String>,
}

impl Default for RalphSettings {
    fn default() -> Self {
        Self {
            history_retention: DEFAULT_RALPH_HISTORY_RETENTION,
            default_max_turns: DEFAULT_RALPH_MAX_TURNS,
            worker_model: None,
            reviewer_model: None,
            worker_prompt_template: None,
            reviewer_prompt_template: None,
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_agents: usize,
    #[serde(default)]
    pub permission_rules: PermissionRules,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt_append: Option<String>,
    /// Path to an MCP server configuration file
    #[serde(default)]
    pub mcp_config_path: Option<PathBuf>,
    #[serde(default)]
    pub plugin_dir: Option<PathBuf>,
    /// Explicit agent binary path; overrides PATH resolution
    #[serde(default)]
    pub agent_binary: Option<PathBuf>,
    #[serde(default)]
    pub ralph: RalphSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent_agents: DEFAULT_MAX_CONCURRENT_AGENTS,
            permission_rules: PermissionRules::default(),
            model: None,
            system_prompt_append: None,
            mcp_config_path: None,
            plugin_dir: None,
            agent_binary: None,
            ralph: RalphSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(settings)
    }

    /// Load from `foreman.toml` under the given directory, or defaults when absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE_NAME);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Project-local settings from `<project>/.foreman/foreman.toml`.
    pub fn load_for_project(project_path: &Path) -> Result<Self> {
        Self::load_or_default(&crate::utils::foreman_dir(project_path))
    }
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_AGENTS
}

fn default_max_turns() -> u32 {
    DEFAULT_RALPH_MAX_TURNS
}

fn default_history_retention() -> usize {
    DEFAULT_RALPH_HISTORY_RETENTION
}
