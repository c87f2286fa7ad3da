// Agent CLI binary resolution and spawn-command construction

use crate::models::{ExecutionMode, PermissionMode};
use crate::settings::PermissionRules;
use anyhow::{anyhow, Result};
use serde_json::json;
use std::path::PathBuf;
use tokio::process::Command;

pub const AGENT_BINARY_NAME: &str = "claude";

/// Everything needed to spawn one agent process.
#[derive(Debug, Clone)]
pub struct AgentLaunchSpec {
    pub project_id: String,
    pub working_dir: PathBuf,
    pub execution_mode: ExecutionMode,
    pub permission_mode: PermissionMode,
    pub permission_rules: PermissionRules,
    /// Session the process should use. Resumed when `resume` is set,
    /// otherwise passed as the id for a new session.
    pub session_id: Option<String>,
    pub resume: bool,
    pub model: Option<String>,
    pub system_prompt_append: Option<String>,
    pub mcp_config_path: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    pub max_turns: Option<u32>,
    /// Explicit binary path; skips PATH resolution when set
    pub agent_binary: Option<PathBuf>,
}

impl AgentLaunchSpec {
    pub fn new(project_id: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_id: project_id.into(),
            working_dir: working_dir.into(),
            execution_mode: ExecutionMode::Interactive,
            permission_mode: PermissionMode::Default,
            permission_rules: PermissionRules::default(),
            session_id: None,
            resume: false,
            model: None,
            system_prompt_append: None,
            mcp_config_path: None,
            plugin_dir: None,
            max_turns: None,
            agent_binary: None,
        }
    }
}

/// Resolve the agent binary by checking common install locations, then PATH.
pub fn resolve_agent_binary(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(anyhow!("Configured agent binary not found: {}", path.display()));
    }

    let common_paths = [
        dirs::home_dir().map(|h| h.join(format!(".npm-global/bin/{}", AGENT_BINARY_NAME))),
        dirs::home_dir().map(|h| h.join(format!(".local/bin/{}", AGENT_BINARY_NAME))),
        Some(PathBuf::from(format!("/usr/local/bin/{}", AGENT_BINARY_NAME))),
        Some(PathBuf::from(format!("/opt/homebrew/bin/{}", AGENT_BINARY_NAME))),
    ];
    for path in common_paths.into_iter().flatten() {
        if path.exists() {
            log::debug!("[ProcessAgent] Found agent binary at {}", path.display());
            return Ok(path);
        }
    }

    which::which(AGENT_BINARY_NAME)
        .map_err(|_| anyhow!("Agent CLI '{}' not found on PATH", AGENT_BINARY_NAME))
}

/// Build the spawn command for a launch spec.
///
/// The process reads newline-delimited JSON envelopes on stdin and writes
/// stream-json events on stdout.
pub fn build_agent_command(spec: &AgentLaunchSpec) -> Result<Command> {
    let binary = resolve_agent_binary(spec.agent_binary.as_ref())?;
    let mut cmd = Command::new(&binary);

    if spec.working_dir.exists() {
        cmd.current_dir(&spec.working_dir);
    } else {
        log::warn!(
            "[ProcessAgent] Working dir {} does not exist, using current directory",
            spec.working_dir.display()
        );
    }

    cmd.arg("--print");
    cmd.arg("--output-format").arg("stream-json");
    cmd.arg("--input-format").arg("stream-json");
    cmd.arg("--verbose");

    if spec.permission_rules.skip_permissions
        || spec.permission_mode == PermissionMode::BypassPermissions
    {
        cmd.arg("--dangerously-skip-permissions");
    } else {
        cmd.arg("--permission-mode").arg(spec.permission_mode.to_string());
        if !spec.permission_rules.allow.is_empty() {
            cmd.arg("--allowedTools")
                .arg(spec.permission_rules.allow.join(","));
        }
        if !spec.permission_rules.deny.is_empty() {
            cmd.arg("--disallowedTools")
                .arg(spec.permission_rules.deny.join(","));
        }
        if !spec.permission_rules.ask.is_empty() {
            let settings = json!({ "permissions": { "ask": spec.permission_rules.ask } });
            cmd.arg("--settings").arg(settings.to_string());
        }
    }

    if let Some(session_id) = &spec.session_id {
        if spec.resume {
            cmd.arg("--resume").arg(session_id);
        } else {
            cmd.arg("--session-id").arg(session_id);
        }
    }

    if let Some(model) = &spec.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(append) = &spec.system_prompt_append {
        cmd.arg("--append-system-prompt").arg(append);
    }
    if let Some(mcp_config) = &spec.mcp_config_path {
        cmd.arg("--mcp-config").arg(mcp_config);
    }
    if let Some(plugin_dir) = &spec.plugin_dir {
        cmd.arg("--plugin-dir").arg(plugin_dir);
    }
    if let Some(max_turns) = spec.max_turns {
        if max_turns > 0 {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
    }

    Ok(cmd)
}

/// Render the argument list for diagnostics.
pub fn describe_command(spec: &AgentLaunchSpec) -> String {
    format!(
        "{} [{} mode, permission {} session {:?}]",
        AGENT_BINARY_NAME, spec.execution_mode, spec.permission_mode, spec.session_id
    )
}
