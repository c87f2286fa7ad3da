// Iteration execution: spawns one fresh agent process per worker or
// reviewer run, with no session continuity between iterations

use super::types::RalphTask;
use crate::agent::{AgentEvent, AgentLaunchSpec, ProcessAgent};
use crate::error::{ForemanError, Result};
use crate::models::{ExecutionMode, PermissionMode};
use crate::settings::Settings;
use crate::storage::ProjectRepository;
use anyhow::anyhow;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// What one worker process produced.
#[derive(Debug, Clone, Default)]
pub struct WorkerRun {
    pub output: String,
    pub files_touched: Vec<String>,
    pub tokens_used: u64,
    pub duration_ms: u64,
}

/// Runs worker and reviewer processes for the Ralph loop.
#[async_trait]
pub trait IterationRunner: Send + Sync {
    async fn run_worker(&self, task: &RalphTask, prompt: &str) -> Result<WorkerRun>;
    /// Returns the reviewer's raw output text.
    async fn run_reviewer(&self, task: &RalphTask, prompt: &str) -> Result<String>;
}

/// Tools whose use means a file was modified.
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Production runner backed by fresh one-shot agent processes.
pub struct ProcessIterationRunner {
    projects: Arc<dyn ProjectRepository>,
    settings: Settings,
}

impl ProcessIterationRunner {
    pub fn new(projects: Arc<dyn ProjectRepository>, settings: Settings) -> Self {
        Self { projects, settings }
    }

    async fn working_dir(&self, project_id: &str) -> Result<PathBuf> {
        let project = self
            .projects
            .find_by_id(project_id)
            .await?
            .ok_or_else(|| ForemanError::ProjectNotFound(project_id.to_string()))?;
        Ok(PathBuf::from(project.path))
    }

    fn base_spec(&self, task: &RalphTask, working_dir: PathBuf) -> AgentLaunchSpec {
        let mut spec = AgentLaunchSpec::new(format!("ralph:{}", task.id), working_dir);
        spec.execution_mode = ExecutionMode::Autonomous;
        spec.system_prompt_append = task
            .config
            .system_prompt_append
            .clone()
            .or_else(|| self.settings.system_prompt_append.clone());
        spec.mcp_config_path = self.settings.mcp_config_path.clone();
        spec.plugin_dir = self.settings.plugin_dir.clone();
        spec.agent_binary = self.settings.agent_binary.clone();
        spec
    }

    async fn run_one_shot(&self, spec: AgentLaunchSpec, prompt: &str) -> Result<WorkerRun> {
        let started = Instant::now();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let agent = ProcessAgent::new(spec, tx);
        agent.start(Some(prompt)).await?;
        agent.close_input().await;

        let mut run = WorkerRun::default();
        let mut output_lines: Vec<String> = Vec::new();
        let mut exit_code = None;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Message { content, .. } => output_lines.push(content),
                AgentEvent::RawOutput { line, .. } => output_lines.push(line),
                AgentEvent::ToolUse {
                    tool_name, input, ..
                } => {
                    if EDIT_TOOLS.contains(&tool_name.as_str()) {
                        if let Some(path) = input.get("file_path").and_then(|p| p.as_str()) {
                            if !run.files_touched.iter().any(|f| f == path) {
                                run.files_touched.push(path.to_string());
                            }
                        }
                    }
                }
                AgentEvent::Usage { usage, .. } => {
                    run.tokens_used = usage.total_tokens();
                }
                AgentEvent::Exit {
                    exit_code: code, ..
                } => {
                    exit_code = code;
                    break;
                }
                _ => {}
            }
        }

        run.output = output_lines.join("\n");
        run.duration_ms = started.elapsed().as_millis() as u64;
        match exit_code {
            Some(0) | None => Ok(run),
            Some(code) => Err(anyhow!("agent process exited with code {}", code).into()),
        }
    }
}

#[async_trait]
impl IterationRunner for ProcessIterationRunner {
    async fn run_worker(&self, task: &RalphTask, prompt: &str) -> Result<WorkerRun> {
        let working_dir = self.working_dir(&task.project_id).await?;
        let mut spec = self.base_spec(task, working_dir);
        // The worker must be able to modify the tree
        spec.permission_mode = PermissionMode::BypassPermissions;
        spec.model = task
            .config
            .worker_model
            .clone()
            .or_else(|| self.settings.ralph.worker_model.clone())
            .or_else(|| self.settings.model.clone());
        log::info!(
            "[RalphRunner] Worker iteration {} for task {}",
            task.current_iteration,
            task.id
        );
        self.run_one_shot(spec, prompt).await
    }

    async fn run_reviewer(&self, task: &RalphTask, prompt: &str) -> Result<String> {
        let working_dir = self.working_dir(&task.project_id).await?;
        let mut spec = self.base_spec(task, working_dir);
        // The reviewer only reads; default permissions suffice
        spec.permission_mode = PermissionMode::Default;
        spec.permission_rules = self.settings.permission_rules.clone();
        spec.model = task
            .config
            .reviewer_model
            .clone()
            .or_else(|| self.settings.ralph.reviewer_model.clone())
            .or_else(|| self.settings.model.clone());
        log::info!(
            "[RalphRunner] Reviewer iteration {} for task {}",
            task.current_iteration,
            task.id
        );
        let run = self.run_one_shot(spec, prompt).await?;
        Ok(run.output)
    }
}
