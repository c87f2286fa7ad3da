// Core data model shared across the supervision core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an agent run is driven.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Driven by an orchestration loop, no human in the loop
    Autonomous,
    /// Driven turn-by-turn by user input
    Interactive,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Autonomous => "autonomous",
            ExecutionMode::Interactive => "interactive",
        };
        write!(f, "{}", s)
    }
}

/// Permission mode fixed at process-spawn time.
///
/// Switching modes requires stopping the process and starting a replacement
/// with the same session id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Rule lists from settings apply
    Default,
    /// Edits are auto-accepted
    AcceptEdits,
    /// Process proposes a plan and halts for approval before changes
    Plan,
    /// All permission checks skipped
    BypassPermissions,
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
        };
        write!(f, "{}", s)
    }
}

/// Running status of one agent process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Stopped => "stopped",
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Derived project status persisted through the project repository.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Idle,
    Queued,
    Running,
    Waiting,
    Error,
}

/// Cumulative token counters for one agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub max_context_tokens: u64,
    pub percent_used: f32,
}

/// Default context window assumed when the process never reports one.
pub const DEFAULT_MAX_CONTEXT_TOKENS: u64 = 200_000;

impl ContextUsage {
    pub fn new() -> Self {
        Self {
            max_context_tokens: DEFAULT_MAX_CONTEXT_TOKENS,
            ..Default::default()
        }
    }

    /// Fold one usage report into the running totals and recompute percent.
    pub fn record(
        &mut self,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
    ) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.cache_read_tokens += cache_read_tokens;
        self.cache_creation_tokens += cache_creation_tokens;
        if self.max_context_tokens == 0 {
            self.max_context_tokens = DEFAULT_MAX_CONTEXT_TOKENS;
        }
        let used = self.input_tokens + self.output_tokens + self.cache_creation_tokens;
        self.percent_used = (used as f32 / self.max_context_tokens as f32) * 100.0;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A project waiting in the admission queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedProject {
    pub project_id: String,
    pub instructions: Option<String>,
    pub queued_at: DateTime<Utc>,
}

/// A subprocess recorded for orphan cleanup across host restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackedProcess {
    pub pid: u32,
    pub project_id: String,
    pub started_at: DateTime<Utc>,
}

/// Reference to the milestone an autonomous loop is currently working on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneRef {
    pub phase_id: String,
    pub phase_title: String,
    pub milestone_id: String,
    pub milestone_title: String,
    /// Titles of the milestone's not-yet-completed tasks, in document order
    pub pending_tasks: Vec<String>,
}

/// A project known to the supervision core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    /// Working directory agents are spawned in
    pub path: String,
    pub status: ProjectStatus,
    /// Currently-remembered conversation, if any
    pub current_conversation_id: Option<String>,
    /// Cumulative token usage from the most recent agent run
    pub context_usage: Option<ContextUsage>,
    /// Next roadmap milestone shown to the user, if any
    pub next_item: Option<MilestoneRef>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            status: ProjectStatus::Idle,
            current_conversation_id: None,
            context_usage: None,
            next_item: None,
        }
    }
}

/// A durable conversation record correlating the external process's session
/// with persisted message history. The id is always a well-formed UUID.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub metadata: serde_json::Value,
}

impl Conversation {
    /// New conversation with a freshly generated UUID id.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            created_at: Utc::now(),
            messages: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// Role of a persisted message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One persisted conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}
