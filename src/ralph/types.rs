// Ralph loop data model: worker/reviewer iterative refinement state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one Ralph task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RalphStatus {
    Idle,
    WorkerRunning,
    ReviewerRunning,
    Completed,
    Failed,
    Paused,
}

/// Reviewer's decision for one iteration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
    NeedsChanges,
}

/// Terminal outcome of a Ralph loop.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Approved,
    MaxTurnsReached,
    CriticalFailure,
}

/// What one worker run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationSummary {
    pub iteration: u32,
    pub output: String,
    pub files_touched: Vec<String>,
    pub tokens_used: u64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// What the reviewer said about one iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewerFeedback {
    pub iteration: u32,
    pub decision: ReviewDecision,
    pub feedback: String,
    pub timestamp: DateTime<Utc>,
}

/// Configuration for one Ralph task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphTaskConfig {
    pub project_id: String,
    /// What the worker is asked to accomplish
    pub description: String,
    pub max_turns: u32,
    #[serde(default)]
    pub worker_model: Option<String>,
    #[serde(default)]
    pub reviewer_model: Option<String>,
    /// Overrides the built-in worker prompt; `{task}`, `{history}` and
    /// `{feedback}` placeholders are substituted
    #[serde(default)]
    pub worker_prompt_template: Option<String>,
    /// Overrides the built-in reviewer prompt; `{task}` and `{summary}`
    /// placeholders are substituted
    #[serde(default)]
    pub reviewer_prompt_template: Option<String>,
    #[serde(default)]
    pub system_prompt_append: Option<String>,
}

/// One Ralph task run. History lists are append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RalphTask {
    pub id: String,
    pub project_id: String,
    pub config: RalphTaskConfig,
    pub current_iteration: u32,
    pub status: RalphStatus,
    pub summaries: Vec<IterationSummary>,
    pub feedback: Vec<ReviewerFeedback>,
    pub final_status: Option<FinalStatus>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RalphTask {
    pub fn new(config: RalphTaskConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: config.project_id.clone(),
            config,
            current_iteration: 0,
            status: RalphStatus::Idle,
            summaries: Vec::new(),
            feedback: Vec::new(),
            final_status: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active means a worker or reviewer may still run for this task.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            RalphStatus::Idle | RalphStatus::WorkerRunning | RalphStatus::ReviewerRunning
        )
    }
}

/// Events emitted by the Ralph loop service.
#[derive(Debug, Clone)]
pub enum RalphEvent {
    IterationStart {
        task_id: String,
        project_id: String,
        iteration: u32,
    },
    WorkerComplete {
        task_id: String,
        iteration: u32,
        summary: IterationSummary,
    },
    ReviewerComplete {
        task_id: String,
        iteration: u32,
        feedback: ReviewerFeedback,
    },
    LoopComplete {
        task_id: String,
        final_status: FinalStatus,
        iterations: u32,
    },
    LoopError {
        task_id: String,
        error: String,
    },
    StatusChange {
        task_id: String,
        old: RalphStatus,
        new: RalphStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&RalphStatus::WorkerRunning).unwrap(),
            "\"worker_running\""
        );
        assert_eq!(
            serde_json::to_string(&FinalStatus::MaxTurnsReached).unwrap(),
            "\"max_turns_reached\""
        );
    }

    #[test]
    fn test_new_task_is_idle() {
        let task = RalphTask::new(RalphTaskConfig {
            project_id: "p1".to_string(),
            description: "fix the bug".to_string(),
            max_turns: 5,
            worker_model: None,
            reviewer_model: None,
            worker_prompt_template: None,
            reviewer_prompt_template: None,
            system_prompt_append: None,
        });
        assert_eq!(task.status, RalphStatus::Idle);
        assert_eq!(task.current_iteration, 0);
        assert!(task.is_active());
        assert!(uuid::Uuid::parse_str(&task.id).is_ok());
    }

    #[test]
    fn test_terminal_task_is_not_active() {
        let mut task = RalphTask::new(RalphTaskConfig {
            project_id: "p1".to_string(),
            description: "x".to_string(),
            max_turns: 1,
            worker_model: None,
            reviewer_model: None,
            worker_prompt_template: None,
            reviewer_prompt_template: None,
            system_prompt_append: None,
        });
        task.status = RalphStatus::Completed;
        assert!(!task.is_active());
        task.status = RalphStatus::Paused;
        assert!(!task.is_active());
    }
}
