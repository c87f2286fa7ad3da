// Event types and payload structures for real-time updates
// These are re-emitted by the facade to whatever transport embeds the core

use crate::models::{ContextUsage, MessageRole, RunStatus};
use serde::{Deserialize, Serialize};

// Event name constants
pub const EVENT_AGENT_MESSAGE: &str = "agent:message";
pub const EVENT_AGENT_STATUS: &str = "agent:status";
pub const EVENT_AGENT_EXIT: &str = "agent:exit";
pub const EVENT_WAITING_FOR_INPUT: &str = "agent:waiting_for_input";
pub const EVENT_SESSION_RECOVERY: &str = "session:recovery";
pub const EVENT_QUEUE_CHANGE: &str = "queue:change";

// Autonomous loop events
pub const EVENT_MILESTONE_STARTED: &str = "loop:milestone_started";
pub const EVENT_MILESTONE_COMPLETED: &str = "loop:milestone_completed";
pub const EVENT_MILESTONE_FAILED: &str = "loop:milestone_failed";
pub const EVENT_LOOP_COMPLETED: &str = "loop:completed";

// Ralph loop events (worker/reviewer refinement)
pub const EVENT_RALPH_ITERATION_START: &str = "ralph:iteration_start";
pub const EVENT_RALPH_WORKER_COMPLETE: &str = "ralph:worker_complete";
pub const EVENT_RALPH_REVIEWER_COMPLETE: &str = "ralph:reviewer_complete";
pub const EVENT_RALPH_LOOP_COMPLETE: &str = "ralph:loop_complete";
pub const EVENT_RALPH_LOOP_ERROR: &str = "ralph:loop_error";
pub const EVENT_RALPH_STATUS_CHANGE: &str = "ralph:status_change";

/// Payload for agent message events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessagePayload {
    pub project_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: String,
}

/// Payload for agent status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusPayload {
    pub project_id: String,
    pub old_status: RunStatus,
    pub new_status: RunStatus,
}

/// Payload for agent exit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentExitPayload {
    pub project_id: String,
    pub exit_code: Option<i32>,
    pub context_usage: ContextUsage,
}

/// Payload for waiting-for-input events
///
/// The version is monotonically increasing per agent so a UI can tell whether
/// the wait it is showing is still current.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingForInputPayload {
    pub project_id: String,
    pub waiting: bool,
    pub version: u64,
    /// Proposed plan content when the wait was triggered by a plan-mode exit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

/// Payload for session recovery events
///
/// Always emitted before the stale conversation is deleted, so the end user
/// learns that context was lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecoveryPayload {
    pub project_id: String,
    pub old_session_id: Option<String>,
    pub new_session_id: String,
    pub reason: String,
}

/// One entry in a queue snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryInfo {
    pub project_id: String,
    pub queued_at: String,
}

/// Payload for queue change events
///
/// Carries the full queue snapshot in admission order so subscribers need no
/// follow-up query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueChangePayload {
    pub queued: Vec<QueueEntryInfo>,
}

/// Payload for milestone lifecycle events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneEventPayload {
    pub project_id: String,
    pub phase_title: String,
    pub milestone_title: String,
    pub pending_tasks: Vec<String>,
    /// Reason string for failures, verdict reason for completions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Payload for loop completion events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopCompletedPayload {
    pub project_id: String,
    pub milestones_completed: u32,
    /// Set when the loop terminated on failure rather than exhaustion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constants() {
        assert_eq!(EVENT_AGENT_MESSAGE, "agent:message");
        assert_eq!(EVENT_AGENT_STATUS, "agent:status");
        assert_eq!(EVENT_WAITING_FOR_INPUT, "agent:waiting_for_input");
        assert_eq!(EVENT_SESSION_RECOVERY, "session:recovery");
        assert_eq!(EVENT_QUEUE_CHANGE, "queue:change");
    }

    #[test]
    fn test_ralph_event_constants() {
        assert_eq!(EVENT_RALPH_ITERATION_START, "ralph:iteration_start");
        assert_eq!(EVENT_RALPH_WORKER_COMPLETE, "ralph:worker_complete");
        assert_eq!(EVENT_RALPH_REVIEWER_COMPLETE, "ralph:reviewer_complete");
        assert_eq!(EVENT_RALPH_LOOP_COMPLETE, "ralph:loop_complete");
        assert_eq!(EVENT_RALPH_LOOP_ERROR, "ralph:loop_error");
    }

    #[test]
    fn test_waiting_payload_serialization() {
        let payload = WaitingForInputPayload {
            project_id: "proj-1".to_string(),
            waiting: true,
            version: 3,
            plan: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"projectId\":\"proj-1\""));
        assert!(json.contains("\"version\":3"));
        assert!(!json.contains("\"plan\""));
    }

    #[test]
    fn test_waiting_payload_with_plan() {
        let payload = WaitingForInputPayload {
            project_id: "proj-1".to_string(),
            waiting: true,
            version: 4,
            plan: Some("1. Do X\n2. Do Y".to_string()),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"plan\":\"1. Do X\\n2. Do Y\""));
    }

    #[test]
    fn test_session_recovery_payload_serialization() {
        let payload = SessionRecoveryPayload {
            project_id: "proj-1".to_string(),
            old_session_id: Some("bad-id".to_string()),
            new_session_id: "b3c9ed1a-0000-4000-8000-000000000000".to_string(),
            reason: "session id was not a valid UUID".to_string(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"oldSessionId\":\"bad-id\""));
        assert!(json.contains("\"newSessionId\""));
        assert!(json.contains("\"reason\""));
    }

    #[test]
    fn test_queue_change_payload_deserialization() {
        let json = r#"{"queued":[{"projectId":"a","queuedAt":"2024-01-01T00:00:00Z"}]}"#;
        let payload: QueueChangePayload = serde_json::from_str(json).unwrap();
        assert_eq!(payload.queued.len(), 1);
        assert_eq!(payload.queued[0].project_id, "a");
    }

    #[test]
    fn test_milestone_payload_skips_empty_reason() {
        let payload = MilestoneEventPayload {
            project_id: "proj-1".to_string(),
            phase_title: "Phase A".to_string(),
            milestone_title: "M1".to_string(),
            pending_tasks: vec!["task".to_string()],
            reason: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("\"reason\""));
    }
}
