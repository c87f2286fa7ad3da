// Session management: maps projects to durable conversation ids,
// validates requested sessions, and recovers from invalid or rejected ones

use crate::error::Result;
use crate::events::SessionRecoveryPayload;
use crate::storage::{ConversationRepository, ProjectRepository};
use crate::utils::lock_mutex_recover;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Outcome of a session resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResolution {
    pub conversation_id: String,
    /// True when a fresh conversation was created rather than resumed
    pub created: bool,
}

pub struct SessionManager {
    projects: Arc<dyn ProjectRepository>,
    conversations: Arc<dyn ConversationRepository>,
    recovery_sender: Mutex<Option<UnboundedSender<SessionRecoveryPayload>>>,
}

impl SessionManager {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        Self {
            projects,
            conversations,
            recovery_sender: Mutex::new(None),
        }
    }

    /// Set the sender used for session recovery notifications.
    pub fn set_recovery_sender(&self, sender: UnboundedSender<SessionRecoveryPayload>) {
        *lock_mutex_recover(&self.recovery_sender) = Some(sender);
    }

    /// Resolve the session for a project.
    ///
    /// Precedence: an explicitly requested id that validates is resumed; an
    /// invalid or foreign requested id is recovered; `force_new` always
    /// creates; otherwise the project's remembered conversation is used when
    /// it still validates, and a new one is created as the last resort.
    pub async fn get_or_create_session(
        &self,
        project_id: &str,
        requested_session_id: Option<&str>,
        force_new: bool,
    ) -> Result<SessionResolution> {
        if let Some(requested) = requested_session_id {
            if self.validates_for_project(project_id, requested).await? {
                log::info!(
                    "[SessionManager] Resuming requested session {} for project {}",
                    requested,
                    project_id
                );
                self.projects
                    .set_current_conversation(project_id, Some(requested.to_string()))
                    .await?;
                return Ok(SessionResolution {
                    conversation_id: requested.to_string(),
                    created: false,
                });
            }
            let reason = if Uuid::parse_str(requested).is_err() {
                "session id was not a valid UUID".to_string()
            } else {
                "session did not belong to this project".to_string()
            };
            let new_id = self
                .recover(project_id, Some(requested.to_string()), reason)
                .await?;
            return Ok(SessionResolution {
                conversation_id: new_id,
                created: true,
            });
        }

        if !force_new {
            if let Some(project) = self.projects.find_by_id(project_id).await? {
                if let Some(current) = project.current_conversation_id {
                    if self.validates_for_project(project_id, &current).await? {
                        return Ok(SessionResolution {
                            conversation_id: current,
                            created: false,
                        });
                    }
                    // Remembered conversation went stale; silent replacement,
                    // no context the user knew about was lost
                    log::warn!(
                        "[SessionManager] Remembered conversation {} for project {} is stale",
                        current,
                        project_id
                    );
                }
            }
        }

        let conversation = self.conversations.create(project_id).await?;
        self.projects
            .set_current_conversation(project_id, Some(conversation.id.clone()))
            .await?;
        log::info!(
            "[SessionManager] Created conversation {} for project {}",
            conversation.id,
            project_id
        );
        Ok(SessionResolution {
            conversation_id: conversation.id,
            created: true,
        })
    }

    /// Handle the external process rejecting a session id.
    ///
    /// Never fatal: always yields a fresh conversation and a recovery event.
    pub async fn handle_session_not_found(
        &self,
        project_id: &str,
        missing_session_id: &str,
    ) -> Result<String> {
        log::warn!(
            "[SessionManager] Agent rejected session {} for project {}",
            missing_session_id,
            project_id
        );
        let old = if missing_session_id.is_empty() {
            None
        } else {
            Some(missing_session_id.to_string())
        };
        self.recover(
            project_id,
            old,
            "agent process did not recognize the session".to_string(),
        )
        .await
    }

    /// Create a replacement conversation, emit the recovery event, then
    /// best-effort delete the stale record. The event is emitted before the
    /// delete so the user learns of the context loss even if cleanup fails.
    async fn recover(
        &self,
        project_id: &str,
        old_session_id: Option<String>,
        reason: String,
    ) -> Result<String> {
        let conversation = self.conversations.create(project_id).await?;
        let new_id = conversation.id;

        self.emit_recovery(SessionRecoveryPayload {
            project_id: project_id.to_string(),
            old_session_id: old_session_id.clone(),
            new_session_id: new_id.clone(),
            reason: reason.clone(),
        });
        log::info!(
            "[SessionManager] Recovered project {} to session {} ({})",
            project_id,
            new_id,
            reason
        );

        if let Some(old) = old_session_id {
            if let Err(err) = self.conversations.delete_conversation(&old).await {
                log::warn!(
                    "[SessionManager] Failed to delete stale conversation {}: {}",
                    old,
                    err
                );
            }
        }

        self.projects
            .set_current_conversation(project_id, Some(new_id.clone()))
            .await?;
        Ok(new_id)
    }

    /// A session validates when it is a well-formed UUID and resolves to a
    /// conversation owned by this project.
    async fn validates_for_project(&self, project_id: &str, session_id: &str) -> Result<bool> {
        if Uuid::parse_str(session_id).is_err() {
            return Ok(false);
        }
        match self.conversations.find_by_id(session_id).await? {
            Some(conversation) => Ok(conversation.project_id == project_id),
            None => Ok(false),
        }
    }

    fn emit_recovery(&self, payload: SessionRecoveryPayload) {
        if let Some(sender) = lock_mutex_recover(&self.recovery_sender).as_ref() {
            let _ = sender.send(payload);
        }
    }
}
