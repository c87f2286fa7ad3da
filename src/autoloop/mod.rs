// Autonomous loop: works through roadmap milestones unattended by running
// one agent per milestone and interpreting its completion verdict

use crate::error::{ForemanError, Result};
use crate::events::{LoopCompletedPayload, MilestoneEventPayload};
use crate::models::MilestoneRef;
use crate::roadmap::RoadmapStore;
use crate::storage::ProjectRepository;
use crate::utils::lock_mutex_recover;
use anyhow::anyhow;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// Per-project loop state, at most one active instance per project.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub looping: bool,
    /// Cleared by a stop request; consulted only at milestone boundaries
    pub should_continue: bool,
    pub current: Option<MilestoneRef>,
    pub conversation_id: Option<String>,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    MilestoneStarted(MilestoneEventPayload),
    MilestoneCompleted(MilestoneEventPayload),
    MilestoneFailed(MilestoneEventPayload),
    LoopCompleted(LoopCompletedPayload),
}

/// One milestone run in flight.
pub struct MilestoneRun {
    /// Conversation the milestone agent runs under, when one is established
    pub conversation_id: Option<String>,
    /// Resolves with the agent's collected output once the run ends
    pub outcome: Pin<Box<dyn Future<Output = Result<String>> + Send>>,
}

/// Runs one agent per milestone.
///
/// `run_milestone` resolves once the agent is started, so the session is
/// known while the run is still in flight. The manager provides the
/// production implementation; tests substitute a scripted one.
#[async_trait]
pub trait MilestoneExecutor: Send + Sync {
    async fn run_milestone(&self, project_id: &str, instructions: &str) -> Result<MilestoneRun>;
}

/// The structured verdict the agent must emit at task end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionVerdict {
    pub status: String,
    #[serde(default)]
    pub reason: String,
}

impl CompletionVerdict {
    pub fn is_complete(&self) -> bool {
        self.status == "COMPLETE"
    }
}

/// Last parseable `{"status":"COMPLETE"|"FAILED","reason":...}` object in
/// the output is authoritative; earlier ones are superseded.
pub fn extract_verdict(output: &str) -> Option<CompletionVerdict> {
    // Candidates are flat JSON objects mentioning a status field
    let pattern = Regex::new(r#"\{[^{}]*"status"[^{}]*\}"#).ok()?;
    let mut last = None;
    for candidate in pattern.find_iter(output) {
        if let Ok(verdict) = serde_json::from_str::<CompletionVerdict>(candidate.as_str()) {
            if verdict.status == "COMPLETE" || verdict.status == "FAILED" {
                last = Some(verdict);
            }
        }
    }
    last
}

/// Instructions given to the agent for one milestone.
pub fn build_milestone_instructions(milestone: &MilestoneRef) -> String {
    let mut text = format!(
        "Work on the milestone \"{}\" in phase \"{}\".\n\nComplete these remaining tasks:\n",
        milestone.milestone_title, milestone.phase_title
    );
    for task in &milestone.pending_tasks {
        text.push_str(&format!("- {}\n", task));
    }
    text.push_str(
        "\nMark each task as complete in ROADMAP.md ([ ] to [x]) as you finish it.\n\
         When done, output a final JSON verdict on its own line:\n\
         {\"status\":\"COMPLETE\",\"reason\":\"<what was accomplished>\"}\n\
         If the milestone cannot be completed, output:\n\
         {\"status\":\"FAILED\",\"reason\":\"<what blocked it>\"}",
    );
    text
}

pub struct LoopOrchestrator {
    roadmaps: Arc<dyn RoadmapStore>,
    projects: Arc<dyn ProjectRepository>,
    executor: Arc<dyn MilestoneExecutor>,
    states: Mutex<HashMap<String, LoopState>>,
    event_sender: Mutex<Option<UnboundedSender<LoopEvent>>>,
}

impl LoopOrchestrator {
    pub fn new(
        roadmaps: Arc<dyn RoadmapStore>,
        projects: Arc<dyn ProjectRepository>,
        executor: Arc<dyn MilestoneExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            roadmaps,
            projects,
            executor,
            states: Mutex::new(HashMap::new()),
            event_sender: Mutex::new(None),
        })
    }

    pub fn set_event_sender(&self, sender: UnboundedSender<LoopEvent>) {
        *lock_mutex_recover(&self.event_sender) = Some(sender);
    }

    pub fn is_looping(&self, project_id: &str) -> bool {
        lock_mutex_recover(&self.states)
            .get(project_id)
            .map(|s| s.looping)
            .unwrap_or(false)
    }

    pub fn loop_state(&self, project_id: &str) -> Option<LoopState> {
        lock_mutex_recover(&self.states).get(project_id).cloned()
    }

    /// Start the loop for a project. Runs in the background until all
    /// milestones complete, one fails, or the caller stops it.
    pub async fn start_loop(self: &Arc<Self>, project_id: &str) -> Result<()> {
        let project = self
            .projects
            .find_by_id(project_id)
            .await?
            .ok_or_else(|| ForemanError::ProjectNotFound(project_id.to_string()))?;
        let project_path = PathBuf::from(&project.path);

        let roadmap = self
            .roadmaps
            .load(&project_path)
            .await?
            .ok_or_else(|| ForemanError::RoadmapMissing(project_id.to_string()))?;

        // Admission must be atomic with the looping check
        {
            let mut states = lock_mutex_recover(&self.states);
            if states.get(project_id).map(|s| s.looping).unwrap_or(false) {
                return Err(ForemanError::LoopAlreadyRunning(project_id.to_string()));
            }
            states.insert(
                project_id.to_string(),
                LoopState {
                    looping: true,
                    should_continue: true,
                    current: None,
                    conversation_id: None,
                },
            );
        }

        if roadmap.next_milestone().is_none() {
            // Nothing to do: terminate immediately with no work performed
            lock_mutex_recover(&self.states).remove(project_id);
            log::info!("[LoopOrchestrator] Roadmap for {} has no pending work", project_id);
            self.emit(LoopEvent::LoopCompleted(LoopCompletedPayload {
                project_id: project_id.to_string(),
                milestones_completed: 0,
                error: None,
            }));
            return Ok(());
        }

        log::info!("[LoopOrchestrator] Starting loop for project {}", project_id);
        let orchestrator = Arc::clone(self);
        let project_id = project_id.to_string();
        tokio::spawn(async move {
            orchestrator.run_loop(&project_id, &project_path).await;
        });
        Ok(())
    }

    /// Request a stop; honored at the next milestone boundary. The running
    /// milestone finishes naturally. Returns false when no loop is active.
    pub fn stop_loop(&self, project_id: &str) -> bool {
        let mut states = lock_mutex_recover(&self.states);
        match states.get_mut(project_id) {
            Some(state) => {
                log::info!("[LoopOrchestrator] Stop requested for project {}", project_id);
                state.should_continue = false;
                true
            }
            None => false,
        }
    }

    async fn run_loop(self: Arc<Self>, project_id: &str, project_path: &std::path::Path) {
        let mut completed: u32 = 0;
        let outcome = loop {
            if !self.should_continue(project_id) {
                log::info!("[LoopOrchestrator] Loop for {} stopped at boundary", project_id);
                break Ok(completed);
            }

            // Re-read the roadmap each boundary so completions made by the
            // previous run are picked up
            let milestone = match self.roadmaps.load(project_path).await {
                Ok(Some(doc)) => doc.next_milestone(),
                Ok(None) => break Err(anyhow!("roadmap disappeared mid-loop")),
                Err(err) => break Err(err.into()),
            };
            let Some(milestone) = milestone else {
                break Ok(completed);
            };

            self.set_current(project_id, Some(milestone.clone()));
            if let Err(err) = self
                .projects
                .update_next_item(project_id, Some(milestone.clone()))
                .await
            {
                log::warn!("[LoopOrchestrator] Failed to persist next item: {}", err);
            }
            self.emit(LoopEvent::MilestoneStarted(payload_for(
                project_id, &milestone, None,
            )));

            let instructions = build_milestone_instructions(&milestone);
            let run = match self.executor.run_milestone(project_id, &instructions).await {
                Ok(run) => run,
                Err(err) => {
                    self.emit(LoopEvent::MilestoneFailed(payload_for(
                        project_id,
                        &milestone,
                        Some(format!("agent run failed: {}", err)),
                    )));
                    break Err(anyhow!("milestone \"{}\" failed: {}", milestone.milestone_title, err));
                }
            };
            self.set_conversation(project_id, run.conversation_id);
            let output = run.outcome.await;
            self.set_conversation(project_id, None);
            let output = match output {
                Ok(output) => output,
                Err(err) => {
                    self.emit(LoopEvent::MilestoneFailed(payload_for(
                        project_id,
                        &milestone,
                        Some(format!("agent run failed: {}", err)),
                    )));
                    break Err(anyhow!("milestone \"{}\" failed: {}", milestone.milestone_title, err));
                }
            };

            match extract_verdict(&output) {
                Some(verdict) if verdict.is_complete() => {
                    completed += 1;
                    log::info!(
                        "[LoopOrchestrator] Milestone \"{}\" complete for {}",
                        milestone.milestone_title,
                        project_id
                    );
                    self.emit(LoopEvent::MilestoneCompleted(payload_for(
                        project_id,
                        &milestone,
                        Some(verdict.reason),
                    )));
                }
                Some(verdict) => {
                    self.emit(LoopEvent::MilestoneFailed(payload_for(
                        project_id,
                        &milestone,
                        Some(verdict.reason.clone()),
                    )));
                    break Err(anyhow!(
                        "milestone \"{}\" failed: {}",
                        milestone.milestone_title,
                        verdict.reason
                    ));
                }
                None => {
                    // No parseable verdict is a failure, never a completion
                    self.emit(LoopEvent::MilestoneFailed(payload_for(
                        project_id,
                        &milestone,
                        Some("agent produced no completion verdict".to_string()),
                    )));
                    break Err(anyhow!(
                        "milestone \"{}\" produced no completion verdict",
                        milestone.milestone_title
                    ));
                }
            }
        };

        lock_mutex_recover(&self.states).remove(project_id);
        if let Err(err) = self.projects.update_next_item(project_id, None).await {
            log::warn!("[LoopOrchestrator] Failed to clear next item: {}", err);
        }
        match outcome {
            Ok(count) => {
                log::info!(
                    "[LoopOrchestrator] Loop for {} finished, {} milestone(s) completed",
                    project_id,
                    count
                );
                self.emit(LoopEvent::LoopCompleted(LoopCompletedPayload {
                    project_id: project_id.to_string(),
                    milestones_completed: count,
                    error: None,
                }));
            }
            Err(err) => {
                log::error!("[LoopOrchestrator] Loop for {} failed: {}", project_id, err);
                self.emit(LoopEvent::LoopCompleted(LoopCompletedPayload {
                    project_id: project_id.to_string(),
                    milestones_completed: completed,
                    error: Some(err.to_string()),
                }));
            }
        }
    }

    fn should_continue(&self, project_id: &str) -> bool {
        lock_mutex_recover(&self.states)
            .get(project_id)
            .map(|s| s.should_continue)
            .unwrap_or(false)
    }

    fn set_current(&self, project_id: &str, milestone: Option<MilestoneRef>) {
        if let Some(state) = lock_mutex_recover(&self.states).get_mut(project_id) {
            state.current = milestone;
        }
    }

    fn set_conversation(&self, project_id: &str, conversation_id: Option<String>) {
        if let Some(state) = lock_mutex_recover(&self.states).get_mut(project_id) {
            state.conversation_id = conversation_id;
        }
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(sender) = lock_mutex_recover(&self.event_sender).as_ref() {
            let _ = sender.send(event);
        }
    }
}

fn payload_for(
    project_id: &str,
    milestone: &MilestoneRef,
    reason: Option<String>,
) -> MilestoneEventPayload {
    MilestoneEventPayload {
        project_id: project_id.to_string(),
        phase_title: milestone.phase_title.clone(),
        milestone_title: milestone.milestone_title.clone(),
        pending_tasks: milestone.pending_tasks.clone(),
        reason,
    }
}
