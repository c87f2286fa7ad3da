// Ralph loop: worker/reviewer iterative refinement service
// Independent of the agent manager's concurrency cap and queue; each task
// owns at most one worker-or-reviewer process at a time

pub mod context;
pub mod feedback;
pub mod runner;
pub mod types;

pub use context::ContextInitializer;
pub use feedback::parse_reviewer_feedback;
pub use runner::{IterationRunner, ProcessIterationRunner, WorkerRun};
pub use types::{
    FinalStatus, IterationSummary, RalphEvent, RalphStatus, RalphTask, RalphTaskConfig,
    ReviewDecision, ReviewerFeedback,
};

use crate::error::{ForemanError, Result};
use crate::settings::RalphSettings;
use crate::utils::lock_mutex_recover;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

pub struct RalphLoopService {
    runner: Arc<dyn IterationRunner>,
    settings: RalphSettings,
    tasks: Mutex<HashMap<String, RalphTask>>,
    pause_requested: Mutex<HashSet<String>>,
    event_sender: Mutex<Option<UnboundedSender<RalphEvent>>>,
}

impl RalphLoopService {
    pub fn new(runner: Arc<dyn IterationRunner>, settings: RalphSettings) -> Arc<Self> {
        Arc::new(Self {
            runner,
            settings,
            tasks: Mutex::new(HashMap::new()),
            pause_requested: Mutex::new(HashSet::new()),
            event_sender: Mutex::new(None),
        })
    }

    pub fn set_event_sender(&self, sender: UnboundedSender<RalphEvent>) {
        *lock_mutex_recover(&self.event_sender) = Some(sender);
    }

    /// Start a new Ralph task. Returns the task id; the loop runs in the
    /// background until a terminal decision, max turns, or an error.
    pub fn start_loop(self: &Arc<Self>, mut config: RalphTaskConfig) -> Result<String> {
        if config.max_turns == 0 {
            config.max_turns = self.settings.default_max_turns;
        }
        config.worker_model = config
            .worker_model
            .or_else(|| self.settings.worker_model.clone());
        config.reviewer_model = config
            .reviewer_model
            .or_else(|| self.settings.reviewer_model.clone());
        config.worker_prompt_template = config
            .worker_prompt_template
            .or_else(|| self.settings.worker_prompt_template.clone());
        config.reviewer_prompt_template = config
            .reviewer_prompt_template
            .or_else(|| self.settings.reviewer_prompt_template.clone());

        let task = RalphTask::new(config);
        let task_id = task.id.clone();
        let project_id = task.project_id.clone();
        lock_mutex_recover(&self.tasks).insert(task_id.clone(), task);
        log::info!(
            "[RalphLoop] Started task {} for project {}",
            task_id,
            project_id
        );

        self.prune_history(&project_id);

        let service = Arc::clone(self);
        let id = task_id.clone();
        tokio::spawn(async move {
            service.run(&id).await;
        });
        Ok(task_id)
    }

    /// Stop admitting new iterations. The in-flight worker or reviewer
    /// process is not killed; the pause takes effect at the next boundary.
    pub fn pause(&self, task_id: &str) -> Result<()> {
        let active = self
            .get_task(task_id)
            .ok_or_else(|| ForemanError::TaskNotFound(task_id.to_string()))?
            .is_active();
        if !active {
            return Err(ForemanError::InvalidTaskState(task_id.to_string()));
        }
        lock_mutex_recover(&self.pause_requested).insert(task_id.to_string());
        log::info!("[RalphLoop] Pause requested for task {}", task_id);
        Ok(())
    }

    /// Re-enter the iteration loop from the persisted iteration count.
    pub fn resume(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let task = self
            .get_task(task_id)
            .ok_or_else(|| ForemanError::TaskNotFound(task_id.to_string()))?;
        if task.status != RalphStatus::Paused {
            return Err(ForemanError::InvalidTaskState(task_id.to_string()));
        }
        lock_mutex_recover(&self.pause_requested).remove(task_id);
        self.set_status(task_id, RalphStatus::Idle);
        log::info!(
            "[RalphLoop] Resuming task {} at iteration {}",
            task_id,
            task.current_iteration
        );

        let service = Arc::clone(self);
        let id = task_id.to_string();
        tokio::spawn(async move {
            service.run(&id).await;
        });
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Option<RalphTask> {
        lock_mutex_recover(&self.tasks).get(task_id).cloned()
    }

    pub fn tasks_for_project(&self, project_id: &str) -> Vec<RalphTask> {
        let mut tasks: Vec<RalphTask> = lock_mutex_recover(&self.tasks)
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Keep only the most recent runs per project. A run in an active,
    /// non-paused status survives the sweep regardless of age.
    pub fn prune_history(&self, project_id: &str) {
        let retention = self.settings.history_retention;
        let mut tasks = lock_mutex_recover(&self.tasks);
        let mut project_tasks: Vec<(String, chrono::DateTime<Utc>, bool)> = tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .map(|t| (t.id.clone(), t.created_at, t.is_active()))
            .collect();
        if project_tasks.len() <= retention {
            return;
        }
        project_tasks.sort_by(|a, b| b.1.cmp(&a.1));
        for (id, _, active) in project_tasks.into_iter().skip(retention) {
            if !active {
                log::debug!("[RalphLoop] Pruning old task {}", id);
                tasks.remove(&id);
            }
        }
    }

    async fn run(self: Arc<Self>, task_id: &str) {
        loop {
            if lock_mutex_recover(&self.pause_requested).contains(task_id) {
                self.set_status(task_id, RalphStatus::Paused);
                log::info!("[RalphLoop] Task {} paused at iteration boundary", task_id);
                return;
            }

            // Begin the next iteration
            let snapshot = {
                let mut tasks = lock_mutex_recover(&self.tasks);
                let Some(task) = tasks.get_mut(task_id) else {
                    return;
                };
                task.current_iteration += 1;
                task.updated_at = Utc::now();
                task.clone()
            };
            let iteration = snapshot.current_iteration;
            self.emit(RalphEvent::IterationStart {
                task_id: task_id.to_string(),
                project_id: snapshot.project_id.clone(),
                iteration,
            });
            self.set_status(task_id, RalphStatus::WorkerRunning);

            let worker_prompt = ContextInitializer::build_worker_prompt(
                &snapshot.config,
                &snapshot.summaries,
                &snapshot.feedback,
                iteration,
            );
            let run = match self.runner.run_worker(&snapshot, &worker_prompt).await {
                Ok(run) => run,
                Err(err) => {
                    self.fail(task_id, format!("worker iteration {} failed: {}", iteration, err));
                    return;
                }
            };
            let summary = IterationSummary {
                iteration,
                output: run.output,
                files_touched: run.files_touched,
                tokens_used: run.tokens_used,
                duration_ms: run.duration_ms,
                timestamp: Utc::now(),
            };
            self.with_task(task_id, |task| {
                task.summaries.push(summary.clone());
                task.updated_at = Utc::now();
            });
            self.emit(RalphEvent::WorkerComplete {
                task_id: task_id.to_string(),
                iteration,
                summary: summary.clone(),
            });

            self.set_status(task_id, RalphStatus::ReviewerRunning);
            let reviewer_prompt =
                ContextInitializer::build_reviewer_prompt(&snapshot.config, &summary);
            let review_output = match self.runner.run_reviewer(&snapshot, &reviewer_prompt).await {
                Ok(output) => output,
                Err(err) => {
                    self.fail(
                        task_id,
                        format!("reviewer iteration {} failed: {}", iteration, err),
                    );
                    return;
                }
            };
            let (decision, feedback_text) = parse_reviewer_feedback(&review_output);
            let feedback = ReviewerFeedback {
                iteration,
                decision,
                feedback: feedback_text,
                timestamp: Utc::now(),
            };
            self.with_task(task_id, |task| {
                task.feedback.push(feedback.clone());
                task.updated_at = Utc::now();
            });
            self.emit(RalphEvent::ReviewerComplete {
                task_id: task_id.to_string(),
                iteration,
                feedback,
            });

            match decision {
                ReviewDecision::Approve => {
                    self.finish(task_id, RalphStatus::Completed, FinalStatus::Approved, iteration);
                    return;
                }
                ReviewDecision::Reject => {
                    self.finish(
                        task_id,
                        RalphStatus::Failed,
                        FinalStatus::CriticalFailure,
                        iteration,
                    );
                    return;
                }
                ReviewDecision::NeedsChanges => {
                    // Max turns is checked before another worker starts
                    if iteration >= snapshot.config.max_turns {
                        log::info!(
                            "[RalphLoop] Task {} reached max turns ({})",
                            task_id,
                            snapshot.config.max_turns
                        );
                        self.finish(
                            task_id,
                            RalphStatus::Completed,
                            FinalStatus::MaxTurnsReached,
                            iteration,
                        );
                        return;
                    }
                }
            }
        }
    }

    fn finish(&self, task_id: &str, status: RalphStatus, final_status: FinalStatus, iterations: u32) {
        self.with_task(task_id, |task| {
            task.final_status = Some(final_status);
            task.updated_at = Utc::now();
        });
        self.set_status(task_id, status);
        log::info!(
            "[RalphLoop] Task {} finished with {:?} after {} iteration(s)",
            task_id,
            final_status,
            iterations
        );
        self.emit(RalphEvent::LoopComplete {
            task_id: task_id.to_string(),
            final_status,
            iterations,
        });
    }

    fn fail(&self, task_id: &str, error: String) {
        log::error!("[RalphLoop] Task {}: {}", task_id, error);
        self.with_task(task_id, |task| {
            task.final_status = Some(FinalStatus::CriticalFailure);
            task.error = Some(error.clone());
            task.updated_at = Utc::now();
        });
        self.set_status(task_id, RalphStatus::Failed);
        self.emit(RalphEvent::LoopError {
            task_id: task_id.to_string(),
            error,
        });
    }

    fn set_status(&self, task_id: &str, new: RalphStatus) {
        let old = {
            let mut tasks = lock_mutex_recover(&self.tasks);
            let Some(task) = tasks.get_mut(task_id) else {
                return;
            };
            let old = task.status;
            task.status = new;
            task.updated_at = Utc::now();
            old
        };
        if old != new {
            self.emit(RalphEvent::StatusChange {
                task_id: task_id.to_string(),
                old,
                new,
            });
        }
    }

    fn with_task(&self, task_id: &str, f: impl FnOnce(&mut RalphTask)) {
        if let Some(task) = lock_mutex_recover(&self.tasks).get_mut(task_id) {
            f(task);
        }
    }

    fn emit(&self, event: RalphEvent) {
        if let Some(sender) = lock_mutex_recover(&self.event_sender).as_ref() {
            let _ = sender.send(event);
        }
    }
}
