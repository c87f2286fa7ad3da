// Agent Manager: composes process agents, queue, sessions, tracker, and
// the autonomous loop; sole entry point for the transport layer

use crate::agent::{AgentEvent, AgentLaunchSpec, ProcessAgent};
use crate::autoloop::{MilestoneExecutor, MilestoneRun};
use crate::error::{ForemanError, Result};
use crate::events::{
    AgentExitPayload, AgentMessagePayload, AgentStatusPayload, QueueChangePayload,
    SessionRecoveryPayload, WaitingForInputPayload,
};
use crate::models::{
    ContextUsage, ExecutionMode, Message, PermissionMode, ProjectStatus, RunStatus,
};
use crate::queue::AgentQueue;
use crate::session::SessionManager;
use crate::shutdown::{PendingWrites, ShutdownResult};
use crate::storage::{ConversationRepository, ProjectRepository, SettingsRepository};
use crate::tracker::ProcessTracker;
use crate::utils::lock_mutex_recover;
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

/// Events re-emitted by the manager for the transport layer.
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    Message(AgentMessagePayload),
    Status(AgentStatusPayload),
    WaitingForInput(WaitingForInputPayload),
    SessionRecovery(SessionRecoveryPayload),
    QueueChange(QueueChangePayload),
    AgentExit(AgentExitPayload),
}

/// What a start request did.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// Agent is running with this pid
    Started(u32),
    /// Concurrency cap reached; project was queued
    Queued,
}

/// Everything a watcher learns when an agent exits.
#[derive(Debug, Clone)]
pub struct AgentExitInfo {
    pub exit_code: Option<i32>,
    pub output: String,
    pub context_usage: ContextUsage,
}

/// Options for one start request.
#[derive(Debug, Clone, Default)]
pub struct StartAgentOptions {
    pub instructions: Option<String>,
    pub execution_mode: Option<ExecutionMode>,
    pub permission_mode: Option<PermissionMode>,
    pub session_id: Option<String>,
    pub force_new_session: bool,
    pub model: Option<String>,
}

/// Slot entry per project; `Starting` reserves the slot before any await so
/// two concurrent start requests cannot both succeed.
enum AgentSlot {
    Starting,
    Live(Arc<ProcessAgent>),
}

pub struct AgentManager {
    projects: Arc<dyn ProjectRepository>,
    conversations: Arc<dyn ConversationRepository>,
    settings_repo: Arc<dyn SettingsRepository>,
    sessions: Arc<SessionManager>,
    queue: Arc<AgentQueue>,
    tracker: Arc<ProcessTracker>,
    pending_writes: Arc<PendingWrites>,
    slots: Mutex<HashMap<String, AgentSlot>>,
    oneoffs: Mutex<HashMap<String, Arc<ProcessAgent>>>,
    /// At most one pending plan per project
    pending_plans: Mutex<HashMap<String, String>>,
    exit_waiters: Mutex<HashMap<String, Vec<oneshot::Sender<AgentExitInfo>>>>,
    event_sender: Mutex<Option<UnboundedSender<ManagerEvent>>>,
}

impl AgentManager {
    pub fn new(
        projects: Arc<dyn ProjectRepository>,
        conversations: Arc<dyn ConversationRepository>,
        settings_repo: Arc<dyn SettingsRepository>,
        sessions: Arc<SessionManager>,
        queue: Arc<AgentQueue>,
        tracker: Arc<ProcessTracker>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            projects,
            conversations,
            settings_repo,
            sessions,
            queue,
            tracker,
            pending_writes: PendingWrites::new(),
            slots: Mutex::new(HashMap::new()),
            oneoffs: Mutex::new(HashMap::new()),
            pending_plans: Mutex::new(HashMap::new()),
            exit_waiters: Mutex::new(HashMap::new()),
            event_sender: Mutex::new(None),
        });

        // Subscribe once to the components' event surfaces and re-emit
        let (recovery_tx, mut recovery_rx) = tokio::sync::mpsc::unbounded_channel();
        manager.sessions.set_recovery_sender(recovery_tx);
        let forward = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Some(payload) = recovery_rx.recv().await {
                forward.emit(ManagerEvent::SessionRecovery(payload));
            }
        });

        let (queue_tx, mut queue_rx) = tokio::sync::mpsc::unbounded_channel();
        manager.queue.set_change_sender(queue_tx);
        let forward = Arc::clone(&manager);
        tokio::spawn(async move {
            while let Some(payload) = queue_rx.recv().await {
                forward.emit(ManagerEvent::QueueChange(payload));
            }
        });

        manager
    }

    pub fn set_event_sender(&self, sender: UnboundedSender<ManagerEvent>) {
        *lock_mutex_recover(&self.event_sender) = Some(sender);
    }

    pub fn pending_writes(&self) -> Arc<PendingWrites> {
        Arc::clone(&self.pending_writes)
    }

    pub fn is_agent_running(&self, project_id: &str) -> bool {
        lock_mutex_recover(&self.slots).contains_key(project_id)
    }

    pub fn running_agent_count(&self) -> usize {
        lock_mutex_recover(&self.slots).len()
    }

    pub fn agent_for(&self, project_id: &str) -> Option<Arc<ProcessAgent>> {
        match lock_mutex_recover(&self.slots).get(project_id) {
            Some(AgentSlot::Live(agent)) => Some(Arc::clone(agent)),
            _ => None,
        }
    }

    /// Start an agent for a project, queueing when the cap is reached.
    ///
    /// A second start for a busy project is rejected; a start for an
    /// already-queued project is rejected.
    pub async fn start_agent(
        self: &Arc<Self>,
        project_id: &str,
        options: StartAgentOptions,
    ) -> Result<StartOutcome> {
        let project = self
            .projects
            .find_by_id(project_id)
            .await?
            .ok_or_else(|| ForemanError::ProjectNotFound(project_id.to_string()))?;
        let settings = self.settings_repo.get().await?;

        // Admission decision is atomic: the Starting placeholder reserves
        // the slot before any await. The guard never lives across an await.
        let over_cap = {
            let mut slots = lock_mutex_recover(&self.slots);
            if slots.contains_key(project_id) {
                return Err(ForemanError::AlreadyRunning(project_id.to_string()));
            }
            if slots.len() >= settings.max_concurrent_agents {
                true
            } else {
                slots.insert(project_id.to_string(), AgentSlot::Starting);
                false
            }
        };
        if over_cap {
            if !self.queue.enqueue(project_id, options.instructions.clone()) {
                return Err(ForemanError::AlreadyQueued(project_id.to_string()));
            }
            log::info!(
                "[AgentManager] Concurrency cap reached, queued project {}",
                project_id
            );
            let _ = self
                .projects
                .update_status(project_id, ProjectStatus::Queued)
                .await;
            return Ok(StartOutcome::Queued);
        }

        match self
            .spawn_for_slot(project_id, &project.path, &settings, options)
            .await
        {
            Ok(pid) => Ok(StartOutcome::Started(pid)),
            Err(err) => {
                lock_mutex_recover(&self.slots).remove(project_id);
                let _ = self
                    .projects
                    .update_status(project_id, ProjectStatus::Error)
                    .await;
                Err(err)
            }
        }
    }

    /// Start an agent and receive its exit outcome. Used by the autonomous
    /// loop, which must not be queued behind other projects.
    pub async fn start_agent_watched(
        self: &Arc<Self>,
        project_id: &str,
        options: StartAgentOptions,
    ) -> Result<oneshot::Receiver<AgentExitInfo>> {
        let (tx, rx) = oneshot::channel();
        // Registered before the start so an immediate exit cannot be missed
        lock_mutex_recover(&self.exit_waiters)
            .entry(project_id.to_string())
            .or_default()
            .push(tx);

        match self.start_agent(project_id, options).await {
            Ok(StartOutcome::Started(_)) => Ok(rx),
            Ok(StartOutcome::Queued) => {
                self.queue.remove_from_queue(project_id);
                self.drop_waiters(project_id);
                let _ = self
                    .projects
                    .update_status(project_id, ProjectStatus::Idle)
                    .await;
                Err(anyhow!("concurrency cap reached, agent not startable now").into())
            }
            Err(err) => {
                self.drop_waiters(project_id);
                Err(err)
            }
        }
    }

    /// Run an ephemeral agent outside the per-project uniqueness constraint
    /// and the queue. Returns the one-off id.
    pub async fn run_oneoff(
        self: &Arc<Self>,
        working_dir: impl Into<PathBuf>,
        instructions: &str,
    ) -> Result<String> {
        let settings = self.settings_repo.get().await?;
        let oneoff_id = format!("oneoff:{}", uuid::Uuid::new_v4());

        let mut spec = AgentLaunchSpec::new(oneoff_id.clone(), working_dir);
        spec.execution_mode = ExecutionMode::Autonomous;
        spec.permission_mode = PermissionMode::AcceptEdits;
        spec.permission_rules = settings.permission_rules.clone();
        spec.model = settings.model.clone();
        spec.system_prompt_append = settings.system_prompt_append.clone();
        spec.mcp_config_path = settings.mcp_config_path.clone();
        spec.plugin_dir = settings.plugin_dir.clone();
        spec.agent_binary = settings.agent_binary.clone();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let agent = ProcessAgent::new(spec, tx);
        let pid = agent.start(Some(instructions)).await?;
        agent.close_input().await;
        self.tracker.track_process(pid, &oneoff_id)?;
        lock_mutex_recover(&self.oneoffs).insert(oneoff_id.clone(), Arc::clone(&agent));
        log::info!("[AgentManager] Started one-off agent {} (pid {})", oneoff_id, pid);

        let manager = Arc::clone(self);
        let id = oneoff_id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let AgentEvent::Exit { exit_code, .. } = event {
                    log::info!("[AgentManager] One-off agent {} exited ({:?})", id, exit_code);
                    let _ = manager.tracker.untrack_process(pid);
                    lock_mutex_recover(&manager.oneoffs).remove(&id);
                    break;
                }
            }
        });
        Ok(oneoff_id)
    }

    /// Forward user input to a project's agent, routing plan approval.
    pub async fn send_input(self: &Arc<Self>, project_id: &str, text: &str) -> Result<()> {
        let pending_plan = lock_mutex_recover(&self.pending_plans).remove(project_id);
        if let Some(plan) = pending_plan {
            let reply = text.trim().to_lowercase();
            if is_affirmative(&reply) {
                // Approval restarts with edit-accepting permissions and the
                // plan as the first instruction
                log::info!("[AgentManager] Plan approved for project {}", project_id);
                return self
                    .restart_agent(project_id, PermissionMode::AcceptEdits, Some(plan))
                    .await;
            }
            if is_negative(&reply) {
                log::info!("[AgentManager] Plan rejected for project {}", project_id);
            } else {
                log::info!(
                    "[AgentManager] Plan feedback for project {}, forwarding",
                    project_id
                );
            }
            // Rejection and free-form feedback both go to the process as-is
        }

        let agent = self
            .agent_for(project_id)
            .ok_or_else(|| ForemanError::NotRunning(project_id.to_string()))?;
        agent.send_input(text).await?;
        self.persist_message(agent.spec().session_id.clone(), Message::user(text))
            .await;
        Ok(())
    }

    /// Respond to a pending tool-use request from a project's agent.
    pub async fn send_tool_result(
        &self,
        project_id: &str,
        tool_use_id: &str,
        content: &str,
    ) -> Result<()> {
        let agent = self
            .agent_for(project_id)
            .ok_or_else(|| ForemanError::NotRunning(project_id.to_string()))?;
        agent.send_tool_result(tool_use_id, content).await
    }

    /// Stop a project's agent, or remove it from the queue if only queued.
    /// Returns true when the stop was graceful (or nothing was running).
    pub async fn stop_agent(&self, project_id: &str) -> Result<bool> {
        if self.queue.remove_from_queue(project_id) {
            let _ = self
                .projects
                .update_status(project_id, ProjectStatus::Idle)
                .await;
            return Ok(true);
        }
        let Some(agent) = self.agent_for(project_id) else {
            return Ok(true);
        };
        let graceful = agent.stop().await?;
        Ok(graceful)
    }

    /// Stop everything: running agents, the queue, and all buffered writes.
    pub async fn shutdown(&self) -> Result<ShutdownResult> {
        let mut result = ShutdownResult::new();
        log::info!("[AgentManager] Shutting down");

        result.queue_dropped = self.queue.len();
        self.queue.clear();

        let agents: Vec<Arc<ProcessAgent>> = {
            let slots = lock_mutex_recover(&self.slots);
            slots
                .values()
                .filter_map(|slot| match slot {
                    AgentSlot::Live(agent) => Some(Arc::clone(agent)),
                    AgentSlot::Starting => None,
                })
                .collect()
        };
        let oneoffs: Vec<Arc<ProcessAgent>> =
            lock_mutex_recover(&self.oneoffs).values().cloned().collect();

        for agent in agents.into_iter().chain(oneoffs) {
            match agent.stop().await {
                Ok(graceful) => {
                    result.agents_stopped += 1;
                    if !graceful {
                        result.agents_killed += 1;
                    }
                }
                Err(err) => result
                    .errors
                    .push(format!("stop {}: {}", agent.project_id(), err)),
            }
        }

        // No conversation write may be lost to the shutdown race
        self.pending_writes.drain().await;
        if let Err(err) = self.conversations.flush().await {
            result.errors.push(format!("flush: {}", err));
        }

        log::info!(
            "[AgentManager] Shutdown complete: {} stopped ({} killed), {} queued dropped",
            result.agents_stopped,
            result.agents_killed,
            result.queue_dropped
        );
        Ok(result)
    }

    async fn spawn_for_slot(
        self: &Arc<Self>,
        project_id: &str,
        project_path: &str,
        settings: &crate::settings::Settings,
        options: StartAgentOptions,
    ) -> Result<u32> {
        let resolution = self
            .sessions
            .get_or_create_session(
                project_id,
                options.session_id.as_deref(),
                options.force_new_session,
            )
            .await?;

        let mut spec = AgentLaunchSpec::new(project_id, project_path);
        spec.execution_mode = options.execution_mode.unwrap_or(ExecutionMode::Interactive);
        spec.permission_mode = options.permission_mode.unwrap_or(PermissionMode::Default);
        spec.permission_rules = settings.permission_rules.clone();
        spec.session_id = Some(resolution.conversation_id);
        spec.resume = !resolution.created;
        spec.model = options.model.or_else(|| settings.model.clone());
        spec.system_prompt_append = settings.system_prompt_append.clone();
        spec.mcp_config_path = settings.mcp_config_path.clone();
        spec.plugin_dir = settings.plugin_dir.clone();
        spec.agent_binary = settings.agent_binary.clone();

        let pid = self
            .install_agent(project_id, spec, options.instructions.as_deref())
            .await?;
        let _ = self
            .projects
            .update_status(project_id, ProjectStatus::Running)
            .await;
        Ok(pid)
    }

    /// Spawn a process for a reserved slot and install the live handle.
    async fn install_agent(
        self: &Arc<Self>,
        project_id: &str,
        spec: AgentLaunchSpec,
        initial_input: Option<&str>,
    ) -> Result<u32> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let agent = ProcessAgent::new(spec, tx);
        let pid = agent.start(initial_input).await?;
        self.tracker.track_process(pid, project_id)?;

        if let Some(input) = initial_input {
            self.persist_message(agent.spec().session_id.clone(), Message::user(input))
                .await;
        }

        lock_mutex_recover(&self.slots).insert(
            project_id.to_string(),
            AgentSlot::Live(Arc::clone(&agent)),
        );

        tokio::spawn(Arc::clone(self).pump_events(Arc::clone(&agent), rx));
        Ok(pid)
    }

    /// Drive one agent's event stream to completion. Boxed because event
    /// handling can restart agents, and a restart builds another pump; the
    /// box keeps the future type finite.
    fn pump_events(
        self: Arc<Self>,
        agent: Arc<ProcessAgent>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<AgentEvent>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            while let Some(event) = rx.recv().await {
                self.handle_agent_event(&agent, event).await;
            }
        })
    }

    /// Stop the current process and start a replacement under the same
    /// session with a different permission mode. Permission mode is fixed at
    /// spawn time, so mode changes are restarts, never in-place mutations.
    async fn restart_agent(
        self: &Arc<Self>,
        project_id: &str,
        permission_mode: PermissionMode,
        initial_input: Option<String>,
    ) -> Result<()> {
        let old = self
            .agent_for(project_id)
            .ok_or_else(|| ForemanError::NotRunning(project_id.to_string()))?;

        // Keep the slot occupied across the swap so no other start sneaks in
        lock_mutex_recover(&self.slots).insert(project_id.to_string(), AgentSlot::Starting);
        old.stop().await?;
        if let Some(pid) = old.pid() {
            let _ = self.tracker.untrack_process(pid);
        }

        let mut spec = old.spec().clone();
        spec.permission_mode = permission_mode;
        spec.resume = spec.session_id.is_some();
        log::info!(
            "[AgentManager] Restarting agent for project {} in {} mode",
            project_id,
            permission_mode
        );

        match self
            .install_agent(project_id, spec, initial_input.as_deref())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                lock_mutex_recover(&self.slots).remove(project_id);
                let _ = self
                    .projects
                    .update_status(project_id, ProjectStatus::Error)
                    .await;
                Err(err)
            }
        }
    }

    async fn handle_agent_event(self: &Arc<Self>, agent: &Arc<ProcessAgent>, event: AgentEvent) {
        match event {
            AgentEvent::Message { project_id, content } => {
                self.persist_message(
                    agent.spec().session_id.clone(),
                    Message::assistant(content.clone()),
                )
                .await;
                self.emit(ManagerEvent::Message(AgentMessagePayload {
                    project_id,
                    role: crate::models::MessageRole::Assistant,
                    content,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                }));
            }
            AgentEvent::Status { project_id, old, new } => {
                // A straggling event from a replaced instance must not
                // overwrite the replacement's status
                if self.is_current_agent(&project_id, agent) {
                    let status = match new {
                        RunStatus::Running | RunStatus::Starting => ProjectStatus::Running,
                        RunStatus::Error => ProjectStatus::Error,
                        RunStatus::Stopped => ProjectStatus::Idle,
                    };
                    let _ = self.projects.update_status(&project_id, status).await;
                }
                self.emit(ManagerEvent::Status(AgentStatusPayload {
                    project_id,
                    old_status: old,
                    new_status: new,
                }));
            }
            AgentEvent::WaitingForInput {
                project_id,
                waiting,
                version,
                plan,
            } => {
                if waiting && self.is_current_agent(&project_id, agent) {
                    let _ = self
                        .projects
                        .update_status(&project_id, ProjectStatus::Waiting)
                        .await;
                }
                self.emit(ManagerEvent::WaitingForInput(WaitingForInputPayload {
                    project_id,
                    waiting,
                    version,
                    plan,
                }));
            }
            AgentEvent::Usage { project_id, usage } => {
                let _ = self.projects.update_context_usage(&project_id, &usage).await;
            }
            AgentEvent::ToolUse {
                project_id,
                tool_name,
                ..
            } => {
                log::debug!("[AgentManager] {} used tool {}", project_id, tool_name);
            }
            AgentEvent::RawOutput { project_id, line } => {
                log::debug!("[AgentManager] {} raw output: {}", project_id, line);
            }
            AgentEvent::EnterPlanMode { project_id } => {
                log::info!("[AgentManager] Project {} entering plan mode", project_id);
                if let Err(err) = self
                    .restart_agent(&project_id, PermissionMode::Plan, None)
                    .await
                {
                    log::error!(
                        "[AgentManager] Plan-mode restart failed for {}: {}",
                        project_id,
                        err
                    );
                }
            }
            AgentEvent::ExitPlanMode { project_id, plan } => {
                let mut plans = lock_mutex_recover(&self.pending_plans);
                if plans.contains_key(&project_id) {
                    // Duplicate plan proposal while one awaits approval
                    log::warn!(
                        "[AgentManager] Ignoring duplicate plan exit for project {}",
                        project_id
                    );
                } else {
                    log::info!("[AgentManager] Plan proposed for project {}", project_id);
                    plans.insert(project_id, plan);
                }
            }
            AgentEvent::SessionNotFound {
                project_id,
                session_id,
            } => {
                self.handle_session_not_found(agent, &project_id, &session_id)
                    .await;
            }
            AgentEvent::Exit {
                project_id,
                exit_code,
            } => {
                self.handle_agent_exit(agent, &project_id, exit_code).await;
            }
        }
    }

    async fn handle_session_not_found(
        self: &Arc<Self>,
        agent: &Arc<ProcessAgent>,
        project_id: &str,
        session_id: &str,
    ) {
        // Stop tracking this instance; identity compare so a replacement
        // started in the meantime is never evicted
        {
            let mut slots = lock_mutex_recover(&self.slots);
            if let Some(AgentSlot::Live(current)) = slots.get(project_id) {
                if Arc::ptr_eq(current, agent) {
                    slots.remove(project_id);
                }
            }
        }
        let _ = agent.stop().await;
        if let Some(pid) = agent.pid() {
            let _ = self.tracker.untrack_process(pid);
        }

        let new_session = match self
            .sessions
            .handle_session_not_found(project_id, session_id)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                log::error!(
                    "[AgentManager] Session recovery failed for {}: {}",
                    project_id,
                    err
                );
                return;
            }
        };

        // Re-issue the interrupted command under the fresh session
        let last_command = agent.last_command();
        let options = StartAgentOptions {
            instructions: last_command,
            execution_mode: Some(agent.spec().execution_mode),
            permission_mode: Some(agent.spec().permission_mode),
            session_id: Some(new_session),
            force_new_session: false,
            model: agent.spec().model.clone(),
        };
        if let Err(err) = self.start_agent(project_id, options).await {
            log::error!(
                "[AgentManager] Restart after session recovery failed for {}: {}",
                project_id,
                err
            );
        }
    }

    async fn handle_agent_exit(
        self: &Arc<Self>,
        agent: &Arc<ProcessAgent>,
        project_id: &str,
        exit_code: Option<i32>,
    ) {
        // Evict only if this exact instance still owns the slot; a stale
        // exit must not remove a just-started replacement
        let evicted = {
            let mut slots = lock_mutex_recover(&self.slots);
            match slots.get(project_id) {
                Some(AgentSlot::Live(current)) if Arc::ptr_eq(current, agent) => {
                    slots.remove(project_id);
                    true
                }
                _ => false,
            }
        };
        if let Some(pid) = agent.pid() {
            let _ = self.tracker.untrack_process(pid);
        }
        lock_mutex_recover(&self.pending_plans).remove(project_id);

        let usage = agent.context_usage();
        let _ = self.projects.update_context_usage(project_id, &usage).await;
        if evicted {
            let status = match exit_code {
                Some(0) | None => ProjectStatus::Idle,
                Some(_) => ProjectStatus::Error,
            };
            let _ = self.projects.update_status(project_id, status).await;
        }

        let info = AgentExitInfo {
            exit_code,
            output: agent.collected_output(),
            context_usage: usage.clone(),
        };
        for waiter in lock_mutex_recover(&self.exit_waiters)
            .remove(project_id)
            .unwrap_or_default()
        {
            let _ = waiter.send(info.clone());
        }
        self.emit(ManagerEvent::AgentExit(AgentExitPayload {
            project_id: project_id.to_string(),
            exit_code,
            context_usage: usage,
        }));

        // A freed slot admits the next queued project
        if evicted {
            self.start_next_queued().await;
        }
    }

    /// Promote queued projects into the freed slot. A head entry that fails
    /// to start is dropped and the next one is tried, so one bad entry
    /// cannot starve the rest of the queue.
    async fn start_next_queued(self: &Arc<Self>) {
        while let Some(entry) = self.queue.dequeue() {
            log::info!(
                "[AgentManager] Starting queued project {} after slot freed",
                entry.project_id
            );
            let options = StartAgentOptions {
                instructions: entry.instructions,
                ..Default::default()
            };
            match self.start_agent(&entry.project_id, options).await {
                Ok(_) => return,
                Err(err) => {
                    log::error!(
                        "[AgentManager] Failed to start queued project {}: {}",
                        entry.project_id,
                        err
                    );
                    let _ = self
                        .projects
                        .update_status(&entry.project_id, ProjectStatus::Error)
                        .await;
                }
            }
        }
    }

    /// Persist one conversation message, tracked so shutdown can drain it.
    async fn persist_message(&self, conversation_id: Option<String>, message: Message) {
        let Some(conversation_id) = conversation_id else {
            return;
        };
        let _guard = self.pending_writes.begin();
        if let Err(err) = self.conversations.add_message(&conversation_id, message).await {
            log::warn!(
                "[AgentManager] Failed to persist message to {}: {}",
                conversation_id,
                err
            );
        }
    }

    fn is_current_agent(&self, project_id: &str, agent: &Arc<ProcessAgent>) -> bool {
        match lock_mutex_recover(&self.slots).get(project_id) {
            Some(AgentSlot::Live(current)) => Arc::ptr_eq(current, agent),
            _ => false,
        }
    }

    fn drop_waiters(&self, project_id: &str) {
        lock_mutex_recover(&self.exit_waiters).remove(project_id);
    }

    fn emit(&self, event: ManagerEvent) {
        if let Some(sender) = lock_mutex_recover(&self.event_sender).as_ref() {
            let _ = sender.send(event);
        }
    }
}

fn is_affirmative(reply: &str) -> bool {
    matches!(
        reply,
        "yes" | "y" | "approve" | "approved" | "ok" | "proceed" | "go ahead" | "lgtm"
    )
}

fn is_negative(reply: &str) -> bool {
    matches!(reply, "no" | "n" | "reject" | "rejected" | "cancel")
}

/// Adapter letting the autonomous loop run milestones through the manager.
pub struct ManagerMilestoneExecutor {
    manager: Arc<AgentManager>,
}

impl ManagerMilestoneExecutor {
    pub fn new(manager: Arc<AgentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl MilestoneExecutor for ManagerMilestoneExecutor {
    async fn run_milestone(&self, project_id: &str, instructions: &str) -> Result<MilestoneRun> {
        let options = StartAgentOptions {
            instructions: Some(instructions.to_string()),
            execution_mode: Some(ExecutionMode::Autonomous),
            permission_mode: Some(PermissionMode::AcceptEdits),
            force_new_session: true,
            ..Default::default()
        };
        let rx = self.manager.start_agent_watched(project_id, options).await?;
        let conversation_id = self
            .manager
            .agent_for(project_id)
            .and_then(|agent| agent.spec().session_id.clone());
        let outcome: Pin<Box<dyn Future<Output = Result<String>> + Send>> =
            Box::pin(async move {
                let info = rx
                    .await
                    .map_err(|_| anyhow!("agent exited without reporting an outcome"))?;
                match info.exit_code {
                    Some(0) | None => Ok(info.output),
                    Some(code) => {
                        Err(anyhow!("milestone agent exited with code {}", code).into())
                    }
                }
            });
        Ok(MilestoneRun {
            conversation_id,
            outcome,
        })
    }
}
