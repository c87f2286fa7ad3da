// Process Agent: owns one external agent subprocess and presents it as a
// typed event source

pub mod command;

pub use command::{build_agent_command, resolve_agent_binary, AgentLaunchSpec};

use crate::error::{ForemanError, Result};
use crate::models::{ContextUsage, ExecutionMode, RunStatus};
use crate::protocol::{
    tool_result_envelope, user_blocks_envelope, user_message_envelope, StreamEvent, StreamParser,
};
use crate::utils::lock_mutex_recover;
use anyhow::anyhow;
use serde_json::Value;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;

/// Grace period between the terminate signal and the forced kill.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Lines of collected output retained per agent.
const OUTPUT_LINE_CAP: usize = 2000;

/// Events emitted by one running agent.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Assistant-authored text
    Message { project_id: String, content: String },
    Status {
        project_id: String,
        old: RunStatus,
        new: RunStatus,
    },
    WaitingForInput {
        project_id: String,
        waiting: bool,
        version: u64,
        plan: Option<String>,
    },
    ToolUse {
        project_id: String,
        tool_id: String,
        tool_name: String,
        input: Value,
    },
    Usage {
        project_id: String,
        usage: ContextUsage,
    },
    SessionNotFound {
        project_id: String,
        session_id: String,
    },
    EnterPlanMode { project_id: String },
    ExitPlanMode { project_id: String, plan: String },
    /// A stdout line that was not a recognized protocol event
    RawOutput { project_id: String, line: String },
    Exit {
        project_id: String,
        exit_code: Option<i32>,
    },
}

/// Ring of the most recent output lines.
#[derive(Debug, Default)]
pub struct CollectedOutput {
    lines: VecDeque<String>,
}

impl CollectedOutput {
    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == OUTPUT_LINE_CAP {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn text(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// One external agent process, spawned from a launch spec.
///
/// The reader task translates stdout into `AgentEvent`s delivered in
/// process-output order. All agent state mutation happens here; the manager
/// only observes events.
pub struct ProcessAgent {
    spec: AgentLaunchSpec,
    status: Mutex<RunStatus>,
    child: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pid: Mutex<Option<u32>>,
    exit_code: Mutex<Option<i32>>,
    waiting: AtomicBool,
    waiting_version: AtomicU64,
    context_usage: Mutex<ContextUsage>,
    output: Mutex<CollectedOutput>,
    last_command: Mutex<Option<String>>,
    events: UnboundedSender<AgentEvent>,
    exit_notify: Notify,
    stop_requested: AtomicBool,
}

impl ProcessAgent {
    pub fn new(spec: AgentLaunchSpec, events: UnboundedSender<AgentEvent>) -> Arc<Self> {
        Arc::new(Self {
            spec,
            status: Mutex::new(RunStatus::Stopped),
            child: tokio::sync::Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            pid: Mutex::new(None),
            exit_code: Mutex::new(None),
            waiting: AtomicBool::new(false),
            waiting_version: AtomicU64::new(0),
            context_usage: Mutex::new(ContextUsage::new()),
            output: Mutex::new(CollectedOutput::default()),
            last_command: Mutex::new(None),
            events,
            exit_notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.spec.project_id
    }

    pub fn spec(&self) -> &AgentLaunchSpec {
        &self.spec
    }

    pub fn status(&self) -> RunStatus {
        *lock_mutex_recover(&self.status)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), RunStatus::Starting | RunStatus::Running)
    }

    pub fn pid(&self) -> Option<u32> {
        *lock_mutex_recover(&self.pid)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *lock_mutex_recover(&self.exit_code)
    }

    pub fn context_usage(&self) -> ContextUsage {
        lock_mutex_recover(&self.context_usage).clone()
    }

    pub fn collected_output(&self) -> String {
        lock_mutex_recover(&self.output).text()
    }

    pub fn last_command(&self) -> Option<String> {
        lock_mutex_recover(&self.last_command).clone()
    }

    pub fn waiting_version(&self) -> u64 {
        self.waiting_version.load(Ordering::SeqCst)
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Spawn the process and begin reading its output. Returns the OS pid.
    pub async fn start(self: &Arc<Self>, initial_input: Option<&str>) -> Result<u32> {
        if self.is_running() {
            return Err(ForemanError::AlreadyRunning(self.spec.project_id.clone()));
        }
        self.set_status(RunStatus::Starting);

        let mut cmd = build_agent_command(&self.spec)?;
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| ForemanError::Spawn(format!("{}", err)))?;
        let pid = child
            .id()
            .ok_or_else(|| ForemanError::Spawn("process exited before pid was read".into()))?;
        *lock_mutex_recover(&self.pid) = Some(pid);
        log::info!(
            "[ProcessAgent] Started agent for project {} (pid {})",
            self.spec.project_id,
            pid
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Spawn("failed to capture stdout".into()))?;
        let stderr = child.stderr.take();
        *self.stdin.lock().await = child.stdin.take();
        *self.child.lock().await = Some(child);

        self.set_status(RunStatus::Running);

        if let Some(stderr) = stderr {
            let project_id = self.spec.project_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        log::warn!("[ProcessAgent] {} stderr: {}", project_id, line);
                    }
                }
            });
        }

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            agent.read_output(stdout).await;
        });

        if let Some(input) = initial_input {
            self.send_input(input).await?;
        }

        Ok(pid)
    }

    /// Write a plain text user message to the process.
    pub async fn send_input(&self, text: &str) -> Result<()> {
        self.write_line(&user_message_envelope(text)).await?;
        *lock_mutex_recover(&self.last_command) = Some(text.to_string());
        self.set_waiting(false, None);
        Ok(())
    }

    /// Write structured content blocks (text plus images). The payload must
    /// be a JSON array of content blocks.
    pub async fn send_blocks(&self, blocks: &Value) -> Result<()> {
        if !blocks.is_array() {
            return Err(anyhow!("structured content must be a JSON array of blocks").into());
        }
        self.write_line(&user_blocks_envelope(blocks)).await?;
        self.set_waiting(false, None);
        Ok(())
    }

    /// Respond to a pending tool-use request.
    pub async fn send_tool_result(&self, tool_use_id: &str, content: &str) -> Result<()> {
        self.write_line(&tool_result_envelope(tool_use_id, content))
            .await
    }

    /// Close the process's stdin. For one-shot runs the process exits after
    /// handling the buffered input.
    pub async fn close_input(&self) {
        *self.stdin.lock().await = None;
    }

    /// Request graceful termination, escalating to a forced kill after the
    /// grace period. Returns true when the process exited gracefully.
    /// Idempotent: stopping a stopped agent succeeds.
    pub async fn stop(&self) -> Result<bool> {
        if !self.is_running() {
            return Ok(true);
        }
        self.stop_requested.store(true, Ordering::SeqCst);
        log::info!(
            "[ProcessAgent] Stopping agent for project {}",
            self.spec.project_id
        );

        if let Some(pid) = self.pid() {
            terminate_pid(pid);
        }

        if tokio::time::timeout(STOP_GRACE, self.exit_notify.notified())
            .await
            .is_ok()
            || !self.is_running()
        {
            return Ok(true);
        }

        log::warn!(
            "[ProcessAgent] Agent for project {} did not exit within grace period, killing",
            self.spec.project_id
        );
        if let Some(child) = self.child.lock().await.as_mut() {
            let _ = child.start_kill();
        }
        let _ = tokio::time::timeout(STOP_GRACE, self.exit_notify.notified()).await;
        Ok(false)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        if !self.is_running() {
            return Err(ForemanError::NotRunning(self.spec.project_id.clone()));
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ForemanError::NotRunning(self.spec.project_id.clone()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| ForemanError::Io(err))?;
        stdin.write_all(b"\n").await.map_err(ForemanError::Io)?;
        stdin.flush().await.map_err(ForemanError::Io)?;
        Ok(())
    }

    async fn read_output(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut parser = StreamParser::new();
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    for event in parser.push(&format!("{}\n", line)) {
                        self.handle_stream_event(event);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::warn!(
                        "[ProcessAgent] Read error for project {}: {}",
                        self.spec.project_id,
                        err
                    );
                    break;
                }
            }
        }
        for event in parser.flush() {
            self.handle_stream_event(event);
        }

        let exit_code = match self.child.lock().await.take() {
            Some(mut child) => match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    log::warn!(
                        "[ProcessAgent] Wait failed for project {}: {}",
                        self.spec.project_id,
                        err
                    );
                    None
                }
            },
            None => None,
        };
        *lock_mutex_recover(&self.exit_code) = exit_code;

        if self.is_waiting() {
            self.set_waiting(false, None);
        }
        let final_status = match exit_code {
            Some(0) | None => RunStatus::Stopped,
            Some(_) if self.stop_requested.load(Ordering::SeqCst) => RunStatus::Stopped,
            Some(_) => RunStatus::Error,
        };
        self.set_status(final_status);
        self.exit_notify.notify_waiters();
        log::info!(
            "[ProcessAgent] Agent for project {} exited with code {:?}",
            self.spec.project_id,
            exit_code
        );
        self.emit(AgentEvent::Exit {
            project_id: self.spec.project_id.clone(),
            exit_code,
        });
    }

    fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::AssistantText(text) => {
                lock_mutex_recover(&self.output).push(text.clone());
                self.emit(AgentEvent::Message {
                    project_id: self.spec.project_id.clone(),
                    content: text,
                });
            }
            StreamEvent::ToolUse {
                tool_id,
                tool_name,
                input,
            } => {
                self.emit(AgentEvent::ToolUse {
                    project_id: self.spec.project_id.clone(),
                    tool_id,
                    tool_name,
                    input,
                });
            }
            StreamEvent::Usage {
                input_tokens,
                output_tokens,
                cache_read_tokens,
                cache_creation_tokens,
            } => {
                let usage = {
                    let mut usage = lock_mutex_recover(&self.context_usage);
                    usage.record(
                        input_tokens,
                        output_tokens,
                        cache_read_tokens,
                        cache_creation_tokens,
                    );
                    usage.clone()
                };
                self.emit(AgentEvent::Usage {
                    project_id: self.spec.project_id.clone(),
                    usage,
                });
            }
            StreamEvent::Result { is_error, detail } => {
                if is_error {
                    log::warn!(
                        "[ProcessAgent] Turn for project {} ended with error: {}",
                        self.spec.project_id,
                        detail
                    );
                }
                // In interactive mode the turn end means the agent awaits
                // the next user message
                if self.spec.execution_mode == ExecutionMode::Interactive && !is_error {
                    self.set_waiting(true, None);
                }
            }
            StreamEvent::EnterPlanMode => {
                self.emit(AgentEvent::EnterPlanMode {
                    project_id: self.spec.project_id.clone(),
                });
            }
            StreamEvent::ExitPlanMode { plan } => {
                self.emit(AgentEvent::ExitPlanMode {
                    project_id: self.spec.project_id.clone(),
                    plan: plan.clone(),
                });
                // Plan proposal halts the process for approval; surfaced as
                // a synthetic wait carrying the plan content
                self.set_waiting(true, Some(plan));
            }
            StreamEvent::SessionNotFound { session_id } => {
                self.emit(AgentEvent::SessionNotFound {
                    project_id: self.spec.project_id.clone(),
                    session_id,
                });
            }
            StreamEvent::RawText(line) => {
                lock_mutex_recover(&self.output).push(line.clone());
                self.emit(AgentEvent::RawOutput {
                    project_id: self.spec.project_id.clone(),
                    line,
                });
            }
        }
    }

    fn set_status(&self, new: RunStatus) {
        let old = {
            let mut status = lock_mutex_recover(&self.status);
            let old = *status;
            *status = new;
            old
        };
        if old != new {
            self.emit(AgentEvent::Status {
                project_id: self.spec.project_id.clone(),
                old,
                new,
            });
        }
    }

    fn set_waiting(&self, waiting: bool, plan: Option<String>) {
        self.waiting.store(waiting, Ordering::SeqCst);
        let version = self.waiting_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(AgentEvent::WaitingForInput {
            project_id: self.spec.project_id.clone(),
            waiting,
            version,
            plan,
        });
    }

    fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }
}

/// Send a graceful terminate signal to a pid.
fn terminate_pid(pid: u32) {
    use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), false);
    if let Some(process) = system.process(Pid::from_u32(pid)) {
        if process.kill_with(Signal::Term).is_none() {
            process.kill();
        }
    }
}
