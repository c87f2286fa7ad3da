// Tracks agent subprocess pids across host restarts and reaps orphans

use crate::error::Result;
use crate::models::TrackedProcess;
use crate::utils::lock_mutex_recover;
use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

pub const TRACKER_FILE_NAME: &str = "processes.json";

/// Interval between the graceful-terminate signal and the liveness re-check.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Aggregate outcome of an orphan cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// Processes that required a signal and died
    pub killed: usize,
    /// Processes that survived the forced kill
    pub failed: usize,
    /// Pids that were already dead
    pub skipped: usize,
}

/// Records the OS pid behind each running agent, persisted to disk so a
/// restart of the host can find and reap processes left behind.
pub struct ProcessTracker {
    state_path: PathBuf,
    processes: Mutex<HashMap<u32, TrackedProcess>>,
}

impl ProcessTracker {
    /// Create a tracker persisting under the given state directory, loading
    /// any records a previous run left behind.
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create {}", state_dir.display()))?;
        let state_path = state_dir.join(TRACKER_FILE_NAME);
        let processes = load_state(&state_path)?;
        if !processes.is_empty() {
            log::info!(
                "[ProcessTracker] Loaded {} tracked process(es) from previous run",
                processes.len()
            );
        }
        Ok(Self {
            state_path,
            processes: Mutex::new(processes),
        })
    }

    /// Tracker rooted at the platform-default state directory.
    pub fn with_default_dir() -> Result<Self> {
        Self::new(&crate::utils::default_state_dir())
    }

    pub fn track_process(&self, pid: u32, project_id: &str) -> Result<()> {
        let snapshot = {
            let mut processes = lock_mutex_recover(&self.processes);
            processes.insert(
                pid,
                TrackedProcess {
                    pid,
                    project_id: project_id.to_string(),
                    started_at: chrono::Utc::now(),
                },
            );
            processes.values().cloned().collect::<Vec<_>>()
        };
        log::debug!("[ProcessTracker] Tracking pid {} for project {}", pid, project_id);
        save_state(&self.state_path, &snapshot)
    }

    pub fn untrack_process(&self, pid: u32) -> Result<()> {
        let snapshot = {
            let mut processes = lock_mutex_recover(&self.processes);
            if processes.remove(&pid).is_none() {
                return Ok(());
            }
            processes.values().cloned().collect::<Vec<_>>()
        };
        log::debug!("[ProcessTracker] Untracked pid {}", pid);
        save_state(&self.state_path, &snapshot)
    }

    pub fn tracked(&self) -> Vec<TrackedProcess> {
        lock_mutex_recover(&self.processes).values().cloned().collect()
    }

    /// Reap processes left over from a previous run.
    ///
    /// Dead pids are dropped silently. Live pids get a terminate signal, a
    /// grace interval, then a forced kill if still alive. One pid failing
    /// never blocks the rest; kills and dead pids are removed from the state
    /// so a second pass finds nothing to do.
    pub async fn cleanup_orphan_processes(&self) -> Result<CleanupReport> {
        let tracked = self.tracked();
        if tracked.is_empty() {
            return Ok(CleanupReport::default());
        }
        log::info!(
            "[ProcessTracker] Checking {} tracked process(es) for orphans",
            tracked.len()
        );

        let mut report = CleanupReport::default();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let mut resolved: Vec<u32> = Vec::new();
        for entry in &tracked {
            let pid = Pid::from_u32(entry.pid);
            let Some(process) = system.process(pid).filter(|p| is_alive(p)) else {
                report.skipped += 1;
                resolved.push(entry.pid);
                continue;
            };

            log::warn!(
                "[ProcessTracker] Terminating orphan pid {} (project {})",
                entry.pid,
                entry.project_id
            );
            if process.kill_with(Signal::Term).is_none() {
                // Platform without Term support; go straight to kill
                process.kill();
            }
            tokio::time::sleep(KILL_GRACE).await;

            system.refresh_processes(ProcessesToUpdate::All, true);
            match system.process(pid).filter(|p| is_alive(p)) {
                None => {
                    report.killed += 1;
                    resolved.push(entry.pid);
                }
                Some(survivor) => {
                    survivor.kill();
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    system.refresh_processes(ProcessesToUpdate::All, true);
                    if system.process(pid).filter(|p| is_alive(p)).is_none() {
                        report.killed += 1;
                        resolved.push(entry.pid);
                    } else {
                        log::error!("[ProcessTracker] Failed to kill orphan pid {}", entry.pid);
                        report.failed += 1;
                    }
                }
            }
        }

        let snapshot = {
            let mut processes = lock_mutex_recover(&self.processes);
            for pid in resolved {
                processes.remove(&pid);
            }
            processes.values().cloned().collect::<Vec<_>>()
        };
        save_state(&self.state_path, &snapshot)?;

        log::info!(
            "[ProcessTracker] Cleanup done: {} killed, {} failed, {} skipped",
            report.killed,
            report.failed,
            report.skipped
        );
        Ok(report)
    }
}

/// A pid that only survives as a zombie has already exited.
fn is_alive(process: &sysinfo::Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn load_state(path: &Path) -> Result<HashMap<u32, TrackedProcess>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let mut file = OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.lock_shared().context("Failed to lock tracker state")?;
    let mut content = String::new();
    let read_result = file.read_to_string(&mut content);
    let _ = file.unlock();
    read_result.with_context(|| format!("Failed to read {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }
    match serde_json::from_str::<Vec<TrackedProcess>>(&content) {
        Ok(entries) => Ok(entries.into_iter().map(|e| (e.pid, e)).collect()),
        Err(err) => {
            // Corrupt state must not block startup
            log::warn!("[ProcessTracker] Discarding corrupt state file: {}", err);
            Ok(HashMap::new())
        }
    }
}

fn save_state(path: &Path, entries: &[TrackedProcess]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.lock_exclusive().context("Failed to lock tracker state")?;
    let result = (|| -> std::io::Result<()> {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        let json = serde_json::to_string_pretty(entries).unwrap_or_else(|_| "[]".to_string());
        file.write_all(json.as_bytes())?;
        file.sync_all()
    })();
    let _ = file.unlock();
    result.with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
