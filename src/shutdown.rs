// Graceful shutdown: signal trapping and in-flight persistence tracking

use anyhow::Result;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared shutdown state across the application
#[derive(Clone)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
    cleanup_complete: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            cleanup_complete: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        log::info!("Shutdown requested");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn mark_cleanup_complete(&self) {
        self.cleanup_complete.store(true, Ordering::SeqCst);
        log::info!("Cleanup complete");
    }

    pub fn is_cleanup_complete(&self) -> bool {
        self.cleanup_complete.load(Ordering::SeqCst)
    }

    /// Reset shutdown state (for testing)
    pub fn reset(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
        self.cleanup_complete.store(false, Ordering::SeqCst);
    }
}

impl Default for ShutdownState {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of graceful shutdown cleanup
#[derive(Debug, Clone, Default)]
pub struct ShutdownResult {
    /// Number of agents that were stopped
    pub agents_stopped: usize,
    /// Agents that had to be force-killed after the grace period
    pub agents_killed: usize,
    /// Queued projects dropped without running
    pub queue_dropped: usize,
    /// Any errors encountered during cleanup
    pub errors: Vec<String>,
}

impl ShutdownResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if shutdown was clean (no errors)
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Tracks persistence operations that were started but not awaited inline.
///
/// Shutdown drains this set to zero before declaring the system stopped, so
/// no conversation write is lost to a racing exit.
pub struct PendingWrites {
    count: AtomicUsize,
    drained: Notify,
}

impl PendingWrites {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    /// Register one in-flight write. Completion is marked when the returned
    /// guard drops.
    pub fn begin(self: &Arc<Self>) -> PendingWriteGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        PendingWriteGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until every registered write has completed.
    pub async fn drain(&self) {
        loop {
            // Arm the waiter before re-checking so a completion between the
            // check and the await cannot be missed
            let notified = self.drained.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn complete_one(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

/// RAII marker for one in-flight write.
pub struct PendingWriteGuard {
    tracker: Arc<PendingWrites>,
}

impl Drop for PendingWriteGuard {
    fn drop(&mut self) {
        self.tracker.complete_one();
    }
}

/// Register signal handlers for graceful shutdown
/// This sets up handlers for SIGINT (Ctrl+C), SIGTERM, and SIGHUP
#[cfg(unix)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::thread;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])
        .map_err(|e| anyhow::anyhow!("Failed to register signal handlers: {}", e))?;

    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT => {
                    log::info!("Received SIGINT (Ctrl+C)");
                    state.request_shutdown();
                }
                SIGTERM => {
                    log::info!("Received SIGTERM");
                    state.request_shutdown();
                }
                SIGHUP => {
                    log::info!("Received SIGHUP");
                    state.request_shutdown();
                }
                _ => {}
            }
        }
    });

    log::info!("Signal handlers registered (SIGINT, SIGTERM, SIGHUP)");
    Ok(())
}

/// Register signal handlers for Windows
#[cfg(windows)]
pub fn register_signal_handlers(state: ShutdownState) -> Result<()> {
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C");
        state.request_shutdown();
    })
    .map_err(|e| anyhow::anyhow!("Failed to register Ctrl+C handler: {}", e))?;

    log::info!("Signal handler registered (Ctrl+C)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_state_new() {
        let state = ShutdownState::new();
        assert!(!state.is_shutdown_requested());
        assert!(!state.is_cleanup_complete());
    }

    #[test]
    fn test_request_shutdown() {
        let state = ShutdownState::new();
        state.request_shutdown();
        assert!(state.is_shutdown_requested());
    }

    #[test]
    fn test_shutdown_state_clone_shares() {
        let state1 = ShutdownState::new();
        let state2 = state1.clone();
        state1.request_shutdown();
        assert!(state2.is_shutdown_requested());
    }

    #[test]
    fn test_shutdown_state_reset() {
        let state = ShutdownState::new();
        state.request_shutdown();
        state.mark_cleanup_complete();
        state.reset();
        assert!(!state.is_shutdown_requested());
        assert!(!state.is_cleanup_complete());
    }

    #[test]
    fn test_shutdown_result_is_clean() {
        let mut result = ShutdownResult::new();
        assert!(result.is_clean());
        result.errors.push("Some error".to_string());
        assert!(!result.is_clean());
    }

    #[tokio::test]
    async fn test_pending_writes_drain_empty() {
        let writes = PendingWrites::new();
        writes.drain().await;
        assert_eq!(writes.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pending_writes_guard_completes_on_drop() {
        let writes = PendingWrites::new();
        let guard = writes.begin();
        assert_eq!(writes.in_flight(), 1);
        drop(guard);
        assert_eq!(writes.in_flight(), 0);
        writes.drain().await;
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_write() {
        let writes = PendingWrites::new();
        let guard = writes.begin();
        let tracker = Arc::clone(&writes);
        let handle = tokio::spawn(async move {
            tracker.drain().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!handle.is_finished());
        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
