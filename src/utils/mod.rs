// Utility functions

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Get the `.foreman` state directory for a project.
#[inline]
pub fn foreman_dir(project_path: &Path) -> PathBuf {
    project_path.join(".foreman")
}

/// Default location for host-level state (tracked processes, settings).
///
/// Falls back to the current directory when no platform data dir exists.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("foreman"))
        .unwrap_or_else(|| PathBuf::from(".foreman"))
}

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// This is useful when you want to continue even if a previous thread panicked.
/// The mutex state may be inconsistent, so use with caution.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}
