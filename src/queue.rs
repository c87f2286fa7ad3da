// FIFO admission queue for projects waiting on a free agent slot

use crate::events::{QueueChangePayload, QueueEntryInfo};
use crate::models::QueuedProject;
use crate::utils::lock_mutex_recover;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc::UnboundedSender;

/// FIFO queue of projects whose start request exceeded the concurrency cap.
///
/// Membership checks are O(1) via a set kept in sync with the queue.
/// A change notification is sent only when state actually changed.
pub struct AgentQueue {
    inner: Mutex<QueueInner>,
    change_sender: Mutex<Option<UnboundedSender<QueueChangePayload>>>,
}

struct QueueInner {
    entries: VecDeque<QueuedProject>,
    members: HashSet<String>,
}

impl AgentQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                members: HashSet::new(),
            }),
            change_sender: Mutex::new(None),
        }
    }

    /// Set the sender used for queue change notifications.
    pub fn set_change_sender(&self, sender: UnboundedSender<QueueChangePayload>) {
        *lock_mutex_recover(&self.change_sender) = Some(sender);
    }

    /// Append a project to the queue. Returns false if it is already queued.
    pub fn enqueue(&self, project_id: &str, instructions: Option<String>) -> bool {
        let snapshot = {
            let mut inner = lock_mutex_recover(&self.inner);
            if inner.members.contains(project_id) {
                return false;
            }
            inner.members.insert(project_id.to_string());
            inner.entries.push_back(QueuedProject {
                project_id: project_id.to_string(),
                instructions,
                queued_at: chrono::Utc::now(),
            });
            snapshot_of(&inner)
        };
        log::info!("[AgentQueue] Enqueued project {}", project_id);
        self.notify(snapshot);
        true
    }

    /// FIFO pop. Returns None on an empty queue.
    pub fn dequeue(&self) -> Option<QueuedProject> {
        let (entry, snapshot) = {
            let mut inner = lock_mutex_recover(&self.inner);
            let entry = inner.entries.pop_front()?;
            inner.members.remove(&entry.project_id);
            (entry, snapshot_of(&inner))
        };
        log::info!("[AgentQueue] Dequeued project {}", entry.project_id);
        self.notify(snapshot);
        Some(entry)
    }

    /// Remove a project wherever it sits in the queue.
    /// Returns false (and notifies nobody) if it was not queued.
    pub fn remove_from_queue(&self, project_id: &str) -> bool {
        let snapshot = {
            let mut inner = lock_mutex_recover(&self.inner);
            if !inner.members.remove(project_id) {
                return false;
            }
            inner.entries.retain(|e| e.project_id != project_id);
            snapshot_of(&inner)
        };
        log::info!("[AgentQueue] Removed project {} from queue", project_id);
        self.notify(snapshot);
        true
    }

    /// Drop all queued entries. Notifies only if the queue was non-empty.
    pub fn clear(&self) -> bool {
        let snapshot = {
            let mut inner = lock_mutex_recover(&self.inner);
            if inner.entries.is_empty() {
                return false;
            }
            inner.entries.clear();
            inner.members.clear();
            snapshot_of(&inner)
        };
        log::info!("[AgentQueue] Cleared queue");
        self.notify(snapshot);
        true
    }

    pub fn is_queued(&self, project_id: &str) -> bool {
        lock_mutex_recover(&self.inner).members.contains(project_id)
    }

    pub fn len(&self) -> usize {
        lock_mutex_recover(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current queue contents in admission order.
    pub fn snapshot(&self) -> QueueChangePayload {
        snapshot_of(&lock_mutex_recover(&self.inner))
    }

    fn notify(&self, payload: QueueChangePayload) {
        if let Some(sender) = lock_mutex_recover(&self.change_sender).as_ref() {
            let _ = sender.send(payload);
        }
    }
}

impl Default for AgentQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn snapshot_of(inner: &QueueInner) -> QueueChangePayload {
    QueueChangePayload {
        queued: inner
            .entries
            .iter()
            .map(|e| QueueEntryInfo {
                project_id: e.project_id.clone(),
                queued_at: e.queued_at.to_rfc3339(),
            })
            .collect(),
    }
}
