/*
[INPUT]:  Task state mutations from the orchestrator
[OUTPUT]: Session-scoped task map + snapshot broadcasts for UI observation
[POS]:    Presentation-facing state layer - never persisted
[UPDATE]: When adding observable task fields or changing snapshot semantics
*/

use std::collections::HashMap;

use tokio::sync::{Mutex, watch};
use tracing::debug;

/// Client-visible status of a tracked task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Processing,
    Success,
    Failed,
}

/// One tracked task as the UI observes it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedTask {
    pub task_id: String,
    pub document_id: Option<String>,
    pub file_name: String,
    pub batch_index: u32,
    pub status: TaskStatus,
    pub progress_percent: u8,
    pub status_message: String,
}

/// Partial update merged into an existing entry
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub document_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub progress_percent: Option<u8>,
    pub status_message: Option<String>,
}

/// In-memory view of every task tracked in the current session.
///
/// Consumers observe it through a `watch` snapshot; entries survive until
/// explicitly removed, so terminal states stay visible until dismissed.
#[derive(Debug)]
pub struct ProgressRegistry {
    tasks: Mutex<HashMap<String, TrackedTask>>,
    snapshot_tx: watch::Sender<Vec<TrackedTask>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        let (snapshot_tx, _rx) = watch::channel(Vec::new());
        Self {
            tasks: Mutex::new(HashMap::new()),
            snapshot_tx,
        }
    }

    /// Subscribe to snapshot updates; the receiver always holds the latest view
    pub fn subscribe(&self) -> watch::Receiver<Vec<TrackedTask>> {
        self.snapshot_tx.subscribe()
    }

    /// Upsert an entry with default progress state
    pub async fn add_task(
        &self,
        task_id: &str,
        file_name: &str,
        batch_index: u32,
        status_message: &str,
    ) {
        let mut tasks = self.tasks.lock().await;
        tasks.insert(
            task_id.to_string(),
            TrackedTask {
                task_id: task_id.to_string(),
                document_id: None,
                file_name: file_name.to_string(),
                batch_index,
                status: TaskStatus::Processing,
                progress_percent: 0,
                status_message: status_message.to_string(),
            },
        );
        self.publish(&tasks);
    }

    /// Merge a patch into an entry.
    ///
    /// A patch for a task that was already removed is dropped: late or
    /// duplicate notifications must not resurrect entries. Displayed progress
    /// never moves backwards, whatever order step notifications arrive in.
    pub async fn update_task(&self, task_id: &str, patch: TaskPatch) {
        let mut tasks = self.tasks.lock().await;
        let Some(task) = tasks.get_mut(task_id) else {
            debug!(%task_id, "update for task no longer in registry");
            return;
        };

        if let Some(document_id) = patch.document_id {
            task.document_id = Some(document_id);
        }
        if let Some(status) = patch.status {
            task.status = status;
        }
        if let Some(percent) = patch.progress_percent {
            task.progress_percent = task.progress_percent.max(percent);
        }
        if let Some(message) = patch.status_message {
            task.status_message = message;
        }

        self.publish(&tasks);
    }

    /// Delete an entry (the UI's dismissal hook)
    pub async fn remove_task(&self, task_id: &str) {
        let mut tasks = self.tasks.lock().await;
        if tasks.remove(task_id).is_some() {
            self.publish(&tasks);
        }
    }

    pub async fn get_task(&self, task_id: &str) -> Option<TrackedTask> {
        self.tasks.lock().await.get(task_id).cloned()
    }

    /// Current view, ordered by batch position
    pub async fn snapshot(&self) -> Vec<TrackedTask> {
        let tasks = self.tasks.lock().await;
        sorted_snapshot(&tasks)
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    fn publish(&self, tasks: &HashMap<String, TrackedTask>) {
        let _ = self.snapshot_tx.send(sorted_snapshot(tasks));
    }
}

impl Default for ProgressRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_snapshot(tasks: &HashMap<String, TrackedTask>) -> Vec<TrackedTask> {
    let mut list: Vec<_> = tasks.values().cloned().collect();
    list.sort_by(|a, b| {
        a.batch_index
            .cmp(&b.batch_index)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    list
}
