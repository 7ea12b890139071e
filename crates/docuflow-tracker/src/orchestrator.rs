/*
[INPUT]:  TaskInfo + shared BatchContext, notifications via NotificationSource
[OUTPUT]: Exactly-once TaskOutcome per task, registry/store kept consistent
[POS]:    Orchestration layer - wires store, registry, and channel per task
[UPDATE]: When startup sequencing or terminal handling changes
*/

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::channel::NotificationSource;
use crate::lifecycle::{Advance, TaskLifecycle};
use crate::progress::{RECONNECTING_MESSAGE, SUCCESS_MESSAGE, SUCCESS_PERCENT, UPLOADING_MESSAGE};
use crate::registry::{ProgressRegistry, TaskPatch, TaskStatus};
use crate::store::{DurableTaskStore, TaskHandle};

const CHANNEL_CLOSED_ERROR: &str = "push channel closed";

/// Identity of one task entering tracking
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub task_id: String,
    pub document_id: Option<String>,
    pub file_name: String,
    pub batch_index: u32,
}

impl TaskInfo {
    fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.task_id.clone(),
            document_id: self.document_id.clone(),
            file_name: self.file_name.clone(),
            batch_index: self.batch_index,
        }
    }
}

impl From<TaskHandle> for TaskInfo {
    fn from(handle: TaskHandle) -> Self {
        Self {
            task_id: handle.task_id,
            document_id: handle.document_id,
            file_name: handle.file_name,
            batch_index: handle.batch_index,
        }
    }
}

/// Terminal result of tracking one task.
///
/// Failures are values, not errors: batch callers tally outcomes without
/// exception handling, and nothing in the tracking path ever panics a
/// caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed {
        document_id: Option<String>,
        file_name: String,
        batch_index: u32,
    },
    Failed {
        error: String,
        file_name: String,
        batch_index: u32,
    },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    pub fn file_name(&self) -> &str {
        match self {
            TaskOutcome::Completed { file_name, .. } | TaskOutcome::Failed { file_name, .. } => {
                file_name
            }
        }
    }

    pub fn batch_index(&self) -> u32 {
        match self {
            TaskOutcome::Completed { batch_index, .. } | TaskOutcome::Failed { batch_index, .. } => {
                *batch_index
            }
        }
    }
}

#[derive(Debug, Default)]
struct BatchState {
    completed_count: usize,
    first_document_id: Option<String>,
}

/// Counters shared by every task started in one submission.
///
/// `first_document_id` belongs to the batch's first slot (`batch_index` 1),
/// so it is deterministic however completion order falls out.
#[derive(Debug)]
pub struct BatchContext {
    batch_size: usize,
    state: Mutex<BatchState>,
}

impl BatchContext {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            state: Mutex::new(BatchState::default()),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub async fn completed_count(&self) -> usize {
        self.state.lock().await.completed_count
    }

    pub async fn first_document_id(&self) -> Option<String> {
        self.state.lock().await.first_document_id.clone()
    }

    /// Whether every task in the submission reached a terminal state
    pub async fn is_complete(&self) -> bool {
        self.completed_count().await >= self.batch_size
    }

    async fn record_terminal(&self, batch_index: u32, success_document_id: Option<&str>) -> usize {
        let mut state = self.state.lock().await;
        state.completed_count += 1;
        if batch_index == 1
            && let Some(document_id) = success_document_id
        {
            state.first_document_id = Some(document_id.to_string());
        }
        state.completed_count
    }
}

/// Per-task progress orchestration over store, registry, and channel.
pub struct TaskTracker {
    registry: Arc<ProgressRegistry>,
    store: Arc<DurableTaskStore>,
    source: Arc<dyn NotificationSource>,
    restore_started: AtomicBool,
}

impl TaskTracker {
    pub fn new(
        registry: Arc<ProgressRegistry>,
        store: Arc<DurableTaskStore>,
        source: Arc<dyn NotificationSource>,
    ) -> Self {
        Self {
            registry,
            store,
            source,
            restore_started: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &Arc<ProgressRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<DurableTaskStore> {
        &self.store
    }

    /// Claim the restore slot; only the first caller gets `true`
    pub(crate) fn mark_restore_started(&self) -> bool {
        !self.restore_started.swap(true, Ordering::SeqCst)
    }

    /// Track one task to its terminal state.
    ///
    /// Startup order: persist the handle (unless resuming one that is
    /// already durable), register in the tracker, then subscribe. The
    /// returned outcome resolves exactly once; duplicate terminal
    /// notifications are absorbed by the lifecycle machine.
    pub async fn track_task(
        &self,
        info: TaskInfo,
        batch: Arc<BatchContext>,
        skip_persist: bool,
    ) -> TaskOutcome {
        self.store.ensure_task(&info.handle(), skip_persist).await;

        let initial_message = if skip_persist {
            RECONNECTING_MESSAGE
        } else {
            UPLOADING_MESSAGE
        };
        self.registry
            .add_task(&info.task_id, &info.file_name, info.batch_index, initial_message)
            .await;

        let mut events = self.source.subscribe(&info.task_id).await;
        let mut lifecycle = TaskLifecycle::new();

        loop {
            let Some(event) = events.recv().await else {
                // The channel went away underneath us. The durable handle is
                // deliberately left in place so the next start resumes this
                // task instead of silently dropping it.
                warn!(task_id = %info.task_id, "push channel closed while task in flight");
                return TaskOutcome::Failed {
                    error: CHANNEL_CLOSED_ERROR.to_string(),
                    file_name: info.file_name.clone(),
                    batch_index: info.batch_index,
                };
            };

            match lifecycle.apply(event) {
                None => {
                    debug!(task_id = %info.task_id, "ignored late or unmapped notification");
                }
                Some(Advance::Progress { percent, message }) => {
                    self.registry
                        .update_task(
                            &info.task_id,
                            TaskPatch {
                                progress_percent: Some(percent),
                                status_message: Some(message.to_string()),
                                ..Default::default()
                            },
                        )
                        .await;
                }
                Some(Advance::Completed { document }) => {
                    let document_id = document
                        .map(|d| d.id)
                        .or_else(|| info.document_id.clone());

                    self.registry
                        .update_task(
                            &info.task_id,
                            TaskPatch {
                                document_id: document_id.clone(),
                                status: Some(TaskStatus::Success),
                                progress_percent: Some(SUCCESS_PERCENT),
                                status_message: Some(SUCCESS_MESSAGE.to_string()),
                            },
                        )
                        .await;
                    self.finish_task(&info.task_id).await;

                    let completed = batch
                        .record_terminal(info.batch_index, document_id.as_deref())
                        .await;
                    info!(
                        task_id = %info.task_id,
                        file_name = %info.file_name,
                        completed,
                        batch_size = batch.batch_size(),
                        "task completed"
                    );

                    return TaskOutcome::Completed {
                        document_id,
                        file_name: info.file_name.clone(),
                        batch_index: info.batch_index,
                    };
                }
                Some(Advance::Failed { error }) => {
                    self.registry
                        .update_task(
                            &info.task_id,
                            TaskPatch {
                                status: Some(TaskStatus::Failed),
                                status_message: Some(format!("✗ {error}")),
                                ..Default::default()
                            },
                        )
                        .await;
                    self.finish_task(&info.task_id).await;

                    let completed = batch.record_terminal(info.batch_index, None).await;
                    warn!(
                        task_id = %info.task_id,
                        file_name = %info.file_name,
                        %error,
                        completed,
                        batch_size = batch.batch_size(),
                        "task failed"
                    );

                    return TaskOutcome::Failed {
                        error,
                        file_name: info.file_name.clone(),
                        batch_index: info.batch_index,
                    };
                }
            }
        }
    }

    /// Terminal teardown: clear the durable handle, then drop the subscription
    async fn finish_task(&self, task_id: &str) {
        self.store.remove_task_with_retry(task_id).await;
        self.source.unsubscribe(task_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn batch_context_counts_terminals() {
        let batch = BatchContext::new(3);
        assert!(!batch.is_complete().await);

        batch.record_terminal(2, Some("doc-b")).await;
        batch.record_terminal(3, None).await;
        assert_eq!(batch.completed_count().await, 2);
        assert_eq!(batch.first_document_id().await, None);

        batch.record_terminal(1, Some("doc-a")).await;
        assert!(batch.is_complete().await);
        assert_eq!(batch.first_document_id().await, Some("doc-a".to_string()));
    }

    #[tokio::test]
    async fn batch_first_document_requires_success() {
        let batch = BatchContext::new(1);
        batch.record_terminal(1, None).await;
        assert!(batch.is_complete().await);
        assert_eq!(batch.first_document_id().await, None);
    }

    #[test]
    fn outcome_accessors() {
        let outcome = TaskOutcome::Failed {
            error: "boom".to_string(),
            file_name: "c.pdf".to_string(),
            batch_index: 3,
        };
        assert!(!outcome.is_success());
        assert_eq!(outcome.file_name(), "c.pdf");
        assert_eq!(outcome.batch_index(), 3);
    }
}
