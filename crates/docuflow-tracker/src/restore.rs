/*
[INPUT]:  Durable task handles surviving a restart
[OUTPUT]: One resumed tracking task per handle, sharing a batch context
[POS]:    Startup layer - runs once per process start
[UPDATE]: When resume sequencing or the settle delay changes
*/

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::orchestrator::{BatchContext, TaskInfo, TaskOutcome, TaskTracker};

/// Grace period before reading the store, so registry observers finish
/// mounting before the first resumed updates land.
const RESTORE_SETTLE_DELAY: Duration = Duration::from_millis(150);

/// Resumed tasks plus the batch context they share
pub struct RestoredBatch {
    pub batch: Arc<BatchContext>,
    pub tasks: Vec<JoinHandle<TaskOutcome>>,
}

impl RestoredBatch {
    fn empty() -> Self {
        Self {
            batch: Arc::new(BatchContext::new(0)),
            tasks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Resume every task whose handle survived the previous run.
///
/// Runs at most once per process; later calls return an empty batch. Each
/// resumed task skips the redundant persist and reports aggregate progress
/// through one shared batch context, exactly like a freshly started batch.
pub async fn restore_pending_tasks(tracker: Arc<TaskTracker>) -> RestoredBatch {
    if !tracker.mark_restore_started() {
        warn!("task restore already ran in this process");
        return RestoredBatch::empty();
    }

    tokio::time::sleep(RESTORE_SETTLE_DELAY).await;

    let mut handles = tracker.store().load_tasks().await;
    if handles.is_empty() {
        return RestoredBatch::empty();
    }
    handles.sort_by_key(|handle| handle.batch_index);

    info!(count = handles.len(), "resuming tasks from durable storage");

    let batch = Arc::new(BatchContext::new(handles.len()));
    let tasks = handles
        .into_iter()
        .map(|handle| {
            let tracker = tracker.clone();
            let batch = batch.clone();
            tokio::spawn(async move {
                tracker
                    .track_task(TaskInfo::from(handle), batch, true)
                    .await
            })
        })
        .collect();

    RestoredBatch { batch, tasks }
}
