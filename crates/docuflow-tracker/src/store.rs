/*
[INPUT]:  Resumable task handles from the orchestrator
[OUTPUT]: JSON-file persistence surviving process restarts
[POS]:    Durability layer - minimal client-side task queue
[UPDATE]: When the handle record format or retry policy changes
*/

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const STORE_FILE_NAME: &str = "pending-tasks.json";
const REMOVE_RETRY_ATTEMPTS: u32 = 3;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Minimal durable record for one resumable task.
///
/// A handle exists exactly as long as a non-terminal task must survive a
/// restart; it is deleted on terminal resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHandle {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub file_name: String,
    pub batch_index: u32,
}

/// File-backed store for pending task handles.
///
/// Every public operation fails soft: storage trouble is logged and absorbed
/// here, never surfaced to the tracking path. A delete that keeps failing is
/// an accepted risk — the resulting phantom resume is harmless because the
/// orchestration downstream is idempotent.
#[derive(Debug)]
pub struct DurableTaskStore {
    path: PathBuf,
    handles: Mutex<HashMap<String, TaskHandle>>,
}

impl DurableTaskStore {
    /// Resolve the default store path under the platform data directory
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow!("Could not determine data directory"))?
            .join("docuflow");
        Ok(data_dir.join(STORE_FILE_NAME))
    }

    /// Open the store at the given path, loading any surviving handles.
    ///
    /// A missing file means an empty store; an unreadable one is logged and
    /// treated as empty rather than taking the tracking layer down with it.
    pub async fn open(path: PathBuf) -> Self {
        if let Some(parent) = path.parent()
            && let Err(err) = fs::create_dir_all(parent).await
        {
            warn!(path = %parent.display(), error = %err, "failed to create task store directory");
        }

        let handles = match Self::load_file(&path).await {
            Ok(handles) => handles,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to load task store; starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            handles: Mutex::new(handles),
        }
    }

    async fn load_file(path: &Path) -> Result<HashMap<String, TaskHandle>> {
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(path).await?;
        let handles: Vec<TaskHandle> = serde_json::from_str(&content)?;
        Ok(handles
            .into_iter()
            .map(|h| (h.task_id.clone(), h))
            .collect())
    }

    /// Make sure a handle is durable.
    ///
    /// `skip_persist` is set when resuming a handle that is already on disk,
    /// avoiding a redundant write of identical bytes.
    pub async fn ensure_task(&self, handle: &TaskHandle, skip_persist: bool) {
        let mut handles = self.handles.lock().await;
        handles.insert(handle.task_id.clone(), handle.clone());

        if skip_persist {
            debug!(task_id = %handle.task_id, "handle already durable; skipping write");
            return;
        }

        if let Err(err) = self.save(&handles).await {
            warn!(task_id = %handle.task_id, error = %err, "failed to persist task handle");
        }
    }

    /// All currently persisted handles, in batch order
    pub async fn load_tasks(&self) -> Vec<TaskHandle> {
        let handles = self.handles.lock().await;
        let mut list: Vec<_> = handles.values().cloned().collect();
        list.sort_by_key(|h| h.batch_index);
        list
    }

    /// Delete a handle, retrying transient write failures.
    ///
    /// A missed delete causes a phantom resume on the next start, so this is
    /// the one storage operation worth retrying.
    pub async fn remove_task_with_retry(&self, task_id: &str) {
        let mut handles = self.handles.lock().await;
        if handles.remove(task_id).is_none() {
            debug!(%task_id, "handle already removed from storage");
            return;
        }

        for attempt in 1..=REMOVE_RETRY_ATTEMPTS {
            match self.save(&handles).await {
                Ok(()) => return,
                Err(err) if attempt < REMOVE_RETRY_ATTEMPTS => {
                    warn!(%task_id, attempt, error = %err, "failed to remove task handle; retrying");
                    tokio::time::sleep(REMOVE_RETRY_DELAY).await;
                }
                Err(err) => {
                    warn!(%task_id, attempt, error = %err, "giving up removing task handle; a phantom resume may follow");
                }
            }
        }
    }

    async fn save(&self, handles: &HashMap<String, TaskHandle>) -> Result<()> {
        let mut list: Vec<_> = handles.values().cloned().collect();
        list.sort_by_key(|h| h.batch_index);
        let content = serde_json::to_string_pretty(&list)?;

        // Atomic write: write to temp file then rename
        let temp_path = self.path.with_extension("tmp");
        fs::write(&temp_path, content)
            .await
            .with_context(|| format!("write {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| format!("rename into {}", self.path.display()))?;
        Ok(())
    }
}
