/*
[INPUT]:  The push channel manager from docuflow-channel
[OUTPUT]: Notification-source seam consumed by the orchestrator
[POS]:    Integration layer - channel access behind a narrow trait
[UPDATE]: When the orchestrator needs new channel capabilities
*/

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};

use docuflow_channel::{ConnectionState, PushChannelManager, TaskEvent};

/// What the orchestrator needs from the push channel.
///
/// Tests substitute an in-memory implementation; production wires in
/// [`SharedPushChannel`].
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Register the single handler for a task and request server pushes
    async fn subscribe(&self, task_id: &str) -> mpsc::UnboundedReceiver<TaskEvent>;

    /// Drop the handler and request the server stop pushing
    async fn unsubscribe(&self, task_id: &str);

    /// Current link state of the underlying connection
    async fn is_connected(&self) -> bool;
}

/// Process-wide shared handle to the one push channel connection.
#[derive(Clone)]
pub struct SharedPushChannel {
    inner: Arc<Mutex<PushChannelManager>>,
}

impl SharedPushChannel {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self::from_manager(PushChannelManager::new(ws_url))
    }

    pub fn from_manager(manager: PushChannelManager) -> Self {
        Self {
            inner: Arc::new(Mutex::new(manager)),
        }
    }

    pub async fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.lock().await.connection_state()
    }

    pub async fn shutdown(&self) {
        self.inner.lock().await.shutdown();
    }
}

#[async_trait]
impl NotificationSource for SharedPushChannel {
    async fn subscribe(&self, task_id: &str) -> mpsc::UnboundedReceiver<TaskEvent> {
        self.inner.lock().await.subscribe_task(task_id)
    }

    async fn unsubscribe(&self, task_id: &str) {
        self.inner.lock().await.unsubscribe_task(task_id);
    }

    async fn is_connected(&self) -> bool {
        self.inner.lock().await.is_connected()
    }
}
