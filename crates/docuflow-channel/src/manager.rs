/*
[INPUT]:  Push channel URL + per-task subscriptions
[OUTPUT]: Per-task notification streams + connection state notifications
[POS]:    Channel layer - one multiplexed auto-reconnecting connection
[UPDATE]: When changing subscription, reconnection backoff, or dispatch semantics
*/

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::TaskSocket;
use crate::error::{ChannelError, Result};
use crate::message::{ControlFrame, TaskEvent, TaskFrame};

const DEFAULT_MAX_RETRIES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection attempt is in flight (nothing tracked, or worker stopped)
    Idle,
    Connected,
    Reconnecting { retry_count: u32 },
}

#[derive(Debug)]
enum ManagerCommand {
    Track {
        task_id: String,
        event_tx: mpsc::UnboundedSender<TaskEvent>,
    },
    Untrack {
        task_id: String,
    },
    Shutdown,
}

/// Multiplexes task notifications over a single WebSocket connection.
///
/// Exactly one physical connection exists regardless of how many tasks are
/// tracked. The internal worker starts lazily on the first subscription and
/// replays a subscribe frame for every tracked task after each reconnect.
#[derive(Debug)]
pub struct PushChannelManager {
    ws_url: String,
    handlers: HashMap<String, mpsc::UnboundedSender<TaskEvent>>,
    connection_state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    cmd_tx: mpsc::UnboundedSender<ManagerCommand>,
    cmd_rx: Option<mpsc::UnboundedReceiver<ManagerCommand>>,
    worker_handle: Option<tokio::task::JoinHandle<()>>,
    auto_connect: bool,
}

impl PushChannelManager {
    /// Create a new manager for the given endpoint.
    ///
    /// Note: this starts the internal worker lazily on first subscription.
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self::new_internal(ws_url.into(), true)
    }

    #[cfg(test)]
    fn new_for_test() -> Self {
        Self::new_internal("ws://127.0.0.1:0".to_string(), false)
    }

    fn new_internal(ws_url: String, auto_connect: bool) -> Self {
        let (connection_state, _rx) = watch::channel(ConnectionState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        Self {
            ws_url,
            handlers: HashMap::new(),
            connection_state,
            shutdown: CancellationToken::new(),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            worker_handle: None,
            auto_connect,
        }
    }

    /// Subscribe to connection state changes
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    /// Report whether the underlying WebSocket link is currently up
    pub fn is_connected(&self) -> bool {
        matches!(*self.connection_state.borrow(), ConnectionState::Connected)
    }

    /// Subscribe to notifications for a task.
    ///
    /// At most one subscription is active per task id; subscribing again for
    /// the same id replaces the previous handler.
    pub fn subscribe_task(&mut self, task_id: &str) -> mpsc::UnboundedReceiver<TaskEvent> {
        if self.auto_connect {
            self.start_worker_if_needed();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .handlers
            .insert(task_id.to_string(), tx.clone())
            .is_some()
        {
            debug!(%task_id, "replacing existing task subscription");
        }

        let _ = self.cmd_tx.send(ManagerCommand::Track {
            task_id: task_id.to_string(),
            event_tx: tx,
        });

        rx
    }

    /// Drop the subscription for a task and tell the server to stop pushing
    pub fn unsubscribe_task(&mut self, task_id: &str) {
        if self.handlers.remove(task_id).is_some() {
            let _ = self.cmd_tx.send(ManagerCommand::Untrack {
                task_id: task_id.to_string(),
            });
        }
    }

    /// Trigger a graceful shutdown of the internal worker
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let _ = self.cmd_tx.send(ManagerCommand::Shutdown);
    }

    fn start_worker_if_needed(&mut self) {
        if self.worker_handle.is_some() {
            return;
        }

        let Some(cmd_rx) = self.cmd_rx.take() else {
            return;
        };

        if tokio::runtime::Handle::try_current().is_err() {
            warn!("PushChannelManager created without Tokio runtime; worker not started");
            self.cmd_rx = Some(cmd_rx);
            return;
        }

        let ws_url = self.ws_url.clone();
        let connection_state = self.connection_state.clone();
        let shutdown = self.shutdown.clone();

        self.worker_handle = Some(tokio::spawn(async move {
            let worker = PushChannelWorker::new(ws_url, cmd_rx, connection_state, shutdown);
            worker.run().await;
        }));
    }
}

impl Drop for PushChannelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Debug)]
struct PushChannelWorker {
    ws_url: String,
    tracked: HashMap<String, mpsc::UnboundedSender<TaskEvent>>,
    cmd_rx: mpsc::UnboundedReceiver<ManagerCommand>,
    connection_state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    max_retries: u32,
}

impl PushChannelWorker {
    fn new(
        ws_url: String,
        cmd_rx: mpsc::UnboundedReceiver<ManagerCommand>,
        connection_state: watch::Sender<ConnectionState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ws_url,
            tracked: HashMap::new(),
            cmd_rx,
            connection_state,
            shutdown,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    async fn run(mut self) {
        let mut retry_count: u32 = 0;

        'run: loop {
            if self.shutdown.is_cancelled() {
                let _ = self.connection_state.send(ConnectionState::Idle);
                break 'run;
            }

            if self.tracked.is_empty() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {
                        let _ = self.connection_state.send(ConnectionState::Idle);
                        break 'run;
                    }
                    cmd = self.cmd_rx.recv() => {
                        if self.apply_idle_command(cmd) {
                            let _ = self.connection_state.send(ConnectionState::Idle);
                            break 'run;
                        }
                    }
                }

                continue;
            }

            match self.connect_once().await {
                Ok((socket, mut rx)) => {
                    retry_count = 0;

                    let _ = self.connection_state.send(ConnectionState::Connected);
                    info!(tracked = self.tracked.len(), "push channel connected");

                    match self.stream_loop(&socket, &mut rx).await {
                        StreamExit::Shutdown => {
                            drop(rx);
                            drop(socket);
                            let _ = self.connection_state.send(ConnectionState::Idle);
                            break 'run;
                        }
                        StreamExit::Disconnected => {
                            drop(rx);
                            drop(socket);
                            retry_count = 0;
                            let _ = self
                                .connection_state
                                .send(ConnectionState::Reconnecting { retry_count });
                            continue 'run;
                        }
                    }
                }
                Err(err) => {
                    retry_count = retry_count.saturating_add(1);

                    let _ = self
                        .connection_state
                        .send(ConnectionState::Reconnecting { retry_count });

                    if retry_count >= self.max_retries {
                        warn!(retry_count, max_retries = self.max_retries, error = %err, "push channel gave up reconnecting");
                        let _ = self.connection_state.send(ConnectionState::Idle);
                        break 'run;
                    }

                    let backoff = backoff_duration(retry_count);
                    warn!(retry_count, ?backoff, error = %err, "push channel connect failed; retrying with backoff");

                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            let _ = self.connection_state.send(ConnectionState::Idle);
                            break 'run;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                        cmd = self.cmd_rx.recv() => {
                            if self.apply_idle_command(cmd) {
                                let _ = self.connection_state.send(ConnectionState::Idle);
                                break 'run;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Apply a command received while not connected. Returns true on shutdown.
    fn apply_idle_command(&mut self, cmd: Option<ManagerCommand>) -> bool {
        match cmd {
            Some(ManagerCommand::Track { task_id, event_tx }) => {
                self.tracked.insert(task_id, event_tx);
                false
            }
            Some(ManagerCommand::Untrack { task_id }) => {
                self.tracked.remove(&task_id);
                false
            }
            Some(ManagerCommand::Shutdown) | None => true,
        }
    }

    async fn connect_once(&self) -> Result<(TaskSocket, mpsc::Receiver<TaskFrame>)> {
        let mut socket = TaskSocket::new();

        info!(ws_url = %self.ws_url, "connecting to task push channel");
        socket.connect(&self.ws_url).await?;
        self.resubscribe_tracked(&socket).await?;

        let rx = socket
            .take_receiver()
            .ok_or_else(|| ChannelError::WebSocket("socket receiver already taken".to_string()))?;

        Ok((socket, rx))
    }

    /// Replay a subscribe frame for every tracked task after (re)connect
    async fn resubscribe_tracked(&self, socket: &TaskSocket) -> Result<()> {
        for task_id in self.tracked.keys() {
            socket
                .send_control(&ControlFrame::subscribe(task_id.clone()))
                .await?;
        }
        Ok(())
    }

    async fn stream_loop(
        &mut self,
        socket: &TaskSocket,
        rx: &mut mpsc::Receiver<TaskFrame>,
    ) -> StreamExit {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("push channel shutdown requested");
                    return StreamExit::Shutdown;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ManagerCommand::Track { task_id, event_tx }) => {
                            self.tracked.insert(task_id.clone(), event_tx);
                            if let Err(err) = socket
                                .send_control(&ControlFrame::subscribe(task_id.clone()))
                                .await
                            {
                                warn!(%task_id, error = %err, "failed to subscribe task while connected");
                                return StreamExit::Disconnected;
                            }
                        }
                        Some(ManagerCommand::Untrack { task_id }) => {
                            self.tracked.remove(&task_id);
                            if let Err(err) = socket
                                .send_control(&ControlFrame::unsubscribe(task_id.clone()))
                                .await
                            {
                                warn!(%task_id, error = %err, "failed to unsubscribe task while connected");
                                return StreamExit::Disconnected;
                            }
                        }
                        Some(ManagerCommand::Shutdown) | None => {
                            return StreamExit::Shutdown;
                        }
                    }
                }
                frame = rx.recv() => {
                    match frame {
                        Some(frame) => {
                            self.dispatch_frame(frame);
                        }
                        None => {
                            warn!("push channel stream ended");
                            return StreamExit::Disconnected;
                        }
                    }
                }
            }
        }
    }

    fn dispatch_frame(&mut self, frame: TaskFrame) {
        match self.tracked.get(&frame.task_id) {
            Some(tx) => {
                if tx.send(frame.event).is_err() {
                    debug!(task_id = %frame.task_id, "event receiver dropped; untracking task");
                    self.tracked.remove(&frame.task_id);
                }
            }
            None => {
                debug!(task_id = %frame.task_id, "notification for untracked task");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamExit {
    Disconnected,
    Shutdown,
}

fn backoff_duration(retry_count: u32) -> Duration {
    let exp = retry_count.saturating_sub(1).min(63);
    let secs = 1u64 << exp;
    Duration::from_secs(secs.min(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DocumentRef;

    #[test]
    fn backoff_clamps_at_30s() {
        assert_eq!(backoff_duration(1), Duration::from_secs(1));
        assert_eq!(backoff_duration(2), Duration::from_secs(2));
        assert_eq!(backoff_duration(3), Duration::from_secs(4));
        assert_eq!(backoff_duration(4), Duration::from_secs(8));
        assert_eq!(backoff_duration(5), Duration::from_secs(16));
        assert_eq!(backoff_duration(6), Duration::from_secs(30));
        assert_eq!(backoff_duration(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn subscribe_replaces_previous_handler() {
        let mut manager = PushChannelManager::new_for_test();

        let mut first_rx = manager.subscribe_task("task-1");
        let mut second_rx = manager.subscribe_task("task-1");
        assert_eq!(manager.handlers.len(), 1);

        let tx = manager.handlers.get("task-1").expect("handler exists");
        tx.send(TaskEvent::Step { step: 1 }).unwrap();

        // Only the live handler sees the event.
        assert_eq!(second_rx.recv().await, Some(TaskEvent::Step { step: 1 }));
        assert!(matches!(
            first_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let mut manager = PushChannelManager::new_for_test();

        let mut rx = manager.subscribe_task("task-2");
        manager.unsubscribe_task("task-2");

        assert!(manager.handlers.is_empty());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn connection_state_broadcasts_updates() {
        let manager = PushChannelManager::new_for_test();

        let mut rx = manager.connection_state();
        assert_eq!(&*rx.borrow(), &ConnectionState::Idle);
        assert!(!manager.is_connected());

        manager
            .connection_state
            .send(ConnectionState::Connected)
            .unwrap();
        rx.changed().await.unwrap();
        assert_eq!(&*rx.borrow(), &ConnectionState::Connected);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn worker_dispatch_routes_by_task_id() {
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Idle);
        let mut worker = PushChannelWorker::new(
            "ws://127.0.0.1:0".to_string(),
            cmd_rx,
            state_tx,
            CancellationToken::new(),
        );

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        worker.tracked.insert("task-a".to_string(), a_tx);
        worker.tracked.insert("task-b".to_string(), b_tx);

        worker.dispatch_frame(TaskFrame {
            task_id: "task-a".to_string(),
            event: TaskEvent::Step { step: 3 },
        });
        worker.dispatch_frame(TaskFrame {
            task_id: "task-b".to_string(),
            event: TaskEvent::Success {
                document: Some(DocumentRef::new("doc-1")),
                step: Some(7),
            },
        });
        worker.dispatch_frame(TaskFrame {
            task_id: "task-unknown".to_string(),
            event: TaskEvent::Step { step: 1 },
        });

        assert_eq!(a_rx.recv().await, Some(TaskEvent::Step { step: 3 }));
        match b_rx.recv().await {
            Some(TaskEvent::Success { document, .. }) => {
                assert_eq!(document.unwrap().id, "doc-1");
            }
            other => panic!("expected success event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_drops_dead_receivers() {
        let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Idle);
        let mut worker = PushChannelWorker::new(
            "ws://127.0.0.1:0".to_string(),
            cmd_rx,
            state_tx,
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        worker.tracked.insert("task-c".to_string(), tx);

        worker.dispatch_frame(TaskFrame {
            task_id: "task-c".to_string(),
            event: TaskEvent::Step { step: 1 },
        });

        assert!(worker.tracked.is_empty());
    }
}
