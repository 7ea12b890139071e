/*
[INPUT]:  Inbound subscribe/unsubscribe control frames + polled job state
[OUTPUT]: Step/success/failure frames pushed per subscribed task
[POS]:    Gateway layer - server end of the task push channel
[UPDATE]: When changing poll cadence, dedupe, or frame shapes
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use docuflow_channel::{ControlFrame, DocumentRef, TaskEvent, TaskFrame};

use crate::job::{JobRecord, JobStatus};
use crate::store::JobStore;

/// How often subscribed jobs are polled for changes
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Re-send cadence for unchanged Processing jobs, so clients can tell a
/// quiet pipeline from a dead connection
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// WebSocket gateway pushing per-task notifications to clients.
///
/// Each connection owns its own subscription set; one poll tick walks the
/// set, emits frames for observable changes, and drops tasks once their
/// terminal frame has gone out.
pub struct PushGateway {
    store: Arc<JobStore>,
    shutdown: CancellationToken,
}

impl PushGateway {
    pub fn new(store: Arc<JobStore>, shutdown: CancellationToken) -> Self {
        Self { store, shutdown }
    }

    /// Accept connections until shutdown
    pub async fn serve(&self, listener: TcpListener) {
        info!(
            addr = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "push gateway listening"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("push gateway shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let store = self.store.clone();
                            let shutdown = self.shutdown.clone();
                            tokio::spawn(async move {
                                handle_connection(store, stream, shutdown).await;
                                debug!(%peer, "gateway connection closed");
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "gateway accept failed");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_connection(store: Arc<JobStore>, stream: TcpStream, shutdown: CancellationToken) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!(error = %err, "gateway handshake failed");
            return;
        }
    };
    let (mut write, mut read) = ws.split();

    let mut session = ClientSession::new(store);
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                break;
            }
            message = read.next() => {
                match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        session.handle_control(&text);
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if write.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = poll.tick() => {
                for frame in session.poll_frames(Instant::now()) {
                    let payload = match serde_json::to_string(&frame) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(task_id = %frame.task_id, error = %err, "failed to encode task frame");
                            continue;
                        }
                    };
                    if write.send(WsMessage::Text(payload.into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Dedupe state for one subscribed task
#[derive(Debug, Default)]
struct JobWatch {
    last_key: Option<String>,
    last_sent_at: Option<Instant>,
}

impl JobWatch {
    /// An update goes out when the observable state changed, or as a
    /// heartbeat while the job keeps processing.
    fn should_send(&mut self, key: &str, is_processing: bool, now: Instant) -> bool {
        let state_changed = self.last_key.as_deref() != Some(key);
        let heartbeat_due = is_processing
            && self
                .last_sent_at
                .is_none_or(|sent| now.duration_since(sent) >= HEARTBEAT_INTERVAL);

        if state_changed || heartbeat_due {
            self.last_key = Some(key.to_string());
            self.last_sent_at = Some(now);
            return true;
        }
        false
    }
}

/// Per-connection subscription set and poll logic
struct ClientSession {
    store: Arc<JobStore>,
    watches: HashMap<String, JobWatch>,
}

impl ClientSession {
    fn new(store: Arc<JobStore>) -> Self {
        Self {
            store,
            watches: HashMap::new(),
        }
    }

    fn handle_control(&mut self, text: &str) {
        match serde_json::from_str::<ControlFrame>(text) {
            Ok(ControlFrame::Subscribe { task_id }) => {
                debug!(%task_id, "client subscribed");
                self.watches.entry(task_id).or_default();
            }
            Ok(ControlFrame::Unsubscribe { task_id }) => {
                debug!(%task_id, "client unsubscribed");
                self.watches.remove(&task_id);
            }
            Err(err) => {
                debug!(error = %err, "ignoring malformed control frame");
            }
        }
    }

    /// Collect frames due on this tick; terminal tasks leave the set once
    /// their frame is queued.
    fn poll_frames(&mut self, now: Instant) -> Vec<TaskFrame> {
        let mut frames = Vec::new();
        let mut finished = Vec::new();

        for (task_id, watch) in &mut self.watches {
            let job = match self.store.get_job(task_id) {
                Ok(Some(job)) => job,
                Ok(None) => {
                    debug!(%task_id, "subscribed job not found yet");
                    continue;
                }
                Err(err) => {
                    warn!(%task_id, error = %err, "failed to load subscribed job");
                    continue;
                }
            };

            let key = state_key(&job);
            if watch.should_send(&key, job.status == JobStatus::Processing, now) {
                frames.push(job_frame(&job));
                if job.status.is_terminal() {
                    finished.push(task_id.clone());
                }
            }
        }

        for task_id in finished {
            info!(%task_id, "task reached terminal state; removed from subscription");
            self.watches.remove(&task_id);
        }

        frames
    }
}

/// Observable state key used to suppress duplicate updates
fn state_key(job: &JobRecord) -> String {
    format!(
        "{}:{}:{}",
        job.status.is_terminal() as u8,
        job.stage.step(),
        job.error.as_deref().unwrap_or("")
    )
}

/// Translate a job snapshot into the frame a client expects
fn job_frame(job: &JobRecord) -> TaskFrame {
    let event = match job.status {
        JobStatus::Processing => TaskEvent::Step {
            step: job.stage.step(),
        },
        JobStatus::Success => TaskEvent::Success {
            document: job.document_id.as_deref().map(DocumentRef::new),
            step: Some(job.stage.step()),
        },
        JobStatus::Failed => TaskEvent::Failure {
            error: job
                .error
                .clone()
                .unwrap_or_else(|| "Task failed".to_string()),
        },
    };

    TaskFrame {
        task_id: job.job_id.clone(),
        event,
    }
}
