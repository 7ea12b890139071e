/*
[INPUT]:  Push channel WebSocket URL
[OUTPUT]: Parsed per-task notification frames + outbound control frames
[POS]:    WebSocket layer - single duplex connection handling
[UPDATE]: When changing frame parsing or connection logic
*/

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::{ChannelError, Result};
use crate::message::{ControlFrame, TaskFrame};

const PARSE_FAIL_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 1024;

static PARSE_FAIL_LOG_COUNT: AtomicUsize = AtomicUsize::new(0);

/// One duplex connection to the task push channel.
///
/// Inbound text is parsed into [`TaskFrame`]s; unparseable frames are
/// dropped after sampled logging so a misbehaving peer cannot break the
/// stream for well-formed notifications.
#[derive(Debug)]
pub struct TaskSocket {
    frame_tx: mpsc::Sender<TaskFrame>,
    frame_rx: Option<mpsc::Receiver<TaskFrame>>,
    outbound_tx: Arc<Mutex<Option<mpsc::Sender<WsMessage>>>>,
}

impl TaskSocket {
    /// Create a new, unconnected socket
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            frame_tx: tx,
            frame_rx: Some(rx),
            outbound_tx: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the inbound frame receiver
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<TaskFrame>> {
        self.frame_rx.take()
    }

    /// Connect to the push channel endpoint
    pub async fn connect(&self, url: &str) -> Result<()> {
        let url = url::Url::parse(url)?;
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::WebSocket(err.to_string()))?;
        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel(100);
        let outbound_state = self.outbound_tx.clone();

        {
            let mut guard = outbound_state.lock().await;
            if guard.is_some() {
                return Err(ChannelError::AlreadyConnected);
            }
            *guard = Some(outbound_tx);
        }

        let frame_tx = self.frame_tx.clone();
        let outbound_state_for_task = outbound_state.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if write.send(message).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break;
                            }
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Close(_))) => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break;
                            }
                            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => {}
                            Some(Ok(message)) => {
                                if let Some(frame) = Self::parse_frame(message)
                                    && frame_tx.send(frame).await.is_err()
                                {
                                    break;
                                }
                            }
                            Some(Err(_)) | None => {
                                break;
                            }
                        }
                    }
                }
            }

            let mut guard = outbound_state_for_task.lock().await;
            *guard = None;
        });

        Ok(())
    }

    /// Send a subscribe/unsubscribe control frame
    pub async fn send_control(&self, frame: &ControlFrame) -> Result<()> {
        let payload = serde_json::to_string(frame)?;

        let sender = {
            let guard = self.outbound_tx.lock().await;
            guard.clone().ok_or(ChannelError::NotConnected)?
        };

        sender
            .send(WsMessage::Text(payload.into()))
            .await
            .map_err(|_| ChannelError::SendQueueClosed)?;

        debug!(task_id = %frame.task_id(), "control frame sent");

        Ok(())
    }

    fn parse_frame(message: WsMessage) -> Option<TaskFrame> {
        let text: String = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8(bytes.to_vec()).ok()?,
            _ => return None,
        };

        match serde_json::from_str::<TaskFrame>(&text) {
            Ok(frame) => Some(frame),
            Err(err) => {
                log_parse_fail_once(&err, &text);
                None
            }
        }
    }
}

impl Default for TaskSocket {
    fn default() -> Self {
        Self::new()
    }
}

fn log_parse_fail_once(err: &serde_json::Error, raw: &str) {
    let count = PARSE_FAIL_LOG_COUNT.fetch_add(1, Ordering::Relaxed);
    if count < PARSE_FAIL_LOG_LIMIT {
        let preview = truncate_for_log(raw, RAW_LOG_MAX_BYTES);
        debug!(
            sample_index = count + 1,
            sample_limit = PARSE_FAIL_LOG_LIMIT,
            error = %err,
            bytes = raw.len(),
            message = %preview,
            "push channel frame parse failed"
        );
    }
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut out = String::with_capacity(max_len + 3);
    out.push_str(&value[..max_len]);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::TaskEvent;

    #[test]
    fn test_parse_frame_step() {
        let message = WsMessage::Text(r#"{"taskId":"t-1","message":"step","step":2}"#.into());
        let frame = TaskSocket::parse_frame(message).expect("frame parses");
        assert_eq!(frame.task_id, "t-1");
        assert_eq!(frame.event, TaskEvent::Step { step: 2 });
    }

    #[test]
    fn test_parse_frame_binary_payload() {
        let raw = br#"{"taskId":"t-2","message":"failure","error":"boom"}"#.to_vec();
        let frame = TaskSocket::parse_frame(WsMessage::Binary(raw.into())).expect("frame parses");
        assert_eq!(
            frame.event,
            TaskEvent::Failure {
                error: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_parse_frame_garbage_dropped() {
        assert!(TaskSocket::parse_frame(WsMessage::Text("not json".into())).is_none());
        assert!(TaskSocket::parse_frame(WsMessage::Text(r#"{"foo":1}"#.into())).is_none());
    }

    #[tokio::test]
    async fn test_send_control_requires_connection() {
        let socket = TaskSocket::new();
        let result = socket.send_control(&ControlFrame::subscribe("t-3")).await;
        assert!(matches!(result, Err(ChannelError::NotConnected)));
    }
}
