/*
[INPUT]:  Raw JSON frames exchanged with the task push channel
[OUTPUT]: Typed notification and control frame structs
[POS]:    WebSocket layer - frame definitions shared by client and server
[UPDATE]: When adding new frame kinds or changing the wire format
*/

use serde::{Deserialize, Serialize};

/// Reference to a document created by a successfully finished job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

impl DocumentRef {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let redirect_url = Some(format!("/documents/{id}"));
        Self { id, redirect_url }
    }
}

/// Per-task notification payload, discriminated by the `message` field.
///
/// Success frames additionally carry `step: 7` upstream; it is accepted but
/// carries no extra information beyond the variant itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "message", rename_all = "lowercase")]
pub enum TaskEvent {
    Step {
        step: u8,
    },
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document: Option<DocumentRef>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<u8>,
    },
    Failure {
        error: String,
    },
}

impl TaskEvent {
    /// Success and failure end a task; steps do not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Success { .. } | TaskEvent::Failure { .. })
    }
}

/// Inbound notification frame: event tagged with the task it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskFrame {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(flatten)]
    pub event: TaskEvent,
}

/// Outbound control frame, discriminated by the `action` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ControlFrame {
    Subscribe {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    Unsubscribe {
        #[serde(rename = "taskId")]
        task_id: String,
    },
}

impl ControlFrame {
    pub fn subscribe(task_id: impl Into<String>) -> Self {
        ControlFrame::Subscribe {
            task_id: task_id.into(),
        }
    }

    pub fn unsubscribe(task_id: impl Into<String>) -> Self {
        ControlFrame::Unsubscribe {
            task_id: task_id.into(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            ControlFrame::Subscribe { task_id } | ControlFrame::Unsubscribe { task_id } => task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_frame_parses() {
        let frame: TaskFrame =
            serde_json::from_str(r#"{"taskId":"t-1","message":"step","step":3}"#).unwrap();
        assert_eq!(frame.task_id, "t-1");
        assert_eq!(frame.event, TaskEvent::Step { step: 3 });
        assert!(!frame.event.is_terminal());
    }

    #[test]
    fn test_success_frame_parses_with_document_and_step() {
        let raw = r#"{
            "taskId": "t-2",
            "message": "success",
            "step": 7,
            "document": {"id": "doc-9", "redirectUrl": "/documents/doc-9"},
            "result": {"tokenUsage": {"inputTokens": 10}}
        }"#;
        let frame: TaskFrame = serde_json::from_str(raw).unwrap();
        match frame.event {
            TaskEvent::Success { document, step } => {
                let document = document.expect("document present");
                assert_eq!(document.id, "doc-9");
                assert_eq!(document.redirect_url.as_deref(), Some("/documents/doc-9"));
                assert_eq!(step, Some(7));
            }
            other => panic!("expected success event, got {other:?}"),
        }
    }

    #[test]
    fn test_success_frame_parses_without_document() {
        let frame: TaskFrame =
            serde_json::from_str(r#"{"taskId":"t-3","message":"success"}"#).unwrap();
        assert_eq!(
            frame.event,
            TaskEvent::Success {
                document: None,
                step: None
            }
        );
        assert!(frame.event.is_terminal());
    }

    #[test]
    fn test_failure_frame_parses() {
        let frame: TaskFrame = serde_json::from_str(
            r#"{"taskId":"t-4","message":"failure","error":"classification timeout"}"#,
        )
        .unwrap();
        assert_eq!(
            frame.event,
            TaskEvent::Failure {
                error: "classification timeout".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_message_kind_is_an_error() {
        let result =
            serde_json::from_str::<TaskFrame>(r#"{"taskId":"t-5","message":"heartbeat"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_control_frames_use_action_tag() {
        let json = serde_json::to_string(&ControlFrame::subscribe("t-6")).unwrap();
        assert_eq!(json, r#"{"action":"subscribe","taskId":"t-6"}"#);

        let parsed: ControlFrame =
            serde_json::from_str(r#"{"action":"unsubscribe","taskId":"t-6"}"#).unwrap();
        assert_eq!(parsed, ControlFrame::unsubscribe("t-6"));
        assert_eq!(parsed.task_id(), "t-6");
    }
}
