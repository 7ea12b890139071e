/*
[INPUT]:  TaskEvent notifications from the push channel
[OUTPUT]: Validated state transitions for one tracked task
[POS]:    Task domain logic - per-task lifecycle state machine
[UPDATE]: When terminal handling or stage interpretation changes
*/

use docuflow_channel::{DocumentRef, TaskEvent};

use crate::progress::stage_progress;
use crate::registry::TaskStatus;

/// Effect of applying one notification to a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Non-terminal progress update; storage and subscription stay untouched
    Progress { percent: u8, message: &'static str },
    /// Terminal success carrying the created document, when known
    Completed { document: Option<DocumentRef> },
    /// Terminal failure with the worker-reported reason
    Failed { error: String },
}

/// State machine for one task's lifecycle.
///
/// Initial state is `Processing`; `Success` and `Failed` are terminal and
/// absorb every later event, so duplicate or late notifications after a
/// terminal one are no-ops.
#[derive(Debug)]
pub struct TaskLifecycle {
    state: TaskStatus,
}

impl TaskLifecycle {
    pub fn new() -> Self {
        Self {
            state: TaskStatus::Processing,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TaskStatus::Success | TaskStatus::Failed)
    }

    /// Apply a notification, returning the resulting effect.
    ///
    /// `None` means the event must be ignored: either the task is already
    /// terminal, or the step has no progress mapping.
    pub fn apply(&mut self, event: TaskEvent) -> Option<Advance> {
        if self.is_terminal() {
            return None;
        }

        match event {
            TaskEvent::Step { step } => {
                stage_progress(step).map(|(percent, message)| Advance::Progress { percent, message })
            }
            TaskEvent::Success { document, .. } => {
                self.state = TaskStatus::Success;
                Some(Advance::Completed { document })
            }
            TaskEvent::Failure { error } => {
                self.state = TaskStatus::Failed;
                Some(Advance::Failed { error })
            }
        }
    }
}

impl Default for TaskLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
