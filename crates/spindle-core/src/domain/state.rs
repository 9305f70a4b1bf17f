//! Task state machine.

use serde::{Deserialize, Serialize};

/// State of a task.
///
/// State transitions:
/// - Created -> Ready -> Running -> Completed | Failed
/// - Ready -> Canceled (intercepted before it started)
/// - Running -> Canceled (body observed a cancel request and gave up)
///
/// Terminal states never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Built but not handed to an executor or completion source yet.
    Created,

    /// Enqueued (possibly delayed) or waiting for its completion source.
    Ready,

    /// A worker is executing the body / callback.
    Running,

    Completed,

    Failed,

    Canceled,
}

impl TaskState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }

    /// Whether `self -> next` is a legal edge of the state machine.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Created, Ready)
                | (Ready, Running)
                | (Ready, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}
