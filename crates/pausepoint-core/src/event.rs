//! Typed session events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ControllerFault;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A controller-supplied result was returned.
    Returned,
    /// No result was set.
    NoValue,
    /// A controller fault was raised to the caller.
    Raised,
}

/// Event emitted by a session as it moves through its states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session paused and is waiting for the controller.
    Paused {
        session_id: Uuid,
        order: String,
        command: Option<String>,
    },
    /// The controller resumed the session.
    Resumed { session_id: Uuid },
    /// A command is about to run.
    Executing { command: String },
    /// A command completed.
    Executed { command: String },
    /// A command asked to chain without pausing.
    ContinueRequested { next: Option<String> },
    /// A command failed with an ordinary error.
    CommandFailed { command: String, error: String },
    /// A controller fault was recorded.
    FaultRaised { fault: ControllerFault },
    /// The invocation finished.
    Finished { session_id: Uuid, outcome: Outcome },
}

impl SessionEvent {
    /// Approximate memory footprint, used for history budgeting.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 32;
        let text = match self {
            Self::Paused { order, command, .. } => {
                order.len() + command.as_ref().map_or(0, String::len)
            }
            Self::Executing { command } | Self::Executed { command } => command.len(),
            Self::ContinueRequested { next } => next.as_ref().map_or(0, String::len),
            Self::CommandFailed { command, error } => command.len() + error.len(),
            Self::FaultRaised { fault } => fault.message.len(),
            Self::Resumed { .. } | Self::Finished { .. } => 0,
        };
        OVERHEAD + text
    }

    /// Whether this event ends an invocation.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }

    /// Render as one JSON line.
    #[must_use]
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"type\":\"error\",\"message\":\"{e}\"}}"))
    }
}
