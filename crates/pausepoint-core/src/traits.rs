//! Protocol slots and the command execution trait.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::Scope;

/// Distinguished error raised by a controller.
///
/// Once recorded in a session it is always propagated to the caller of the
/// pause point.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("controller fault: {message}")]
pub struct ControllerFault {
    /// Human-readable reason.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControllerFault {
    /// Create a fault with just a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// The three controller-writable slots of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slots {
    /// Pending command text.
    pub command: Option<String>,
    /// Value handed back to the caller.
    pub result: Option<Value>,
    /// Fault raised to the caller.
    pub fault: Option<ControllerFault>,
}

impl Slots {
    /// Slots seeded with an initial command.
    #[must_use]
    pub fn seeded(command: Option<String>) -> Self {
        Self {
            command,
            result: None,
            fault: None,
        }
    }
}

/// Outcome of a failed command execution.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The command raised a controller fault.
    #[error(transparent)]
    Fault(#[from] ControllerFault),
    /// The command asked the loop to run the pending command again without
    /// pausing.
    #[error("continue requested")]
    Continue,
    /// Any other failure.
    #[error("command failed: {0}")]
    Failed(String),
}

impl ExecError {
    /// Wrap any displayable error as an ordinary failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Everything a command may observe or mutate while executing.
#[derive(Debug)]
pub struct CommandContext<'a> {
    /// Order of the pause point being served.
    pub order: &'a str,
    /// Caller's bindings.
    pub scope: &'a Scope,
    /// Session slots. Setting `command` and returning
    /// [`ExecError::Continue`] chains another step.
    pub slots: &'a mut Slots,
}

/// Capability to execute controller-supplied command text.
///
/// Implement this trait to plug an interpreter into a session.
/// Closures with the matching signature implement it too.
pub trait Interpreter: Send + Sync {
    /// Execute `command` against the context.
    ///
    /// # Errors
    /// Returns [`ExecError`] describing how the session loop must react.
    fn execute(&self, command: &str, cx: &mut CommandContext<'_>) -> Result<(), ExecError>;
}

impl<F> Interpreter for F
where
    F: Fn(&str, &mut CommandContext<'_>) -> Result<(), ExecError> + Send + Sync,
{
    fn execute(&self, command: &str, cx: &mut CommandContext<'_>) -> Result<(), ExecError> {
        self(command, cx)
    }
}
