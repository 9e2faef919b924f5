//! Session error types.

use pausepoint_core::ControllerFault;
use pausepoint_shm::RegionError;
use thiserror::Error;

use crate::Phase;

/// Error returned to the caller of a pause point.
///
/// These are the only failures that ever leave a session; ordinary command
/// failures are absorbed by re-pausing.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("A pause is already active on this call stack")]
    ReentrantPause,
    #[error(transparent)]
    Fault(#[from] ControllerFault),
}

/// Error returned to a controller that drives a session out of turn.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Session is not paused (phase: {0:?})")]
    NotPaused(Phase),
    #[error("Session closed")]
    Closed,
}

/// Error from the region slot transport.
#[derive(Debug, Error)]
pub enum SlotError {
    #[error("Region error: {0}")]
    Region(#[from] RegionError),
    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}
