//! Controller side of a session.
//!
//! A [`Controller`] observes a paused session, inspects what it was asked to
//! do, writes the command, result and fault slots, and finally resumes it.
//! Slot writes are only accepted while the session is paused.

use std::{
    sync::{Arc, PoisonError},
    time::Duration,
};

use pausepoint_core::{ControllerFault, EventStore, Scope, SessionEvent, Slots, Value};
use uuid::Uuid;

use crate::{ControlError, Phase, session::Shared};

/// Handle used by whoever drives a paused session.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    pub(crate) const fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.shared.id
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.phase() == Phase::Paused
    }

    /// Block until the session is paused.
    pub fn wait_paused(&self) {
        let state = self.shared.lock();
        drop(
            self.shared
                .changed
                .wait_while(state, |s| s.phase != Phase::Paused)
                .unwrap_or_else(PoisonError::into_inner),
        );
    }

    /// Block until the session is paused or `timeout` elapses.
    ///
    /// Returns whether the session is paused.
    #[must_use]
    pub fn wait_paused_timeout(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| s.phase != Phase::Paused)
            .unwrap_or_else(PoisonError::into_inner);
        state.phase == Phase::Paused
    }

    /// Wait asynchronously until the session is paused.
    ///
    /// # Errors
    /// Returns `Closed` if the session is gone.
    pub async fn paused(&self) -> Result<(), ControlError> {
        let mut rx = self.shared.phase_tx.subscribe();
        rx.wait_for(|phase| *phase == Phase::Paused)
            .await
            .map(|_| ())
            .map_err(|_| ControlError::Closed)
    }

    /// The order text of the current pause.
    #[must_use]
    pub fn order(&self) -> Option<String> {
        self.shared.lock().order.clone()
    }

    /// The caller's scope of the current pause.
    #[must_use]
    pub fn scope(&self) -> Option<Scope> {
        self.shared.lock().scope.clone()
    }

    /// Snapshot of the slots.
    #[must_use]
    pub fn slots(&self) -> Slots {
        self.shared.lock().slots.clone()
    }

    /// Apply `f` to the slots while paused.
    ///
    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn update<R>(&self, f: impl FnOnce(&mut Slots) -> R) -> Result<R, ControlError> {
        let mut state = self.shared.lock();
        if state.phase != Phase::Paused {
            return Err(ControlError::NotPaused(state.phase));
        }
        Ok(f(&mut state.slots))
    }

    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn set_command(&self, command: impl Into<String>) -> Result<(), ControlError> {
        let command = command.into();
        self.update(|slots| slots.command = Some(command))
    }

    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn clear_command(&self) -> Result<(), ControlError> {
        self.update(|slots| slots.command = None)
    }

    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn set_result(&self, value: Value) -> Result<(), ControlError> {
        self.update(|slots| slots.result = Some(value))
    }

    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn set_fault(&self, fault: ControllerFault) -> Result<(), ControlError> {
        self.update(|slots| slots.fault = Some(fault))
    }

    /// Signal the paused session to continue.
    ///
    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn resume(&self) -> Result<(), ControlError> {
        let mut state = self.shared.lock();
        if state.phase != Phase::Paused {
            return Err(ControlError::NotPaused(state.phase));
        }
        state.resume_requested = true;
        self.shared.set_phase(&mut state, Phase::Running);
        self.shared.events.push(SessionEvent::Resumed {
            session_id: self.shared.id,
        });
        Ok(())
    }

    /// Set the command slot and resume.
    ///
    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn run_command(&self, command: impl Into<String>) -> Result<(), ControlError> {
        self.set_command(command)?;
        self.resume()
    }

    /// Hand `value` back to the caller and resume.
    ///
    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn respond(&self, value: Value) -> Result<(), ControlError> {
        self.update(|slots| {
            slots.command = None;
            slots.result = Some(value);
        })?;
        self.resume()
    }

    /// Raise `fault` to the caller and resume.
    ///
    /// # Errors
    /// Returns `NotPaused` outside a pause.
    pub fn fail(&self, fault: ControllerFault) -> Result<(), ControlError> {
        self.set_fault(fault)?;
        self.resume()
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.shared.events)
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("session_id", &self.shared.id)
            .finish_non_exhaustive()
    }
}
