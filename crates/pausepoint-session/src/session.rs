//! The pause/resume state machine.

use std::{
    any::Any,
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use pausepoint_core::{
    CommandContext, Config, EventStore, ExecError, Interpreter, Scope, SessionEvent, Slots, Value,
    event::Outcome,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::{Controller, InvokeError};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No invocation in progress.
    Idle,
    /// Blocked, waiting for the controller to resume.
    Paused,
    /// Executing commands or finalizing.
    Running,
}

/// How the command loop treats a successful command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Keep executing while a command is pending; chain on the continue
    /// signal without pausing.
    Autonomous,
    /// Pause again after every successful command.
    Consultation,
}

pub(crate) struct State {
    pub(crate) phase: Phase,
    pub(crate) order: Option<String>,
    pub(crate) slots: Slots,
    pub(crate) scope: Option<Scope>,
    pub(crate) resume_requested: bool,
}

pub(crate) struct Shared {
    pub(crate) id: Uuid,
    pub(crate) state: Mutex<State>,
    pub(crate) changed: Condvar,
    pub(crate) phase_tx: watch::Sender<Phase>,
    pub(crate) events: Arc<EventStore>,
    interpreter: Arc<dyn Interpreter>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_phase(&self, state: &mut State, phase: Phase) {
        state.phase = phase;
        self.phase_tx.send_replace(phase);
        self.changed.notify_all();
    }

    /// Block the calling thread until the controller resumes.
    fn suspend(&self) {
        let mut state = self.lock();
        state.resume_requested = false;
        self.set_phase(&mut state, Phase::Paused);
        self.events.push(SessionEvent::Paused {
            session_id: self.id,
            order: state.order.clone().unwrap_or_default(),
            command: state.slots.command.clone(),
        });
        tracing::info!(
            session_id = %self.id,
            command = ?state.slots.command,
            "Paused; waiting for controller"
        );

        let mut state = self
            .changed
            .wait_while(state, |s| !s.resume_requested)
            .unwrap_or_else(PoisonError::into_inner);
        state.resume_requested = false;
        tracing::debug!(session_id = %self.id, "Resumed by controller");
    }
}

thread_local! {
    static PAUSE_ACTIVE: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as paused for as long as it lives.
struct PauseMarker;

impl PauseMarker {
    fn acquire() -> Option<Self> {
        PAUSE_ACTIVE.with(|active| if active.replace(true) { None } else { Some(Self) })
    }
}

impl Drop for PauseMarker {
    fn drop(&mut self) {
        PAUSE_ACTIVE.with(|active| active.set(false));
    }
}

/// Whether a pause is active on the current thread.
#[must_use]
pub fn pause_active() -> bool {
    PAUSE_ACTIVE.with(Cell::get)
}

/// Returns the session to `Idle` with empty slots on every exit path.
struct ResetOnExit<'a>(&'a Shared);

impl Drop for ResetOnExit<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.order = None;
        state.slots = Slots::default();
        state.scope = None;
        state.resume_requested = false;
        self.0.set_phase(&mut state, Phase::Idle);
    }
}

enum Step {
    /// Command succeeded.
    Done,
    /// Command asked to chain.
    Chain,
    /// A controller fault was recorded.
    Faulted,
    /// Pause again and let the controller react.
    Repause,
}

/// An interaction point shared between the paused program and its
/// controller.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Create a session that executes commands with `interpreter`.
    #[must_use]
    pub fn new(interpreter: impl Interpreter + 'static) -> Self {
        Self::with_config(interpreter, &Config::default())
    }

    /// Create a session with explicit configuration.
    #[must_use]
    pub fn with_config(interpreter: impl Interpreter + 'static, config: &Config) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    order: None,
                    slots: Slots::default(),
                    scope: None,
                    resume_requested: false,
                }),
                changed: Condvar::new(),
                phase_tx,
                events: Arc::new(EventStore::with_config(config)),
                interpreter: Arc::new(interpreter),
            }),
        }
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    /// Handle for the controller side.
    #[must_use]
    pub fn controller(&self) -> Controller {
        Controller::new(Arc::clone(&self.shared))
    }

    /// Event store of this session.
    #[must_use]
    pub fn events(&self) -> Arc<EventStore> {
        Arc::clone(&self.shared.events)
    }

    /// Pause for a delegated task and run commands autonomously.
    ///
    /// # Errors
    /// Returns `ReentrantPause` if a pause is already active on this thread
    /// or this session is in use, or the controller's fault.
    pub fn invoke(
        &self,
        order: &str,
        seed_command: Option<&str>,
        scope: &Scope,
    ) -> Result<Option<Value>, InvokeError> {
        self.run(Mode::Autonomous, order, seed_command, scope)
    }

    /// Pause for human consultation, pausing again after every command.
    ///
    /// # Errors
    /// Same as [`invoke`](Self::invoke).
    pub fn consult(
        &self,
        order: &str,
        seed_command: Option<&str>,
        scope: &Scope,
    ) -> Result<Option<Value>, InvokeError> {
        self.run(Mode::Consultation, order, seed_command, scope)
    }

    /// Pause and run the command loop in the given mode.
    ///
    /// Blocks the calling thread until the controller resumes; there is no
    /// timeout. The only way to cancel from outside is for the controller to
    /// set a fault and resume.
    ///
    /// # Errors
    /// Same as [`invoke`](Self::invoke).
    pub fn run(
        &self,
        mode: Mode,
        order: &str,
        seed_command: Option<&str>,
        scope: &Scope,
    ) -> Result<Option<Value>, InvokeError> {
        let shared = &*self.shared;
        let Some(_marker) = PauseMarker::acquire() else {
            tracing::warn!(session_id = %shared.id, order, "Pause requested while another is active");
            return Err(InvokeError::ReentrantPause);
        };

        {
            let mut state = shared.lock();
            if state.phase != Phase::Idle {
                tracing::warn!(session_id = %shared.id, order, "Session already in use");
                return Err(InvokeError::ReentrantPause);
            }
            state.order = Some(order.to_string());
            state.slots = Slots::seeded(seed_command.map(str::to_string));
            state.scope = Some(scope.clone());
            shared.set_phase(&mut state, Phase::Running);
        }
        let _reset = ResetOnExit(shared);

        tracing::info!(session_id = %shared.id, ?mode, order, "Interaction point reached");
        shared.suspend();

        loop {
            let command = {
                let state = shared.lock();
                if state.slots.fault.is_some() {
                    break;
                }
                match &state.slots.command {
                    Some(command) => command.clone(),
                    None => break,
                }
            };

            match self.step(mode, order, &command, scope) {
                Step::Done if mode == Mode::Consultation => shared.suspend(),
                Step::Done | Step::Chain | Step::Faulted => {}
                Step::Repause => shared.suspend(),
            }
        }

        self.finalize()
    }

    fn step(&self, mode: Mode, order: &str, command: &str, scope: &Scope) -> Step {
        let shared = &*self.shared;
        let mut working = shared.lock().slots.clone();
        shared.events.push(SessionEvent::Executing {
            command: command.to_string(),
        });
        tracing::debug!(session_id = %shared.id, command, "Executing command");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            shared.interpreter.execute(
                command,
                &mut CommandContext {
                    order,
                    scope,
                    slots: &mut working,
                },
            )
        }))
        .unwrap_or_else(|payload| Err(ExecError::Failed(panic_message(payload.as_ref()))));

        let mut state = shared.lock();
        state.slots = working;
        match outcome {
            Ok(()) => {
                state.slots.command = None;
                shared.events.push(SessionEvent::Executed {
                    command: command.to_string(),
                });
                Step::Done
            }
            Err(ExecError::Continue) if mode == Mode::Autonomous => {
                tracing::debug!(session_id = %shared.id, next = ?state.slots.command, "Continue requested");
                shared.events.push(SessionEvent::ContinueRequested {
                    next: state.slots.command.clone(),
                });
                Step::Chain
            }
            Err(ExecError::Continue) => {
                tracing::debug!(session_id = %shared.id, "Continue ignored during consultation");
                state.slots.command = None;
                state.slots.fault = None;
                Step::Repause
            }
            Err(ExecError::Fault(fault)) => {
                tracing::info!(session_id = %shared.id, order, command, %fault, "Controller fault raised");
                shared.events.push(SessionEvent::FaultRaised {
                    fault: fault.clone(),
                });
                state.slots.command = None;
                state.slots.fault = Some(fault);
                Step::Faulted
            }
            Err(ExecError::Failed(error)) => {
                tracing::warn!(session_id = %shared.id, command, %error, "Unhandled error during command");
                shared.events.push(SessionEvent::CommandFailed {
                    command: command.to_string(),
                    error,
                });
                state.slots.command = None;
                state.slots.fault = None;
                Step::Repause
            }
        }
    }

    fn finalize(&self) -> Result<Option<Value>, InvokeError> {
        let shared = &*self.shared;
        let (fault, result) = {
            let mut state = shared.lock();
            (state.slots.fault.take(), state.slots.result.take())
        };

        let (outcome, ret) = match (fault, result) {
            (Some(fault), _) => (Outcome::Raised, Err(InvokeError::Fault(fault))),
            (None, Some(value)) => (Outcome::Returned, Ok(Some(value))),
            (None, None) => (Outcome::NoValue, Ok(None)),
        };
        tracing::info!(session_id = %shared.id, ?outcome, "Leaving interaction point");
        shared.events.push(SessionEvent::Finished {
            session_id: shared.id,
            outcome,
        });
        ret
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload");
    format!("command panicked: {detail}")
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use pausepoint_core::ControllerFault;
    use serde_json::json;

    use super::*;
    use crate::ScriptInterpreter;

    fn spawn_invoke(
        session: &Session,
        mode: Mode,
        seed: Option<&'static str>,
        scope: &Scope,
    ) -> thread::JoinHandle<Result<Option<Value>, InvokeError>> {
        let session = session.clone();
        let scope = scope.clone();
        thread::spawn(move || session.run(mode, "test order", seed, &scope))
    }

    #[test]
    fn test_result_is_returned() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let handle = spawn_invoke(&session, Mode::Autonomous, None, &Scope::new());

        controller.wait_paused();
        assert_eq!(controller.order().as_deref(), Some("test order"));
        controller.respond(json!({"answer": 42})).unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), Some(json!({"answer": 42})));
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn test_fault_skips_command_loop() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let session = Session::new(move |_: &str, _: &mut CommandContext<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ExecError>(())
        });
        let controller = session.controller();
        let handle = spawn_invoke(&session, Mode::Autonomous, Some("pending"), &Scope::new());

        controller.wait_paused();
        controller.fail(ControllerFault::new("abort")).unwrap();

        match handle.join().unwrap() {
            Err(InvokeError::Fault(fault)) => assert_eq!(fault, ControllerFault::new("abort")),
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_command_mutates_caller_scope() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let scope = Scope::new();
        let handle = spawn_invoke(&session, Mode::Autonomous, None, &scope);

        controller.wait_paused();
        controller.run_command("x = 1").unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), None);
        assert_eq!(scope.get("x"), Some(json!(1)));
    }

    #[test]
    fn test_seed_command_runs_after_resume() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let scope = Scope::new();
        let handle = spawn_invoke(&session, Mode::Autonomous, Some("return 5"), &scope);

        controller.wait_paused();
        assert_eq!(controller.slots().command.as_deref(), Some("return 5"));
        controller.resume().unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), Some(json!(5)));
    }

    #[test]
    fn test_continue_chains_without_pausing() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let scope = Scope::new();
        let events = session.events();
        let handle = spawn_invoke(&session, Mode::Autonomous, None, &scope);

        controller.wait_paused();
        controller
            .run_command("a = 1; next \"b = add(a, 1); next \\\"return b\\\"; continue\"; continue")
            .unwrap();

        assert_eq!(handle.join().unwrap().unwrap(), Some(json!(2)));
        let pauses = events
            .get_history()
            .iter()
            .filter(|e| matches!(e, SessionEvent::Paused { .. }))
            .count();
        assert_eq!(pauses, 1);
    }

    #[test]
    fn test_failure_repauses_then_recovers() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let scope = Scope::new();
        let events = session.events();
        let handle = spawn_invoke(&session, Mode::Autonomous, None, &scope);

        controller.wait_paused();
        controller.run_command("x = undefined_name").unwrap();

        controller.wait_paused();
        let slots = controller.slots();
        assert_eq!(slots.command, None);
        assert_eq!(slots.fault, None);
        assert!(events
            .get_history()
            .iter()
            .any(|e| matches!(e, SessionEvent::CommandFailed { .. })));

        controller.run_command("x = 3").unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), None);
        assert_eq!(scope.get("x"), Some(json!(3)));
    }

    #[test]
    fn test_fault_raised_by_command_propagates() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let handle = spawn_invoke(&session, Mode::Autonomous, None, &Scope::new());

        controller.wait_paused();
        controller.run_command("fault \"cannot comply\"; x = 1").unwrap();

        match handle.join().unwrap() {
            Err(InvokeError::Fault(fault)) => assert_eq!(fault.message, "cannot comply"),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_consultation_pauses_after_each_command() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let scope = Scope::new();
        let handle = spawn_invoke(&session, Mode::Consultation, None, &scope);

        controller.wait_paused();
        controller.run_command("x = 1").unwrap();

        controller.wait_paused();
        assert_eq!(scope.get("x"), Some(json!(1)));
        controller.run_command("return add(x, 1)").unwrap();

        controller.wait_paused();
        controller.resume().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), Some(json!(2)));
    }

    #[test]
    fn test_reentrant_pause_is_rejected() {
        let inner = Session::new(ScriptInterpreter::new());
        let nested_target = inner.clone();
        let observed = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&observed);
        let outer_controller: Arc<Mutex<Option<Controller>>> = Arc::new(Mutex::new(None));
        let outer_handle = Arc::clone(&outer_controller);

        let session = Session::new(move |_: &str, cx: &mut CommandContext<'_>| {
            let controller = outer_handle.lock().unwrap().clone().unwrap();
            for attempt in ["first", "second"] {
                let result = nested_target.invoke(attempt, Some("return \"leaked\""), &Scope::new());
                record.lock().unwrap().push((
                    matches!(result, Err(InvokeError::ReentrantPause)),
                    pause_active(),
                    controller.slots(),
                    controller.order(),
                    cx.slots.clone(),
                ));
            }
            Ok::<(), ExecError>(())
        });
        *outer_controller.lock().unwrap() = Some(session.controller());
        let controller = session.controller();
        let handle = spawn_invoke(&session, Mode::Autonomous, Some("go"), &Scope::new());

        controller.wait_paused();
        controller.resume().unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), None);

        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 2);
        let seeded = Slots::seeded(Some("go".to_string()));
        for (rejected, active, outer_slots, outer_order, own_slots) in observed.iter() {
            assert!(*rejected);
            assert!(*active);
            assert_eq!(outer_slots, &seeded);
            assert_eq!(outer_order.as_deref(), Some("test order"));
            assert_eq!(own_slots, &seeded);
        }
        assert_eq!(inner.phase(), Phase::Idle);
        assert!(inner.events().get_history().is_empty());
    }

    #[test]
    fn test_interpreter_panic_repauses() {
        let session = Session::new(|command: &str, cx: &mut CommandContext<'_>| {
            if command == "boom" {
                panic!("interpreter blew up");
            }
            cx.slots.result = Some(json!(command));
            Ok::<(), ExecError>(())
        });
        let controller = session.controller();
        let events = session.events();
        let handle = spawn_invoke(&session, Mode::Autonomous, Some("boom"), &Scope::new());

        controller.wait_paused();
        controller.resume().unwrap();

        controller.wait_paused();
        assert_eq!(controller.slots().command, None);
        assert!(events.get_history().iter().any(|e| matches!(
            e,
            SessionEvent::CommandFailed { error, .. } if error.contains("interpreter blew up")
        )));

        controller.run_command("fine").unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), Some(json!("fine")));
    }

    #[test]
    fn test_deeply_nested_command_repauses() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let scope = Scope::new();
        let handle = spawn_invoke(&session, Mode::Autonomous, None, &scope);

        controller.wait_paused();
        controller
            .run_command(format!("x = {}", "[".repeat(200_000)))
            .unwrap();

        controller.wait_paused();
        assert_eq!(controller.slots().command, None);
        assert!(!scope.contains("x"));

        controller.run_command("x = [[1]]").unwrap();
        assert_eq!(handle.join().unwrap().unwrap(), None);
        assert_eq!(scope.get("x"), Some(json!([[1]])));
    }

    #[test]
    fn test_busy_session_rejects_second_invoke() {
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let handle = spawn_invoke(&session, Mode::Autonomous, Some("keep = 1"), &Scope::new());

        controller.wait_paused();
        let second = session.invoke("intruder", Some("x = 2"), &Scope::new());
        assert!(matches!(second, Err(InvokeError::ReentrantPause)));

        let slots = controller.slots();
        assert_eq!(slots.command.as_deref(), Some("keep = 1"));
        assert_eq!(controller.order().as_deref(), Some("test order"));

        controller.resume().unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_pause_marker_resets() {
        assert!(!pause_active());
        {
            let _marker = PauseMarker::acquire().unwrap();
            assert!(pause_active());
            assert!(PauseMarker::acquire().is_none());
            assert!(pause_active());
        }
        assert!(!pause_active());
    }
}
