//! Pause-point sessions driven by an external controller.
//!
//! Provides:
//! - `Session` - Suspends the calling thread and runs controller commands
//! - `Controller` - Inspects a paused session, writes its slots and resumes it
//! - `ScriptInterpreter` - Restricted command language bound to the caller's scope
//! - `RegionSlots` - Slot transport for controllers in another process

pub mod controller;
pub mod error;
pub mod region_slots;
pub mod script;
pub mod session;

pub use controller::Controller;
pub use error::{ControlError, InvokeError, SlotError};
pub use region_slots::{Applied, PauseNotice, RegionSlots, SlotKeys};
pub use script::{ScriptError, ScriptInterpreter};
pub use session::{Mode, Phase, Session, pause_active};
