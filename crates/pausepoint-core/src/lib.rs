//! Core abstractions for pause-point sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `codec` - Value encoding for shared regions
//! - `Scope` - Shared variable bindings captured at a pause point
//! - `Slots` / `ControllerFault` - The controller-facing protocol slots
//! - `Interpreter` - The command execution capability
//! - `EventStore` - Broadcast + history of session events

pub mod codec;
pub mod config;
pub mod event;
pub mod event_store;
pub mod scope;
pub mod traits;

pub use codec::CodecError;
pub use config::{Config, ConfigError};
pub use event::SessionEvent;
pub use event_store::EventStore;
pub use scope::{Bindings, Scope};
pub use traits::{CommandContext, ControllerFault, ExecError, Interpreter, Slots};

/// Dynamic value exchanged between the paused program and its controller.
pub use serde_json::Value;
