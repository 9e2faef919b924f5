//! Session slots carried over shared-memory regions.
//!
//! Lets a controller in another process drive a paused session. The paused
//! side publishes a [`PauseNotice`] under `{prefix}.order`; the remote side
//! answers by writing `{prefix}.command`, `{prefix}.result` or
//! `{prefix}.fault`, and the paused side consumes whatever is present with
//! [`RegionSlots::apply`].
//!
//! Every write replaces the region under a fresh object and every read
//! attaches anew, so neither side ever observes a stale mapping.

use std::sync::Arc;

use pausepoint_core::{Config, ControllerFault, Value, codec};
use pausepoint_shm::{PutOutcome, Region, RegionError, RegionRegistry, region::unlink_name};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::{ControlError, Controller, SlotError};

/// What the paused side tells a remote controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseNotice {
    pub session_id: Uuid,
    pub order: String,
    pub command: Option<String>,
}

/// Region names of the slots for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotKeys {
    pub order: String,
    pub command: String,
    pub result: String,
    pub fault: String,
}

impl SlotKeys {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        Self {
            order: format!("{prefix}.order"),
            command: format!("{prefix}.command"),
            result: format!("{prefix}.result"),
            fault: format!("{prefix}.fault"),
        }
    }
}

/// Which slots an [`apply`](RegionSlots::apply) filled in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub command: bool,
    pub result: bool,
    pub fault: bool,
}

impl Applied {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !(self.command || self.result || self.fault)
    }
}

/// Slot transport over a region registry.
#[derive(Debug, Clone)]
pub struct RegionSlots {
    registry: Arc<RegionRegistry>,
    keys: SlotKeys,
}

impl RegionSlots {
    #[must_use]
    pub fn new(registry: Arc<RegionRegistry>, prefix: &str) -> Self {
        Self {
            registry,
            keys: SlotKeys::new(prefix),
        }
    }

    /// Use the configured slot prefix.
    #[must_use]
    pub fn from_config(registry: Arc<RegionRegistry>, config: &Config) -> Self {
        Self::new(registry, &config.slot_prefix)
    }

    #[must_use]
    pub const fn keys(&self) -> &SlotKeys {
        &self.keys
    }

    // Paused side.

    /// Publish the current pause for remote controllers.
    ///
    /// # Errors
    /// Returns `NotPaused` if the session is not paused, or a region error.
    pub fn publish(&self, controller: &Controller) -> Result<PauseNotice, SlotError> {
        let order = controller
            .order()
            .filter(|_| controller.is_paused())
            .ok_or_else(|| ControlError::NotPaused(controller.phase()))?;
        let notice = PauseNotice {
            session_id: controller.session_id(),
            order,
            command: controller.slots().command,
        };
        self.replace(&self.keys.order, &notice)?;
        tracing::debug!(
            session_id = %notice.session_id,
            region = %self.keys.order,
            "Published pause notice"
        );
        Ok(notice)
    }

    /// Copy any remotely written slots into the paused session and consume
    /// them.
    ///
    /// Slots that were never written are left untouched. Nothing is consumed
    /// if the session is not paused.
    ///
    /// # Errors
    /// Returns `NotPaused` if the session is not paused, or a region error if
    /// a present slot cannot be read or decoded.
    pub fn apply(&self, controller: &Controller) -> Result<Applied, SlotError> {
        let command: Option<String> = peek(&self.keys.command)?;
        let result: Option<Value> = peek(&self.keys.result)?;
        let fault: Option<ControllerFault> = peek(&self.keys.fault)?;

        let applied = Applied {
            command: command.is_some(),
            result: result.is_some(),
            fault: fault.is_some(),
        };
        controller.update(|slots| {
            if let Some(command) = command {
                slots.command = Some(command);
            }
            if let Some(result) = result {
                slots.result = Some(result);
            }
            if let Some(fault) = fault {
                slots.fault = Some(fault);
            }
        })?;

        for (present, key) in [
            (applied.command, &self.keys.command),
            (applied.result, &self.keys.result),
            (applied.fault, &self.keys.fault),
        ] {
            if present {
                unlink_name(key)?;
            }
        }
        if !applied.is_empty() {
            tracing::debug!(?applied, "Applied remote slots");
        }
        Ok(applied)
    }

    /// Withdraw the pause notice.
    ///
    /// # Errors
    /// Returns a region error if unlinking fails.
    pub fn retract(&self) -> Result<bool, RegionError> {
        self.registry.release(&self.keys.order)
    }

    // Remote side.

    /// Read the pause notice, if one is published.
    ///
    /// # Errors
    /// Returns a region error if the notice cannot be read or decoded.
    pub fn read_notice(&self) -> Result<Option<PauseNotice>, RegionError> {
        peek(&self.keys.order)
    }

    /// # Errors
    /// Returns a region error if the slot cannot be written.
    pub fn send_command(&self, command: &str) -> Result<PutOutcome, RegionError> {
        self.replace(&self.keys.command, command)
    }

    /// # Errors
    /// Returns a region error if the slot cannot be written.
    pub fn send_result(&self, value: &Value) -> Result<PutOutcome, RegionError> {
        self.replace(&self.keys.result, value)
    }

    /// # Errors
    /// Returns a region error if the slot cannot be written.
    pub fn send_fault(&self, fault: &ControllerFault) -> Result<PutOutcome, RegionError> {
        self.replace(&self.keys.fault, fault)
    }

    /// Store `value` under a fresh object named `key`.
    fn replace<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<PutOutcome, RegionError> {
        self.registry.release(key)?;
        unlink_name(key)?;
        self.registry.share(key, value)
    }
}

/// Read and decode `name` without tracking it.
///
/// A missing region, or one whose writer has not filled it yet, reads as
/// `None`.
fn peek<T: DeserializeOwned>(name: &str) -> Result<Option<T>, RegionError> {
    let region = match Region::attach(name) {
        Ok(region) => region,
        Err(e) if e.is_not_found() || e.is_unsized() => return Ok(None),
        Err(e) => return Err(e),
    };
    let bytes = region.read()?;
    if bytes.is_empty() {
        return Ok(None);
    }
    codec::decode(&bytes)
        .map(Some)
        .map_err(|source| RegionError::DecodeFailed {
            name: name.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pausepoint_core::Scope;
    use serde_json::json;

    use super::*;
    use crate::{InvokeError, ScriptInterpreter, Session};

    fn pair() -> (RegionSlots, RegionSlots) {
        let prefix = format!("pp-slots-{}", Uuid::new_v4().simple());
        (
            RegionSlots::new(Arc::new(RegionRegistry::new()), &prefix),
            RegionSlots::new(Arc::new(RegionRegistry::new()), &prefix),
        )
    }

    #[test]
    fn test_keys_follow_prefix() {
        let keys = SlotKeys::new("pausepoint");
        assert_eq!(keys.order, "pausepoint.order");
        assert_eq!(keys.fault, "pausepoint.fault");
    }

    #[test]
    fn test_debug_shows_keys_and_registry() {
        let (local, _) = pair();
        let rendered = format!("{local:?}");
        assert!(rendered.contains("RegionRegistry"));
        assert!(rendered.contains(&local.keys().order));
    }

    #[test]
    fn test_remote_command_round() {
        let (local, remote) = pair();
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let caller = {
            let session = session.clone();
            thread::spawn(move || session.invoke("compute seven", None, &Scope::new()))
        };

        controller.wait_paused();
        assert_eq!(remote.read_notice().unwrap(), None);
        local.publish(&controller).unwrap();

        let notice = remote.read_notice().unwrap().unwrap();
        assert_eq!(notice.order, "compute seven");
        assert_eq!(notice.session_id, session.id());

        assert!(local.apply(&controller).unwrap().is_empty());
        remote.send_command("x = 3").unwrap();
        remote.send_command("return 7").unwrap();

        let applied = local.apply(&controller).unwrap();
        assert_eq!(
            applied,
            Applied {
                command: true,
                ..Applied::default()
            }
        );
        assert_eq!(controller.slots().command.as_deref(), Some("return 7"));
        assert!(local.apply(&controller).unwrap().is_empty());

        controller.resume().unwrap();
        assert_eq!(caller.join().unwrap().unwrap(), Some(json!(7)));
        assert!(local.retract().unwrap());
        assert_eq!(remote.read_notice().unwrap(), None);
    }

    #[test]
    fn test_remote_fault() {
        let (local, remote) = pair();
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();
        let caller = {
            let session = session.clone();
            thread::spawn(move || session.invoke("refuse", None, &Scope::new()))
        };

        controller.wait_paused();
        remote
            .send_fault(&ControllerFault::new("remote says no").with_payload(json!({"code": 9})))
            .unwrap();
        remote.send_result(&json!("ignored")).unwrap();
        let applied = local.apply(&controller).unwrap();
        assert!(applied.fault && applied.result && !applied.command);

        controller.resume().unwrap();
        match caller.join().unwrap() {
            Err(InvokeError::Fault(fault)) => {
                assert_eq!(fault.message, "remote says no");
                assert_eq!(fault.payload, Some(json!({"code": 9})));
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[test]
    fn test_apply_requires_pause() {
        let (local, remote) = pair();
        let session = Session::new(ScriptInterpreter::new());
        let controller = session.controller();

        remote.send_result(&json!(1)).unwrap();
        assert!(matches!(
            local.apply(&controller),
            Err(SlotError::Control(ControlError::NotPaused(_)))
        ));
        assert!(matches!(
            local.publish(&controller),
            Err(SlotError::Control(ControlError::NotPaused(_)))
        ));
        assert_eq!(peek::<Value>(&remote.keys().result).unwrap(), Some(json!(1)));
    }
}
