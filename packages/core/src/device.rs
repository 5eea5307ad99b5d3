//! Device twin data model: desired/real/dirty property tracking, function
//! descriptors, and reconciliation (spec §3 "Device twin", "DeviceProperty",
//! §4.9).
//!
//! As with [`crate::resource`], this is pure `&mut self` state; the server's
//! device manager supplies the external lock, persistence, and RPC routing.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a device's live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    Online,
    Offline,
    Sleeping,
    Standby,
    Updating,
    Busy,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::Offline
    }
}

/// A single RPC descriptor a device advertises at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

/// Real/desired/dirty tracking for one named property on a twin.
///
/// Invariant (spec §8.3): `dirty` is true exactly while a client-written
/// `set_value` has not yet been echoed back by the device as an equal
/// `real_value`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceProperty {
    pub real_value: Option<Value>,
    pub set_value: Option<Value>,
    pub dirty: bool,
    /// Milliseconds of the last confirmed `real_value` update.
    pub timestamp: u64,
    pub metadata: Option<Value>,
}

/// Outcome of echoing a confirmed real value back onto a property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub accepted: bool,
    pub timestamp: u64,
}

impl DeviceProperty {
    /// A client write: records the desired value and marks the property
    /// dirty. The caller is responsible for forwarding the setter RPC when
    /// the device is online (spec §4.9 "Client writes to a property").
    pub fn set_desired(&mut self, value: Value) {
        self.set_value = Some(value);
        self.dirty = true;
    }

    /// The device echoing a confirmed real value, either from a live RPC
    /// reply or from reconciliation on reattach.
    ///
    /// `keep_dirty`: reconciliation (spec §4.9 step 1) updates `real_value`
    /// but must not clear `dirty` just because the device's advertised
    /// value happens to match -- only a genuine runtime echo clears it when
    /// `keep_dirty` is `false`.
    pub fn set_real_value(&mut self, value: Value, now_millis: u64, keep_dirty: bool) -> Confirmation {
        let accepted = self.set_value.as_ref() == Some(&value);
        self.real_value = Some(value);
        self.timestamp = now_millis;
        if keep_dirty {
            // Dirty only survives if the pending desired value still differs
            // from what the device just reported as real.
            self.dirty = self
                .set_value
                .as_ref()
                .is_some_and(|sv| Some(sv) != self.real_value.as_ref());
        } else {
            self.dirty = false;
        }
        Confirmation {
            accepted,
            timestamp: now_millis,
        }
    }
}

/// Pure state of a device's durable server-side twin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceTwin {
    pub uuid: String,
    pub device_type: String,
    pub short_id: Option<String>,
    pub functions: Vec<FunctionDescriptor>,
    pub properties: HashMap<String, DeviceProperty>,
    pub state: DeviceState,
    pub description: Option<String>,
    pub auth_key: Option<u32>,
    pub enable_secure_check: bool,
    /// Parsed from a `.fwvers` property as `major*1000 + minor`.
    pub firmware_version: Option<u32>,
    pub last_online: u64,
    pub permissions: HashMap<String, bool>,
}

impl DeviceTwin {
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            device_type: String::new(),
            short_id: None,
            functions: Vec::new(),
            properties: HashMap::new(),
            state: DeviceState::Offline,
            description: None,
            auth_key: None,
            enable_secure_check: true,
            firmware_version: None,
            last_online: 0,
            permissions: HashMap::new(),
        }
    }

    /// Generates and persists a fresh 32-bit auth key, if one is not
    /// already set (spec §4.9 "Authentication key": idempotent per §8.7).
    pub fn ensure_auth_key(&mut self) -> u32 {
        if let Some(key) = self.auth_key {
            return key;
        }
        let key: u32 = rand::rng().random();
        self.auth_key = Some(key);
        key
    }

    /// Validates a `node:register` key against the stored auth key. Only
    /// enforced when `enable_secure_check` is set.
    #[must_use]
    pub fn check_auth_key(&self, supplied: u32) -> bool {
        !self.enable_secure_check || self.auth_key == Some(supplied)
    }

    /// Reconciliation step 1 (spec §4.9): for each property the device
    /// advertises, fold in the real value while preserving dirty pending
    /// writes. Unknown property names are created fresh.
    pub fn reconcile_property(&mut self, name: &str, value: Value, now_millis: u64) {
        let prop = self.properties.entry(name.to_string()).or_default();
        prop.set_real_value(value, now_millis, true);
    }

    /// Reconciliation step 2: properties still dirty after folding in every
    /// advertised real value -- these are sent back to the device as the
    /// desired state it should converge to.
    #[must_use]
    pub fn dirty_properties(&self) -> HashMap<String, Value> {
        self.properties
            .iter()
            .filter(|(_, p)| p.dirty)
            .filter_map(|(name, p)| p.set_value.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Parses a `.fwvers` advertised value of the form `"major.minor"` into
    /// `major*1000 + minor` (spec §4.9 "Firmware update").
    pub fn set_firmware_version_from_fwvers(&mut self, fwvers: &str) {
        if let Some((major, minor)) = fwvers.split_once('.') {
            if let (Ok(major), Ok(minor)) = (major.parse::<u32>(), minor.parse::<u32>()) {
                self.firmware_version = Some(major * 1000 + minor);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_desired_marks_dirty() {
        let mut prop = DeviceProperty::default();
        prop.set_desired(Value::Bool(true));
        assert!(prop.dirty);
        assert_eq!(prop.set_value, Some(Value::Bool(true)));
    }

    #[test]
    fn runtime_echo_matching_clears_dirty_and_accepts() {
        let mut prop = DeviceProperty::default();
        prop.set_desired(Value::Bool(true));
        let confirmation = prop.set_real_value(Value::Bool(true), 100, false);
        assert!(!prop.dirty);
        assert!(confirmation.accepted);
        assert_eq!(prop.timestamp, 100);
    }

    #[test]
    fn runtime_echo_mismatching_clears_dirty_but_not_accepted() {
        let mut prop = DeviceProperty::default();
        prop.set_desired(Value::Bool(true));
        let confirmation = prop.set_real_value(Value::Bool(false), 100, false);
        assert!(!prop.dirty);
        assert!(!confirmation.accepted);
    }

    #[test]
    fn reconciliation_keeps_dirty_when_stale() {
        // Offline write then reconciliation with a stale advertised value (S4).
        let mut prop = DeviceProperty::default();
        prop.set_desired(Value::Bool(true));
        prop.set_real_value(Value::Bool(false), 100, true);
        assert!(prop.dirty, "stale real value must not clear dirty");
    }

    #[test]
    fn reconciliation_clears_dirty_when_matching() {
        let mut prop = DeviceProperty::default();
        prop.set_desired(Value::Bool(true));
        prop.set_real_value(Value::Bool(true), 100, true);
        assert!(!prop.dirty);
    }

    #[test]
    fn twin_dirty_properties_collects_pending_writes() {
        let mut twin = DeviceTwin::new("AA:BB");
        twin.reconcile_property("on", Value::Bool(false), 1);
        twin.properties.get_mut("on").unwrap().set_desired(Value::Bool(true));
        let dirty = twin.dirty_properties();
        assert_eq!(dirty.get("on"), Some(&Value::Bool(true)));
    }

    #[test]
    fn ensure_auth_key_is_idempotent() {
        let mut twin = DeviceTwin::new("AA:BB");
        let k1 = twin.ensure_auth_key();
        let k2 = twin.ensure_auth_key();
        assert_eq!(k1, k2);
    }

    #[test]
    fn auth_check_bypassed_when_secure_check_disabled() {
        let mut twin = DeviceTwin::new("AA:BB");
        twin.enable_secure_check = false;
        assert!(twin.check_auth_key(0));
    }

    #[test]
    fn auth_check_enforced_when_enabled() {
        let mut twin = DeviceTwin::new("AA:BB");
        let key = twin.ensure_auth_key();
        assert!(twin.check_auth_key(key));
        assert!(!twin.check_auth_key(key.wrapping_add(1)));
    }

    #[test]
    fn fwvers_parses_major_minor() {
        let mut twin = DeviceTwin::new("AA:BB");
        twin.set_firmware_version_from_fwvers("2.5");
        assert_eq!(twin.firmware_version, Some(2005));
    }
}
