//! Device twin lifecycle, registration, property writes, and RPC call
//! routing (spec §4.9).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use hub_core::{
    Confirmation, DeviceError, DeviceState, DeviceTwin, FunctionDescriptor, Identity, PersistedStore,
    TwinDocument, MANAGE_DEVICES,
};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::warn;

use crate::resource::Subscription;
use crate::session::AnyIdentity;
use crate::traits::{FirmwareLookup, PermissionChecker};

/// Parameters carried by a `node:register` message.
pub struct RegisterParams {
    pub uuid: String,
    pub device_type: String,
    pub key: Option<u32>,
    pub functions: Vec<FunctionDescriptor>,
    pub properties: HashMap<String, Value>,
    pub short_id: Option<String>,
}

/// Outcome of a successful registration: whether the channel should have
/// its keepalive tightened, and the desired values to push back to the
/// device as `initProperties` (spec §4.9 "Reconciliation on (re)attach").
pub struct RegisterOutcome {
    pub init_properties: HashMap<String, Value>,
}

/// Outcome of forwarding `triggerFunction` (spec §4.9 "RPC").
pub struct TriggerOutcome {
    /// `Some` when the caller supplied a `cbID`: record it so the device's
    /// later `msg` response routes back to exactly this channel; `None`
    /// means broadcast the eventual result to every subscriber instead.
    pub cb_id: Option<String>,
}

/// Owns every device twin, the live channel binding for connected devices,
/// and the `cbID -> channel` correlation table for in-flight RPCs.
pub struct DeviceManager {
    twins: DashMap<String, Arc<RwLock<DeviceTwin>>>,
    /// Descriptor -> device uuid, the durable naming layer between
    /// human-chosen addresses and device uuids (spec §3 "Mapping table").
    mappings: DashMap<String, String>,
    channel_by_uuid: DashMap<String, String>,
    pending_calls: DashMap<String, String>,
    /// Channels subscribed to a twin's property deltas, keyed by uuid (spec
    /// §4.8, generalized from the list/object subscription handler to
    /// twins -- the same membership/fan-out shape, just keyed by device
    /// uuid instead of a qualified resource name).
    subscribers: DashMap<String, RwLock<HashMap<String, Subscription>>>,
    permissions: Arc<dyn PermissionChecker>,
    firmware: Arc<dyn FirmwareLookup>,
    /// Write-through persistence (spec §6 "Persisted layout"); `None` runs
    /// with twins held purely in memory.
    storage: Option<Arc<dyn PersistedStore>>,
}

impl DeviceManager {
    #[must_use]
    pub fn new(permissions: Arc<dyn PermissionChecker>, firmware: Arc<dyn FirmwareLookup>) -> Self {
        Self {
            twins: DashMap::new(),
            mappings: DashMap::new(),
            channel_by_uuid: DashMap::new(),
            pending_calls: DashMap::new(),
            subscribers: DashMap::new(),
            permissions,
            firmware,
            storage: None,
        }
    }

    /// Attaches a persistence backend; twin mutations are written through to
    /// it under `devices/<uuid>` (spec §6).
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn PersistedStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Fires off a best-effort write of the current twin state. Runs
    /// detached from the caller so hook/register/property writes stay
    /// synchronous; a slow or failing backend never blocks a live RPC.
    fn persist_twin(&self, uuid: &str, twin: &DeviceTwin) {
        let Some(storage) = self.storage.clone() else { return };
        let key = format!("devices/{uuid}");
        let doc = match serde_json::to_value(TwinDocument::from(twin)) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(uuid, %err, "failed to serialize device twin for persistence");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = storage.store(&key, &doc).await {
                warn!(uuid = %key, %err, "failed to persist device twin");
            }
        });
    }

    /// Fires off a best-effort write of the whole descriptor->uuid table
    /// under the single shared `mappings` document (spec §6).
    fn persist_mappings(&self) {
        let Some(storage) = self.storage.clone() else { return };
        let snapshot: HashMap<String, String> =
            self.mappings.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        let doc = match serde_json::to_value(&snapshot) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "failed to serialize device mappings for persistence");
                return;
            }
        };
        tokio::spawn(async move {
            if let Err(err) = storage.store("mappings", &doc).await {
                warn!(%err, "failed to persist device mappings");
            }
        });
    }

    /// Resolves a human descriptor to its mapped device uuid, falling back to
    /// treating the input as an already-raw uuid if no mapping exists (spec
    /// §3 "Mapping table").
    #[must_use]
    pub fn resolve_uuid(&self, descriptor_or_uuid: &str) -> String {
        self.mappings
            .get(descriptor_or_uuid)
            .map(|e| e.value().clone())
            .unwrap_or_else(|| descriptor_or_uuid.to_string())
    }

    /// Attaches a channel to a twin's delta fan-out (spec §4.8 step 2,
    /// applied to `device:attach`). No-op on repeated attach from the same
    /// channel.
    pub fn attach(&self, uuid: &str, channel_id: &str, token: Option<String>) {
        self.subscribers
            .entry(uuid.to_string())
            .or_default()
            .write()
            .insert(channel_id.to_string(), Subscription { token });
    }

    pub fn detach(&self, uuid: &str, channel_id: &str) {
        if let Some(members) = self.subscribers.get(uuid) {
            members.write().remove(channel_id);
        }
    }

    #[must_use]
    pub fn subscriber_ids(&self, uuid: &str) -> Vec<String> {
        self.subscribers
            .get(uuid)
            .map(|m| m.read().keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Detaches every channel subscribed under `token`, across every twin
    /// (spec §4.8 step 5, forced session close).
    pub fn detach_by_token(&self, token: &str) {
        for entry in &self.subscribers {
            let mut members = entry.value().write();
            let stale: Vec<String> = members
                .iter()
                .filter(|(_, sub)| sub.token.as_deref() == Some(token))
                .map(|(id, _)| id.clone())
                .collect();
            for id in stale {
                members.remove(&id);
            }
        }
    }

    #[must_use]
    pub fn twin(&self, uuid: &str) -> Option<Arc<RwLock<DeviceTwin>>> {
        self.twins.get(uuid).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn is_online(&self, uuid: &str) -> bool {
        self.channel_by_uuid.contains_key(uuid)
    }

    /// The channel currently bound to a device's own connection, used to
    /// forward setter/RPC frames to it (spec §4.9 "Client writes to a
    /// property", "RPC").
    #[must_use]
    pub fn online_channel(&self, uuid: &str) -> Option<String> {
        self.channel_by_uuid.get(uuid).map(|e| e.value().clone())
    }

    /// Hooks a mapping to a device uuid, creating its twin if this is the
    /// first hook, gated on `MANAGE_DEVICES` (spec §4.9 "Twin lifecycle").
    /// `mapping` is the optional human-readable descriptor (e.g.
    /// `living/lamp1`) recorded in the descriptor->uuid table; idempotent
    /// per spec §8.7: hooking the same `(mapping, uuid)` twice leaves both
    /// the mapping table and the twin's `authKey` unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::PermissionDenied`] if `identity` lacks
    /// `MANAGE_DEVICES`.
    pub fn hook(
        &self,
        uuid: &str,
        mapping: Option<&str>,
        identity: &AnyIdentity,
    ) -> Result<Arc<RwLock<DeviceTwin>>, DeviceError> {
        if !identity.is_authorized_to(MANAGE_DEVICES) {
            return Err(DeviceError::PermissionDenied);
        }
        let twin = if let Some(existing) = self.twins.get(uuid) {
            Arc::clone(existing.value())
        } else {
            let twin = Arc::new(RwLock::new(DeviceTwin::new(uuid)));
            self.twins.insert(uuid.to_string(), Arc::clone(&twin));
            self.persist_twin(uuid, &twin.read());
            twin
        };
        if let Some(mapping) = mapping {
            if self.mappings.get(mapping).map(|e| e.value().clone()).as_deref() != Some(uuid) {
                self.mappings.insert(mapping.to_string(), uuid.to_string());
                self.persist_mappings();
            }
        }
        Ok(twin)
    }

    /// Removes the twin and any mapping entries pointing at it; a twin
    /// already held by a subscribed client survives via its own `Arc` clone
    /// (spec §4.9 "Twin lifecycle").
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::PermissionDenied`] if `identity` lacks
    /// `MANAGE_DEVICES`.
    pub fn unhook(&self, uuid: &str, identity: &AnyIdentity) -> Result<(), DeviceError> {
        if !identity.is_authorized_to(MANAGE_DEVICES) {
            return Err(DeviceError::PermissionDenied);
        }
        self.twins.remove(uuid);
        let stale: Vec<String> = self
            .mappings
            .iter()
            .filter(|e| e.value() == uuid)
            .map(|e| e.key().clone())
            .collect();
        if !stale.is_empty() {
            for descriptor in &stale {
                self.mappings.remove(descriptor);
            }
            self.persist_mappings();
        }
        if let Some(storage) = self.storage.clone() {
            let key = format!("devices/{uuid}");
            tokio::spawn(async move {
                if let Err(err) = storage.delete(&key).await {
                    warn!(uuid = %key, %err, "failed to delete persisted device twin");
                }
            });
        }
        Ok(())
    }

    /// Handles `node:register` (spec §4.9 "Registration" and
    /// "Reconciliation on (re)attach"). Returns `Ok(None)` when the key
    /// check silently rejects the registration.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::DeviceNotAvailable`] if no twin has ever been
    /// hooked for this uuid.
    pub fn register(
        &self,
        channel_id: &str,
        params: RegisterParams,
        now_millis: u64,
    ) -> Result<Option<RegisterOutcome>, DeviceError> {
        let twin_arc = self.twins.get(&params.uuid).map(|e| Arc::clone(e.value()));
        let Some(twin_arc) = twin_arc else {
            return Err(DeviceError::DeviceNotAvailable);
        };

        {
            let twin = twin_arc.read();
            if let Some(key) = params.key {
                if !twin.check_auth_key(key) {
                    warn!(uuid = %params.uuid, "node:register key mismatch, rejecting silently");
                    return Ok(None);
                }
            } else if twin.enable_secure_check && twin.auth_key.is_some() {
                warn!(uuid = %params.uuid, "node:register missing key on secured device");
                return Ok(None);
            }
        }

        // Deregister any previous in-memory binding for this uuid, keeping
        // the twin handle itself (spec §4.9 step 1).
        self.channel_by_uuid.insert(params.uuid.clone(), channel_id.to_string());

        let mut twin = twin_arc.write();
        twin.device_type = params.device_type;
        twin.functions = params.functions;
        twin.state = DeviceState::Online;
        twin.last_online = now_millis;
        if params.short_id.is_some() {
            twin.short_id = params.short_id;
        }
        if twin.enable_secure_check {
            twin.ensure_auth_key();
        }
        for (name, value) in params.properties {
            twin.reconcile_property(&name, value, now_millis);
        }
        let init_properties = twin.dirty_properties();
        self.persist_twin(&params.uuid, &twin);

        Ok(Some(RegisterOutcome { init_properties }))
    }

    /// Client write to a device property (spec §4.9 "Client writes to a
    /// property"). Returns `true` if the caller should forward a setter RPC
    /// now (the device is online); otherwise the write is persisted and
    /// waits for the device to reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::DeviceNotAvailable`] if no twin exists, or
    /// [`DeviceError::PermissionDenied`] if the permission checker rejects
    /// the write.
    pub fn set_property(
        &self,
        uuid: &str,
        name: &str,
        value: Value,
        permissions: &[String],
    ) -> Result<bool, DeviceError> {
        let twin_arc = self.twin(uuid).ok_or(DeviceError::DeviceNotAvailable)?;
        let device_type = twin_arc.read().device_type.clone();
        if !self.permissions.can_write_property(&device_type, name, permissions) {
            return Err(DeviceError::PermissionDenied);
        }
        {
            let mut twin = twin_arc.write();
            twin.properties.entry(name.to_string()).or_default().set_desired(value);
            self.persist_twin(uuid, &twin);
        }
        Ok(self.is_online(uuid))
    }

    /// A device echoing a confirmed real value, either a live RPC reply or
    /// a reconciliation pass. `keep_dirty` distinguishes the two (spec
    /// §8.3 invariant).
    #[must_use]
    pub fn echo_property(
        &self,
        uuid: &str,
        name: &str,
        value: Value,
        now_millis: u64,
        keep_dirty: bool,
    ) -> Option<Confirmation> {
        let twin_arc = self.twin(uuid)?;
        let mut twin = twin_arc.write();
        let prop = twin.properties.entry(name.to_string()).or_default();
        let confirmation = prop.set_real_value(value, now_millis, keep_dirty);
        self.persist_twin(uuid, &twin);
        Some(confirmation)
    }

    /// Forwards `triggerFunction` (spec §4.9 "RPC").
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::DeviceNotAvailable`] if the device is offline,
    /// or [`DeviceError::FunctionNotExist`] if no advertised function
    /// matches `name`.
    pub fn trigger_function(
        &self,
        uuid: &str,
        name: &str,
        caller_channel: &str,
        cb_id: Option<String>,
    ) -> Result<TriggerOutcome, DeviceError> {
        let twin_arc = self.twin(uuid).ok_or(DeviceError::DeviceNotAvailable)?;
        if !self.is_online(uuid) {
            return Err(DeviceError::DeviceNotAvailable);
        }
        if !twin_arc.read().functions.iter().any(|f| f.name == name) {
            return Err(DeviceError::FunctionNotExist(name.to_string()));
        }
        if let Some(cb_id) = &cb_id {
            self.pending_calls.insert(cb_id.clone(), caller_channel.to_string());
        }
        Ok(TriggerOutcome { cb_id })
    }

    /// Resolves and removes a pending `cbID -> channel` route, used when the
    /// device's `{cmd:"msg", params:{subject:cbID}}` reply arrives.
    #[must_use]
    pub fn take_callback_route(&self, cb_id: &str) -> Option<String> {
        self.pending_calls.remove(cb_id).map(|(_, channel)| channel)
    }

    /// Purges everything bound to a disconnected channel: its device
    /// binding (marking the twin offline) and any pending `cbID` routes
    /// (spec §4.9 "channel disconnects purge any pending cbID").
    pub fn on_channel_disconnect(&self, channel_id: &str) {
        let disconnected: Vec<String> = self
            .channel_by_uuid
            .iter()
            .filter(|e| e.value() == channel_id)
            .map(|e| e.key().clone())
            .collect();
        for uuid in disconnected {
            self.channel_by_uuid.remove(&uuid);
            if let Some(twin) = self.twin(&uuid) {
                twin.write().state = DeviceState::Offline;
            }
        }
        self.pending_calls.retain(|_, channel| channel != channel_id);
        for entry in &self.subscribers {
            entry.value().write().remove(channel_id);
        }
    }

    /// Looks up whether a newer firmware image is available, per the
    /// `FirmwareLookup` collaborator seam (spec §4.9 "Firmware update").
    ///
    /// # Errors
    ///
    /// Propagates whatever the configured [`FirmwareLookup`] returns.
    pub async fn check_firmware_update(&self, device_type: &str) -> anyhow::Result<Option<u32>> {
        self.firmware.latest_version(device_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{AllowAll, NoFirmwareLookup};
    use hub_core::User;

    fn manager() -> DeviceManager {
        DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup))
    }

    fn admin() -> AnyIdentity {
        let mut user = User::new("admin", "x");
        user.set_permission(MANAGE_DEVICES, true);
        AnyIdentity::User(user)
    }

    #[test]
    fn hook_requires_manage_devices_permission() {
        let mgr = manager();
        let plain = AnyIdentity::User(User::new("bob", "x"));
        assert!(matches!(
            mgr.hook("AA:BB", None, &plain),
            Err(DeviceError::PermissionDenied)
        ));
    }

    #[test]
    fn hook_then_register_reconciles_dirty_property() {
        let mgr = manager();
        mgr.hook("AA:BB", None, &admin()).unwrap();

        // Offline write before the device ever connects.
        mgr.set_property("AA:BB", "on", Value::Bool(true), &[]).unwrap();

        let mut props = HashMap::new();
        props.insert("on".to_string(), Value::Bool(false)); // stale advertised value
        let outcome = mgr
            .register(
                "C1",
                RegisterParams {
                    uuid: "AA:BB".to_string(),
                    device_type: "espduino".to_string(),
                    key: None,
                    functions: vec![],
                    properties: props,
                    short_id: None,
                },
                1000,
            )
            .unwrap()
            .unwrap();

        assert_eq!(outcome.init_properties.get("on"), Some(&Value::Bool(true)));
        assert!(mgr.is_online("AA:BB"));
    }

    #[test]
    fn register_without_hook_fails() {
        let mgr = manager();
        let err = mgr
            .register(
                "C1",
                RegisterParams {
                    uuid: "unknown".to_string(),
                    device_type: "x".to_string(),
                    key: None,
                    functions: vec![],
                    properties: HashMap::new(),
                    short_id: None,
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, DeviceError::DeviceNotAvailable));
    }

    #[test]
    fn trigger_function_requires_online_device() {
        let mgr = manager();
        mgr.hook("AA:BB", None, &admin()).unwrap();
        let err = mgr.trigger_function("AA:BB", "blink", "C1", None).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceNotAvailable));
    }

    #[test]
    fn trigger_function_routes_cb_id_and_can_be_taken_once() {
        let mgr = manager();
        mgr.hook("AA:BB", None, &admin()).unwrap();
        mgr.register(
            "C1",
            RegisterParams {
                uuid: "AA:BB".to_string(),
                device_type: "x".to_string(),
                key: None,
                functions: vec![FunctionDescriptor {
                    name: "blink".to_string(),
                    params: Value::Null,
                }],
                properties: HashMap::new(),
                short_id: None,
            },
            0,
        )
        .unwrap();

        mgr.trigger_function("AA:BB", "blink", "C1", Some("cb1".to_string())).unwrap();
        assert_eq!(mgr.take_callback_route("cb1"), Some("C1".to_string()));
        assert_eq!(mgr.take_callback_route("cb1"), None);
    }

    #[test]
    fn disconnect_marks_offline_and_purges_pending_calls() {
        let mgr = manager();
        mgr.hook("AA:BB", None, &admin()).unwrap();
        mgr.register(
            "C1",
            RegisterParams {
                uuid: "AA:BB".to_string(),
                device_type: "x".to_string(),
                key: None,
                functions: vec![FunctionDescriptor {
                    name: "blink".to_string(),
                    params: Value::Null,
                }],
                properties: HashMap::new(),
                short_id: None,
            },
            0,
        )
        .unwrap();
        mgr.trigger_function("AA:BB", "blink", "C1", Some("cb1".to_string())).unwrap();

        mgr.on_channel_disconnect("C1");

        assert!(!mgr.is_online("AA:BB"));
        assert_eq!(mgr.take_callback_route("cb1"), None);
    }

    #[test]
    fn attach_tracks_subscriber_and_detach_removes_it() {
        let mgr = manager();
        mgr.hook("AA:BB", None, &admin()).unwrap();
        mgr.attach("AA:BB", "C1", Some("tok".to_string()));
        assert_eq!(mgr.subscriber_ids("AA:BB"), vec!["C1".to_string()]);
        mgr.detach("AA:BB", "C1");
        assert!(mgr.subscriber_ids("AA:BB").is_empty());
    }

    #[test]
    fn detach_by_token_clears_matching_subscribers_across_twins() {
        let mgr = manager();
        mgr.hook("AA:BB", None, &admin()).unwrap();
        mgr.hook("CC:DD", None, &admin()).unwrap();
        mgr.attach("AA:BB", "C1", Some("tokA".to_string()));
        mgr.attach("CC:DD", "C2", Some("tokA".to_string()));
        mgr.attach("CC:DD", "C3", Some("tokB".to_string()));

        mgr.detach_by_token("tokA");

        assert!(mgr.subscriber_ids("AA:BB").is_empty());
        assert_eq!(mgr.subscriber_ids("CC:DD"), vec!["C3".to_string()]);
    }

    #[test]
    fn disconnect_purges_subscriber_membership() {
        let mgr = manager();
        mgr.hook("AA:BB", None, &admin()).unwrap();
        mgr.attach("AA:BB", "C1", None);

        mgr.on_channel_disconnect("C1");

        assert!(mgr.subscriber_ids("AA:BB").is_empty());
    }

    #[tokio::test]
    async fn hook_persists_a_fresh_twin_document() {
        let storage: Arc<dyn hub_core::PersistedStore> = Arc::new(hub_core::InMemoryStore::new());
        let mgr = DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup)).with_storage(Arc::clone(&storage));
        mgr.hook("AA:BB", None, &admin()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let doc = storage.load("devices/AA:BB").await.unwrap();
        assert!(doc.is_some(), "hooking a new uuid should write its twin document");
    }

    #[tokio::test]
    async fn register_persists_reconciled_properties() {
        let storage: Arc<dyn hub_core::PersistedStore> = Arc::new(hub_core::InMemoryStore::new());
        let mgr = DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup)).with_storage(Arc::clone(&storage));
        mgr.hook("AA:BB", None, &admin()).unwrap();

        let mut props = HashMap::new();
        props.insert("on".to_string(), Value::Bool(true));
        mgr.register(
            "C1",
            RegisterParams {
                uuid: "AA:BB".to_string(),
                device_type: "espduino".to_string(),
                key: None,
                functions: vec![],
                properties: props,
                short_id: None,
            },
            1000,
        )
        .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let doc = storage.load("devices/AA:BB").await.unwrap().unwrap();
        let twin_doc: hub_core::TwinDocument = serde_json::from_value(doc).unwrap();
        assert_eq!(twin_doc.properties["on"].val, Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn unhook_deletes_the_persisted_twin_document() {
        let storage: Arc<dyn hub_core::PersistedStore> = Arc::new(hub_core::InMemoryStore::new());
        let mgr = DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup)).with_storage(Arc::clone(&storage));
        mgr.hook("AA:BB", None, &admin()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(storage.load("devices/AA:BB").await.unwrap().is_some());

        mgr.unhook("AA:BB", &admin()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(storage.load("devices/AA:BB").await.unwrap().is_none());
    }

    #[test]
    fn key_mismatch_on_secured_device_rejects_silently() {
        let mgr = manager();
        let twin = mgr.hook("AA:BB", None, &admin()).unwrap();
        let correct_key = twin.write().ensure_auth_key();

        let outcome = mgr
            .register(
                "C1",
                RegisterParams {
                    uuid: "AA:BB".to_string(),
                    device_type: "x".to_string(),
                    key: Some(correct_key.wrapping_add(1)),
                    functions: vec![],
                    properties: HashMap::new(),
                    short_id: None,
                },
                0,
            )
            .unwrap();
        assert!(outcome.is_none());
        assert!(!mgr.is_online("AA:BB"));
    }

    #[test]
    fn hook_with_mapping_resolves_descriptor_to_uuid() {
        let mgr = manager();
        mgr.hook("AA:BB", Some("living/lamp1"), &admin()).unwrap();
        assert_eq!(mgr.resolve_uuid("living/lamp1"), "AA:BB");
    }

    #[test]
    fn resolve_uuid_falls_back_to_input_when_unmapped() {
        let mgr = manager();
        assert_eq!(mgr.resolve_uuid("AA:BB"), "AA:BB");
    }

    #[test]
    fn hooking_same_mapping_twice_is_idempotent() {
        let mgr = manager();
        let twin = mgr.hook("AA:BB", Some("living/lamp1"), &admin()).unwrap();
        let auth_key = twin.write().ensure_auth_key();
        mgr.hook("AA:BB", Some("living/lamp1"), &admin()).unwrap();
        assert_eq!(mgr.resolve_uuid("living/lamp1"), "AA:BB");
        assert_eq!(twin.read().auth_key, Some(auth_key));
    }

    #[test]
    fn unhook_removes_mappings_pointing_at_the_uuid() {
        let mgr = manager();
        mgr.hook("AA:BB", Some("living/lamp1"), &admin()).unwrap();
        mgr.unhook("AA:BB", &admin()).unwrap();
        assert_eq!(mgr.resolve_uuid("living/lamp1"), "living/lamp1");
    }

    #[tokio::test]
    async fn hook_with_mapping_persists_mappings_document() {
        let storage: Arc<dyn hub_core::PersistedStore> = Arc::new(hub_core::InMemoryStore::new());
        let mgr = DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup)).with_storage(Arc::clone(&storage));
        mgr.hook("AA:BB", Some("living/lamp1"), &admin()).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let doc = storage.load("mappings").await.unwrap().unwrap();
        let mappings: HashMap<String, String> = serde_json::from_value(doc).unwrap();
        assert_eq!(mappings.get("living/lamp1"), Some(&"AA:BB".to_string()));
    }
}
