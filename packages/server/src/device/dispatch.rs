//! Routes `device:*` and `node:register` messages to [`DeviceManager`]
//! (spec §4.9, and the `device` member of the `<type>:attach` umbrella in
//! §4.8). Mirrors `resource::dispatch`'s shape -- reply to the originator,
//! broadcast the delta to every subscriber -- generalized from a
//! `ResourceInstance`'s membership map to `DeviceManager`'s per-uuid one.

use hub_core::{DeviceError, FunctionDescriptor, Message, ToWire};
use serde_json::{json, Value};

use super::manager::{DeviceManager, RegisterParams};
use crate::network::connection::ChannelRegistry;
use crate::session::AnyIdentity;

/// Everything a single dispatch call needs about the channel issuing it.
pub struct DeviceDispatchContext<'a> {
    pub channel_id: &'a str,
    pub token: Option<&'a str>,
    pub identity: Option<&'a AnyIdentity>,
    pub now_millis: u64,
}

/// Attempts to handle `msg` as a device command. Returns `false` if the
/// command belongs to neither the `device` nor `node` namespace (the caller
/// should try the next handler in the chain, spec §7).
pub fn dispatch(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) -> bool {
    let parsed = msg.parsed_command();
    match parsed.namespace {
        "node" if parsed.verb == Some("register") => {
            handle_register(manager, channels, msg, ctx);
            true
        }
        "device" => {
            let Some(verb) = parsed.verb else { return false };
            let result = route(manager, channels, verb, msg, ctx);
            if let Err(err) = result {
                if let Some(channel) = channels.get(ctx.channel_id) {
                    let wire = err.to_wire();
                    channel.send(msg.failed_reply(wire.errorcode, wire.errorstring));
                }
            }
            true
        }
        _ => false,
    }
}

fn route(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    verb: &str,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) -> Result<(), DeviceError> {
    if ctx.identity.is_none() {
        return Err(DeviceError::PermissionDenied);
    }

    if verb == "hook" {
        return hook(manager, channels, msg, ctx);
    }
    if verb == "unhook" {
        return unhook(manager, channels, msg, ctx);
    }

    // Every other verb addresses a twin by descriptor or raw uuid, resolved
    // through the mapping table (spec §3 "Mapping table").
    let raw = field_str(msg, "descriptor")
        .or_else(|| field_str(msg, "uuid"))
        .unwrap_or_default();
    let uuid = manager.resolve_uuid(&raw);

    match verb {
        "attach" => attach(manager, channels, &uuid, ctx),
        "dump" => {
            if let Some(channel) = channels.get(ctx.channel_id) {
                channel.send(dump_message(manager, &uuid)?);
            }
            Ok(())
        }
        "detach" => {
            manager.detach(&uuid, ctx.channel_id);
            Ok(())
        }
        "setproperty" => set_property(manager, channels, &uuid, msg, ctx),
        "trigger" => trigger(manager, channels, &uuid, msg, ctx),
        "echo" => echo(manager, channels, &uuid, msg, ctx),
        "msg" => {
            route_rpc_reply(manager, channels, msg);
            Ok(())
        }
        _ => Err(DeviceError::FunctionNotExist(verb.to_string())),
    }
}

/// Administrative `device:hook {mapping, uuid}` -- creates (or returns the
/// existing) twin for `uuid` and records the optional `mapping` descriptor
/// in the descriptor->uuid table, gated on `MANAGE_DEVICES` (spec §4.9
/// "Twin lifecycle", scenario S3). Idempotent per spec §8.7: hooking the
/// same `(mapping, uuid)` twice leaves the mapping table and the twin's
/// `authKey` stable.
fn hook(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) -> Result<(), DeviceError> {
    let identity = ctx.identity.ok_or(DeviceError::PermissionDenied)?;
    let uuid = field_str(msg, "uuid").ok_or(DeviceError::DeviceNotAvailable)?;
    let mapping = field_str(msg, "mapping");
    manager.hook(&uuid, mapping.as_deref(), identity)?;
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
    Ok(())
}

/// Administrative `device:unhook {uuid}` -- removes the twin and any
/// mapping pointing at it; a twin still held by a subscribed client
/// survives via its own `Arc` clone (spec §4.9 "Twin lifecycle").
fn unhook(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) -> Result<(), DeviceError> {
    let identity = ctx.identity.ok_or(DeviceError::PermissionDenied)?;
    let uuid = field_str(msg, "uuid").ok_or(DeviceError::DeviceNotAvailable)?;
    manager.unhook(&uuid, identity)?;
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
    Ok(())
}

fn attach(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    uuid: &str,
    ctx: &DeviceDispatchContext<'_>,
) -> Result<(), DeviceError> {
    let dump = dump_message(manager, uuid)?;
    manager.attach(uuid, ctx.channel_id, ctx.token.map(str::to_string));
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(dump);
    }
    Ok(())
}

fn dump_message(manager: &DeviceManager, uuid: &str) -> Result<Message, DeviceError> {
    let twin_arc = manager.twin(uuid).ok_or(DeviceError::DeviceNotAvailable)?;
    let twin = twin_arc.read();
    Ok(Message::new("device:dump").with_data(
        serde_json::to_value(&*twin).unwrap_or(Value::Null),
    ))
}

fn set_property(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    uuid: &str,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) -> Result<(), DeviceError> {
    let name = field_str(msg, "property")
        .or_else(|| field_str(msg, "name"))
        .ok_or_else(|| DeviceError::PropertyNotExists(String::new()))?;
    let value = field(msg, "value");
    let permissions = caller_permissions(ctx.identity);

    let forward_now = manager.set_property(uuid, &name, value.clone(), &permissions)?;

    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
    let delta = Message::new("device:setproperty").with_data(json!({ "uuid": uuid, "name": name, "value": value }));
    broadcast_to_subscribers(manager, channels, uuid, Some(ctx.channel_id), &delta);

    if forward_now {
        if let Some(device_channel) = manager.online_channel(uuid) {
            if let Some(channel) = channels.get(&device_channel) {
                channel.send(Message::new("device:set").with_data(json!({ "name": name, "value": value })));
            }
        }
    }
    Ok(())
}

fn trigger(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    uuid: &str,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) -> Result<(), DeviceError> {
    let name = field_str(msg, "name").ok_or_else(|| DeviceError::FunctionNotExist(String::new()))?;
    let params = field(msg, "params");
    let cb_id = field_str(msg, "cbID");

    let outcome = manager.trigger_function(uuid, &name, ctx.channel_id, cb_id.clone())?;

    if let Some(device_channel) = manager.online_channel(uuid) {
        if let Some(channel) = channels.get(&device_channel) {
            channel.send(
                Message::new("device:call")
                    .with_data(json!({ "name": name, "params": params, "cbID": outcome.cb_id })),
            );
        }
    }
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
    Ok(())
}

/// A device echoing a confirmed real value (runtime RPC reply or
/// reconciliation), `device:echo {uuid, name, value, keepDirty}`.
fn echo(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    uuid: &str,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) -> Result<(), DeviceError> {
    let name = field_str(msg, "name").ok_or_else(|| DeviceError::PropertyNotExists(String::new()))?;
    let value = field(msg, "value");
    let keep_dirty = msg.data().and_then(|d| d.get("keepDirty")).and_then(Value::as_bool).unwrap_or(false);

    let confirmation = manager
        .echo_property(uuid, &name, value.clone(), ctx.now_millis, keep_dirty)
        .ok_or(DeviceError::DeviceNotAvailable)?;

    let delta = Message::new("device:setproperty").with_data(json!({
        "uuid": uuid,
        "name": name,
        "value": value,
        "accepted": confirmation.accepted,
    }));
    broadcast_to_subscribers(manager, channels, uuid, None, &delta);
    Ok(())
}

/// A device's `{cmd:"msg"}` RPC reply, routed back to whichever channel
/// issued the originating `device:trigger` (spec §4.9 "RPC").
fn route_rpc_reply(manager: &DeviceManager, channels: &ChannelRegistry, msg: &Message) {
    let Some(cb_id) = field_str(msg, "subject") else { return };
    let Some(caller_channel) = manager.take_callback_route(&cb_id) else { return };
    let Some(channel) = channels.get(&caller_channel) else { return };
    channel.send(Message::new("device:response").with_data(json!({
        "cbID": cb_id,
        "data": field(msg, "data"),
    })));
}

fn handle_register(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &DeviceDispatchContext<'_>,
) {
    let Some(uuid) = field_str(msg, "id") else { return };
    let device_type = field_str(msg, "type").unwrap_or_default();
    let short_id = field_str(msg, "sid");
    let key = msg.data().and_then(|d| d.get("key")).and_then(Value::as_u64).map(|k| k as u32);
    let functions: Vec<FunctionDescriptor> = msg
        .data()
        .and_then(|d| d.get("functions"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();
    let properties = msg
        .data()
        .and_then(|d| d.get("properties"))
        .and_then(|v| v.as_object().cloned())
        .map(|m| m.into_iter().collect())
        .unwrap_or_default();

    let params = RegisterParams {
        uuid: uuid.clone(),
        device_type,
        key,
        functions,
        properties,
        short_id,
    };

    match manager.register(ctx.channel_id, params, ctx.now_millis) {
        Ok(Some(outcome)) => {
            if let Some(channel) = channels.get(ctx.channel_id) {
                channel.send(
                    Message::new("node:register:success")
                        .with_data(json!({ "initProperties": outcome.init_properties })),
                );
            }
        }
        Ok(None) => {
            // Silent rejection: key mismatch or a missing key on a secured
            // device (spec §4.9 step 1).
        }
        Err(err) => {
            if let Some(channel) = channels.get(ctx.channel_id) {
                let wire = err.to_wire();
                channel.send(msg.failed_reply(wire.errorcode, wire.errorstring));
            }
        }
    }
}

fn broadcast_to_subscribers(
    manager: &DeviceManager,
    channels: &ChannelRegistry,
    uuid: &str,
    originator: Option<&str>,
    delta: &Message,
) {
    for member_id in manager.subscriber_ids(uuid) {
        let Some(channel) = channels.get(&member_id) else { continue };
        let mut out = delta.clone();
        out.reply = Some(originator == Some(member_id.as_str()));
        channel.send(out);
    }
}

fn caller_permissions(identity: Option<&AnyIdentity>) -> Vec<String> {
    identity
        .and_then(AnyIdentity::as_user)
        .map(|u| u.permissions.iter().filter(|(_, granted)| **granted).map(|(k, _)| k.clone()).collect())
        .unwrap_or_default()
}

fn field(msg: &Message, name: &str) -> Value {
    msg.data().and_then(|d| d.get(name)).cloned().unwrap_or(Value::Null)
}

fn field_str(msg: &Message, name: &str) -> Option<String> {
    msg.data()?.get(name)?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::ConnectionConfig;
    use crate::network::connection::{ConnectionRegistry, OutboundFrame};
    use crate::traits::{AllowAll, NoFirmwareLookup};
    use hub_core::{MANAGE_DEVICES, User};
    use std::sync::Arc;

    fn manager() -> DeviceManager {
        DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup))
    }

    fn admin() -> AnyIdentity {
        let mut user = User::new("admin", "x");
        user.set_permission(MANAGE_DEVICES, true);
        AnyIdentity::User(user)
    }

    fn ctx<'a>(identity: &'a AnyIdentity, channel_id: &'a str) -> DeviceDispatchContext<'a> {
        DeviceDispatchContext {
            channel_id,
            token: Some("tok"),
            identity: Some(identity),
            now_millis: 1000,
        }
    }

    #[test]
    fn node_register_then_device_attach_dumps_twin() {
        let mgr = manager();
        let identity = admin();
        mgr.hook("AA:BB", None, &identity).unwrap();

        let conns = ConnectionRegistry::new();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let register_msg = Message::new("node:register")
            .with_data(json!({ "id": "AA:BB", "type": "espduino", "functions": [], "properties": {} }));
        assert!(dispatch(&mgr, &channels, &register_msg, &ctx(&identity, "C1")));
        let (_, success) = rx.try_recv().unwrap();
        match success {
            OutboundFrame::Message(m) => assert_eq!(m.command, "node:register:success"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }

        let (conn2, mut rx2) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn2, "C2").unwrap();
        let attach_msg = Message::new("device:attach").with_data(json!({ "descriptor": "AA:BB" }));
        assert!(dispatch(&mgr, &channels, &attach_msg, &ctx(&identity, "C2")));
        let (_, dump) = rx2.try_recv().unwrap();
        match dump {
            OutboundFrame::Message(m) => assert_eq!(m.command, "device:dump"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
        assert_eq!(mgr.subscriber_ids("AA:BB"), vec!["C2".to_string()]);
    }

    #[test]
    fn unrelated_namespace_is_not_dispatched() {
        let mgr = manager();
        let identity = admin();
        let channels = ConnectionRegistry::new().channels();
        let msg = Message::new("synclist:attach");
        assert!(!dispatch(&mgr, &channels, &msg, &ctx(&identity, "C1")));
    }

    #[test]
    fn setproperty_on_unknown_device_replies_failed() {
        let mgr = manager();
        let identity = admin();
        let conns = ConnectionRegistry::new();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("device:setproperty")
            .with_data(json!({ "descriptor": "unknown", "property": "on", "value": true }));
        assert!(dispatch(&mgr, &channels, &msg, &ctx(&identity, "C1")));
        let (_, failed) = rx.try_recv().unwrap();
        match failed {
            OutboundFrame::Message(m) => assert_eq!(m.command, "device:setproperty:failed"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
    }

    #[test]
    fn setproperty_accepts_name_as_a_legacy_fallback_field() {
        let mgr = manager();
        let identity = admin();
        mgr.hook("AA:BB", None, &identity).unwrap();
        let conns = ConnectionRegistry::new();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("device:setproperty")
            .with_data(json!({ "descriptor": "AA:BB", "name": "on", "value": true }));
        assert!(dispatch(&mgr, &channels, &msg, &ctx(&identity, "C1")));
        let (_, success) = rx.try_recv().unwrap();
        match success {
            OutboundFrame::Message(m) => assert_eq!(m.command, "device:setproperty:success"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
    }

    #[test]
    fn hook_with_mapping_then_attach_by_descriptor_dumps_twin() {
        let mgr = manager();
        let identity = admin();
        let conns = ConnectionRegistry::new();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let hook_msg =
            Message::new("device:hook").with_data(json!({ "mapping": "living/lamp1", "uuid": "AA:BB" }));
        assert!(dispatch(&mgr, &channels, &hook_msg, &ctx(&identity, "C1")));
        rx.try_recv().unwrap();

        let attach_msg = Message::new("device:attach").with_data(json!({ "descriptor": "living/lamp1" }));
        assert!(dispatch(&mgr, &channels, &attach_msg, &ctx(&identity, "C1")));
        let (_, dump) = rx.try_recv().unwrap();
        match dump {
            OutboundFrame::Message(m) => assert_eq!(m.command, "device:dump"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
        assert_eq!(mgr.subscriber_ids("AA:BB"), vec!["C1".to_string()]);
    }

    #[test]
    fn hook_over_the_wire_creates_a_twin_and_is_idempotent() {
        let mgr = manager();
        let identity = admin();
        let conns = ConnectionRegistry::new();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let hook_msg = Message::new("device:hook").with_data(json!({ "uuid": "AA:BB" }));
        assert!(dispatch(&mgr, &channels, &hook_msg, &ctx(&identity, "C1")));
        let (_, success) = rx.try_recv().unwrap();
        match success {
            OutboundFrame::Message(m) => assert_eq!(m.command, "device:hook:success"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
        let twin = mgr.twin("AA:BB").unwrap();
        let auth_key = twin.write().ensure_auth_key();

        // Hooking again (spec §8.7) must leave the auth key stable.
        assert!(dispatch(&mgr, &channels, &hook_msg, &ctx(&identity, "C1")));
        rx.try_recv().unwrap();
        assert_eq!(twin.read().auth_key, Some(auth_key));
    }

    #[test]
    fn hook_without_manage_devices_permission_replies_failed() {
        let mgr = manager();
        let plain = AnyIdentity::User(User::new("bob", "x"));
        let conns = ConnectionRegistry::new();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let hook_msg = Message::new("device:hook").with_data(json!({ "uuid": "AA:BB" }));
        assert!(dispatch(&mgr, &channels, &hook_msg, &ctx(&plain, "C1")));
        let (_, failed) = rx.try_recv().unwrap();
        match failed {
            OutboundFrame::Message(m) => assert_eq!(m.command, "device:hook:failed"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
        assert!(mgr.twin("AA:BB").is_none());
    }

    #[test]
    fn unhook_over_the_wire_removes_the_mapping() {
        let mgr = manager();
        let identity = admin();
        mgr.hook("AA:BB", None, &identity).unwrap();
        let conns = ConnectionRegistry::new();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let unhook_msg = Message::new("device:unhook").with_data(json!({ "uuid": "AA:BB" }));
        assert!(dispatch(&mgr, &channels, &unhook_msg, &ctx(&identity, "C1")));
        let (_, success) = rx.try_recv().unwrap();
        match success {
            OutboundFrame::Message(m) => assert_eq!(m.command, "device:unhook:success"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
        assert!(mgr.twin("AA:BB").is_none());
    }
}
