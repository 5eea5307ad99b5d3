//! Routes `<prefix>:<verb>` messages to the matching resource operation,
//! replying to the originator and broadcasting deltas to all subscribers
//! (spec §4.5, §4.6, §4.7, §4.8 "Protocol commands").

use hub_core::{ErrorCode, HubError, ListResource, Message, ResourceType, ToWire};
use serde_json::json;

use super::instance::{ResourceInstance, ResourceKind};
use super::registry::ResourceRegistry;
use super::subscription::{broadcast_delta, dump_message};
use crate::network::connection::ChannelRegistry;
use crate::session::AnyIdentity;

/// Everything a single dispatch call needs about the channel issuing it.
pub struct DispatchContext<'a> {
    pub channel_id: &'a str,
    pub token: Option<&'a str>,
    pub identity: Option<&'a AnyIdentity>,
    pub owner_id: &'a str,
    pub now_millis: u64,
}

/// Attempts to handle `msg` as a resource command. Returns `false` if the
/// command's namespace does not match any known resource type prefix (the
/// caller should try the next handler in the chain, spec §7).
pub fn dispatch(
    registry: &ResourceRegistry,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &DispatchContext<'_>,
) -> bool {
    let parsed = msg.parsed_command();
    let Some(resource_type) = ResourceType::from_command_prefix(parsed.namespace) else {
        return false;
    };
    // Device twins share the `<type>:attach` umbrella but are keyed by uuid
    // and fan out through `DeviceManager`'s own membership map rather than a
    // `ResourceInstance`; `device/dispatch.rs` owns this prefix instead.
    if resource_type == ResourceType::Device {
        return false;
    }
    let Some(bare_verb) = parsed.verb else {
        return false;
    };
    // `property:set`/`metadata:set` are three-segment commands; `ParsedCommand`
    // only splits namespace/verb/status, so the full verb is reassembled here.
    let full_verb = match parsed.status {
        Some(status) => format!("{bare_verb}:{status}"),
        None => bare_verb.to_string(),
    };

    let result = route(registry, channels, resource_type, &full_verb, msg, ctx);
    if let Err(err) = result {
        if let Some(channel) = channels.get(ctx.channel_id) {
            let wire = err.to_wire();
            channel.send(msg.failed_reply(wire.errorcode, wire.errorstring));
        }
    }
    true
}

fn route(
    registry: &ResourceRegistry,
    channels: &ChannelRegistry,
    resource_type: ResourceType,
    verb: &str,
    msg: &Message,
    ctx: &DispatchContext<'_>,
) -> Result<(), HubError> {
    if ctx.identity.is_none() {
        return Err(HubError::InvalidToken);
    }
    let descriptor = msg.data().and_then(|d| d.get("descriptor")).and_then(|v| v.as_str());

    // `attach` always resolves fresh from `descriptor` (defaulting to the
    // empty/default descriptor) and records the result as this channel's
    // binding for the type. Every other verb prefers an explicit
    // `descriptor` when given, otherwise routes through that binding rather
    // than re-resolving an empty descriptor to an unrelated instance (spec
    // §4.5, §5).
    let instance = if verb == "attach" {
        let instance = registry.get_or_create(resource_type, descriptor.unwrap_or_default(), ctx.owner_id)?;
        registry.bind(ctx.channel_id, resource_type, &instance.registry_key);
        instance
    } else if let Some(descriptor) = descriptor {
        registry.get_or_create(resource_type, descriptor, ctx.owner_id)?
    } else {
        registry
            .bound(ctx.channel_id, resource_type)
            .ok_or(HubError::InvalidDescriptor(String::new()))?
    };

    match verb {
        "attach" => attach(&instance, channels, ctx),
        "dump" => {
            if !instance.can_read(ctx.identity) {
                return Err(HubError::PermissionDenied);
            }
            if let Some(channel) = channels.get(ctx.channel_id) {
                channel.send(dump_message(&instance));
            }
            Ok(())
        }
        "detach" => {
            instance.detach(ctx.channel_id);
            registry.unbind(ctx.channel_id, resource_type);
            maybe_evict(registry, &instance);
            Ok(())
        }
        "get" => get_page(&instance, channels, msg, ctx),
        _ => mutate(registry, &instance, channels, verb, msg, ctx),
    }
}

fn attach(
    instance: &ResourceInstance,
    channels: &ChannelRegistry,
    ctx: &DispatchContext<'_>,
) -> Result<(), HubError> {
    if !instance.can_read(ctx.identity) {
        return Err(HubError::PermissionDenied);
    }
    instance.attach(ctx.channel_id, ctx.token.map(str::to_string));
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(dump_message(instance));
    }
    Ok(())
}

fn get_page(
    instance: &ResourceInstance,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &DispatchContext<'_>,
) -> Result<(), HubError> {
    let ResourceKind::List(list) = &*instance.state.read() else {
        return Err(HubError::InvalidParameters("get is only valid on list resources".to_string()));
    };
    let from = field_usize(msg, "from").unwrap_or(0);
    let count = field_usize(msg, "count").unwrap_or(list.len());
    let page = list.page(from, count);
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(Message::new("synclist:get").with_data(json!({ "items": page })));
    }
    Ok(())
}

fn mutate(
    registry: &ResourceRegistry,
    instance: &ResourceInstance,
    channels: &ChannelRegistry,
    verb: &str,
    msg: &Message,
    ctx: &DispatchContext<'_>,
) -> Result<(), HubError> {
    if !instance.can_write(ctx.identity) {
        return Err(HubError::PermissionDenied);
    }

    let delta = {
        let mut state = instance.state.write();
        apply_mutation(&mut state, verb, msg, ctx)?
    };

    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
    broadcast_delta(instance, channels, Some(ctx.channel_id), &delta);

    if matches!(verb, "delete") {
        maybe_evict(registry, instance);
    }
    Ok(())
}

fn apply_mutation(
    state: &mut ResourceKind,
    verb: &str,
    msg: &Message,
    ctx: &DispatchContext<'_>,
) -> Result<Message, HubError> {
    let owner = ctx.owner_id;
    let now = ctx.now_millis;
    match state {
        ResourceKind::List(list) => list_mutation(list, verb, msg, owner, now),
        ResourceKind::Object(obj) => object_mutation(obj, verb, msg, owner, now),
        ResourceKind::Settings(settings) => object_mutation(&mut settings.inner, verb, msg, owner, now),
        ResourceKind::ImageCollection(images) => image_mutation(images, verb, msg),
    }
}

fn list_mutation(
    list: &mut ListResource,
    verb: &str,
    msg: &Message,
    owner: &str,
    now: u64,
) -> Result<Message, HubError> {
    let data = msg.data().cloned().unwrap_or(serde_json::Value::Null);
    let delta = match verb {
        "append" => list.append(data.get("data").cloned().unwrap_or(data), owner, now),
        "insertat" => {
            let index = field_usize(msg, "index").ok_or_else(|| {
                HubError::InvalidParameters("insertat requires index".to_string())
            })?;
            list.insert_at(field(msg, "data"), index, owner, now)
        }
        "appendlist" => {
            let items = msg
                .data()
                .and_then(|d| d.get("list"))
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            list.append_list(items, owner, now)
        }
        "remove" => {
            let index = field_usize(msg, "index").unwrap_or(usize::MAX);
            let uuid = field_str(msg, "uuid").unwrap_or_default();
            list.remove(index, &uuid)?
        }
        "clear" => list.clear(),
        "delete" => list.delete(),
        "set" => {
            let index = field_usize(msg, "index").unwrap_or(usize::MAX);
            let uuid = field_str(msg, "uuid").unwrap_or_default();
            list.set(field(msg, "data"), index, &uuid, owner, now)?
        }
        "filter" => {
            list.set_filter()?;
            return Ok(Message::new("synclist:filter"));
        }
        "property:set" => {
            let index = field_usize(msg, "index").unwrap_or(usize::MAX);
            let uuid = field_str(msg, "uuid").unwrap_or_default();
            let name = field_str(msg, "property")
                .ok_or_else(|| HubError::InvalidParameters("property:set requires property".to_string()))?;
            list.set_property(&name, field(msg, "data"), index, &uuid, now)?
        }
        "metadata:set" => list.set_metadata(field(msg, "metadata")),
        _ => return Err(unknown_verb(verb)),
    };
    Ok(delta_to_message("synclist", verb, &delta))
}

fn delta_to_message(prefix: &str, verb: &str, delta: &hub_core::ListDelta) -> Message {
    Message::new(format!("{prefix}:{verb}")).with_data(serde_json::to_value(delta).unwrap_or(serde_json::Value::Null))
}

fn object_mutation(
    obj: &mut hub_core::ObjectResource,
    verb: &str,
    msg: &Message,
    owner: &str,
    now: u64,
) -> Result<Message, HubError> {
    match verb {
        "property:set" => {
            let name = field_str(msg, "name").ok_or_else(|| {
                HubError::InvalidParameters("object property:set requires name".to_string())
            })?;
            let delta = obj.set_property(&name, field(msg, "value"), owner, now)?;
            Ok(Message::new("object:property:set").with_data(serde_json::to_value(&delta).unwrap_or(serde_json::Value::Null)))
        }
        "metadata:set" => {
            obj.set_metadata(field(msg, "metadata"));
            Ok(Message::new("object:metadata:set").with_data(field(msg, "metadata")))
        }
        _ => Err(unknown_verb(verb)),
    }
}

fn image_mutation(
    images: &mut hub_core::ImageCollectionResource,
    verb: &str,
    msg: &Message,
) -> Result<Message, HubError> {
    match verb {
        "insert" => {
            let uid = field_str(msg, "uid").ok_or_else(|| {
                HubError::InvalidParameters("imgcoll insert requires uid".to_string())
            })?;
            let blob = field_str(msg, "image").unwrap_or_default();
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, blob)
                .map_err(|e| HubError::InvalidData(e.to_string()))?;
            images.insert(&uid, bytes, field(msg, "metadata"));
            Ok(Message::new("imgcoll:insert").with_data(json!({ "uid": uid })))
        }
        "delete" => {
            let uid = field_str(msg, "uid").unwrap_or_default();
            images.delete_image(&uid)?;
            Ok(Message::new("imgcoll:delete").with_data(json!({ "uid": uid })))
        }
        _ => Err(unknown_verb(verb)),
    }
}

fn maybe_evict(registry: &ResourceRegistry, instance: &ResourceInstance) {
    if instance.is_empty() {
        registry.evict(&instance.registry_key);
    }
}

fn unknown_verb(verb: &str) -> HubError {
    HubError::InvalidParameters(format!("unsupported operation: {verb}"))
}

fn field(msg: &Message, name: &str) -> serde_json::Value {
    msg.data()
        .and_then(|d| d.get(name))
        .cloned()
        .unwrap_or(serde_json::Value::Null)
}

fn field_str(msg: &Message, name: &str) -> Option<String> {
    msg.data()?.get(name)?.as_str().map(str::to_string)
}

fn field_usize(msg: &Message, name: &str) -> Option<usize> {
    msg.data()?.get(name)?.as_u64().map(|v| v as usize)
}
