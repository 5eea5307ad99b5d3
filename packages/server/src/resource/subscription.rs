//! Attach/dump/fan-out for resource subscriptions (spec §4.8).

use hub_core::Message;
use serde_json::json;

use super::instance::{ResourceInstance, ResourceKind};
use crate::network::connection::ChannelRegistry;

/// Builds the snapshot message sent to a channel on attach.
///
/// Large lists (item count over [`hub_core::ListResource::LARGE_LIST_THRESHOLD`])
/// send an `init` carrying just the count; the client is expected to page
/// through `<prefix>:get {from,count}` afterward. Everything else sends a
/// full `dump`.
#[must_use]
pub fn dump_message(instance: &ResourceInstance) -> Message {
    let prefix = instance.state.read().resource_type().command_prefix();
    match &*instance.state.read() {
        ResourceKind::List(list) => {
            if list.len() > hub_core::ListResource::LARGE_LIST_THRESHOLD {
                Message::new(format!("{prefix}:init")).with_data(json!({ "count": list.len() }))
            } else {
                Message::new(format!("{prefix}:dump")).with_data(json!({ "items": list.items }))
            }
        }
        ResourceKind::Object(obj) => Message::new(format!("{prefix}:dump"))
            .with_data(json!({ "data": obj.object_data(), "metadata": obj.meta_data() })),
        ResourceKind::Settings(settings) => Message::new(format!("{prefix}:dump")).with_data(json!({
            "data": settings.inner.object_data(),
            "metadata": settings.inner.meta_data(),
        })),
        ResourceKind::ImageCollection(images) => {
            Message::new(format!("{prefix}:dump")).with_data(json!({ "metadata": images.all_metadata() }))
        }
    }
}

/// Sends every member of `instance` the delta, stamping `reply: true` only
/// on the originating channel's copy (spec §4.8 step 3).
pub fn broadcast_delta(
    instance: &ResourceInstance,
    channels: &ChannelRegistry,
    originator: Option<&str>,
    delta: &Message,
) {
    for member_id in instance.member_ids() {
        let Some(channel) = channels.get(&member_id) else {
            continue;
        };
        let mut msg = delta.clone();
        msg.reply = Some(originator == Some(member_id.as_str()));
        channel.send(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::ConnectionConfig;
    use crate::network::connection::ConnectionRegistry;
    use hub_core::ListResource;

    fn list_instance(items: usize) -> ResourceInstance {
        let mut list = ListResource::new(false);
        for i in 0..items {
            list.append(serde_json::Value::from(i), "admin", 1);
        }
        ResourceInstance::new(
            "synclist:home/admin/todo".to_string(),
            "home/admin/todo".to_string(),
            ResourceKind::List(list),
            true,
        )
    }

    #[test]
    fn small_list_dumps_full_snapshot() {
        let instance = list_instance(1);
        let msg = dump_message(&instance);
        assert_eq!(msg.command, "synclist:dump");
    }

    #[test]
    fn large_list_sends_init_with_count() {
        let instance = list_instance(5);
        let msg = dump_message(&instance);
        assert_eq!(msg.command, "synclist:init");
        assert_eq!(msg.data().unwrap()["count"], 5);
    }

    #[test]
    fn broadcast_marks_originator_reply_true() {
        let instance = list_instance(0);
        let conn_registry = ConnectionRegistry::new();
        let (conn, mut rx_a) = conn_registry.register(&ConnectionConfig::default());
        conn_registry.register_channel(&conn, "A").unwrap();
        let (conn_b, mut rx_b) = conn_registry.register(&ConnectionConfig::default());
        conn_registry.register_channel(&conn_b, "B").unwrap();

        instance.attach("A", None);
        instance.attach("B", None);

        let delta = Message::new("synclist:append");
        broadcast_delta(&instance, &conn_registry.channels(), Some("A"), &delta);

        let (_, frame_a) = rx_a.try_recv().unwrap();
        let (_, frame_b) = rx_b.try_recv().unwrap();
        match (frame_a, frame_b) {
            (
                crate::network::connection::OutboundFrame::Message(a),
                crate::network::connection::OutboundFrame::Message(b),
            ) => {
                assert_eq!(a.reply, Some(true));
                assert_eq!(b.reply, Some(false));
            }
            _ => panic!("expected message frames"),
        }
    }
}
