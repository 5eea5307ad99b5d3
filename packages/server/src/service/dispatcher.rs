//! Named-service call routing (spec §4.10).
//!
//! Each registered [`HubService`] exposes `{name, calls[], call}`. The
//! dispatcher routes `call:<service>/<callName>` to the named service,
//! keeping a `cbID -> channel` map so the eventual result reaches the
//! channel that issued the call even if another channel dispatches in the
//! meantime.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use hub_core::{ErrorCode, Message};
use serde_json::Value;

use crate::network::connection::ChannelRegistry;

/// A caller-facing error from a service call, carrying the same
/// `{errorcode, errorstring}` shape every other wire failure uses.
#[derive(Debug, Clone)]
pub struct ServiceCallError {
    pub code: ErrorCode,
    pub message: String,
}

impl ServiceCallError {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A named, independently-addressable unit of server-side business logic,
/// invoked over `call:<name>/<callName>`.
#[async_trait]
pub trait HubService: Send + Sync {
    /// The namespace segment clients address this service by.
    fn name(&self) -> &str;

    /// The call names this service answers; used to reject unknown calls
    /// before the service itself is invoked.
    fn calls(&self) -> &[&str];

    /// Executes `call` and returns its eventual result. `token` is the
    /// caller's session token (already validated by the caller), `cb_id`
    /// is the client-supplied correlation id if one was given.
    async fn call(
        &self,
        call: &str,
        token: Option<&str>,
        cb_id: Option<&str>,
        arg: Value,
    ) -> Result<Value, ServiceCallError>;
}

/// Routes `call:*` commands to registered [`HubService`]s and correlates
/// replies back to the originating channel by `cbID`.
pub struct ServiceDispatcher {
    services: DashMap<String, Arc<dyn HubService>>,
    pending: DashMap<String, String>,
}

impl ServiceDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn register(&self, service: Arc<dyn HubService>) {
        self.services.insert(service.name().to_string(), service);
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Attempts to handle `msg` as `call:<service>/<callName>`. Returns
    /// `false` if the namespace isn't `call`.
    pub async fn dispatch(
        &self,
        channels: &ChannelRegistry,
        msg: &Message,
        channel_id: &str,
        token: Option<&str>,
    ) -> bool {
        let parsed = msg.parsed_command();
        if parsed.namespace != "call" {
            return false;
        }
        let Some(path) = parsed.verb else {
            reply_failed(channels, msg, channel_id, ErrorCode::InvalidParameters, "missing service/call path");
            return true;
        };
        let Some((service_name, call_name)) = path.split_once('/') else {
            reply_failed(channels, msg, channel_id, ErrorCode::InvalidParameters, "expected <service>/<call>");
            return true;
        };
        let Some(service) = self.services.get(service_name).map(|e| Arc::clone(e.value())) else {
            reply_failed(channels, msg, channel_id, ErrorCode::UnknownType, "unknown service");
            return true;
        };
        if !service.calls().contains(&call_name) {
            reply_failed(channels, msg, channel_id, ErrorCode::UnknownItem, "unknown call");
            return true;
        }

        let cb_id = field_str(msg, "cbID");
        if let Some(cb) = &cb_id {
            self.pending.insert(cb.clone(), channel_id.to_string());
        }
        let arg = msg.data().cloned().unwrap_or(Value::Null);

        match service.call(call_name, token, cb_id.as_deref(), arg).await {
            Ok(result) => self.respond(channels, cb_id, channel_id, result),
            Err(err) => {
                if let Some(cb) = &cb_id {
                    self.pending.remove(cb);
                }
                reply_failed(channels, msg, channel_id, err.code, err.message);
            }
        }
        true
    }

    /// Sends `{uid: cbID, data: result}` to the channel that issued the
    /// originating call, resolving the `cbID -> channel` route if one was
    /// recorded, then drops the route (spec §4.10).
    pub fn respond(&self, channels: &ChannelRegistry, cb_id: Option<String>, fallback_channel: &str, result: Value) {
        let target = cb_id
            .as_ref()
            .and_then(|cb| self.pending.remove(cb).map(|(_, channel)| channel))
            .unwrap_or_else(|| fallback_channel.to_string());
        if let Some(channel) = channels.get(&target) {
            let uid = cb_id.unwrap_or_default();
            channel.send(Message::new("call:response").with_data(serde_json::json!({ "uid": uid, "data": result })));
        }
    }
}

impl Default for ServiceDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn reply_failed(channels: &ChannelRegistry, msg: &Message, channel_id: &str, code: ErrorCode, text: impl Into<String>) {
    if let Some(channel) = channels.get(channel_id) {
        channel.send(msg.failed_reply(code as i32, text));
    }
}

fn field_str(msg: &Message, name: &str) -> Option<String> {
    msg.data()?.get(name)?.as_str().map(str::to_string)
}
