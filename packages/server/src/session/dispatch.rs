//! Routes `user:login|logout|add|delete|changepassword|setpermission`
//! (spec §4.3, §6) and cascades a closed session into the resource and
//! device subscription layers (spec §4.8 step 5).

use hub_core::{ErrorCode, Identity, Message, SessionClosed, SessionError, User, IS_ADMIN};
use serde_json::Value;

use super::directory::InMemoryUserDirectory;
use super::store::SessionStore;
use crate::device::DeviceManager;
use crate::network::connection::ChannelRegistry;
use crate::resource::ResourceRegistry;

/// Everything a single dispatch call needs about the channel issuing it.
pub struct SessionDispatchContext<'a> {
    pub channel_id: &'a str,
    pub token: Option<&'a str>,
}

/// Attempts to handle `msg` as a `user:*` command. Returns `false` if the
/// namespace isn't `user` (the caller should try the next handler, spec §7).
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    store: &SessionStore,
    directory: &InMemoryUserDirectory,
    resources: &ResourceRegistry,
    devices: &DeviceManager,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &SessionDispatchContext<'_>,
) -> bool {
    let parsed = msg.parsed_command();
    if parsed.namespace != "user" {
        return false;
    }
    let Some(verb) = parsed.verb else { return false };

    match verb {
        "login" => handle_login(store, directory, channels, msg, ctx),
        "logout" => handle_logout(store, resources, devices, channels, msg, ctx),
        "add" => handle_add(store, directory, channels, msg, ctx),
        "delete" => handle_delete(store, directory, channels, msg, ctx),
        "changepassword" => handle_changepassword(store, directory, channels, msg, ctx),
        "setpermission" => handle_setpermission(store, directory, channels, msg, ctx),
        _ => reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidParameters, "unknown user command"),
    }
    true
}

/// Invalidates a token and detaches every resource/device subscription it
/// held, intended to be shared between `user:logout` and the periodic
/// expiry sweep (spec §4.8 step 5: "session close... all channels attached
/// under that token are detached").
pub fn cascade_session_closed(
    closed: &SessionClosed,
    resources: &ResourceRegistry,
    devices: &DeviceManager,
) {
    resources.detach_all_by_token(&closed.token);
    devices.detach_by_token(&closed.token);
}

fn handle_login(
    store: &SessionStore,
    directory: &InMemoryUserDirectory,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &SessionDispatchContext<'_>,
) {
    let Some(user_id) = field_str(msg, "userID") else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidParameters, "userID required");
    };
    let password = field_str(msg, "password").unwrap_or_default();

    match store.login_with_password(&user_id, &password) {
        Ok(token) => {
            if let Some(channel) = channels.get(ctx.channel_id) {
                channel.set_token(Some(token.clone()));
                let token_expiration = store.token_expiration_millis(&token).unwrap_or(0);
                let user = directory.get(&user_id).map(|u| sanitized_user(&u)).unwrap_or(Value::Null);
                channel.send(Message::new("user:login:success").with_data(serde_json::json!({
                    "token": token,
                    "tokenExpiration": token_expiration,
                    "user": user,
                })));
            }
        }
        Err(err) => reply_failed(channels, msg, ctx.channel_id, session_error_code(&err), err.to_string()),
    }
}

/// Strips credential material (`password_hash`, `steady_tokens`) before a
/// `User` record crosses the wire (spec S1 `user:{...}`).
fn sanitized_user(user: &User) -> Value {
    serde_json::json!({
        "userID": user.user_id,
        "email": user.email,
        "displayName": user.display_name,
        "permissions": user.permissions,
        "isServiceIdentity": user.is_service_identity,
    })
}

fn handle_logout(
    store: &SessionStore,
    resources: &ResourceRegistry,
    devices: &DeviceManager,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &SessionDispatchContext<'_>,
) {
    let Some(token) = ctx.token else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidToken, "no active session");
    };
    match store.logout(token) {
        Some(closed) => {
            cascade_session_closed(&closed, resources, devices);
            if let Some(channel) = channels.get(ctx.channel_id) {
                channel.set_token(None);
                channel.send(msg.success_reply());
            }
        }
        None => reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidToken, "no active session"),
    }
}

fn handle_add(
    store: &SessionStore,
    directory: &InMemoryUserDirectory,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &SessionDispatchContext<'_>,
) {
    if !is_admin(store, ctx.token) {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::PermissionDenied, "is-admin required");
    }
    let Some(user_id) = field_str(msg, "userID") else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidParameters, "userID required");
    };
    let password = field_str(msg, "password").unwrap_or_default();
    if directory.get(&user_id).is_some() {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::AlreadyExists, "user already exists");
    }
    let mut user = User::new(&user_id, &password);
    user.email = field_str(msg, "email");
    user.display_name = field_str(msg, "displayName");
    directory.upsert(user);
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
}

fn handle_delete(
    store: &SessionStore,
    directory: &InMemoryUserDirectory,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &SessionDispatchContext<'_>,
) {
    if !is_admin(store, ctx.token) {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::PermissionDenied, "is-admin required");
    }
    let Some(user_id) = field_str(msg, "userID") else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidParameters, "userID required");
    };
    if directory.remove(&user_id).is_none() {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::UnknownItem, "no such user");
    }
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
}

fn handle_changepassword(
    store: &SessionStore,
    directory: &InMemoryUserDirectory,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &SessionDispatchContext<'_>,
) {
    let Some(user_id) = field_str(msg, "userID") else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidParameters, "userID required");
    };
    let caller = ctx.token.and_then(|t| store.validate_token(t));
    let self_service = caller.as_ref().is_some_and(|c| c.identity_id() == user_id);
    if !self_service && !is_admin(store, ctx.token) {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::PermissionDenied, "not permitted");
    }
    let Some(mut user) = directory.get(&user_id) else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::UnknownItem, "no such user");
    };
    let new_password = field_str(msg, "newPassword").unwrap_or_default();
    user.password_hash = User::hash_password(&user_id, &new_password);
    directory.upsert(user);
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
}

fn handle_setpermission(
    store: &SessionStore,
    directory: &InMemoryUserDirectory,
    channels: &ChannelRegistry,
    msg: &Message,
    ctx: &SessionDispatchContext<'_>,
) {
    if !is_admin(store, ctx.token) {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::PermissionDenied, "is-admin required");
    }
    let Some(user_id) = field_str(msg, "userID") else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidParameters, "userID required");
    };
    let Some(permission) = field_str(msg, "permission") else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::InvalidParameters, "permission required");
    };
    let granted = msg.data().and_then(|d| d.get("granted")).and_then(Value::as_bool).unwrap_or(false);
    let Some(mut user) = directory.get(&user_id) else {
        return reply_failed(channels, msg, ctx.channel_id, ErrorCode::UnknownItem, "no such user");
    };
    user.set_permission(permission, granted);
    directory.upsert(user);
    if let Some(channel) = channels.get(ctx.channel_id) {
        channel.send(msg.success_reply());
    }
}

fn is_admin(store: &SessionStore, token: Option<&str>) -> bool {
    token
        .and_then(|t| store.validate_token(t))
        .is_some_and(|identity| identity.is_authorized_to(IS_ADMIN))
}

fn session_error_code(err: &SessionError) -> ErrorCode {
    match err {
        SessionError::UserNotExists | SessionError::IncorrectPassword | SessionError::InvalidToken => {
            ErrorCode::InvalidToken
        }
        SessionError::AlreadyLoggedIn => ErrorCode::PermissionDenied,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::config::ConnectionConfig;
    use crate::network::connection::{ConnectionRegistry, OutboundFrame};
    use crate::traits::{AllowAll, NoFirmwareLookup};
    use hub_core::ManualClock;
    use std::sync::Arc;

    fn fixtures() -> (SessionStore, InMemoryUserDirectory, ResourceRegistry, DeviceManager, ConnectionRegistry) {
        let clock = Arc::new(ManualClock::new(0));
        let store = SessionStore::new(clock);
        let directory = InMemoryUserDirectory::new();
        directory.upsert(User::new("admin", "hunter2"));
        let mut admin = directory.get("admin").unwrap();
        admin.set_permission(IS_ADMIN, true);
        directory.upsert(admin);
        store.register_authenticator(Arc::new(InMemoryUserDirectory::from_users(directory.snapshot())));
        let resources = ResourceRegistry::new();
        let devices = DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup));
        let conns = ConnectionRegistry::new();
        (store, directory, resources, devices, conns)
    }

    #[test]
    fn login_sets_channel_token_and_replies_success() {
        let (store, directory, resources, devices, conns) = fixtures();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        let channel = conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("user:login").with_data(serde_json::json!({ "userID": "admin", "password": "hunter2" }));
        let ctx = SessionDispatchContext { channel_id: "C1", token: None };
        assert!(dispatch(&store, &directory, &resources, &devices, &channels, &msg, &ctx));

        assert!(channel.token().is_some());
        let (_, frame) = rx.try_recv().unwrap();
        match frame {
            OutboundFrame::Message(m) => {
                assert_eq!(m.command, "user:login:success");
                let data = m.data().unwrap();
                assert_eq!(data["token"], Value::String(channel.token().unwrap()));
                assert!(data["tokenExpiration"].as_i64().unwrap() > 0);
                assert_eq!(data["user"]["userID"], "admin");
                assert!(data["user"].get("password_hash").is_none());
            }
            OutboundFrame::Close(_) => panic!("expected message"),
        }
    }

    #[test]
    fn wrong_password_replies_failed() {
        let (store, directory, resources, devices, conns) = fixtures();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("user:login").with_data(serde_json::json!({ "userID": "admin", "password": "wrong" }));
        let ctx = SessionDispatchContext { channel_id: "C1", token: None };
        dispatch(&store, &directory, &resources, &devices, &channels, &msg, &ctx);

        let (_, frame) = rx.try_recv().unwrap();
        match frame {
            OutboundFrame::Message(m) => assert_eq!(m.command, "user:login:failed"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
    }

    #[test]
    fn add_requires_admin_permission() {
        let (store, directory, resources, devices, conns) = fixtures();
        let token = store.login_with_password("admin", "hunter2").unwrap();
        let (conn, mut rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("user:add").with_data(serde_json::json!({ "userID": "bob", "password": "x" }));
        let ctx = SessionDispatchContext { channel_id: "C1", token: Some(&token) };
        dispatch(&store, &directory, &resources, &devices, &channels, &msg, &ctx);

        let (_, frame) = rx.try_recv().unwrap();
        match frame {
            OutboundFrame::Message(m) => assert_eq!(m.command, "user:add:success"),
            OutboundFrame::Close(_) => panic!("expected message"),
        }
        assert!(directory.get("bob").is_some());
    }

    #[test]
    fn logout_cascades_resource_detach() {
        let (store, directory, resources, devices, conns) = fixtures();
        resources.register_factory(
            hub_core::ResourceType::SyncList,
            crate::resource::ResourceFactory {
                descriptor_prefix: "",
                dynamic: false,
                build: || crate::resource::ResourceKind::List(hub_core::ListResource::new(false)),
            },
        );
        let token = store.login_with_password("admin", "hunter2").unwrap();
        let instance = resources.get_or_create(hub_core::ResourceType::SyncList, "home/todo", "admin").unwrap();
        instance.attach("C1", Some(token.clone()));

        let (conn, _rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("user:logout");
        let ctx = SessionDispatchContext { channel_id: "C1", token: Some(&token) };
        dispatch(&store, &directory, &resources, &devices, &channels, &msg, &ctx);

        assert_eq!(resources.count(), 0);
    }
}
