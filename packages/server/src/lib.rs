//! Realtime hub server: connection multiplexing, identity/session
//! management, the resource subscription engine, the device twin layer, and
//! named-service call routing (spec §1).
//!
//! [`Hub`] is the top-level orchestrator: it owns every collaborator and
//! implements the first-match-wins dispatch chain (spec §7) a connection's
//! inbound message is routed through.

pub mod config;
pub mod device;
pub mod network;
pub mod resource;
pub mod service;
pub mod session;
pub mod traits;

use std::sync::Arc;

use hub_core::{Identity, Message, PersistedStore};

use device::DeviceManager;
use network::connection::ChannelRegistry;
use resource::ResourceRegistry;
use service::ServiceDispatcher;
use session::{AnyIdentity, InMemoryUserDirectory, SessionStore};

pub use config::{Cli, ServerConfig};
pub use traits::{AllowAll, FirmwareLookup, NoFirmwareLookup, PermissionChecker};

/// Everything a connection needs bound together: sessions, resources,
/// device twins, and named services, plus the persistence backend they
/// share. Constructed once per process and shared behind an `Arc` across
/// every connection task.
pub struct Hub {
    pub sessions: SessionStore,
    pub directory: Arc<InMemoryUserDirectory>,
    pub resources: ResourceRegistry,
    pub devices: DeviceManager,
    pub services: ServiceDispatcher,
    pub storage: Arc<dyn PersistedStore>,
}

impl Hub {
    /// Wires a fresh [`Hub`] from its collaborators, registering `directory`
    /// as the session store's sole authenticator (spec §4.3
    /// `registerAuthenticator`).
    #[must_use]
    pub fn with_collaborators(
        sessions: SessionStore,
        directory: Arc<InMemoryUserDirectory>,
        resources: ResourceRegistry,
        devices: DeviceManager,
        services: ServiceDispatcher,
        storage: Arc<dyn PersistedStore>,
    ) -> Self {
        sessions.register_authenticator(directory.clone());
        let devices = devices.with_storage(Arc::clone(&storage));
        Self {
            sessions,
            directory,
            resources,
            devices,
            services,
            storage,
        }
    }

    /// Routes one inbound [`Message`] through the dispatch chain: session
    /// commands, then resource commands, then device commands, then named
    /// service calls (spec §7). The first handler that recognizes the
    /// command's namespace owns it; later handlers never see it.
    pub async fn dispatch(&self, channels: &ChannelRegistry, msg: &Message, channel_id: &str, now_millis: u64) -> bool {
        let token = channels.get(channel_id).and_then(|c| c.token());
        let identity = token.as_deref().and_then(|t| self.sessions.validate_token(t));

        let session_ctx = session::SessionDispatchContext {
            channel_id,
            token: token.as_deref(),
        };
        if session::dispatch_user_command(
            &self.sessions,
            &self.directory,
            &self.resources,
            &self.devices,
            channels,
            msg,
            &session_ctx,
        ) {
            return true;
        }

        let owner_id = identity.as_ref().map(|i| i.identity_id().to_string()).unwrap_or_default();
        let resource_ctx = resource::DispatchContext {
            channel_id,
            token: token.as_deref(),
            identity: identity.as_ref(),
            owner_id: &owner_id,
            now_millis,
        };
        if resource::dispatch(&self.resources, channels, msg, &resource_ctx) {
            return true;
        }

        let device_ctx = device::DeviceDispatchContext {
            channel_id,
            token: token.as_deref(),
            identity: identity.as_ref(),
            now_millis,
        };
        if device::dispatch(&self.devices, channels, msg, &device_ctx) {
            return true;
        }

        self.services.dispatch(channels, msg, channel_id, token.as_deref()).await
    }

    /// Cascades a transport disconnect into every subscription layer (spec
    /// §5 "when a channel disconnects, all resources detach it").
    pub fn on_channel_disconnect(&self, channel_id: &str) {
        self.resources.detach_all_by_channel(channel_id);
        self.devices.on_channel_disconnect(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use hub_core::{ManualClock, ResourceType, User, IS_ADMIN};

    use super::*;
    use crate::network::config::ConnectionConfig;
    use crate::network::connection::ConnectionRegistry;
    use crate::resource::ResourceFactory;

    fn hub() -> Hub {
        let clock = Arc::new(ManualClock::new(0));
        let sessions = SessionStore::new(clock);
        let directory = Arc::new(InMemoryUserDirectory::new());
        directory.upsert(User::new("admin", "hunter2"));
        let mut admin = directory.get("admin").unwrap();
        admin.set_permission(IS_ADMIN, true);
        directory.upsert(admin);

        let resources = ResourceRegistry::new();
        resources.register_factory(
            ResourceType::SyncList,
            ResourceFactory {
                descriptor_prefix: "",
                dynamic: false,
                build: || resource::ResourceKind::List(hub_core::ListResource::new(false)),
            },
        );
        let devices = DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup));
        let services = ServiceDispatcher::new();
        let storage: Arc<dyn PersistedStore> = Arc::new(hub_core::InMemoryStore::new());

        Hub::with_collaborators(sessions, directory, resources, devices, services, storage)
    }

    #[tokio::test]
    async fn login_is_handled_by_session_layer() {
        let hub = hub();
        let conns = ConnectionRegistry::new();
        let (conn, _rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("user:login").with_data(serde_json::json!({ "userID": "admin", "password": "hunter2" }));
        assert!(hub.dispatch(&channels, &msg, "C1", 0).await);
        assert!(channels.get("C1").unwrap().token().is_some());
    }

    #[tokio::test]
    async fn resource_attach_is_handled_by_resource_layer() {
        let hub = hub();
        let conns = ConnectionRegistry::new();
        let (conn, _rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let token = hub.sessions.login_with_password("admin", "hunter2").unwrap();
        channels.get("C1").unwrap().set_token(Some(token));

        let msg = Message::new("synclist:attach").with_data(serde_json::json!({ "descriptor": "home/todo" }));
        assert!(hub.dispatch(&channels, &msg, "C1", 0).await);
        assert_eq!(hub.resources.count(), 1);
    }

    #[tokio::test]
    async fn unrecognized_command_falls_through_every_handler() {
        let hub = hub();
        let conns = ConnectionRegistry::new();
        let (conn, _rx) = conns.register(&ConnectionConfig::default());
        conns.register_channel(&conn, "C1").unwrap();
        let channels = conns.channels();

        let msg = Message::new("nonsense:verb");
        assert!(!hub.dispatch(&channels, &msg, "C1", 0).await);
    }

    #[test]
    fn disconnect_cascades_into_resources_and_devices() {
        let hub = hub();
        let instance = hub.resources.get_or_create(ResourceType::SyncList, "home/todo", "admin").unwrap();
        instance.attach("C1", None);
        assert_eq!(hub.resources.count(), 1);

        hub.on_channel_disconnect("C1");
        assert_eq!(hub.resources.count(), 0);
    }
}
