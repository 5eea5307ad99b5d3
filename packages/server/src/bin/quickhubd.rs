//! Process entry point: parses CLI flags, wires every [`Hub`] collaborator,
//! and runs the network module until a shutdown signal arrives (spec §4.12).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use hub_core::{FileStore, ImageCollectionResource, ListResource, ObjectResource, PersistedStore, ResourceType, SettingsObjectResource, SystemClock};
use tracing_subscriber::EnvFilter;

use hub_server::device::DeviceManager;
use hub_server::network::config::NetworkConfig;
use hub_server::network::module::NetworkModule;
use hub_server::resource::{ResourceFactory, ResourceKind, ResourceRegistry};
use hub_server::service::{BackgroundRunnable, BackgroundWorker};
use hub_server::session::{InMemoryUserDirectory, SessionStore};
use hub_server::traits::{AllowAll, NoFirmwareLookup};
use hub_server::{Cli, Hub, ServerConfig};

/// Drives [`SessionStore::sweep_expired`] on a fixed tick, cascading each
/// closed session into the resource and device subscription layers just as
/// `user:logout` does (spec §4.3, §4.8 step 5).
struct SessionSweeper {
    hub: Arc<Hub>,
}

#[async_trait]
impl BackgroundRunnable for SessionSweeper {
    async fn on_tick(&mut self) {
        for closed in self.hub.sessions.sweep_expired() {
            hub_server::session::cascade_session_closed(&closed, &self.hub.resources, &self.hub.devices);
        }
    }
}

fn register_resource_factories(resources: &ResourceRegistry) {
    resources.register_factory(
        ResourceType::SyncList,
        ResourceFactory {
            descriptor_prefix: "",
            dynamic: false,
            build: || ResourceKind::List(ListResource::new(false)),
        },
    );
    resources.register_factory(
        ResourceType::Object,
        ResourceFactory {
            descriptor_prefix: "settings/",
            dynamic: false,
            build: || ResourceKind::Settings(SettingsObjectResource::new(true)),
        },
    );
    resources.register_factory(
        ResourceType::Object,
        ResourceFactory {
            descriptor_prefix: "",
            dynamic: false,
            build: || ResourceKind::Object(ObjectResource::new()),
        },
    );
    resources.register_factory(
        ResourceType::ImageCollection,
        ResourceFactory {
            descriptor_prefix: "",
            dynamic: false,
            build: || ResourceKind::ImageCollection(ImageCollectionResource::new()),
        },
    );
}

fn build_hub(storage: Arc<dyn PersistedStore>) -> Arc<Hub> {
    let clock = Arc::new(SystemClock);
    let sessions = SessionStore::new(clock);
    let directory = Arc::new(InMemoryUserDirectory::new());

    let resources = ResourceRegistry::new();
    register_resource_factories(&resources);

    // `FIRMWARE_UPDATE_LOOKUP` has no concrete HTTP client wired in; a
    // deployment that needs it swaps `NoFirmwareLookup` for its own
    // `FirmwareLookup` impl reading `config.firmware_update_lookup`.
    let devices = DeviceManager::new(Arc::new(AllowAll), Arc::new(NoFirmwareLookup));
    let services = hub_server::service::ServiceDispatcher::new();

    Arc::new(Hub::with_collaborators(sessions, directory, resources, devices, services, storage))
}

fn build_network_config(config: &ServerConfig) -> NetworkConfig {
    let mut network = NetworkConfig {
        port: config.port,
        ..NetworkConfig::default()
    };
    if let (Some(cert), Some(key)) = (&config.ssl_cert, &config.ssl_key) {
        network.tls = Some(hub_server::network::config::TlsConfig {
            cert_path: cert.into(),
            key_path: key.into(),
            ca_cert_path: None,
        });
    }
    network
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from(Cli::parse());
    let storage: Arc<dyn PersistedStore> = Arc::new(FileStore::new(config.storage_root.clone()));
    let hub = build_hub(storage);

    let sweeper = BackgroundWorker::spawn("session-sweep", Duration::from_secs(60), SessionSweeper { hub: Arc::clone(&hub) });

    let network_config = build_network_config(&config);
    let mut module = NetworkModule::new(network_config, Arc::clone(&hub));
    let port = module.start().await.context("binding TCP listener")?;
    tracing::info!(port, "quickhubd listening");

    module
        .serve(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    sweeper.stop().await;
    Ok(())
}
