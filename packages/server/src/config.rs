//! Server configuration: CLI flags and environment variables assembled into
//! a [`ServerConfig`] (spec §4.12).

use clap::Parser;

/// `clap`-derived command line, generalized from the teacher's
/// `service::config` timeout/partition knobs to the hub's session/storage
/// knobs.
#[derive(Debug, Parser)]
#[command(name = "quickhubd", about = "Realtime hub for connected clients and IoT devices")]
pub struct Cli {
    /// Port to bind the HTTP/WebSocket listener on.
    #[arg(short = 'p', long = "port", default_value_t = 4711)]
    pub port: u16,

    /// Root directory for the JSON-file-per-document persistence backend.
    #[arg(short = 'f', long = "storage-root", default_value = "./data")]
    pub storage_root: String,

    /// Seconds of inactivity before a session token expires.
    #[arg(long = "session-expiration", env = "USER_SESSION_EXPIRATION", default_value_t = 1200)]
    pub session_expiration_secs: i64,

    /// Base URL of a firmware index to consult for update checks; absent
    /// means [`crate::traits::NoFirmwareLookup`] is used instead.
    #[arg(long = "firmware-update-lookup", env = "FIRMWARE_UPDATE_LOOKUP")]
    pub firmware_update_lookup: Option<String>,

    /// TLS certificate/key pair. Both must be set to serve over `wss://`.
    #[arg(long = "ssl-cert", env = "SSL_CERT")]
    pub ssl_cert: Option<String>,

    #[arg(long = "ssl-key", env = "SSL_KEY")]
    pub ssl_key: Option<String>,
}

/// Resolved server configuration consumed by the service registry and
/// network module.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage_root: String,
    pub session_expiration_secs: i64,
    pub firmware_update_lookup: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            port: cli.port,
            storage_root: cli.storage_root,
            session_expiration_secs: cli.session_expiration_secs,
            firmware_update_lookup: cli.firmware_update_lookup,
            ssl_cert: cli.ssl_cert,
            ssl_key: cli.ssl_key,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4711,
            storage_root: "./data".to_string(),
            session_expiration_secs: 1200,
            firmware_update_lookup: None,
            ssl_cert: None,
            ssl_key: None,
        }
    }
}
