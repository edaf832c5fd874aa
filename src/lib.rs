//! PecaPort - automatic UPnP port mapping for a local PeerCast server
//!
//! This library discovers UPnP Internet Gateway Devices on the local network,
//! reads the port-mapping table of their WAN connection services and reconciles
//! it with a requested state ("open port P" / "close port P") without touching
//! mappings that belong to other clients.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod network;
pub mod preferences;
pub mod service;
pub mod upnp;

pub use config::ServiceConfig;
pub use network::{InterfaceError, NetworkIdentity, NetworkInterfaceInfo};
pub use preferences::{Preferences, PreferencesManager};
pub use service::{PecaPortService, PortRequest, ServiceHandle, ServiceState};
pub use upnp::{ActionError, DiscoveryError};

/// Result type alias for PecaPort operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for PecaPort operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Local network interface error
    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    /// UPnP action invocation error
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    /// Router discovery error
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Preference storage error
    #[error("Preferences error: {0}")]
    Preferences(String),

    /// Port number outside the mappable range
    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    /// A wait on a network operation was interrupted
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// The service loop is no longer running
    #[error("Service stopped")]
    ServiceStopped,

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

/// Initialize logging with the `info` level unless `RUST_LOG` says otherwise
pub fn init() {
    init_with_filter("info");
}

/// Initialize logging with a default filter directive
///
/// `RUST_LOG` takes precedence over `default_filter` when it is set.
pub fn init_with_filter(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // A second initialization (tests, embedding hosts) is not an error
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests;
