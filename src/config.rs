//! Service configuration
//!
//! Timeouts of the discovery and idle phases plus the description written
//! into every mapping this host creates. Loaded from JSON like the preferences;
//! absent fields take their defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use sysinfo::System;

/// Longest host name prefix kept in the default mapping description
const DESCRIPTION_HOST_CHARS: usize = 16;

/// Configuration of the port-mapping service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Search window of the first search after attaching (ms)
    pub attach_search_ms: u64,
    /// Search window of a repeated search (ms)
    pub research_search_ms: u64,
    /// Time after the last request before discovery is stopped (ms)
    pub idle_timeout_ms: u64,
    /// Longest wait for the router to answer one action (ms)
    pub action_timeout_ms: u64,
    /// `NewPortMappingDescription` of the mappings this host adds
    pub description: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            attach_search_ms: 3_000,
            research_search_ms: 5_000,
            idle_timeout_ms: 10_000,
            action_timeout_ms: 5_000,
            description: default_description(),
        }
    }
}

impl ServiceConfig {
    /// Search window used by `attach()`
    pub fn attach_search_window(&self) -> Duration {
        Duration::from_millis(self.attach_search_ms)
    }

    /// Search window used by `research()`
    pub fn research_search_window(&self) -> Duration {
        Duration::from_millis(self.research_search_ms)
    }

    /// Idle time before discovery stops
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Deadline of a single `AddPortMapping` / `DeletePortMapping`
    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    /// Load a configuration file
    ///
    /// Fields missing from the file keep their default values.
    ///
    /// # Arguments
    /// * `path` - Path to the JSON configuration file
    ///
    /// # Returns
    /// The loaded configuration, or the defaults if the file doesn't exist or is empty
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)?;
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_json::from_str(&data)?)
    }

    /// Save the configuration as pretty-printed JSON
    ///
    /// # Arguments
    /// * `path` - Destination file; missing parent directories are created
    ///
    /// # Returns
    /// Result indicating success or failure
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(Error::from)
    }
}

/// `PeerCast(<host name>)`, the host name cut to 16 characters
pub fn default_description() -> String {
    let host = System::host_name().unwrap_or_default();
    describe_host(&host)
}

pub(crate) fn describe_host(host: &str) -> String {
    let host: String = host.chars().take(DESCRIPTION_HOST_CHARS).collect();
    format!("PeerCast({})", host)
}
