//! Persisted port-mapping preferences

use crate::network::NetworkIdentity;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Port-mapping preferences
///
/// Stored as JSON and loaded/saved from disk.
///
/// # Example
/// ```rust,no_run
/// use pecaport::Preferences;
///
/// // Load preferences (returns default if file doesn't exist)
/// let mut prefs = Preferences::load("preferences.json").expect("Failed to load");
///
/// prefs.add_disabled_network("Wi-Fi(wlan0)/udn/WANPPPConn1".into());
/// prefs.save("preferences.json").expect("Failed to save");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Preferences {
    /// Networks on which NAT management is disabled
    pub disabled_networks: BTreeSet<NetworkIdentity>,
    /// Verbose feedback about mapping results
    pub debug: bool,
}

impl Preferences {
    /// Default preferences file inside the user's config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("pecaport").join("preferences.json"))
    }

    /// Load preferences from a JSON file
    ///
    /// # Returns
    /// The loaded preferences, or defaults if the file doesn't exist or is empty
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Preferences(format!("Failed to read preferences: {}", e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Preferences(format!("Failed to parse preferences: {}", e)))
    }

    /// Save preferences to a JSON file, creating its directory if needed
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Preferences(format!("Failed to create preferences directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Preferences(format!("Failed to serialize preferences: {}", e)))?;

        std::fs::write(path, json)
            .map_err(|e| Error::Preferences(format!("Failed to write preferences: {}", e)))?;

        Ok(())
    }

    /// Disable NAT management on `identity`; returns false if it already was
    pub fn add_disabled_network(&mut self, identity: NetworkIdentity) -> bool {
        self.disabled_networks.insert(identity)
    }

    /// Re-enable NAT management on `identity`; returns false if it was not disabled
    pub fn remove_disabled_network(&mut self, identity: &NetworkIdentity) -> bool {
        self.disabled_networks.remove(identity)
    }

    /// Whether NAT management is disabled on `identity`
    pub fn is_network_disabled(&self, identity: &NetworkIdentity) -> bool {
        self.disabled_networks.contains(identity)
    }
}
