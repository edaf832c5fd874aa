//! Shared, auto-saving access to the preferences

use super::settings::Preferences;
use crate::Result;
use crate::network::NetworkIdentity;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Thread-safe preferences store
///
/// Every mutation is written back to the file it was loaded from.
///
/// # Example
/// ```rust,no_run
/// use pecaport::{NetworkIdentity, PreferencesManager};
///
/// # async fn example() -> pecaport::Result<()> {
/// let prefs = PreferencesManager::new("preferences.json").await?;
///
/// let identity = NetworkIdentity::from("Wi-Fi(wlan0)/udn/WANPPPConn1");
/// prefs.disable_network(identity.clone()).await?;
/// assert!(prefs.is_network_disabled(&identity).await);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PreferencesManager {
    preferences: Arc<RwLock<Preferences>>,
    path: Arc<PathBuf>,
}

impl PreferencesManager {
    /// Create a new preferences manager
    ///
    /// Loads preferences from `path`, or starts from defaults if the file doesn't exist.
    ///
    /// # Arguments
    /// * `path` - Path to the preferences file, also used for every auto-save
    ///
    /// # Returns
    /// A new PreferencesManager instance
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let preferences = Preferences::load(&path)?;

        Ok(Self {
            preferences: Arc::new(RwLock::new(preferences)),
            path: Arc::new(path.as_ref().to_path_buf()),
        })
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether NAT management is disabled on a network
    ///
    /// # Arguments
    /// * `identity` - Identity of the WAN connection as seen from the active interface
    ///
    /// # Returns
    /// `true` if the user opted this network out
    pub async fn is_network_disabled(&self, identity: &NetworkIdentity) -> bool {
        self.preferences.read().await.is_network_disabled(identity)
    }

    /// All networks with NAT management disabled
    pub async fn disabled_networks(&self) -> Vec<NetworkIdentity> {
        self.preferences
            .read()
            .await
            .disabled_networks
            .iter()
            .cloned()
            .collect()
    }

    /// Disable NAT management on a network and auto-save
    ///
    /// Nothing is written if the network was already disabled.
    ///
    /// # Arguments
    /// * `identity` - Network to opt out
    ///
    /// # Returns
    /// Result indicating success or failure
    pub async fn disable_network(&self, identity: NetworkIdentity) -> Result<()> {
        let mut preferences = self.preferences.write().await;
        if preferences.add_disabled_network(identity) {
            preferences.save(self.path.as_path())?;
        }
        Ok(())
    }

    /// Re-enable NAT management on a network and auto-save
    ///
    /// # Arguments
    /// * `identity` - Network to opt back in
    ///
    /// # Returns
    /// Result indicating success or failure
    pub async fn enable_network(&self, identity: &NetworkIdentity) -> Result<()> {
        let mut preferences = self.preferences.write().await;
        if preferences.remove_disabled_network(identity) {
            preferences.save(self.path.as_path())?;
        }
        Ok(())
    }

    /// Whether verbose feedback is enabled
    pub async fn is_debug(&self) -> bool {
        self.preferences.read().await.debug
    }

    /// Set verbose feedback and auto-save
    ///
    /// # Arguments
    /// * `debug` - Whether every notice and mapping table is logged at info level
    ///
    /// # Returns
    /// Result indicating success or failure
    pub async fn set_debug(&self, debug: bool) -> Result<()> {
        let mut preferences = self.preferences.write().await;
        preferences.debug = debug;
        preferences.save(self.path.as_path())
    }

    /// A copy of all preferences
    pub async fn get_all(&self) -> Preferences {
        self.preferences.read().await.clone()
    }

    /// Reload preferences from disk
    ///
    /// Picks up changes made by another process (e.g. the CLI).
    pub async fn reload(&self) -> Result<()> {
        let loaded = Preferences::load(self.path.as_path())?;
        *self.preferences.write().await = loaded;
        Ok(())
    }
}
