//! Persistent preferences
//!
//! - `settings` - the preferences file (disabled networks, debug flag)
//! - `manager` - shared, auto-saving access for the service and the CLI

pub mod manager;
pub mod settings;

pub use manager::PreferencesManager;
pub use settings::Preferences;
