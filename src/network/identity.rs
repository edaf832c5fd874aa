//! Identity of a network attachment point

use super::interface::NetworkInterfaceInfo;
use crate::upnp::ServiceRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// "This router, this WAN service, reached through this interface"
///
/// Built from the interface display name, the router UDN and the WAN service
/// id. Compared, hashed and persisted as one opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkIdentity(String);

impl NetworkIdentity {
    /// Identity of `service` as reached through `interface`
    pub fn new(interface: &NetworkInterfaceInfo, service: &ServiceRef) -> Self {
        Self(format!(
            "{}/{}/{}",
            interface.display_name(),
            service.device_udn,
            service.short_id()
        ))
    }

    /// The identity string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for NetworkIdentity {
    fn from(identity: String) -> Self {
        Self(identity)
    }
}

impl From<&str> for NetworkIdentity {
    fn from(identity: &str) -> Self {
        Self(identity.to_string())
    }
}

impl fmt::Display for NetworkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
