//! Local network interface snapshots

use pnet::datalink::{self, NetworkInterface};
use pnet::ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use thiserror::Error;
use tracing::debug;

/// Errors about local network interfaces
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InterfaceError {
    /// No interface is up with a private IPv4 address
    #[error("No active network interface")]
    NoActiveInterface,

    /// The interface is known but not connected
    #[error("Interface {0} is not active")]
    NotActive(String),

    /// No interface has the requested name
    #[error("Interface not found: {0}")]
    NotFound(String),

    /// The OS could not be queried
    #[error("Interface query failed: {0}")]
    Query(String),
}

/// Kind of link an interface provides
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Wired (or any non-wireless) link
    Ethernet,
    /// Wireless link
    Wifi,
}

/// Snapshot of one local network interface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInterfaceInfo {
    name: String,
    kind: InterfaceKind,
    is_active: bool,
    private_address: Option<Ipv4Addr>,
    hardware_address: Option<String>,
}

impl NetworkInterfaceInfo {
    /// An interface that is up with a private address
    pub fn active(
        name: impl Into<String>,
        kind: InterfaceKind,
        private_address: Ipv4Addr,
        hardware_address: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            is_active: true,
            private_address: Some(private_address),
            hardware_address: Some(hardware_address.into()),
        }
    }

    /// An interface that is known but not connected
    pub fn inactive(name: impl Into<String>, kind: InterfaceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            is_active: false,
            private_address: None,
            hardware_address: None,
        }
    }

    /// OS name of the interface (`eth0`, `wlan0`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link kind
    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }

    /// Whether the interface is connected
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    /// Name shown to users and used in network identities
    pub fn display_name(&self) -> String {
        match self.kind {
            InterfaceKind::Wifi => format!("Wi-Fi({})", self.name),
            InterfaceKind::Ethernet => format!("Ethernet({})", self.name),
        }
    }

    /// Private IPv4 address, e.g. `192.168.0.6`
    pub fn private_address(&self) -> Result<Ipv4Addr, InterfaceError> {
        self.private_address
            .filter(|_| self.is_active)
            .ok_or_else(|| InterfaceError::NotActive(self.name.clone()))
    }

    /// Hardware address, e.g. `12:34:56:78:90:AB`
    pub fn hardware_address(&self) -> Result<&str, InterfaceError> {
        self.hardware_address
            .as_deref()
            .filter(|_| self.is_active)
            .ok_or_else(|| InterfaceError::NotActive(self.name.clone()))
    }
}

impl fmt::Display for NetworkInterfaceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} [name={}, ip={}, mac={}, active={}]",
            self.kind,
            self.name,
            self.private_address
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.hardware_address.as_deref().unwrap_or("-"),
            self.is_active
        )
    }
}

/// Where the service gets the interface to map ports for
pub trait InterfaceSource: Send + Sync + 'static {
    /// The interface currently carrying traffic
    fn active_interface(&self) -> Result<NetworkInterfaceInfo, InterfaceError>;
}

/// Reads interfaces from the operating system on every call
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn active_interface(&self) -> Result<NetworkInterfaceInfo, InterfaceError> {
        active_interface()
    }
}

/// Always reports the same interface
#[derive(Debug, Clone)]
pub struct FixedInterface(pub NetworkInterfaceInfo);

impl InterfaceSource for FixedInterface {
    fn active_interface(&self) -> Result<NetworkInterfaceInfo, InterfaceError> {
        if self.0.is_active() {
            Ok(self.0.clone())
        } else {
            Err(InterfaceError::NotActive(self.0.name().to_string()))
        }
    }
}

/// All interfaces that are up with a private IPv4 address
pub fn list_interfaces() -> Vec<NetworkInterfaceInfo> {
    datalink::interfaces()
        .iter()
        .filter(|i| i.is_up() && !i.is_loopback())
        .filter_map(to_info)
        .collect()
}

/// Find an interface by OS name
pub fn find_by_name(name: &str) -> Result<NetworkInterfaceInfo, InterfaceError> {
    list_interfaces()
        .into_iter()
        .find(|i| i.name() == name)
        .ok_or_else(|| InterfaceError::NotFound(name.to_string()))
}

/// The interface the default route goes through
///
/// Falls back to the first wired interface, then to any interface, when the
/// route source address cannot be determined.
pub fn active_interface() -> Result<NetworkInterfaceInfo, InterfaceError> {
    let interfaces = list_interfaces();

    match route_source_address() {
        Ok(source) => {
            if let Some(found) = interfaces
                .iter()
                .find(|i| i.private_address == Some(source))
            {
                return Ok(found.clone());
            }
            debug!("Route source {} is not a private interface address", source);
        }
        Err(e) => debug!("Could not determine route source address: {}", e),
    }

    interfaces
        .iter()
        .find(|i| i.kind() == InterfaceKind::Ethernet)
        .or_else(|| interfaces.first())
        .cloned()
        .ok_or(InterfaceError::NoActiveInterface)
}

/// Local address used to reach the internet
///
/// Connecting a UDP socket sends nothing, it only selects a route.
fn route_source_address() -> Result<Ipv4Addr, InterfaceError> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .map_err(|e| InterfaceError::Query(format!("Failed to create socket: {}", e)))?;

    socket
        .connect("8.8.8.8:80")
        .map_err(|e| InterfaceError::Query(format!("Failed to connect: {}", e)))?;

    let local_addr = socket
        .local_addr()
        .map_err(|e| InterfaceError::Query(format!("Failed to get local address: {}", e)))?;

    match local_addr.ip() {
        IpAddr::V4(ipv4) => Ok(ipv4),
        IpAddr::V6(_) => Err(InterfaceError::Query("Route source is not IPv4".to_string())),
    }
}

fn to_info(interface: &NetworkInterface) -> Option<NetworkInterfaceInfo> {
    let address = interface.ips.iter().find_map(|net| match net {
        IpNetwork::V4(v4) if v4.ip().is_private() => Some(v4.ip()),
        _ => None,
    })?;

    let hardware_address = interface
        .mac
        .map(|mac| mac.to_string().to_uppercase())
        .unwrap_or_default();

    Some(NetworkInterfaceInfo::active(
        interface.name.clone(),
        kind_of(interface),
        address,
        hardware_address,
    ))
}

#[cfg(target_os = "linux")]
fn kind_of(interface: &NetworkInterface) -> InterfaceKind {
    let wireless = std::path::Path::new(&format!("/sys/class/net/{}/wireless", interface.name)).exists();
    if wireless {
        InterfaceKind::Wifi
    } else {
        InterfaceKind::Ethernet
    }
}

#[cfg(not(target_os = "linux"))]
fn kind_of(interface: &NetworkInterface) -> InterfaceKind {
    if interface.name.starts_with("wl") || interface.name.starts_with("wifi") {
        InterfaceKind::Wifi
    } else {
        InterfaceKind::Ethernet
    }
}
