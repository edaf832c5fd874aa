//! Common types for the UPnP module

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Device type of a router's NAT function
pub const INTERNET_GATEWAY_DEVICE: &str = "InternetGatewayDevice";
/// WAN connection service used by PPPoE routers (preferred)
pub const WAN_PPP_CONNECTION: &str = "WANPPPConnection";
/// WAN connection service used by DHCP/static routers
pub const WAN_IP_CONNECTION: &str = "WANIPConnection";

/// `GetExternalIPAddress` action name
pub const GET_EXTERNAL_IP_ADDRESS: &str = "GetExternalIPAddress";
/// `GetStatusInfo` action name
pub const GET_STATUS_INFO: &str = "GetStatusInfo";
/// `GetGenericPortMappingEntry` action name
pub const GET_GENERIC_PORT_MAPPING_ENTRY: &str = "GetGenericPortMappingEntry";
/// `AddPortMapping` action name
pub const ADD_PORT_MAPPING: &str = "AddPortMapping";
/// `DeletePortMapping` action name
pub const DELETE_PORT_MAPPING: &str = "DeletePortMapping";

/// Output arguments of an action invocation, keyed by argument name
pub type ActionOutput = HashMap<String, String>;

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// TCP protocol
    TCP,
    /// UDP protocol
    UDP,
}

impl Protocol {
    /// Wire representation used in SOAP arguments
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::TCP => "TCP",
            Protocol::UDP => "UDP",
        }
    }

    /// Parse the wire representation (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TCP" => Some(Protocol::TCP),
            "UDP" => Some(Protocol::UDP),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Protocol::parse(value).ok_or_else(|| format!("Unknown protocol: {}", value))
    }
}

/// Connection status reported by `GetStatusInfo`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    /// The connection has not been configured
    Unconfigured,
    /// The connection is being established
    Connecting,
    /// The connection is up
    Connected,
    /// A disconnect has been requested
    PendingDisconnect,
    /// The connection is being torn down
    Disconnecting,
    /// The connection is down
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    /// Parse the `NewConnectionStatus` output argument
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Unconfigured" => Some(Self::Unconfigured),
            "Connecting" => Some(Self::Connecting),
            "Connected" => Some(Self::Connected),
            "PendingDisconnect" => Some(Self::PendingDisconnect),
            "Disconnecting" => Some(Self::Disconnecting),
            "Disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One entry of a router's port-mapping table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    /// Remote host filter (empty = any host)
    pub remote_host: String,
    /// External (WAN side) port
    pub external_port: u16,
    /// Internal (LAN side) port
    pub internal_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// LAN address the mapping forwards to
    pub internal_client: String,
    /// Human readable description
    pub description: String,
    /// Lease duration in seconds (0 = permanent)
    pub lease_duration_secs: u32,
    /// Whether the mapping is active
    pub enabled: bool,
}

impl PortMapping {
    /// A permanent, enabled mapping of `external_port` to `internal_port` on `client`
    pub fn new(
        external_port: u16,
        internal_port: u16,
        protocol: Protocol,
        client: Ipv4Addr,
        description: impl Into<String>,
    ) -> Self {
        Self {
            remote_host: String::new(),
            external_port,
            internal_port,
            protocol,
            internal_client: client.to_string(),
            description: description.into(),
            lease_duration_secs: 0,
            enabled: true,
        }
    }

    /// A permanent, enabled TCP mapping forwarding `port` to the same port on `client`
    pub fn tcp(port: u16, client: Ipv4Addr, description: impl Into<String>) -> Self {
        Self::new(port, port, Protocol::TCP, client, description)
    }

    /// A mapping carrying only the (external port, protocol) key, as needed for deletion
    pub fn key(port: u16, protocol: Protocol) -> Self {
        Self {
            remote_host: String::new(),
            external_port: port,
            internal_port: 0,
            protocol,
            internal_client: String::new(),
            description: String::new(),
            lease_duration_secs: 0,
            enabled: false,
        }
    }

    /// Whether this is an enabled TCP mapping on external `port`
    pub fn is_enabled_tcp_on(&self, port: u16) -> bool {
        self.enabled && self.protocol == Protocol::TCP && self.external_port == port
    }

    /// Whether the mapping forwards to `client`
    pub fn is_owned_by(&self, client: Ipv4Addr) -> bool {
        match self.internal_client.trim().parse::<Ipv4Addr>() {
            Ok(ip) => ip == client,
            Err(_) => self.internal_client.trim() == client.to_string(),
        }
    }

    /// Build a mapping from the output of `GetGenericPortMappingEntry`
    pub fn from_action_output(output: &ActionOutput) -> Result<Self, ActionError> {
        let external_port = parse_argument(output, "NewExternalPort")?;
        let internal_port = parse_argument(output, "NewInternalPort")?;

        let raw_protocol = required_argument(output, "NewProtocol")?;
        let protocol = Protocol::parse(raw_protocol).ok_or_else(|| ActionError::InvalidArgument {
            name: "NewProtocol",
            value: raw_protocol.to_string(),
        })?;

        let internal_client = required_argument(output, "NewInternalClient")?.trim().to_string();

        let lease_duration_secs = match output.get("NewLeaseDuration") {
            Some(_) => parse_argument(output, "NewLeaseDuration")?,
            None => 0,
        };

        let enabled = match output.get("NewEnabled").map(|v| v.trim()) {
            None => true,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => {
                return Err(ActionError::InvalidArgument {
                    name: "NewEnabled",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            remote_host: output.get("NewRemoteHost").cloned().unwrap_or_default(),
            external_port,
            internal_port,
            protocol,
            internal_client,
            description: output
                .get("NewPortMappingDescription")
                .cloned()
                .unwrap_or_default(),
            lease_duration_secs,
            enabled,
        })
    }

    /// Input arguments of `AddPortMapping`
    pub fn add_arguments(&self) -> Vec<(&'static str, String)> {
        vec![
            ("NewRemoteHost", self.remote_host.clone()),
            ("NewExternalPort", self.external_port.to_string()),
            ("NewProtocol", self.protocol.as_str().to_string()),
            ("NewInternalPort", self.internal_port.to_string()),
            ("NewInternalClient", self.internal_client.clone()),
            ("NewEnabled", if self.enabled { "1" } else { "0" }.to_string()),
            ("NewPortMappingDescription", self.description.clone()),
            ("NewLeaseDuration", self.lease_duration_secs.to_string()),
        ]
    }

    /// Input arguments of `DeletePortMapping`
    ///
    /// Routers identify the entry by (remote host, external port, protocol) only.
    pub fn delete_arguments(&self) -> Vec<(&'static str, String)> {
        vec![
            ("NewRemoteHost", self.remote_host.clone()),
            ("NewExternalPort", self.external_port.to_string()),
            ("NewProtocol", self.protocol.as_str().to_string()),
        ]
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}:{}",
            self.protocol, self.external_port, self.internal_client, self.internal_port
        )?;
        if !self.description.is_empty() {
            write!(f, " \"{}\"", self.description)?;
        }
        if !self.enabled {
            f.write_str(" (disabled)")?;
        }
        Ok(())
    }
}

fn required_argument<'a>(output: &'a ActionOutput, name: &'static str) -> Result<&'a str, ActionError> {
    output
        .get(name)
        .map(String::as_str)
        .ok_or(ActionError::MissingArgument(name))
}

fn parse_argument<T: std::str::FromStr>(
    output: &ActionOutput,
    name: &'static str,
) -> Result<T, ActionError> {
    let raw = required_argument(output, name)?;
    raw.trim().parse().map_err(|_| ActionError::InvalidArgument {
        name,
        value: raw.to_string(),
    })
}

/// A WAN connection service of a discovered device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    /// UDN of the device exposing the service, without the `uuid:` prefix
    pub device_udn: String,
    /// Full service type URN, e.g. `urn:schemas-upnp-org:service:WANIPConnection:1`
    pub service_type: String,
    /// Full service id, e.g. `urn:upnp-org:serviceId:WANIPConn1`
    pub service_id: String,
    /// Actions listed in the service description, `None` when it could not be read
    pub actions: Option<Vec<String>>,
}

impl ServiceRef {
    /// The last segment of the service id (`WANIPConn1`)
    pub fn short_id(&self) -> &str {
        self.service_id.rsplit(':').next().unwrap_or(&self.service_id)
    }

    /// The service type name (`WANIPConnection`)
    pub fn type_name(&self) -> Option<&str> {
        urn_type_name(&self.service_type)
    }

    /// Whether the service advertises `action`
    ///
    /// A service whose action list is unknown is assumed to support everything.
    pub fn advertises(&self, action: &str) -> bool {
        self.actions
            .as_ref()
            .is_none_or(|actions| actions.iter().any(|a| a == action))
    }
}

/// A device reported by a UPnP search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteDevice {
    /// UDN without the `uuid:` prefix
    pub udn: String,
    /// Full device type URN
    pub device_type: String,
    /// Friendly name from the device description
    pub friendly_name: String,
    /// Whether this is a root device
    pub root: bool,
    /// Services of this device and all of its embedded devices
    pub services: Vec<ServiceRef>,
}

impl RemoteDevice {
    /// Whether this is a root Internet Gateway Device
    pub fn is_internet_gateway(&self) -> bool {
        self.root && urn_type_name(&self.device_type) == Some(INTERNET_GATEWAY_DEVICE)
    }

    /// Services of the given type name
    pub fn find_services(&self, type_name: &str) -> Vec<ServiceRef> {
        self.services
            .iter()
            .filter(|s| s.type_name() == Some(type_name))
            .cloned()
            .collect()
    }

    /// WAN connection services, `WANPPPConnection` first and `WANIPConnection` as fallback
    pub fn wan_services(&self) -> Vec<ServiceRef> {
        let ppp = self.find_services(WAN_PPP_CONNECTION);
        if !ppp.is_empty() {
            return ppp;
        }
        self.find_services(WAN_IP_CONNECTION)
    }
}

impl fmt::Display for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.friendly_name, self.udn)
    }
}

/// Extract the type name from a `urn:<domain>:device|service:<name>:<version>` URN
pub fn urn_type_name(urn: &str) -> Option<&str> {
    let mut parts = urn.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("urn"), Some(_), Some("device" | "service"), Some(name)) if !name.is_empty() => {
            Some(name)
        }
        _ => None,
    }
}

/// Errors that can occur while invoking a UPnP action
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    /// The router answered with a UPnP/SOAP fault
    #[error("UPnP fault: {description}")]
    Fault {
        /// UPnP error code, when the transport exposes it
        code: Option<u16>,
        /// Fault description
        description: String,
    },

    /// HTTP, socket or response parsing failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// A required output argument was missing
    #[error("Missing output argument: {0}")]
    MissingArgument(&'static str),

    /// An output argument could not be parsed
    #[error("Invalid output argument {name}: {value:?}")]
    InvalidArgument {
        /// Argument name
        name: &'static str,
        /// Raw value
        value: String,
    },

    /// The service does not list the action
    #[error("Action not advertised by service: {0}")]
    NotAdvertised(&'static str),

    /// The runtime does not know the device or service
    #[error("Unknown service: {0}")]
    UnknownService(String),
}

impl ActionError {
    /// Whether the router itself rejected the action
    pub fn is_fault(&self) -> bool {
        matches!(self, ActionError::Fault { .. })
    }

    /// The router did not answer in time
    pub fn timed_out() -> Self {
        ActionError::Transport("timed out".to_string())
    }
}

/// Errors that can occur during router discovery
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    /// `research()` was called before `attach()`
    #[error("Not attached to the UPnP runtime")]
    NotAttached,

    /// The SSDP search could not be started
    #[error("Search failed: {0}")]
    Search(String),
}
