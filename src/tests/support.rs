// Scripted in-memory router used by the UPnP and service tests

use crate::network::{InterfaceKind, NetworkInterfaceInfo};
use crate::upnp::types::{
    ADD_PORT_MAPPING, DELETE_PORT_MAPPING, GET_EXTERNAL_IP_ADDRESS,
    GET_GENERIC_PORT_MAPPING_ENTRY, GET_STATUS_INFO,
};
use crate::upnp::{
    ActionError, ActionOutput, DiscoveryError, PortMapping, Protocol, RemoteDevice, ServiceRef,
    UpnpRuntime,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const ROUTER_UDN: &str = "11111111-2222-3333-4444-555555555555";
pub const PPP_SERVICE_ID: &str = "urn:upnp-org:serviceId:WANPPPConn1";
pub const IP_SERVICE_ID: &str = "urn:upnp-org:serviceId:WANIPConn1";
pub const EXTERNAL_IP: &str = "203.0.113.7";
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 9);
pub const OTHER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 5);

pub fn ppp_service() -> ServiceRef {
    service(PPP_SERVICE_ID, "urn:schemas-upnp-org:service:WANPPPConnection:1")
}

pub fn ip_service() -> ServiceRef {
    service(IP_SERVICE_ID, "urn:schemas-upnp-org:service:WANIPConnection:1")
}

pub fn service(service_id: &str, service_type: &str) -> ServiceRef {
    ServiceRef {
        device_udn: ROUTER_UDN.to_string(),
        service_type: service_type.to_string(),
        service_id: service_id.to_string(),
        actions: None,
    }
}

pub fn gateway(services: Vec<ServiceRef>) -> RemoteDevice {
    RemoteDevice {
        udn: ROUTER_UDN.to_string(),
        device_type: "urn:schemas-upnp-org:device:InternetGatewayDevice:1".to_string(),
        friendly_name: "Test Router".to_string(),
        root: true,
        services,
    }
}

pub fn media_server() -> RemoteDevice {
    RemoteDevice {
        udn: "99999999-0000-0000-0000-000000000000".to_string(),
        device_type: "urn:schemas-upnp-org:device:MediaServer:1".to_string(),
        friendly_name: "NAS".to_string(),
        root: true,
        services: vec![],
    }
}

pub fn wifi() -> NetworkInterfaceInfo {
    NetworkInterfaceInfo::active("wlan0", InterfaceKind::Wifi, LOCAL_IP, "12:34:56:78:90:AB")
}

pub fn foreign_mapping(port: u16) -> PortMapping {
    PortMapping::tcp(port, OTHER_IP, "other")
}

pub fn local_mapping(port: u16) -> PortMapping {
    PortMapping::tcp(port, LOCAL_IP, "PeerCast(test)")
}

fn fault(code: u16, description: &str) -> ActionError {
    ActionError::Fault {
        code: Some(code),
        description: description.to_string(),
    }
}

struct RouterState {
    devices: Vec<RemoteDevice>,
    tables: HashMap<String, Vec<PortMapping>>,
    external_ip: Option<String>,
    status: String,
    entry_failure: Option<(u32, ActionError)>,
    action_failures: HashMap<String, ActionError>,
    calls: Vec<(String, String)>,
    searches: usize,
    clears: usize,
}

/// A router answering from in-memory tables
///
/// Records every invocation and the highest number of invocations that were
/// running at the same time.
pub struct ScriptedRouter {
    state: Mutex<RouterState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedRouter {
    /// A connected gateway with a single, empty WANPPPConnection service
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RouterState {
                devices: vec![gateway(vec![ppp_service()])],
                tables: HashMap::new(),
                external_ip: Some(EXTERNAL_IP.to_string()),
                status: "Connected".to_string(),
                entry_failure: None,
                action_failures: HashMap::new(),
                calls: Vec::new(),
                searches: 0,
                clears: 0,
            }),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_devices(self, devices: Vec<RemoteDevice>) -> Self {
        self.lock().devices = devices;
        self
    }

    /// Replace the devices answering later searches
    pub fn set_devices(&self, devices: Vec<RemoteDevice>) {
        self.lock().devices = devices;
    }

    pub fn with_table(self, service_id: &str, mappings: Vec<PortMapping>) -> Self {
        self.lock().tables.insert(service_id.to_string(), mappings);
        self
    }

    pub fn with_status(self, status: &str) -> Self {
        self.lock().status = status.to_string();
        self
    }

    pub fn without_external_ip(self) -> Self {
        self.lock().external_ip = None;
        self
    }

    /// `GetGenericPortMappingEntry` at `index` fails with `error`
    pub fn with_entry_failure(self, index: u32, error: ActionError) -> Self {
        self.lock().entry_failure = Some((index, error));
        self
    }

    /// Every invocation of `action` fails with `error`
    pub fn with_action_failure(self, action: &str, error: ActionError) -> Self {
        self.lock().action_failures.insert(action.to_string(), error);
        self
    }

    pub fn table(&self, service_id: &str) -> Vec<PortMapping> {
        self.lock().tables.get(service_id).cloned().unwrap_or_default()
    }

    pub fn count(&self, action: &str) -> usize {
        self.lock().calls.iter().filter(|(_, a)| a == action).count()
    }

    /// Number of `AddPortMapping` and `DeletePortMapping` calls
    pub fn mutations(&self) -> usize {
        self.count(ADD_PORT_MAPPING) + self.count(DELETE_PORT_MAPPING)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.lock().searches
    }

    pub fn clears(&self) -> usize {
        self.lock().clears
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state.lock().unwrap()
    }

    fn answer(
        &self,
        service: &ServiceRef,
        action: &str,
        arguments: &[(&str, String)],
    ) -> Result<ActionOutput, ActionError> {
        let mut state = self.lock();
        state
            .calls
            .push((service.service_id.clone(), action.to_string()));

        if let Some(error) = state.action_failures.get(action) {
            return Err(error.clone());
        }

        let argument = |name: &str| {
            arguments
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap_or_default()
        };

        let mut output = ActionOutput::new();
        match action {
            GET_EXTERNAL_IP_ADDRESS => match &state.external_ip {
                Some(ip) => {
                    output.insert("NewExternalIPAddress".to_string(), ip.clone());
                }
                None => return Err(fault(501, "ActionFailed")),
            },
            GET_STATUS_INFO => {
                output.insert("NewConnectionStatus".to_string(), state.status.clone());
                output.insert("NewLastConnectionError".to_string(), "ERROR_NONE".to_string());
                output.insert("NewUptime".to_string(), "3600".to_string());
            }
            GET_GENERIC_PORT_MAPPING_ENTRY => {
                let index: u32 = argument("NewPortMappingIndex").parse().unwrap();
                if let Some((failing, error)) = &state.entry_failure {
                    if *failing == index {
                        return Err(error.clone());
                    }
                }
                let table = state.tables.get(&service.service_id);
                let Some(mapping) = table.and_then(|t| t.get(index as usize)) else {
                    return Err(fault(713, "SpecifiedArrayIndexInvalid"));
                };
                output.extend(entry_output(mapping));
            }
            ADD_PORT_MAPPING => {
                let mapping = PortMapping {
                    remote_host: argument("NewRemoteHost"),
                    external_port: argument("NewExternalPort").parse().unwrap(),
                    internal_port: argument("NewInternalPort").parse().unwrap(),
                    protocol: Protocol::parse(&argument("NewProtocol")).unwrap(),
                    internal_client: argument("NewInternalClient"),
                    description: argument("NewPortMappingDescription"),
                    lease_duration_secs: argument("NewLeaseDuration").parse().unwrap(),
                    enabled: argument("NewEnabled") == "1",
                };
                let table = state.tables.entry(service.service_id.clone()).or_default();
                let position = table.iter().position(|m| {
                    m.external_port == mapping.external_port && m.protocol == mapping.protocol
                });
                match position {
                    Some(i) if table[i].internal_client != mapping.internal_client => {
                        return Err(fault(718, "ConflictInMappingEntry"));
                    }
                    Some(i) => table[i] = mapping,
                    None => table.push(mapping),
                }
            }
            DELETE_PORT_MAPPING => {
                let port: u16 = argument("NewExternalPort").parse().unwrap();
                let protocol = Protocol::parse(&argument("NewProtocol")).unwrap();
                let table = state.tables.entry(service.service_id.clone()).or_default();
                let before = table.len();
                table.retain(|m| !(m.external_port == port && m.protocol == protocol));
                if table.len() == before {
                    return Err(fault(714, "NoSuchEntryInArray"));
                }
            }
            other => return Err(fault(401, &format!("Invalid Action {}", other))),
        }
        Ok(output)
    }
}

fn entry_output(mapping: &PortMapping) -> ActionOutput {
    [
        ("NewRemoteHost", mapping.remote_host.clone()),
        ("NewExternalPort", mapping.external_port.to_string()),
        ("NewProtocol", mapping.protocol.to_string()),
        ("NewInternalPort", mapping.internal_port.to_string()),
        ("NewInternalClient", mapping.internal_client.clone()),
        ("NewEnabled", if mapping.enabled { "1" } else { "0" }.to_string()),
        ("NewPortMappingDescription", mapping.description.clone()),
        ("NewLeaseDuration", mapping.lease_duration_secs.to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

#[async_trait]
impl UpnpRuntime for ScriptedRouter {
    async fn search(
        &self,
        _window: Duration,
        found: mpsc::UnboundedSender<RemoteDevice>,
    ) -> Result<(), DiscoveryError> {
        let devices = {
            let mut state = self.lock();
            state.searches += 1;
            state.devices.clone()
        };
        for device in devices {
            let _ = found.send(device);
        }
        Ok(())
    }

    async fn clear_remote_devices(&self) {
        self.lock().clears += 1;
    }

    async fn invoke(
        &self,
        service: &ServiceRef,
        action: &str,
        arguments: &[(&str, String)],
    ) -> Result<ActionOutput, ActionError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        // Give the caller a chance to start further invocations
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        self.answer(service, action, arguments)
    }
}

// Also released when the caller drops the invocation midway
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// How a [`FaultyRouter`] misbehaves on its chosen action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misbehaviour {
    /// Never answer
    Hang,
    /// Panic on the first invocation, then behave
    PanicOnce,
}

/// A [`ScriptedRouter`] that misbehaves on one action
pub struct FaultyRouter {
    pub inner: ScriptedRouter,
    action: &'static str,
    misbehaviour: Misbehaviour,
    tripped: AtomicBool,
}

impl FaultyRouter {
    pub fn new(inner: ScriptedRouter, action: &'static str, misbehaviour: Misbehaviour) -> Self {
        Self {
            inner,
            action,
            misbehaviour,
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl UpnpRuntime for FaultyRouter {
    async fn search(
        &self,
        window: Duration,
        found: mpsc::UnboundedSender<RemoteDevice>,
    ) -> Result<(), DiscoveryError> {
        self.inner.search(window, found).await
    }

    async fn clear_remote_devices(&self) {
        self.inner.clear_remote_devices().await
    }

    async fn invoke(
        &self,
        service: &ServiceRef,
        action: &str,
        arguments: &[(&str, String)],
    ) -> Result<ActionOutput, ActionError> {
        if action == self.action {
            match self.misbehaviour {
                Misbehaviour::Hang => std::future::pending::<()>().await,
                Misbehaviour::PanicOnce => {
                    if !self.tripped.swap(true, Ordering::SeqCst) {
                        panic!("router crashed during {}", action);
                    }
                }
            }
        }
        self.inner.invoke(service, action, arguments).await
    }
}

/// Collects the formatted output of every tracing event
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route this thread's tracing output into the capture until the guard drops
    ///
    /// Tasks spawned on a current-thread runtime log here too.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Number of captured lines containing `needle`
    pub fn count(&self, needle: &str) -> usize {
        let output = self.0.lock().unwrap();
        String::from_utf8_lossy(&output)
            .lines()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
