//! Router discovery
//!
//! [`RouterDiscoverer`] searches for root devices, keeps the Internet Gateway
//! Devices among them and resolves their WAN connection services into
//! [`WanConnection`] snapshots. Results are delivered as [`DiscoveryEvent`]s on a
//! channel handed over at construction.
//!
//! Every search runs in its own session. A session handles its devices one at a
//! time, so the snapshot of a gateway is never built twice concurrently within a
//! session, and a session that was replaced or detached delivers nothing more.

use super::runtime::UpnpRuntime;
use super::types::{DiscoveryError, RemoteDevice};
use super::wan::WanConnection;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Events emitted while discovering routers
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A root Internet Gateway Device appeared
    GatewayFound(RemoteDevice),
    /// The WAN connection services of a gateway were read
    WanConnectionsResolved {
        /// The gateway
        device: RemoteDevice,
        /// Snapshots ordered by service id
        connections: Vec<WanConnection>,
    },
    /// A gateway left the device cache
    ///
    /// Only sent by `research()`, for every gateway of the replaced search.
    /// A router that reboots or leaves the network during a search produces no
    /// event; its connections are gone from the next search instead.
    GatewayLost(RemoteDevice),
}

struct Session {
    listening: AtomicBool,
    gateways: Mutex<HashMap<String, RemoteDevice>>,
}

impl Session {
    fn new() -> Self {
        Self {
            listening: AtomicBool::new(true),
            gateways: Mutex::new(HashMap::new()),
        }
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    /// Record a gateway, returning false if this session already knows it
    fn remember(&self, device: &RemoteDevice) -> bool {
        let mut gateways = self.gateways.lock().unwrap_or_else(|e| e.into_inner());
        if gateways.contains_key(&device.udn) {
            return false;
        }
        gateways.insert(device.udn.clone(), device.clone());
        true
    }

    fn forget_all(&self) -> Vec<RemoteDevice> {
        let mut gateways = self.gateways.lock().unwrap_or_else(|e| e.into_inner());
        gateways.drain().map(|(_, device)| device).collect()
    }

    fn emit(&self, events: &mpsc::UnboundedSender<DiscoveryEvent>, event: DiscoveryEvent) {
        if self.is_listening() && events.send(event).is_err() {
            debug!("Discovery event dropped, receiver closed");
        }
    }
}

/// Bridge between the UPnP runtime and the port-mapping service
pub struct RouterDiscoverer<R: UpnpRuntime + ?Sized> {
    runtime: Arc<R>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    attach_window: Duration,
    research_window: Duration,
    session: Option<Arc<Session>>,
}

impl<R: UpnpRuntime + ?Sized> RouterDiscoverer<R> {
    /// Create a detached discoverer delivering events on `events`
    pub fn new(
        runtime: Arc<R>,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
        attach_window: Duration,
        research_window: Duration,
    ) -> Self {
        Self {
            runtime,
            events,
            attach_window,
            research_window,
            session: None,
        }
    }

    /// Whether `attach()` has been called without a matching `detach()`
    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    /// Start listening and search for root devices
    ///
    /// Devices cached by a previous session are discarded first.
    pub async fn attach(&mut self) {
        if let Some(previous) = self.session.take() {
            previous.stop();
        }

        self.runtime.clear_remote_devices().await;

        let session = Arc::new(Session::new());
        self.session = Some(session.clone());
        info!("Attached to UPnP runtime, searching for routers ({:?})", self.attach_window);
        self.spawn_search(session, self.attach_window);
    }

    /// Forget every known device and search again
    pub async fn research(&mut self) -> Result<(), DiscoveryError> {
        let previous = self.session.take().ok_or(DiscoveryError::NotAttached)?;
        previous.stop();

        for device in previous.forget_all() {
            debug!("Forgetting gateway {}", device);
            if self.events.send(DiscoveryEvent::GatewayLost(device)).is_err() {
                debug!("Discovery event dropped, receiver closed");
            }
        }

        self.runtime.clear_remote_devices().await;

        let session = Arc::new(Session::new());
        self.session = Some(session.clone());
        info!("Searching for routers again ({:?})", self.research_window);
        self.spawn_search(session, self.research_window);
        Ok(())
    }

    /// Stop listening
    ///
    /// Work already in flight finishes, but its events are not delivered.
    pub fn detach(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop();
            info!("Detached from UPnP runtime");
        }
    }

    fn spawn_search(&self, session: Arc<Session>, window: Duration) {
        let runtime = self.runtime.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let (found_tx, mut found_rx) = mpsc::unbounded_channel();

            let search = async {
                if let Err(e) = runtime.search(window, found_tx).await {
                    warn!("Router search failed: {}", e);
                }
            };

            let handle = async {
                while let Some(device) = found_rx.recv().await {
                    if !session.is_listening() {
                        break;
                    }
                    handle_device(&*runtime, &session, &events, device).await;
                }
            };

            tokio::join!(search, handle);
            debug!("Router search finished");
        });
    }
}

impl<R: UpnpRuntime + ?Sized> Drop for RouterDiscoverer<R> {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn handle_device<R: UpnpRuntime + ?Sized>(
    runtime: &R,
    session: &Session,
    events: &mpsc::UnboundedSender<DiscoveryEvent>,
    device: RemoteDevice,
) {
    if !device.is_internet_gateway() {
        debug!("Ignoring device {} ({})", device, device.device_type);
        return;
    }
    if !session.remember(&device) {
        return;
    }

    info!("Router found: {}", device);
    session.emit(events, DiscoveryEvent::GatewayFound(device.clone()));

    let services = device.wan_services();
    if services.is_empty() {
        warn!("Router {} has no WAN connection service", device);
        return;
    }

    let mut connections = Vec::with_capacity(services.len());
    for service in services {
        connections.push(WanConnection::create(runtime, service).await);
    }
    connections.sort_by(|a, b| a.service().service_id.cmp(&b.service().service_id));

    session.emit(
        events,
        DiscoveryEvent::WanConnectionsResolved {
            device,
            connections,
        },
    );
}
