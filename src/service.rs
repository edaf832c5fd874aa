//! The port-mapping service
//!
//! [`PecaPortService`] is a single tokio task owning the task queue and the
//! [`RouterDiscoverer`]. Requests to open or close a port are turned into
//! [`PortTask`]s and queued; discovery is (re)started; every time the WAN
//! connections of a router are resolved, the queue is drained against the first
//! usable connection. Discovery stops after a period without requests.
//!
//! Because one task does all of this, reconciliation of two connections never
//! overlaps and requests arriving mid-pass simply join the queue.

use crate::config::ServiceConfig;
use crate::network::{InterfaceSource, NetworkIdentity, NetworkInterfaceInfo};
use crate::preferences::PreferencesManager;
use crate::upnp::{
    DiscoveryEvent, MappingNotice, PortManipulator, PortTask, RemoteDevice, RouterDiscoverer,
    UpnpRuntime, WanConnection,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Capacity of the notice broadcast channel
const NOTICE_CAPACITY: usize = 64;

/// A change of the desired mapping state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PortRequest {
    /// Make the TCP port reachable from outside
    Open(u16),
    /// Remove the TCP port mapping
    Close(u16),
}

impl PortRequest {
    /// Requested port
    pub fn port(&self) -> u16 {
        match self {
            PortRequest::Open(port) | PortRequest::Close(port) => *port,
        }
    }

    fn tasks(&self, client_ip: std::net::Ipv4Addr) -> Vec<PortTask> {
        match *self {
            PortRequest::Open(port) => PortTask::open(client_ip, port).to_vec(),
            PortRequest::Close(port) => PortTask::close(client_ip, port).to_vec(),
        }
    }
}

/// What the service loop is doing
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceState {
    /// Discovery stopped, nothing pending
    #[default]
    Idle,
    /// Waiting for routers to answer
    Discovering,
    /// Executing tasks against a connection
    Reconciling,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Observable state of the service loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceStatus {
    /// Current phase
    pub state: ServiceState,
    /// Requests taken off the request channel so far
    pub handled_requests: u64,
    /// Tasks waiting for a usable connection
    pub pending_tasks: usize,
    /// `WanConnectionsResolved` events handled so far
    pub resolved_events: u64,
    /// Latest snapshot of every connection seen, keyed by UDN and service id
    pub connections: BTreeMap<String, WanConnection>,
}

enum Command {
    Request(PortRequest),
    Shutdown,
}

/// Handle to a running [`PecaPortService`]
///
/// Dropping the handle stops the service once queued commands are handled.
pub struct ServiceHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<MappingNotice>,
    status: watch::Receiver<ServiceStatus>,
    submitted: AtomicU64,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// Request `port` to be opened
    pub fn open(&self, port: u16) -> Result<()> {
        self.request(PortRequest::Open(port))
    }

    /// Request `port` to be closed
    pub fn close(&self, port: u16) -> Result<()> {
        self.request(PortRequest::Close(port))
    }

    /// Submit a request to the service loop
    pub fn request(&self, request: PortRequest) -> Result<()> {
        if request.port() == 0 {
            return Err(Error::InvalidPort(0));
        }

        self.commands
            .send(Command::Request(request))
            .map_err(|_| Error::ServiceStopped)?;
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Receive a [`MappingNotice`] for every executed task
    pub fn subscribe(&self) -> broadcast::Receiver<MappingNotice> {
        self.notices.subscribe()
    }

    /// Current status of the loop
    pub fn status(&self) -> ServiceStatus {
        self.status.borrow().clone()
    }

    /// Wait until the loop status satisfies `condition`
    pub async fn wait_for(
        &self,
        mut condition: impl FnMut(&ServiceStatus) -> bool,
    ) -> Result<ServiceStatus> {
        let mut status = self.status.clone();
        let found = status
            .wait_for(|s| condition(s))
            .await
            .map_err(|_| Error::ServiceStopped)?;
        Ok(found.clone())
    }

    /// Wait until every submitted request was handled and its tasks consumed
    ///
    /// Tasks stay pending while no usable connection has been found; this
    /// returns once the idle timeout drops them in that case.
    pub async fn wait_settled(&self) -> Result<ServiceStatus> {
        let submitted = self.submitted.load(Ordering::SeqCst);
        self.wait_for(|s| {
            s.handled_requests >= submitted
                && s.pending_tasks == 0
                && s.state != ServiceState::Reconciling
        })
        .await
    }

    /// Stop the service and wait for its task to end
    pub async fn shutdown(self) -> Result<()> {
        // Already stopped is fine
        let _ = self.commands.send(Command::Shutdown);
        self.task
            .await
            .map_err(|e| Error::Interrupted(format!("service task: {}", e)))
    }
}

/// The port-mapping service loop
pub struct PecaPortService<R: UpnpRuntime + ?Sized, S: InterfaceSource> {
    runtime: Arc<R>,
    interfaces: S,
    preferences: PreferencesManager,
    config: ServiceConfig,
    discoverer: RouterDiscoverer<R>,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    notices: broadcast::Sender<MappingNotice>,
    status: watch::Sender<ServiceStatus>,
    queue: VecDeque<PortTask>,
    interface: Option<NetworkInterfaceInfo>,
    deadline: Option<Instant>,
}

impl<R: UpnpRuntime + ?Sized, S: InterfaceSource> PecaPortService<R, S> {
    /// Start the service on the current tokio runtime
    pub fn spawn(
        runtime: Arc<R>,
        interfaces: S,
        preferences: PreferencesManager,
        config: ServiceConfig,
    ) -> ServiceHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (notices_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ServiceStatus::default());

        let discoverer = RouterDiscoverer::new(
            runtime.clone(),
            events_tx,
            config.attach_search_window(),
            config.research_search_window(),
        );

        let service = Self {
            runtime,
            interfaces,
            preferences,
            config,
            discoverer,
            events: events_rx,
            commands: commands_rx,
            notices: notices_tx.clone(),
            status: status_tx,
            queue: VecDeque::new(),
            interface: None,
            deadline: None,
        };

        let task = tokio::spawn(service.run());

        ServiceHandle {
            commands: commands_tx,
            notices: notices_tx,
            status: status_rx,
            submitted: AtomicU64::new(0),
            task,
        }
    }

    async fn run(mut self) {
        info!("PecaPort service started");

        loop {
            let deadline = self.deadline;
            let idle = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request(request)) => self.on_request(request).await,
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event).await,
                _ = idle => self.on_idle(),
            }
        }

        self.discoverer.detach();
        if !self.queue.is_empty() {
            warn!("Service stopped with {} pending tasks", self.queue.len());
        }
        info!("PecaPort service stopped");
    }

    async fn on_request(&mut self, request: PortRequest) {
        debug!("Request: {:?}", request);

        let resolved = self.interfaces.active_interface().and_then(|interface| {
            let client_ip = interface.private_address()?;
            Ok((interface, client_ip))
        });

        match resolved {
            Ok((interface, client_ip)) => {
                debug!("Active network: {} ({})", interface.display_name(), client_ip);
                self.queue.extend(request.tasks(client_ip));
                self.interface = Some(interface);

                if !self.discoverer.is_attached() {
                    self.discoverer.attach().await;
                } else if let Err(e) = self.discoverer.research().await {
                    warn!("Router search not restarted: {}", e);
                }

                self.deadline = Some(Instant::now() + self.config.idle_timeout());
                self.update_status(|s| {
                    s.state = ServiceState::Discovering;
                    s.handled_requests += 1;
                });
            }
            Err(e) => {
                error!("No active network: {}", e);
                self.update_status(|s| s.handled_requests += 1);
            }
        }
    }

    async fn on_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::GatewayFound(device) => debug!("Gateway found: {}", device),
            DiscoveryEvent::GatewayLost(device) => debug!("Gateway lost: {}", device),
            DiscoveryEvent::WanConnectionsResolved {
                device,
                connections,
            } => {
                self.on_connections_resolved(device, connections).await;
            }
        }
    }

    async fn on_connections_resolved(&mut self, device: RemoteDevice, connections: Vec<WanConnection>) {
        info!("{} WAN connection(s) resolved on {}", connections.len(), device);

        for connection in connections {
            if let Err(e) = self.reconcile(connection).await {
                error!("Reconciliation aborted: {}", e);
            }
        }

        let state = if self.discoverer.is_attached() {
            ServiceState::Discovering
        } else {
            ServiceState::Idle
        };
        self.update_status(|s| {
            s.state = state;
            s.resolved_events += 1;
        });
    }

    /// Drain the queue against `connection`
    async fn reconcile(&mut self, connection: WanConnection) -> Result<()> {
        if !connection.is_online() {
            info!(
                "Skipping {}: {} (external IP {})",
                connection.service().short_id(),
                connection.status(),
                connection.external_ip().unwrap_or("unknown")
            );
            self.store(connection);
            return Ok(());
        }

        if self.queue.is_empty() {
            self.store(connection);
            return Ok(());
        }

        let Some(interface) = self.interface.as_ref() else {
            warn!("Tasks pending without a known network");
            self.store(connection);
            return Ok(());
        };

        let identity = NetworkIdentity::new(interface, connection.service());
        if self.preferences.is_network_disabled(&identity).await {
            info!("Denied: NAT management is disabled on {}", identity);
            self.store(connection);
            return Ok(());
        }

        self.update_status(|s| s.state = ServiceState::Reconciling);
        let debug = self.preferences.is_debug().await;

        let mut snapshot = connection;
        let result = loop {
            let Some(task) = self.queue.pop_front() else {
                break Ok(());
            };
            if !task.need_execute(snapshot.mappings()) {
                debug!("Skipping {}", task);
                continue;
            }

            match self.execute(task, &snapshot).await {
                Ok(notice) => {
                    snapshot = snapshot.apply(&notice);
                    self.publish(notice, &snapshot, debug);
                }
                Err(e) => break Err(e),
            }
        };

        self.store(snapshot);
        result
    }

    /// Run `task` on its own tokio task
    ///
    /// The action is bounded by the configured action timeout, so a router that
    /// never answers yields a failed notice instead of stalling the loop.
    async fn execute(&self, task: PortTask, snapshot: &WanConnection) -> Result<MappingNotice> {
        let runtime = self.runtime.clone();
        let service = snapshot.service().clone();
        let description = self.config.description.clone();
        let timeout = self.config.action_timeout();

        tokio::spawn(async move {
            let manipulator = PortManipulator::new(&*runtime, &service).with_timeout(timeout);
            task.execute(&manipulator, &description).await
        })
        .await
        .map_err(|e| Error::Interrupted(format!("{}: {}", task, e)))
    }

    fn publish(&self, notice: MappingNotice, snapshot: &WanConnection, debug: bool) {
        if debug {
            info!("{}", notice);
            info!(
                "Mapping table of {} (generation {}):",
                snapshot.service().short_id(),
                snapshot.generation()
            );
            for (index, mapping) in snapshot.indexed_mappings() {
                info!("  [{}] {}", index, mapping);
            }
        } else {
            debug!("{}", notice);
        }

        if self.notices.send(notice).is_err() {
            debug!("No notice subscribers");
        }
    }

    fn on_idle(&mut self) {
        info!("No requests for {:?}, stopping discovery", self.config.idle_timeout());
        self.deadline = None;
        self.discoverer.detach();

        if !self.queue.is_empty() {
            warn!("Dropping {} pending tasks: no usable router found", self.queue.len());
            self.queue.clear();
        }

        self.update_status(|s| s.state = ServiceState::Idle);
    }

    fn store(&self, connection: WanConnection) {
        let key = format!(
            "{}/{}",
            connection.service().device_udn,
            connection.service().service_id
        );
        self.status.send_modify(|s| {
            s.connections.insert(key, connection);
        });
    }

    fn update_status(&self, change: impl FnOnce(&mut ServiceStatus)) {
        let pending = self.queue.len();
        self.status.send_modify(|s| {
            change(s);
            s.pending_tasks = pending;
        });
    }
}
