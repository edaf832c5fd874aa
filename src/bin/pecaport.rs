//! PecaPort command line
//!
//! Opens or closes the PeerCast port on the local UPnP router, edits the
//! router's mapping table by hand and manages the per-network opt-out list.

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use pecaport::network::{FixedInterface, NetworkInterfaceInfo, active_interface, find_by_name, list_interfaces};
use pecaport::upnp::{
    DiscoveryEvent, PortMapping, Protocol, RemoteDevice, RouterDiscoverer, RupnpRuntime, WanConnection,
};
use pecaport::{NetworkIdentity, PecaPortService, Preferences, PreferencesManager, ServiceConfig};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Time allowed for resolving the routers found during a search window
const RESOLVE_GRACE: Duration = Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "pecaport", version, about = "Automatic UPnP port mapping for PeerCast")]
struct Cli {
    /// Preferences file (defaults to the user config directory)
    #[arg(long, global = true)]
    prefs: Option<PathBuf>,

    /// Service configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Network interface to map ports for (defaults to the active one)
    #[arg(short, long, global = true)]
    interface: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Map a TCP port to this host
    Open {
        /// Port used by the PeerCast server
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Remove the mapping of a TCP port
    Close {
        /// Port used by the PeerCast server
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        port: u16,
    },
    /// Add an arbitrary mapping to a router's table
    Add {
        /// External (WAN side) port
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        external_port: u16,
        /// Internal port (defaults to the external port)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        internal_port: Option<u16>,
        /// LAN client to forward to (defaults to this host)
        #[arg(long)]
        client: Option<Ipv4Addr>,
        /// `TCP` or `UDP`
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
        /// Mapping description (defaults to the configured one)
        #[arg(long)]
        description: Option<String>,
        /// Identity of the connection to use (defaults to the first connected one)
        #[arg(long)]
        network: Option<String>,
    },
    /// Delete a mapping from a router's table
    Remove {
        /// External (WAN side) port of the mapping
        #[arg(value_parser = clap::value_parser!(u16).range(1..))]
        external_port: u16,
        /// `TCP` or `UDP`
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
        /// Identity of the connection to use (defaults to the first connected one)
        #[arg(long)]
        network: Option<String>,
    },
    /// Show routers, WAN connections and their mapping tables
    Status,
    /// List local network interfaces
    Interfaces,
    /// List the identities of the reachable networks
    Identities,
    /// Disable NAT management on a network
    Disable {
        /// Network identity as printed by `identities`
        identity: String,
    },
    /// Enable NAT management on a network again
    Enable {
        /// Network identity as printed by `identities`
        identity: String,
    },
    /// Turn verbose mapping feedback on or off
    Debug {
        /// `on` or `off`
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let prefs_path = match cli.prefs.clone() {
        Some(path) => path,
        None => Preferences::default_path().ok_or_else(|| anyhow!("No config directory, use --prefs"))?,
    };
    let preferences = PreferencesManager::new(&prefs_path)
        .await
        .with_context(|| format!("Failed to load preferences from {}", prefs_path.display()))?;

    pecaport::init_with_filter(if preferences.is_debug().await { "debug" } else { "info" });

    let config = match &cli.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    match cli.command {
        Commands::Open { port } => run_request(cli.interface.as_deref(), preferences, config, port, true).await,
        Commands::Close { port } => run_request(cli.interface.as_deref(), preferences, config, port, false).await,
        Commands::Status => show_status(cli.interface.as_deref(), &preferences, &config, true).await,
        Commands::Identities => show_status(cli.interface.as_deref(), &preferences, &config, false).await,
        Commands::Add {
            external_port,
            internal_port,
            client,
            protocol,
            description,
            network,
        } => {
            let interface = resolve_interface(cli.interface.as_deref())?;
            let client = match client {
                Some(client) => client,
                None => interface.private_address()?,
            };
            let mapping = PortMapping::new(
                external_port,
                internal_port.unwrap_or(external_port),
                protocol,
                client,
                description.unwrap_or_else(|| config.description.clone()),
            );
            add_mapping(&interface, &config, network.as_deref(), mapping).await
        }
        Commands::Remove {
            external_port,
            protocol,
            network,
        } => {
            let interface = resolve_interface(cli.interface.as_deref())?;
            remove_mapping(&interface, &config, network.as_deref(), external_port, protocol).await
        }
        Commands::Interfaces => {
            show_interfaces();
            Ok(())
        }
        Commands::Disable { identity } => {
            preferences.disable_network(NetworkIdentity::from(identity.as_str())).await?;
            println!("NAT management disabled on {}", identity);
            Ok(())
        }
        Commands::Enable { identity } => {
            preferences.enable_network(&NetworkIdentity::from(identity.as_str())).await?;
            println!("NAT management enabled on {}", identity);
            Ok(())
        }
        Commands::Debug { state } => {
            preferences.set_debug(state == "on").await?;
            println!("Debug feedback {}", state);
            Ok(())
        }
    }
}

fn resolve_interface(name: Option<&str>) -> Result<NetworkInterfaceInfo> {
    let interface = match name {
        Some(name) => find_by_name(name)?,
        None => active_interface()?,
    };
    Ok(interface)
}

async fn run_request(
    interface: Option<&str>,
    preferences: PreferencesManager,
    config: ServiceConfig,
    port: u16,
    open: bool,
) -> Result<()> {
    let interface = resolve_interface(interface)?;
    println!("Network: {}", interface);

    let runtime = Arc::new(RupnpRuntime::with_action_timeout(config.action_timeout()));
    let service = PecaPortService::spawn(runtime, FixedInterface(interface), preferences, config);
    let mut notices = service.subscribe();

    if open {
        service.open(port)?;
    } else {
        service.close(port)?;
    }

    let status = service.wait_settled().await?;
    service.shutdown().await?;

    let mut executed = 0;
    while let Ok(notice) = notices.try_recv() {
        println!("{}", notice);
        executed += 1;
    }

    if executed == 0 {
        if status.connections.values().any(WanConnection::is_online) {
            println!("Nothing to do");
        } else {
            println!("No usable router found");
        }
    }
    Ok(())
}

async fn show_status(
    interface: Option<&str>,
    preferences: &PreferencesManager,
    config: &ServiceConfig,
    tables: bool,
) -> Result<()> {
    let interface = resolve_interface(interface)?;
    println!("Network: {}", interface);

    let runtime = Arc::new(RupnpRuntime::with_action_timeout(config.action_timeout()));
    let routers = discover(runtime, config).await;
    if routers.is_empty() {
        println!("No router found");
    }

    for (device, connections) in routers {
        println!();
        println!("Router: {}", device);

        for connection in &connections {
            let identity = NetworkIdentity::new(&interface, connection.service());
            let state = if preferences.is_network_disabled(&identity).await {
                "disabled"
            } else {
                "enabled"
            };
            println!("  {} [{}]", identity, state);

            if tables {
                println!(
                    "    {} external IP {}",
                    connection.status(),
                    connection.external_ip().unwrap_or("unknown")
                );
                for (index, mapping) in connection.indexed_mappings() {
                    println!("    [{}] {}", index, mapping);
                }
            }
        }
    }
    Ok(())
}

/// Search for routers and collect the WAN connections resolved in time
async fn discover(
    runtime: Arc<RupnpRuntime>,
    config: &ServiceConfig,
) -> Vec<(RemoteDevice, Vec<WanConnection>)> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut discoverer = RouterDiscoverer::new(
        runtime,
        events_tx,
        config.attach_search_window(),
        config.research_search_window(),
    );
    discoverer.attach().await;

    let deadline = Instant::now() + config.attach_search_window() + RESOLVE_GRACE;
    let mut routers = Vec::new();
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events_rx.recv()).await {
        if let DiscoveryEvent::WanConnectionsResolved { device, connections } = event {
            routers.push((device, connections));
        }
    }
    discoverer.detach();
    routers
}

/// The connection named by `network`, or the first connected one
async fn pick_connection(
    runtime: Arc<RupnpRuntime>,
    interface: &NetworkInterfaceInfo,
    config: &ServiceConfig,
    network: Option<&str>,
) -> Result<WanConnection> {
    let wanted = network.map(NetworkIdentity::from);

    discover(runtime, config)
        .await
        .into_iter()
        .flat_map(|(_, connections)| connections)
        .find(|connection| match &wanted {
            Some(identity) => NetworkIdentity::new(interface, connection.service()) == *identity,
            None => connection.is_online(),
        })
        .ok_or_else(|| match network {
            Some(identity) => anyhow!("No WAN connection with identity {}", identity),
            None => anyhow!("No connected router found"),
        })
}

async fn add_mapping(
    interface: &NetworkInterfaceInfo,
    config: &ServiceConfig,
    network: Option<&str>,
    mapping: PortMapping,
) -> Result<()> {
    let runtime = Arc::new(RupnpRuntime::with_action_timeout(config.action_timeout()));
    let connection = pick_connection(runtime.clone(), interface, config, network).await?;

    let notice = connection.manipulator(&*runtime).add_port(&mapping).await;
    println!("{}", notice);
    if !notice.is_success() {
        return Err(anyhow!("Mapping not added"));
    }
    Ok(())
}

async fn remove_mapping(
    interface: &NetworkInterfaceInfo,
    config: &ServiceConfig,
    network: Option<&str>,
    external_port: u16,
    protocol: Protocol,
) -> Result<()> {
    let runtime = Arc::new(RupnpRuntime::with_action_timeout(config.action_timeout()));
    let connection = pick_connection(runtime.clone(), interface, config, network).await?;

    let mapping = connection
        .find_mapping(external_port, protocol)
        .ok_or_else(|| {
            anyhow!(
                "No {} mapping on port {} in the table of {}",
                protocol,
                external_port,
                connection.service().short_id()
            )
        })?;
    println!("Deleting {}", mapping);

    let notice = connection.manipulator(&*runtime).delete_port(mapping).await;
    println!("{}", notice);
    if !notice.is_success() {
        return Err(anyhow!("Mapping not deleted"));
    }
    Ok(())
}

fn show_interfaces() {
    let active = active_interface().ok();
    for interface in list_interfaces() {
        let marker = if active.as_ref().map(|a| a.name()) == Some(interface.name()) {
            "*"
        } else {
            " "
        };
        println!("{} {} {}", marker, interface.display_name(), interface);
    }
}
