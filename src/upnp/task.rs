//! Port reconciliation tasks
//!
//! A task decides, from the current mapping table alone, whether its action is
//! still needed, and performs that action when asked. Tasks hold no state
//! besides their parameters, so they can be checked again against a newer table.

use super::manipulator::{MappingNotice, PortManipulator, PortMethod};
use super::runtime::UpnpRuntime;
use super::types::{PortMapping, Protocol};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// What a task does
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskKind {
    /// Open the port for the client
    Add,
    /// Close the port, whoever owns it
    Delete,
    /// Close the port only if another client owns it
    ///
    /// Adding a port that is mapped to someone else fails with
    /// `ConflictInMappingEntry`, so this runs before [`TaskKind::Add`].
    DeleteOnDifferentClient,
}

/// One reconciliation step for a TCP port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortTask {
    /// What to do
    pub kind: TaskKind,
    /// LAN address of this host
    pub client_ip: Ipv4Addr,
    /// External and internal port
    pub port: u16,
}

impl PortTask {
    /// Task opening `port` for `client_ip`
    pub fn add(client_ip: Ipv4Addr, port: u16) -> Self {
        Self { kind: TaskKind::Add, client_ip, port }
    }

    /// Task closing `port`
    pub fn delete(client_ip: Ipv4Addr, port: u16) -> Self {
        Self { kind: TaskKind::Delete, client_ip, port }
    }

    /// Task closing `port` if it is mapped to a host other than `client_ip`
    pub fn delete_on_different_client(client_ip: Ipv4Addr, port: u16) -> Self {
        Self {
            kind: TaskKind::DeleteOnDifferentClient,
            client_ip,
            port,
        }
    }

    /// Tasks that make `port` reach `client_ip`
    pub fn open(client_ip: Ipv4Addr, port: u16) -> [Self; 2] {
        [
            Self::delete_on_different_client(client_ip, port),
            Self::add(client_ip, port),
        ]
    }

    /// Tasks that close `port`
    pub fn close(client_ip: Ipv4Addr, port: u16) -> [Self; 1] {
        [Self::delete(client_ip, port)]
    }

    /// Port operation this task performs
    pub fn method(&self) -> PortMethod {
        match self.kind {
            TaskKind::Add => PortMethod::Add,
            TaskKind::Delete | TaskKind::DeleteOnDifferentClient => PortMethod::Delete,
        }
    }

    /// Whether the task must run against `mappings`
    pub fn need_execute<'a>(&self, mappings: impl IntoIterator<Item = &'a PortMapping>) -> bool {
        let mut existing = mappings
            .into_iter()
            .filter(|m| m.is_enabled_tcp_on(self.port));

        match self.kind {
            TaskKind::Add => {
                let exists = existing.next().is_some();
                if exists {
                    info!("Already mapping: port={}", self.port);
                }
                !exists
            }
            TaskKind::Delete => {
                let exists = existing.next().is_some();
                if !exists {
                    debug!("No mapping: port={}", self.port);
                }
                exists
            }
            TaskKind::DeleteOnDifferentClient => existing.any(|m| !m.is_owned_by(self.client_ip)),
        }
    }

    /// Perform the task's action
    pub async fn execute<R: UpnpRuntime + ?Sized>(
        &self,
        manipulator: &PortManipulator<'_, R>,
        description: &str,
    ) -> MappingNotice {
        match self.kind {
            TaskKind::Add => {
                let mapping = PortMapping::tcp(self.port, self.client_ip, description);
                manipulator.add_port(&mapping).await
            }
            TaskKind::Delete | TaskKind::DeleteOnDifferentClient => {
                manipulator
                    .delete_port(&PortMapping::key(self.port, Protocol::TCP))
                    .await
            }
        }
    }
}

impl fmt::Display for PortTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({}:{})", self.kind, self.client_ip, self.port)
    }
}
