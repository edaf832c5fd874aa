//! Snapshot of a WAN connection service
//!
//! A [`WanConnection`] is built by running, over one FIFO queue of actions:
//!
//! 1. `GetExternalIPAddress`
//! 2. `GetStatusInfo`
//! 3. `GetGenericPortMappingEntry` for indices 0 to 15
//!
//! Routers never report how many mappings they hold, so the table is read until
//! the cap or the first failing index. At most [`ACTION_CONCURRENCY`] actions are
//! in flight at a time; embedded HTTP servers handle more than that badly.
//!
//! Snapshots are immutable. Applying the result of an Add/Delete produces a new
//! snapshot with the next generation number.

use super::manipulator::{MappingNotice, PortManipulator, PortMethod};
use super::runtime::UpnpRuntime;
use super::types::{
    ActionError, ConnectionStatus, GET_EXTERNAL_IP_ADDRESS, GET_GENERIC_PORT_MAPPING_ENTRY,
    GET_STATUS_INFO, PortMapping, Protocol, ServiceRef,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, warn};

/// Maximum number of `GetGenericPortMappingEntry` calls per snapshot
pub const MAX_MAPPING_ENTRIES: u32 = 16;

/// Maximum number of action invocations in flight while building a snapshot
pub const ACTION_CONCURRENCY: usize = 2;

/// Live state of one WAN connection service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WanConnection {
    service: ServiceRef,
    external_ip: Option<String>,
    status: ConnectionStatus,
    mappings: BTreeMap<u32, PortMapping>,
    generation: u64,
}

enum Step {
    ExternalIp,
    StatusInfo,
    Entry(u32),
}

enum StepResult {
    ExternalIp(Result<String, ActionError>),
    StatusInfo(Result<ConnectionStatus, ActionError>),
    Entry(u32, Result<PortMapping, ActionError>),
}

impl WanConnection {
    /// Query the router and build a snapshot of `service`
    ///
    /// Never fails: unreadable values keep their defaults and are logged.
    pub async fn create<R: UpnpRuntime + ?Sized>(runtime: &R, service: ServiceRef) -> Self {
        let mut steps = vec![Step::ExternalIp, Step::StatusInfo];
        if service.advertises(GET_GENERIC_PORT_MAPPING_ENTRY) {
            steps.extend((0..MAX_MAPPING_ENTRIES).map(Step::Entry));
        } else {
            debug!(
                "{} does not advertise {}, skipping table",
                service.short_id(),
                GET_GENERIC_PORT_MAPPING_ENTRY
            );
        }

        let mut external_ip = None;
        let mut status = ConnectionStatus::default();
        let mut mappings = BTreeMap::new();

        {
            let service = &service;
            let mut results = stream::iter(steps)
                .map(|step| run_step(runtime, service, step))
                .buffered(ACTION_CONCURRENCY);

            while let Some(result) = results.next().await {
                match result {
                    StepResult::ExternalIp(Ok(ip)) => {
                        debug!("GetExternalIP success: {}", ip);
                        external_ip = Some(ip);
                    }
                    StepResult::ExternalIp(Err(e)) => {
                        error!("GetExternalIP failure on {}: {}", service.short_id(), e);
                    }
                    StepResult::StatusInfo(Ok(s)) => {
                        debug!("GetStatusInfo success: {}", s);
                        status = s;
                    }
                    StepResult::StatusInfo(Err(e)) => {
                        error!("GetStatusInfo failure on {}: {}", service.short_id(), e);
                    }
                    StepResult::Entry(index, Ok(mapping)) => {
                        debug!("GetGenericPortMappingEntry success: index={}, {}", index, mapping);
                        mappings.insert(index, mapping);
                    }
                    StepResult::Entry(index, Err(e)) => {
                        if e.is_fault() {
                            debug!("End of mapping table at index={}: {}", index, e);
                        } else {
                            warn!(
                                "Mapping enumeration aborted at index={} on {}, table may be incomplete: {}",
                                index,
                                service.short_id(),
                                e
                            );
                        }
                        // The entry already in flight behind this one is dropped with the stream
                        break;
                    }
                }
            }
        }

        let connection = Self {
            service,
            external_ip,
            status,
            mappings,
            generation: 0,
        };
        connection.report_duplicates();
        connection
    }

    /// Assemble a snapshot from known values
    pub fn from_parts(
        service: ServiceRef,
        external_ip: Option<String>,
        status: ConnectionStatus,
        mappings: impl IntoIterator<Item = PortMapping>,
    ) -> Self {
        Self {
            service,
            external_ip,
            status,
            mappings: (0u32..).zip(mappings).collect(),
            generation: 0,
        }
    }

    /// The service this snapshot describes
    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    /// External IP address, if the router reported one
    pub fn external_ip(&self) -> Option<&str> {
        self.external_ip.as_deref()
    }

    /// Connection status
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Snapshot generation, incremented on every applied change
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mappings in table index order
    pub fn mappings(&self) -> impl Iterator<Item = &PortMapping> {
        self.mappings.values()
    }

    /// Mappings with their router-side index
    pub fn indexed_mappings(&self) -> impl Iterator<Item = (u32, &PortMapping)> {
        self.mappings.iter().map(|(index, mapping)| (*index, mapping))
    }

    /// Number of known mappings
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Enabled mapping for (`port`, `protocol`), if any
    pub fn find_mapping(&self, port: u16, protocol: Protocol) -> Option<&PortMapping> {
        self.mappings
            .values()
            .find(|m| m.enabled && m.external_port == port && m.protocol == protocol)
    }

    /// Whether the connection is up and has an external address
    pub fn is_online(&self) -> bool {
        self.external_ip.is_some() && self.status == ConnectionStatus::Connected
    }

    /// A manipulator acting on this snapshot's service
    pub fn manipulator<'a, R: UpnpRuntime + ?Sized>(&'a self, runtime: &'a R) -> PortManipulator<'a, R> {
        PortManipulator::new(runtime, &self.service)
    }

    /// Snapshot reflecting a successful `AddPortMapping`
    pub fn with_mapping_added(&self, mapping: PortMapping) -> Self {
        let mut next = self.next_generation();
        next.mappings
            .retain(|_, m| !(m.external_port == mapping.external_port && m.protocol == mapping.protocol));
        let index = next.mappings.keys().next_back().map_or(0, |last| last + 1);
        next.mappings.insert(index, mapping);
        next
    }

    /// Snapshot reflecting a successful `DeletePortMapping`
    pub fn with_mapping_removed(&self, external_port: u16, protocol: Protocol) -> Self {
        let mut next = self.next_generation();
        next.mappings
            .retain(|_, m| !(m.external_port == external_port && m.protocol == protocol));
        next
    }

    /// Snapshot reflecting `notice`; failed operations change nothing
    pub fn apply(&self, notice: &MappingNotice) -> Self {
        if !notice.is_success() {
            return self.clone();
        }
        match notice.method {
            PortMethod::Add => self.with_mapping_added(notice.mapping.clone()),
            PortMethod::Delete => {
                self.with_mapping_removed(notice.mapping.external_port, notice.mapping.protocol)
            }
        }
    }

    fn next_generation(&self) -> Self {
        let mut next = self.clone();
        next.generation += 1;
        next
    }

    fn report_duplicates(&self) {
        let mut counts: HashMap<(u16, Protocol), usize> = HashMap::new();
        for mapping in self.mappings.values().filter(|m| m.enabled) {
            *counts.entry((mapping.external_port, mapping.protocol)).or_default() += 1;
        }
        for ((port, protocol), count) in counts {
            if count > 1 {
                warn!(
                    "Router {} reports {} enabled mappings for {}/{}",
                    self.service.short_id(),
                    count,
                    port,
                    protocol
                );
            }
        }
    }
}

async fn run_step<R: UpnpRuntime + ?Sized>(runtime: &R, service: &ServiceRef, step: Step) -> StepResult {
    match step {
        Step::ExternalIp => StepResult::ExternalIp(
            runtime
                .invoke(service, GET_EXTERNAL_IP_ADDRESS, &[])
                .await
                .and_then(|out| {
                    out.get("NewExternalIPAddress")
                        .map(|ip| ip.trim().to_string())
                        .filter(|ip| !ip.is_empty())
                        .ok_or(ActionError::MissingArgument("NewExternalIPAddress"))
                }),
        ),
        Step::StatusInfo => StepResult::StatusInfo(
            runtime
                .invoke(service, GET_STATUS_INFO, &[])
                .await
                .and_then(|out| {
                    let raw = out
                        .get("NewConnectionStatus")
                        .ok_or(ActionError::MissingArgument("NewConnectionStatus"))?;
                    ConnectionStatus::parse(raw).ok_or_else(|| ActionError::InvalidArgument {
                        name: "NewConnectionStatus",
                        value: raw.clone(),
                    })
                }),
        ),
        Step::Entry(index) => StepResult::Entry(
            index,
            runtime
                .invoke(
                    service,
                    GET_GENERIC_PORT_MAPPING_ENTRY,
                    &[("NewPortMappingIndex", index.to_string())],
                )
                .await
                .and_then(|out| PortMapping::from_action_output(&out)),
        ),
    }
}
