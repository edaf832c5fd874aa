//! Opening and closing ports on one WAN connection service

use super::runtime::UpnpRuntime;
use super::types::{ActionError, ADD_PORT_MAPPING, DELETE_PORT_MAPPING, PortMapping, ServiceRef};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

/// Port operation performed by a [`PortManipulator`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PortMethod {
    /// `AddPortMapping`
    Add,
    /// `DeletePortMapping`
    Delete,
}

impl PortMethod {
    /// SOAP action name
    pub fn action(&self) -> &'static str {
        match self {
            PortMethod::Add => ADD_PORT_MAPPING,
            PortMethod::Delete => DELETE_PORT_MAPPING,
        }
    }
}

impl fmt::Display for PortMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Outcome of a port operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum NoticeOutcome {
    /// The router accepted the action
    Success,
    /// The router (or the transport) rejected it
    Failure(String),
}

/// Result notification of a port operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappingNotice {
    /// Operation performed
    pub method: PortMethod,
    /// Service the operation was performed on
    pub service: ServiceRef,
    /// Mapping that was added or deleted
    pub mapping: PortMapping,
    /// Whether it worked
    pub outcome: NoticeOutcome,
    /// Timestamp (Unix milliseconds)
    pub at_ms: i64,
}

impl MappingNotice {
    /// Whether the operation succeeded
    pub fn is_success(&self) -> bool {
        self.outcome == NoticeOutcome::Success
    }
}

impl fmt::Display for MappingNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            NoticeOutcome::Success => write!(
                f,
                "Success: {}PortMapping {} on {}",
                self.method,
                self.mapping,
                self.service.short_id()
            ),
            NoticeOutcome::Failure(message) => write!(
                f,
                "Failed: {}PortMapping {} on {}: {}",
                self.method,
                self.mapping,
                self.service.short_id(),
                message
            ),
        }
    }
}

/// Issues `AddPortMapping` / `DeletePortMapping` against one service
pub struct PortManipulator<'a, R: UpnpRuntime + ?Sized> {
    runtime: &'a R,
    service: &'a ServiceRef,
    timeout: Option<Duration>,
}

impl<'a, R: UpnpRuntime + ?Sized> PortManipulator<'a, R> {
    /// Create a manipulator for `service`
    ///
    /// Without [`with_timeout`](Self::with_timeout) an action may take as long
    /// as the runtime lets it.
    pub fn new(runtime: &'a R, service: &'a ServiceRef) -> Self {
        Self {
            runtime,
            service,
            timeout: None,
        }
    }

    /// Fail any action the router doesn't answer within `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The service this manipulator acts on
    pub fn service(&self) -> &ServiceRef {
        self.service
    }

    /// Open the port described by `mapping`
    pub async fn add_port(&self, mapping: &PortMapping) -> MappingNotice {
        self.perform(PortMethod::Add, mapping, mapping.add_arguments())
            .await
    }

    /// Close the port described by `mapping`
    ///
    /// Only the external port and protocol of `mapping` are sent.
    pub async fn delete_port(&self, mapping: &PortMapping) -> MappingNotice {
        self.perform(PortMethod::Delete, mapping, mapping.delete_arguments())
            .await
    }

    async fn perform(
        &self,
        method: PortMethod,
        mapping: &PortMapping,
        arguments: Vec<(&'static str, String)>,
    ) -> MappingNotice {
        debug!(
            "{} on {}: {}",
            method.action(),
            self.service.short_id(),
            mapping
        );

        let invocation = self.runtime.invoke(self.service, method.action(), &arguments);
        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, invocation)
                .await
                .unwrap_or_else(|_| Err(ActionError::timed_out())),
            None => invocation.await,
        };

        let outcome = match result {
            Ok(_) => NoticeOutcome::Success,
            Err(e) => {
                warn!("{} failed on {}: {}", method.action(), self.service.short_id(), e);
                NoticeOutcome::Failure(e.to_string())
            }
        };

        MappingNotice {
            method,
            service: self.service.clone(),
            mapping: mapping.clone(),
            outcome,
            at_ms: Utc::now().timestamp_millis(),
        }
    }
}
