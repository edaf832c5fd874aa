//! The seam between this crate and a UPnP control point implementation
//!
//! Everything below the action level (SSDP multicast, description parsing,
//! SOAP envelopes) belongs to the runtime. The rest of the crate only sees
//! devices as they respond to a search and the result of each invoked action.

use super::types::{ActionError, ActionOutput, DiscoveryError, RemoteDevice, ServiceRef};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// A UPnP control point
#[async_trait]
pub trait UpnpRuntime: Send + Sync + 'static {
    /// Search for root devices during `window`
    ///
    /// Each device is sent on `found` as soon as its description has been read.
    /// The future completes when the search window has elapsed.
    async fn search(
        &self,
        window: Duration,
        found: mpsc::UnboundedSender<RemoteDevice>,
    ) -> Result<(), DiscoveryError>;

    /// Forget every remote device reported by earlier searches
    async fn clear_remote_devices(&self);

    /// Invoke `action` on `service` with the given input arguments
    async fn invoke(
        &self,
        service: &ServiceRef,
        action: &str,
        arguments: &[(&str, String)],
    ) -> Result<ActionOutput, ActionError>;
}
