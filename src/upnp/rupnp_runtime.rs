//! `UpnpRuntime` backed by the `rupnp` control point
//!
//! rupnp has no device registry of its own, so this runtime keeps the devices
//! returned by the last searches and looks services up by UDN and service id
//! when an action is invoked. Every request to a router is bounded by a timeout.

use super::runtime::UpnpRuntime;
use super::types::{
    ActionError, ActionOutput, DiscoveryError, RemoteDevice, ServiceRef, WAN_IP_CONNECTION,
    WAN_PPP_CONNECTION, urn_type_name,
};
use async_trait::async_trait;
use futures::StreamExt;
use rupnp::ssdp::SearchTarget;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};

/// Default deadline of one SOAP or SCPD request
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Extra time granted to the SSDP search on top of its window
const SEARCH_GRACE: Duration = Duration::from_secs(1);

/// Production UPnP runtime
pub struct RupnpRuntime {
    devices: RwLock<HashMap<String, rupnp::Device>>,
    action_timeout: Duration,
}

impl Default for RupnpRuntime {
    fn default() -> Self {
        Self::with_action_timeout(DEFAULT_ACTION_TIMEOUT)
    }
}

impl RupnpRuntime {
    /// Create a runtime with an empty device cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a runtime whose router requests fail after `action_timeout`
    pub fn with_action_timeout(action_timeout: Duration) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            action_timeout,
        }
    }
}

#[async_trait]
impl UpnpRuntime for RupnpRuntime {
    async fn search(
        &self,
        window: Duration,
        found: mpsc::UnboundedSender<RemoteDevice>,
    ) -> Result<(), DiscoveryError> {
        debug!("SSDP search for root devices ({:?})", window);

        let devices = tokio::time::timeout(
            window + SEARCH_GRACE,
            rupnp::discover(&SearchTarget::RootDevice, window),
        )
        .await
        .map_err(|_| DiscoveryError::Search("SSDP search timed out".to_string()))?
        .map_err(|e| DiscoveryError::Search(e.to_string()))?;
        tokio::pin!(devices);

        while let Some(device) = devices.next().await {
            let device = match device {
                Ok(device) => device,
                Err(e) => {
                    debug!("Ignoring device with unreadable description: {}", e);
                    continue;
                }
            };

            let remote = describe(&device, self.action_timeout).await;
            self.devices
                .write()
                .await
                .insert(remote.udn.clone(), device);

            if found.send(remote).is_err() {
                // Nobody is listening anymore
                break;
            }
        }

        Ok(())
    }

    async fn clear_remote_devices(&self) {
        self.devices.write().await.clear();
    }

    async fn invoke(
        &self,
        service: &ServiceRef,
        action: &str,
        arguments: &[(&str, String)],
    ) -> Result<ActionOutput, ActionError> {
        let device = self
            .devices
            .read()
            .await
            .get(&service.device_udn)
            .cloned()
            .ok_or_else(|| ActionError::UnknownService(service.device_udn.clone()))?;

        let upnp_service = find_service(&device, &service.service_id)
            .cloned()
            .ok_or_else(|| ActionError::UnknownService(service.service_id.clone()))?;

        let encoded = encode_arguments(arguments);
        let call = upnp_service.action(device.url(), action, &encoded);
        tokio::time::timeout(self.action_timeout, call)
            .await
            .map_err(|_| ActionError::timed_out())?
            .map_err(|e| match e {
                rupnp::Error::UPnPError(fault) => ActionError::Fault {
                    code: None,
                    description: fault.to_string(),
                },
                other => ActionError::Transport(other.to_string()),
            })
    }
}

/// Convert a rupnp device into the runtime-independent model
async fn describe(device: &rupnp::Device, timeout: Duration) -> RemoteDevice {
    let mut services = Vec::new();
    collect_services(device, &mut services);

    let mut refs = Vec::with_capacity(services.len());
    for service in services {
        let service_type = service.service_type().to_string();

        // Only WAN services need their action list; reading every SCPD is slow
        let is_wan = matches!(
            urn_type_name(&service_type),
            Some(WAN_PPP_CONNECTION) | Some(WAN_IP_CONNECTION)
        );
        let actions = if is_wan {
            match tokio::time::timeout(timeout, service.scpd(device.url())).await {
                Ok(Ok(scpd)) => Some(scpd.actions().iter().map(|a| a.name().to_string()).collect()),
                Ok(Err(e)) => {
                    warn!("Could not read SCPD of {}: {}", service.service_id(), e);
                    None
                }
                Err(_) => {
                    warn!("SCPD of {} timed out", service.service_id());
                    None
                }
            }
        } else {
            None
        };

        refs.push(ServiceRef {
            device_udn: strip_uuid(device.udn()).to_string(),
            service_type,
            service_id: service.service_id().to_string(),
            actions,
        });
    }

    RemoteDevice {
        udn: strip_uuid(device.udn()).to_string(),
        device_type: device.device_type().to_string(),
        friendly_name: device.friendly_name().to_string(),
        root: true,
        services: refs,
    }
}

fn collect_services<'a>(device: &'a rupnp::DeviceSpec, out: &mut Vec<&'a rupnp::Service>) {
    out.extend(device.services().iter());
    for embedded in device.devices() {
        collect_services(embedded, out);
    }
}

fn find_service<'a>(device: &'a rupnp::DeviceSpec, service_id: &str) -> Option<&'a rupnp::Service> {
    device.services()
        .iter()
        .find(|s| s.service_id() == service_id)
        .or_else(|| {
            device.devices()
                .iter()
                .find_map(|embedded| find_service(embedded, service_id))
        })
}

fn strip_uuid(udn: &str) -> &str {
    udn.strip_prefix("uuid:").unwrap_or(udn)
}

/// Render input arguments as the body of a SOAP action element
pub(crate) fn encode_arguments(arguments: &[(&str, String)]) -> String {
    arguments
        .iter()
        .map(|(name, value)| format!("<{name}>{}</{name}>", escape_xml(value)))
        .collect()
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
