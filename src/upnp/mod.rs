//! UPnP Internet Gateway Device support
//!
//! This module finds the router, reads its WAN connection state and port-mapping
//! table, and opens or closes ports on it:
//! - `discoverer` - router search and WAN service resolution
//! - `wan` - WAN connection snapshots and bounded table enumeration
//! - `task` - idempotent Add / Delete / DeleteOnDifferentClient decisions
//! - `manipulator` - `AddPortMapping` / `DeletePortMapping` with uniform results
//! - `runtime` - the control point seam, `rupnp_runtime` its production binding

// Submodules
pub mod discoverer;
pub mod manipulator;
pub mod rupnp_runtime;
pub mod runtime;
pub mod task;
pub mod types;
pub mod wan;

// Re-export commonly used types
pub use discoverer::{DiscoveryEvent, RouterDiscoverer};
pub use manipulator::{MappingNotice, NoticeOutcome, PortManipulator, PortMethod};
pub use rupnp_runtime::RupnpRuntime;
pub use runtime::UpnpRuntime;
pub use task::{PortTask, TaskKind};
pub use types::{
    ActionError, ActionOutput, ConnectionStatus, DiscoveryError, PortMapping, Protocol,
    RemoteDevice, ServiceRef,
};
pub use wan::{ACTION_CONCURRENCY, MAX_MAPPING_ENTRIES, WanConnection};
