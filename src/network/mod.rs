//! Local network state
//!
//! - `interface` - snapshots of the local interfaces and the active one
//! - `identity` - keys scoping per-network preferences

pub mod identity;
pub mod interface;

pub use identity::NetworkIdentity;
pub use interface::{
    FixedInterface, InterfaceError, InterfaceKind, InterfaceSource, NetworkInterfaceInfo,
    SystemInterfaces, active_interface, find_by_name, list_interfaces,
};
