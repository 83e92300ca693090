//! # netalloc
//!
//! Control-plane network allocator for a container orchestrator.
//!
//! The allocator is the authoritative bookkeeper of network-layer resources
//! attached to cluster objects:
//!
//! - **Networks**: IPAM pools, gateway addresses, and driver-specific state
//! - **Services**: virtual IPs (one per attached network) and published ports
//! - **Tasks and nodes**: per-attachment IP addresses
//!
//! It is not a dataplane. It assigns identifiers and delegates driver-specific
//! state to network and IPAM drivers resolved through a [`DriverRegistry`];
//! packet forwarding, DNS, and routing live elsewhere.
//!
//! ## Ownership model
//!
//! The caller owns the network/service/task/node objects and presents them by
//! mutable reference. Allocation writes the assigned resources into the
//! object's endpoint, IPAM, and driver-state fields in place and records
//! success in the allocator's internal indexes; deallocation consumes the same
//! object and reverses the mutation.
//!
//! ## Concurrency
//!
//! The allocator is not internally synchronized and assumes a single exclusive
//! caller (the surrounding reconciliation loop). Driver and IPAM calls may
//! block on I/O when the driver is an out-of-process plugin. The
//! [`DriverRegistry`] is the only shared resource and synchronizes itself.

pub mod allocator;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod model;
pub mod ports;
pub mod registry;

pub use allocator::{
    is_ingress_network, is_ingress_network_needed, NetworkAllocator, ServiceAllocationOpts,
    DEFAULT_DRIVER, PREDEFINED_LABEL,
};
pub use error::Error;
pub use registry::{is_builtin_driver, DriverRegistry};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
