//! Built-in driver implementations registered at construction.
//!
//! These cover the manager side only: the overlay driver assigns VXLAN ids,
//! the default IPAM driver carves pools and addresses, and the node-local
//! drivers are name-only markers whose resources are allocated on the node.

pub mod ipam;
pub mod local;
pub mod overlay;
