//! Error types surfaced by the allocator.
//!
//! Allocation paths that fail after partial success roll back what they
//! acquired in the same call before returning, so a surfaced error never
//! leaves resources registered for the failed object. Release paths are
//! best-effort: individual failures are logged and the sweep continues.

use thiserror::Error;

use crate::driver::{DriverError, IpamError, PluginError};
use crate::ports::PortError;

/// Errors surfaced by the allocator's public surface.
#[derive(Debug, Error)]
pub enum Error {
    /// The network is already present in the allocator's index.
    #[error("network {0} already allocated")]
    AlreadyAllocated(String),

    /// No internal record exists for the network.
    #[error("no allocator state for network {0}")]
    NoNetworkState(String),

    /// The requested network driver is not registered and could not be
    /// loaded.
    #[error("could not resolve network driver {0}")]
    DriverNotFound(String),

    /// The requested IPAM driver is not registered.
    #[error("could not resolve IPAM driver {0}")]
    IpamNotFound(String),

    /// Lazy driver loading was requested but no plugin getter is configured.
    #[error("plugin store is uninitialized")]
    PluginStoreMissing,

    /// Plugin lookup failed.
    #[error("failed to load plugin for driver {name}")]
    PluginLoad {
        name: String,
        #[source]
        source: PluginError,
    },

    /// An IPAM pool request failed.
    #[error("pool request failed")]
    PoolRequest(#[source] IpamError),

    /// A gateway address request failed.
    #[error("gateway address request failed")]
    GatewayRequest(#[source] IpamError),

    /// The IPAM driver returned a gateway that does not parse.
    #[error("failed to parse gateway address ({value}) returned by ipam driver")]
    GatewayParse { value: String },

    /// An IPAM address request failed for a reason other than falling
    /// through the pool list.
    #[error("could not allocate IP from IPAM")]
    AddressRequest(#[source] IpamError),

    /// Every pool was tried and none yielded an address.
    #[error("could not find an available IP")]
    NoAvailableIp,

    /// An address string could not be parsed as CIDR or bare IP.
    #[error("could not parse address {0}")]
    InvalidAddress(String),

    /// The address is not recorded in the network's endpoint state.
    #[error("address {0} is not allocated")]
    AddressNotAllocated(String),

    /// The IPAM driver failed to release an address.
    #[error("IPAM failure while releasing address {addr}")]
    AddressRelease {
        addr: String,
        #[source]
        source: IpamError,
    },

    /// A subnet string could not be parsed while building driver state.
    #[error("error parsing subnet {0} while allocating driver state")]
    InvalidSubnet(String),

    /// A network driver call failed.
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// Pool and gateway allocation failed for the network; everything
    /// acquired in the call has been released.
    #[error("failed allocating pools and gateway IP for network {network_id}")]
    PoolAllocation {
        network_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Driver state allocation failed for the network; its pools have been
    /// released.
    #[error("failed while allocating driver state for network {network_id}")]
    DriverAllocation {
        network_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Freeing driver state failed during deallocation. Pool release is
    /// still attempted before this is surfaced.
    #[error("failed to free driver state for network {network_id}")]
    DriverRelease {
        network_id: String,
        #[source]
        source: Box<Error>,
    },

    /// Allocating an attachment address failed for the task; addresses
    /// assigned to earlier attachments in the same call have been released.
    #[error("failed to allocate network IP for task {task_id} network {network_id}")]
    TaskAllocation {
        task_id: String,
        network_id: String,
        #[source]
        source: Box<Error>,
    },

    /// A port reservation failed.
    #[error(transparent)]
    Port(#[from] PortError),
}
