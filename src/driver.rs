//! Contracts between the allocator and its drivers.
//!
//! Network drivers allocate opaque network-wide state (e.g. VXLAN ids) and
//! declare the scope of that state; IPAM drivers provision subnet pools and
//! hand out individual addresses; the plugin getter looks up out-of-process
//! drivers on registry miss. All three are injected capabilities; the
//! allocator never reaches for globals.
//!
//! Implementations synchronize internally: every method takes `&self` and may
//! block on I/O when the driver lives out of process.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use thiserror::Error;

/// Option key an IPAM request uses to mark the address's intended role.
pub const REQUEST_ADDRESS_TYPE: &str = "RequestAddressType";

/// Meta/option key under which a gateway address travels.
pub const GATEWAY: &str = "com.docker.network.gateway";

/// Option key requesting serial (monotonically advancing) address
/// allocation instead of first-fit, avoiding quick reuse of freed addresses.
pub const ALLOC_SERIAL_PREFIX: &str = "com.docker.network.ipam.serial";

/// Endpoint type used when looking up network driver plugins.
pub const NETWORK_PLUGIN_ENDPOINT_TYPE: &str = "NetworkDriver";

/// Scope of the state a network driver allocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataScope {
    /// State is local to a single node; the manager performs no allocation.
    Local,
    /// State is cluster-wide and allocated by the manager.
    Global,
}

/// Capabilities a network driver declares at registration.
#[derive(Debug, Clone, Copy)]
pub struct Capability {
    pub data_scope: DataScope,
}

/// Per-subnet data handed to a network driver at allocation time.
#[derive(Debug, Clone)]
pub struct IpamData {
    pub pool: IpNetwork,
    /// Gateway as an address inside the pool, carrying the pool's mask.
    pub gateway: Option<IpNetwork>,
}

/// Errors reported by network drivers.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("network allocation is not supported by the {0} driver")]
    NotSupported(String),

    #[error("no allocated state for network {0}")]
    UnknownNetwork(String),

    #[error("id space exhausted")]
    IdExhausted,

    /// Opaque failure reported by an external driver.
    #[error("{0}")]
    Driver(String),
}

/// A network driver as seen from the manager: it allocates and frees
/// cluster-wide driver state, never dataplane resources.
pub trait NetworkDriver: Send + Sync {
    /// Allocate network-wide state for `id` and return the opaque options
    /// map to record in the network's driver state.
    fn network_allocate(
        &self,
        id: &str,
        options: &HashMap<String, String>,
        ipv4_data: &[IpamData],
        ipv6_data: &[IpamData],
    ) -> Result<HashMap<String, String>, DriverError>;

    /// Free the state previously allocated for `id`.
    fn network_free(&self, id: &str) -> Result<(), DriverError>;
}

/// Errors reported by IPAM drivers.
///
/// `NoAvailableIps` and `IpOutOfRange` are contractual: the allocator falls
/// through to the next pool on either and fails on anything else.
#[derive(Debug, Error)]
pub enum IpamError {
    #[error("no available addresses in pool")]
    NoAvailableIps,

    #[error("requested address is out of range")]
    IpOutOfRange,

    #[error("address is already allocated")]
    AlreadyAllocated,

    #[error("pool {0} is already allocated")]
    PoolOverlap(String),

    #[error("no available subnet in address space")]
    NoAvailablePool,

    #[error("unknown pool {0}")]
    UnknownPool(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Opaque failure reported by an external driver.
    #[error("{0}")]
    Driver(String),
}

/// Result of a successful pool request.
#[derive(Debug, Clone)]
pub struct PoolAllocation {
    /// Stable opaque handle used for all later requests against the pool.
    pub pool_id: String,
    /// The pool's subnet, driver-chosen when the request left it open.
    pub pool: IpNetwork,
    /// Driver metadata; may carry a driver-provided gateway under
    /// [`GATEWAY`].
    pub meta: HashMap<String, String>,
}

/// An IPAM driver: provisions subnet pools and individual addresses.
pub trait Ipam: Send + Sync {
    /// The driver's preferred (local, global) address-space labels.
    fn default_address_spaces(&self) -> (String, String);

    /// Request a pool in `address_space`. An empty `subnet` asks the driver
    /// to choose one; `sub_pool` optionally restricts address allocation to
    /// a sub-range of the subnet.
    fn request_pool(
        &self,
        address_space: &str,
        subnet: &str,
        sub_pool: &str,
        options: &HashMap<String, String>,
        v6: bool,
    ) -> Result<PoolAllocation, IpamError>;

    /// Release a pool and all its driver-side state.
    fn release_pool(&self, pool_id: &str) -> Result<(), IpamError>;

    /// Request an address from the pool. `preferred` asks for a specific
    /// address; `None` lets the driver choose. Returns the assigned address
    /// with the pool's prefix length.
    fn request_address(
        &self,
        pool_id: &str,
        preferred: Option<IpAddr>,
        options: &HashMap<String, String>,
    ) -> Result<IpNetwork, IpamError>;

    /// Release a single address back to the pool.
    fn release_address(&self, pool_id: &str, addr: IpAddr) -> Result<(), IpamError>;
}

/// Errors from plugin lookup.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin {0} not found")]
    NotFound(String),

    #[error("failed to load plugin: {0}")]
    Load(String),
}

/// A driver implementation paired with its declared capability, as produced
/// by registration or by a successful plugin load.
#[derive(Clone)]
pub struct RegisteredDriver {
    pub driver: Arc<dyn NetworkDriver>,
    pub capability: Capability,
}

/// Lookup handle for out-of-process driver plugins.
///
/// Called only for network drivers, only on a registry cache miss. The
/// returned driver is recorded in the registry before lookup is retried.
pub trait PluginGetter: Send + Sync {
    fn get(&self, name: &str, endpoint_type: &str) -> Result<RegisteredDriver, PluginError>;
}
