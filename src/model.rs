//! Mirrors of the externally-owned cluster objects.
//!
//! These types are in-memory copies of store objects owned by the surrounding
//! reconciler. The allocator mutates their endpoint, IPAM, and driver-state
//! fields in place; it never mints identifiers and never persists anything.
//!
//! Addresses, subnets, and gateways are carried as strings in CIDR or bare-IP
//! form, matching the store representation. Parsing happens at the point of
//! use. An empty string means "unset".

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A driver reference: a name plus an opaque options map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

/// Address family of an IPAM config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

/// One IPAM pool configuration.
///
/// In a spec, any field may be empty to let the IPAM driver choose. After
/// network allocation the live copy has `subnet` and `gateway` backfilled
/// with the driver's choices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamConfig {
    pub family: AddressFamily,
    /// Pool subnet in CIDR form, e.g. `10.0.0.0/24`.
    #[serde(default)]
    pub subnet: String,
    /// Optional sub-range of the subnet to allocate addresses from.
    #[serde(default)]
    pub range: String,
    /// Gateway address for the subnet.
    #[serde(default)]
    pub gateway: String,
    /// Auxiliary reserved addresses, keyed by purpose.
    #[serde(default)]
    pub reserved: HashMap<String, String>,
}

/// IPAM driver selection and pool configurations for a network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamOptions {
    pub driver: Option<Driver>,
    #[serde(default)]
    pub configs: Vec<IpamConfig>,
}

/// Desired state of a network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Network driver selection. `None` selects the default driver.
    pub driver_config: Option<Driver>,
    pub ipam: Option<IpamOptions>,
    /// Marks the cluster's ingress network, which carries ingress-published
    /// service traffic.
    #[serde(default)]
    pub ingress: bool,
}

/// A network object: spec plus live allocation state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub spec: NetworkSpec,
    /// Driver name and opaque driver-allocated options, written by the
    /// allocator.
    pub driver_state: Option<Driver>,
    /// Resolved IPAM driver and pool configs, written by the allocator.
    pub ipam: Option<IpamOptions>,
}

/// How clients reach a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionMode {
    /// A single load-balanced virtual IP per attached network.
    #[default]
    VirtualIp,
    /// DNS round-robin over per-task addresses; no VIPs are allocated.
    DnsRoundRobin,
}

/// L4 protocol of a published port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortProtocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl PortProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

/// How a port is published outside the cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublishMode {
    /// Published on the routing mesh through the ingress network.
    #[default]
    Ingress,
    /// Published directly on the host where the task runs.
    Host,
}

/// A single published port, both as configured and as allocated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default)]
    pub name: String,
    pub protocol: PortProtocol,
    /// Port the task listens on.
    pub target_port: u32,
    /// Externally published port. Zero in a spec requests a dynamically
    /// assigned port; the allocated copy carries the assignment.
    #[serde(default)]
    pub published_port: u32,
    pub publish_mode: PublishMode,
}

/// Desired endpoint properties of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub mode: ResolutionMode,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

/// A virtual IP allocated to a service on one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualIp {
    pub network_id: String,
    /// Allocated address in CIDR form. Empty until allocated.
    #[serde(default)]
    pub addr: String,
}

/// Live endpoint state of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    /// Copy of the endpoint spec the allocation was made against.
    pub spec: Option<EndpointSpec>,
    /// Allocated port states, one per spec port.
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub virtual_ips: Vec<VirtualIp>,
}

/// A requested attachment of a service or task to a network.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAttachmentConfig {
    /// ID of the target network.
    pub target: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// User-requested addresses, CIDR or bare IP.
    #[serde(default)]
    pub addresses: Vec<String>,
}

/// Desired state of a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub endpoint: Option<EndpointSpec>,
    /// Service-level network attachments.
    #[serde(default)]
    pub networks: Vec<NetworkAttachmentConfig>,
    /// Task-level network attachments; take precedence over the
    /// service-level ones when non-empty.
    #[serde(default)]
    pub task_networks: Vec<NetworkAttachmentConfig>,
}

/// A service object: spec plus live endpoint state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub spec: ServiceSpec,
    pub endpoint: Option<Endpoint>,
}

/// A live network-to-object binding carrying assigned addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Mirror of the attached network object.
    pub network: Network,
    /// Assigned addresses in CIDR form.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A task object with its ordered network attachments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
}

/// A node object with its single manager-managed attachment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub attachment: Option<NetworkAttachment>,
}

/// Minimum data needed to create a predefined node-local network object in
/// the store, corresponding to the networks that exist on every host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredefinedNetworkData {
    pub name: String,
    pub driver: String,
}
