//! The allocation state machine spanning networks, services, tasks, and
//! nodes.
//!
//! [`NetworkAllocator`] owns the internal bookkeeping: one record per
//! allocated network (pool handles, endpoint addresses, node-local flag) and
//! index sets for services, tasks, and nodes whose allocation completed. The
//! caller presents externally-owned objects by mutable reference; allocation
//! writes assigned resources into them in place, deallocation reverses the
//! mutation.
//!
//! Not internally synchronized: the surrounding reconciliation loop is the
//! single exclusive user.

mod network;
mod service;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tracing::error;

use crate::driver::PluginGetter;
use crate::error::Error;
use crate::model::{Network, Node, PublishMode, Service, Task, VirtualIp};
use crate::ports::PortAllocator;
use crate::registry::DriverRegistry;
use crate::Result;

/// Name of the driver used when a network spec does not specify one.
pub const DEFAULT_DRIVER: &str = "overlay";

/// Label identifying internally allocated networks that correspond to the
/// predefined node-local networks on the host.
pub const PREDEFINED_LABEL: &str = "com.docker.swarm.predefined";

/// Legacy ingress detection: a network named `ingress` carrying this label.
const INTERNAL_NETWORK_LABEL: &str = "com.docker.swarm.internal";
const INGRESS_NETWORK_NAME: &str = "ingress";

/// Options for [`NetworkAllocator::service_needs_allocation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceAllocationOpts {
    /// Set during allocator initialization, when live state restored from
    /// the store is accepted as-is for dynamically published ports.
    pub on_init: bool,
}

/// Internal record for one allocated network.
pub(crate) struct NetworkState {
    /// Local mirror of the network object as of allocation.
    pub(crate) network: Network,
    /// Pool CIDR string → driver-assigned pool handle.
    pub(crate) pools: BTreeMap<String, String>,
    /// Allocated address string → handle of the pool it came from.
    pub(crate) endpoints: BTreeMap<String, String>,
    /// Whether the network's resources are scoped to a single node, in
    /// which case the manager allocates nothing.
    pub(crate) is_node_local: bool,
}

/// Controller for all network-level allocation: networks and their IPAM
/// pools, service VIPs and ports, task and node attachment addresses.
pub struct NetworkAllocator {
    pub(crate) registry: DriverRegistry,
    pub(crate) port_allocator: PortAllocator,
    pub(crate) networks: HashMap<String, NetworkState>,
    pub(crate) services: HashSet<String>,
    pub(crate) tasks: HashSet<String>,
    pub(crate) nodes: HashSet<String>,
}

impl NetworkAllocator {
    /// Create an allocator with the built-in drivers registered. External
    /// network drivers are looked up through `plugin_getter` on demand.
    pub fn new(plugin_getter: Option<Arc<dyn PluginGetter>>) -> Self {
        Self {
            registry: DriverRegistry::new(plugin_getter),
            port_allocator: PortAllocator::new(),
            networks: HashMap::new(),
            services: HashSet::new(),
            tasks: HashSet::new(),
            nodes: HashSet::new(),
        }
    }

    /// The driver registry backing this allocator. External IPAM drivers
    /// must be registered here before any network referencing them is
    /// allocated.
    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    /// Whether the network has been allocated.
    pub fn is_allocated(&self, network: &Network) -> bool {
        self.networks.contains_key(&network.id)
    }

    /// Whether the task has all of its network resources allocated.
    pub fn is_task_allocated(&self, task: &Task) -> bool {
        if !self.tasks.contains(&task.id) {
            return false;
        }
        if task.networks.is_empty() {
            return false;
        }

        for attachment in &task.networks {
            let Some(state) = self.networks.get(&attachment.network.id) else {
                return false;
            };
            // Nothing further to check for node-local networks.
            if state.is_node_local {
                continue;
            }
            let Some(first) = attachment.addresses.first() else {
                return false;
            };
            if !state.endpoints.contains_key(first) {
                return false;
            }
        }

        true
    }

    /// Whether the node has its attachment address allocated.
    pub fn is_node_allocated(&self, node: &Node) -> bool {
        if !self.nodes.contains(&node.id) {
            return false;
        }
        let Some(attachment) = &node.attachment else {
            return false;
        };
        let Some(state) = self.networks.get(&attachment.network.id) else {
            return false;
        };
        let Some(first) = attachment.addresses.first() else {
            return false;
        };
        state.endpoints.contains_key(first)
    }

    /// Whether the VIP lives on the ingress network.
    pub fn is_vip_on_ingress_network(&self, vip: &VirtualIp) -> bool {
        self.networks
            .get(&vip.network_id)
            .map_or(false, |state| is_ingress_network(&state.network))
    }

    /// True iff the service's host-mode published ports differ between spec
    /// and live endpoint.
    pub fn host_publish_ports_need_update(&self, service: &Service) -> bool {
        self.port_allocator.host_publish_ports_need_update(service)
    }

    /// Allocate addresses for every attachment of the task. On failure, the
    /// addresses assigned to earlier attachments in this call are released
    /// before the error is returned.
    pub fn allocate_task(&mut self, task: &mut Task) -> Result<()> {
        for i in 0..task.networks.len() {
            let network_id = task.networks[i].network.id.clone();
            if self
                .networks
                .get(&network_id)
                .map_or(false, |state| state.is_node_local)
            {
                continue;
            }

            if let Err(e) = self.allocate_network_ips(&mut task.networks[i]) {
                let (done, _) = task.networks.split_at_mut(i);
                if let Err(release_err) = self.release_endpoints(done) {
                    error!(
                        task_id = %task.id,
                        network_id = %network_id,
                        error = %release_err,
                        "failed to release addresses while rolling back task allocation"
                    );
                }
                return Err(Error::TaskAllocation {
                    task_id: task.id.clone(),
                    network_id,
                    source: Box::new(e),
                });
            }
        }

        self.tasks.insert(task.id.clone());
        Ok(())
    }

    /// Release all endpoint resources of the task.
    pub fn deallocate_task(&mut self, task: &mut Task) -> Result<()> {
        self.tasks.remove(&task.id);
        self.release_endpoints(&mut task.networks)
    }

    /// Allocate the address for the network the node is attached to.
    pub fn allocate_node(&mut self, node: &mut Node) -> Result<()> {
        if let Some(attachment) = node.attachment.as_mut() {
            self.allocate_network_ips(attachment)?;
        }
        self.nodes.insert(node.id.clone());
        Ok(())
    }

    /// Release the node's attachment address.
    pub fn deallocate_node(&mut self, node: &mut Node) -> Result<()> {
        self.nodes.remove(&node.id);
        match node.attachment.as_mut() {
            Some(attachment) => self.release_endpoints(std::slice::from_mut(attachment)),
            None => Ok(()),
        }
    }
}

/// Whether the network is the cluster's ingress network, either by its
/// ingress flag or by the legacy name-plus-label convention.
pub fn is_ingress_network(network: &Network) -> bool {
    if network.spec.ingress {
        return true;
    }
    network.spec.name == INGRESS_NETWORK_NAME
        && network.spec.labels.contains_key(INTERNAL_NETWORK_LABEL)
}

/// Whether the service publishes any port through the routing mesh and thus
/// requires attachment to the ingress network.
pub fn is_ingress_network_needed(service: &Service) -> bool {
    service
        .spec
        .endpoint
        .as_ref()
        .map_or(false, |endpoint| {
            endpoint
                .ports
                .iter()
                .any(|port| port.publish_mode == PublishMode::Ingress)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointSpec, NetworkSpec, PortConfig, ServiceSpec};

    fn network_named(name: &str, ingress: bool, labels: &[(&str, &str)]) -> Network {
        Network {
            id: "net1".to_string(),
            spec: NetworkSpec {
                name: name.to_string(),
                ingress,
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..NetworkSpec::default()
            },
            ..Network::default()
        }
    }

    #[test]
    fn ingress_network_detection() {
        assert!(is_ingress_network(&network_named("any", true, &[])));
        assert!(is_ingress_network(&network_named(
            "ingress",
            false,
            &[("com.docker.swarm.internal", "")],
        )));
        assert!(!is_ingress_network(&network_named("ingress", false, &[])));
        assert!(!is_ingress_network(&network_named(
            "backend",
            false,
            &[("com.docker.swarm.internal", "")],
        )));
    }

    #[test]
    fn ingress_needed_follows_publish_mode() {
        let mut service = Service {
            id: "svc1".to_string(),
            spec: ServiceSpec {
                endpoint: Some(EndpointSpec {
                    ports: vec![PortConfig {
                        target_port: 80,
                        publish_mode: PublishMode::Host,
                        ..PortConfig::default()
                    }],
                    ..EndpointSpec::default()
                }),
                ..ServiceSpec::default()
            },
            endpoint: None,
        };
        assert!(!is_ingress_network_needed(&service));

        service
            .spec
            .endpoint
            .as_mut()
            .unwrap()
            .ports
            .push(PortConfig {
                target_port: 443,
                publish_mode: PublishMode::Ingress,
                ..PortConfig::default()
            });
        assert!(is_ingress_network_needed(&service));
    }
}
