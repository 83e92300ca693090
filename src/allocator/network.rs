//! Network lifecycle: driver resolution, IPAM pool allocation, attachment
//! address allocation, and driver state.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{debug, warn};

use crate::driver::{
    Capability, DataScope, Ipam, IpamData, IpamError, NetworkDriver, ALLOC_SERIAL_PREFIX,
    GATEWAY, NETWORK_PLUGIN_ENDPOINT_TYPE, REQUEST_ADDRESS_TYPE,
};
use crate::error::Error;
use crate::model::{
    AddressFamily, Driver, IpamConfig, IpamOptions, Network, NetworkAttachment,
};
use crate::registry::DEFAULT_IPAM_DRIVER;
use crate::Result;

use super::{NetworkAllocator, NetworkState, DEFAULT_DRIVER};

/// A resolved network driver with its declared capability.
pub(crate) struct ResolvedDriver {
    pub(crate) driver: Arc<dyn NetworkDriver>,
    pub(crate) capability: Capability,
    pub(crate) name: String,
}

impl NetworkAllocator {
    /// Allocate all general and driver-specific resources the network spec
    /// asks for: IPAM pools and gateways, then driver state.
    ///
    /// For node-local networks no cluster-level resources exist; the driver
    /// state becomes a name-only marker and the IPAM field an empty-driver
    /// marker kept for consumers that require it to be present.
    pub fn allocate(&mut self, network: &mut Network) -> Result<()> {
        if self.networks.contains_key(&network.id) {
            return Err(Error::AlreadyAllocated(network.id.clone()));
        }

        let resolved = self.resolve_driver(network)?;
        let is_node_local = resolved.capability.data_scope == DataScope::Local;

        if is_node_local {
            network.driver_state = Some(Driver {
                name: resolved.name,
                options: HashMap::new(),
            });
            network.ipam = Some(IpamOptions {
                driver: Some(Driver::default()),
                configs: Vec::new(),
            });
            self.networks.insert(
                network.id.clone(),
                NetworkState {
                    network: network.clone(),
                    pools: BTreeMap::new(),
                    endpoints: BTreeMap::new(),
                    is_node_local: true,
                },
            );
            debug!(network_id = %network.id, "allocated node-local network");
            return Ok(());
        }

        let pools = self
            .allocate_pools(network)
            .map_err(|e| Error::PoolAllocation {
                network_id: network.id.clone(),
                source: Box::new(e),
            })?;

        if let Err(e) = self.allocate_driver_state(network) {
            if let Err(release_err) = self.free_pools(network, &pools) {
                warn!(
                    network_id = %network.id,
                    error = %release_err,
                    "failed to release pools while rolling back network allocation"
                );
            }
            return Err(Error::DriverAllocation {
                network_id: network.id.clone(),
                source: Box::new(e),
            });
        }

        self.networks.insert(
            network.id.clone(),
            NetworkState {
                network: network.clone(),
                pools,
                endpoints: BTreeMap::new(),
                is_node_local: false,
            },
        );
        debug!(network_id = %network.id, "allocated network");
        Ok(())
    }

    /// Free all resources assigned to the network. Driver state and pools
    /// are both attempted even if freeing the driver state fails; in that
    /// case the driver error is the one surfaced.
    pub fn deallocate(&mut self, network: &mut Network) -> Result<()> {
        let Some(state) = self.networks.get(&network.id) else {
            return Err(Error::NoNetworkState(network.id.clone()));
        };

        if state.is_node_local {
            self.networks.remove(&network.id);
            return Ok(());
        }

        let driver_result = self.free_driver_state(network);

        let pools = self
            .networks
            .remove(&network.id)
            .map(|state| state.pools)
            .unwrap_or_default();
        let pool_result = self.free_pools(network, &pools);

        debug!(network_id = %network.id, "deallocated network");
        match driver_result {
            Err(e) => Err(Error::DriverRelease {
                network_id: network.id.clone(),
                source: Box::new(e),
            }),
            Ok(()) => pool_result,
        }
    }

    /// Resolve the network driver named by the spec, falling back to the
    /// default driver and lazily loading a plugin on registry miss.
    pub(crate) fn resolve_driver(&self, network: &Network) -> Result<ResolvedDriver> {
        let name = match &network.spec.driver_config {
            Some(config) if !config.name.is_empty() => config.name.as_str(),
            _ => DEFAULT_DRIVER,
        };

        if let Some(registered) = self.registry.driver(name) {
            return Ok(ResolvedDriver {
                driver: registered.driver,
                capability: registered.capability,
                name: name.to_string(),
            });
        }

        self.load_driver(name)?;

        match self.registry.driver(name) {
            Some(registered) => Ok(ResolvedDriver {
                driver: registered.driver,
                capability: registered.capability,
                name: name.to_string(),
            }),
            None => Err(Error::DriverNotFound(name.to_string())),
        }
    }

    fn load_driver(&self, name: &str) -> Result<()> {
        let Some(getter) = self.registry.plugin_getter() else {
            return Err(Error::PluginStoreMissing);
        };
        let loaded = getter
            .get(name, NETWORK_PLUGIN_ENDPOINT_TYPE)
            .map_err(|e| Error::PluginLoad {
                name: name.to_string(),
                source: e,
            })?;
        self.registry.add_driver(name, loaded.driver, loaded.capability);
        Ok(())
    }

    /// Resolve the IPAM driver named by the spec together with its options.
    pub(crate) fn resolve_ipam(
        &self,
        network: &Network,
    ) -> Result<(Arc<dyn Ipam>, String, HashMap<String, String>)> {
        let (name, options) = match network.spec.ipam.as_ref().and_then(|i| i.driver.as_ref()) {
            Some(driver) if !driver.name.is_empty() => {
                (driver.name.clone(), driver.options.clone())
            }
            Some(driver) => (DEFAULT_IPAM_DRIVER.to_string(), driver.options.clone()),
            None => (DEFAULT_IPAM_DRIVER.to_string(), HashMap::new()),
        };

        let ipam = self
            .registry
            .ipam(&name)
            .ok_or_else(|| Error::IpamNotFound(name.clone()))?;
        Ok((ipam, name, options))
    }

    /// Allocate one IPAM pool per config, with a gateway address each.
    ///
    /// Live IPAM configs are authoritative over spec configs so that subnets
    /// survive restarts; with neither present a single synthetic IPv4 config
    /// lets the driver choose a subnet. On failure everything acquired by
    /// this call is released before the error is returned.
    pub(crate) fn allocate_pools(
        &mut self,
        network: &mut Network,
    ) -> Result<BTreeMap<String, String>> {
        let (ipam, driver_name, driver_options) = self.resolve_ipam(network)?;

        // User-defined address spaces are not supported; pools go into the
        // driver's default global space.
        let (_, address_space) = ipam.default_address_spaces();

        let mut configs: Vec<IpamConfig> = if let Some(state) = &network.ipam {
            state.configs.clone()
        } else if let Some(spec) = &network.spec.ipam {
            spec.configs.clone()
        } else {
            Vec::new()
        };

        if configs.is_empty() {
            configs.push(IpamConfig {
                family: AddressFamily::Ipv4,
                ..IpamConfig::default()
            });
        }

        let mut pools = BTreeMap::new();

        for i in 0..configs.len() {
            if let Err(e) = allocate_pool_config(
                ipam.as_ref(),
                &address_space,
                &driver_options,
                &mut configs[i],
                &mut pools,
            ) {
                release_pools(ipam.as_ref(), &configs[..i], &pools);
                network.ipam = Some(IpamOptions {
                    driver: Some(Driver {
                        name: driver_name,
                        options: driver_options,
                    }),
                    configs,
                });
                return Err(e);
            }
        }

        network.ipam = Some(IpamOptions {
            driver: Some(Driver {
                name: driver_name,
                options: driver_options,
            }),
            configs,
        });

        Ok(pools)
    }

    /// Release the network's pools and their gateway addresses, best-effort.
    /// Only a failure to resolve the IPAM driver is surfaced.
    pub(crate) fn free_pools(
        &mut self,
        network: &Network,
        pools: &BTreeMap<String, String>,
    ) -> Result<()> {
        let (ipam, _, _) = self.resolve_ipam(network)?;
        let configs = network
            .ipam
            .as_ref()
            .map(|i| i.configs.clone())
            .unwrap_or_default();
        release_pools(ipam.as_ref(), &configs, pools);
        Ok(())
    }

    /// Build the IPv4 IPAM data and hand the network to its driver for
    /// state allocation.
    pub(crate) fn allocate_driver_state(&mut self, network: &mut Network) -> Result<()> {
        let resolved = self.resolve_driver(network)?;

        // Merge spec options with any pre-existing operational state; the
        // state wins.
        let mut options = HashMap::new();
        if let Some(config) = &network.spec.driver_config {
            options.extend(config.options.clone());
        }
        if let Some(state) = &network.driver_state {
            options.extend(state.options.clone());
        }

        let mut ipv4_data = Vec::new();
        if let Some(ipam_state) = &network.ipam {
            for config in &ipam_state.configs {
                if config.family == AddressFamily::Ipv6 {
                    continue;
                }

                let subnet: IpNetwork = config
                    .subnet
                    .parse()
                    .map_err(|_| Error::InvalidSubnet(config.subnet.clone()))?;

                let gateway = config
                    .gateway
                    .parse::<IpAddr>()
                    .ok()
                    .and_then(|ip| IpNetwork::new(ip, subnet.prefix()).ok());

                ipv4_data.push(IpamData {
                    pool: subnet,
                    gateway,
                });
            }
        }

        let driver_options =
            resolved
                .driver
                .network_allocate(&network.id, &options, &ipv4_data, &[])?;

        network.driver_state = Some(Driver {
            name: resolved.name,
            options: driver_options,
        });
        Ok(())
    }

    pub(crate) fn free_driver_state(&mut self, network: &Network) -> Result<()> {
        let resolved = self.resolve_driver(network)?;
        resolved.driver.network_free(&network.id)?;
        Ok(())
    }

    /// Allocate an address for a task or node attachment from the network's
    /// pools.
    pub(crate) fn allocate_network_ips(
        &mut self,
        attachment: &mut NetworkAttachment,
    ) -> Result<()> {
        let (ipam, _, _) = self.resolve_ipam(&attachment.network)?;

        let network_id = attachment.network.id.clone();
        let Some(state) = self.networks.get(&network_id) else {
            return Err(Error::NoNetworkState(network_id));
        };

        let mut options = HashMap::new();
        if let Some(driver) = state.network.ipam.as_ref().and_then(|i| i.driver.as_ref()) {
            options = driver.options.clone();
            set_serial_alloc(&mut options);
        }

        let pools: Vec<String> = state.pools.values().cloned().collect();

        let mut addresses = if attachment.addresses.is_empty() {
            vec![String::new()]
        } else {
            attachment.addresses.clone()
        };

        for i in 0..addresses.len() {
            let preferred = parse_preferred(&addresses[i])?;

            for pool_id in &pools {
                match ipam.request_address(pool_id, preferred, &options) {
                    Err(IpamError::NoAvailableIps) | Err(IpamError::IpOutOfRange) => continue,
                    Err(e) => return Err(Error::AddressRequest(e)),
                    Ok(assigned) => {
                        let addr = assigned.to_string();
                        if let Some(state) = self.networks.get_mut(&network_id) {
                            state.endpoints.insert(addr.clone(), pool_id.clone());
                        }
                        addresses[i] = addr;
                        attachment.addresses = addresses;
                        // An attachment carries a single address; the first
                        // assignment completes the allocation.
                        return Ok(());
                    }
                }
            }
        }

        Err(Error::NoAvailableIp)
    }

    /// Release every address of every attachment, best-effort, and clear the
    /// attachments' address lists.
    pub(crate) fn release_endpoints(
        &mut self,
        attachments: &mut [NetworkAttachment],
    ) -> Result<()> {
        for attachment in attachments {
            let network_id = attachment.network.id.clone();
            let Some(state) = self.networks.get(&network_id) else {
                return Err(Error::NoNetworkState(network_id));
            };
            if state.is_node_local {
                continue;
            }

            let (ipam, _, _) = self.resolve_ipam(&attachment.network)?;

            // Keep going on individual failures and release as many
            // addresses as possible.
            for addr in &attachment.addresses {
                let pool_id = self
                    .networks
                    .get_mut(&network_id)
                    .and_then(|state| state.endpoints.remove(addr));
                let Some(pool_id) = pool_id else {
                    warn!(address = %addr, network_id = %network_id, "no pool recorded for address while releasing");
                    continue;
                };

                let ip = match addr.parse::<IpNetwork>() {
                    Ok(net) => net.ip(),
                    Err(_) => {
                        warn!(address = %addr, "could not parse address while releasing");
                        continue;
                    }
                };

                if let Err(e) = ipam.release_address(&pool_id, ip) {
                    warn!(error = %e, address = %addr, "IPAM failure while releasing address");
                }
            }

            attachment.addresses.clear();
        }

        Ok(())
    }
}

/// Request one pool plus gateway for a single IPAM config, backfilling the
/// config's empty subnet and gateway fields with the driver's choices.
fn allocate_pool_config(
    ipam: &dyn Ipam,
    address_space: &str,
    driver_options: &HashMap<String, String>,
    config: &mut IpamConfig,
    pools: &mut BTreeMap<String, String>,
) -> Result<()> {
    let pool = ipam
        .request_pool(
            address_space,
            &config.subnet,
            &config.range,
            driver_options,
            false,
        )
        .map_err(Error::PoolRequest)?;
    pools.insert(pool.pool.to_string(), pool.pool_id.clone());

    // The IPAM contract lets the driver provide a gateway in response to the
    // pool request. A gateway in the spec is allocated regardless, so the
    // driver learns which address the network is going to use.
    let mut gateway: Option<IpNetwork> = None;
    if let Some(value) = pool.meta.get(GATEWAY) {
        let parsed: IpNetwork = value
            .parse()
            .map_err(|_| Error::GatewayParse {
                value: value.clone(),
            })?;
        gateway = Some(parsed);
    }

    if !config.gateway.is_empty() || gateway.is_none() {
        let preferred = config.gateway.parse::<IpAddr>().ok();

        let mut gw_options = driver_options.clone();
        gw_options.insert(REQUEST_ADDRESS_TYPE.to_string(), GATEWAY.to_string());
        set_serial_alloc(&mut gw_options);

        let assigned = ipam
            .request_address(&pool.pool_id, preferred, &gw_options)
            .map_err(Error::GatewayRequest)?;
        gateway = Some(assigned);
    }

    if config.subnet.is_empty() {
        config.subnet = pool.pool.to_string();
    }
    if config.gateway.is_empty() {
        if let Some(gateway) = &gateway {
            config.gateway = gateway.ip().to_string();
        }
    }

    Ok(())
}

/// Best-effort release of gateway addresses and pools.
///
/// The gateway lookup is keyed by each config's subnet string; for a pool
/// whose subnet was driver-chosen and not yet backfilled the key misses, and
/// the sweep moves on.
fn release_pools(ipam: &dyn Ipam, configs: &[IpamConfig], pools: &BTreeMap<String, String>) {
    for config in configs {
        let Some(pool_id) = pools.get(&config.subnet) else {
            warn!(subnet = %config.subnet, "no pool found while releasing gateway address");
            continue;
        };
        let gateway = match config.gateway.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(
                    gateway = %config.gateway,
                    subnet = %config.subnet,
                    "could not parse gateway address while releasing"
                );
                continue;
            }
        };
        if let Err(e) = ipam.release_address(pool_id, gateway) {
            warn!(error = %e, subnet = %config.subnet, "failed to release gateway address");
        }
    }

    for (cidr, pool_id) in pools {
        if let Err(e) = ipam.release_pool(pool_id) {
            warn!(error = %e, pool = %cidr, "failed to release pool");
        }
    }
}

/// Parse a requested address, CIDR form first with a bare-IP fallback.
fn parse_preferred(raw: &str) -> Result<Option<IpAddr>> {
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(net) = raw.parse::<IpNetwork>() {
        return Ok(Some(net.ip()));
    }
    raw.parse::<IpAddr>()
        .map(Some)
        .map_err(|_| Error::InvalidAddress(raw.to_string()))
}

/// Ask the IPAM driver for serial allocation, which avoids quick reuse of
/// recently freed addresses.
pub(crate) fn set_serial_alloc(options: &mut HashMap<String, String>) {
    options
        .entry(ALLOC_SERIAL_PREFIX.to_string())
        .or_insert_with(|| "true".to_string());
}
