//! Service allocation: virtual IPs and published ports, reconciled against
//! the service spec.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use crate::driver::IpamError;
use crate::error::Error;
use crate::model::{
    Endpoint, NetworkAttachmentConfig, ResolutionMode, Service, VirtualIp,
};
use crate::Result;

use super::network::set_serial_alloc;
use super::{is_ingress_network_needed, NetworkAllocator, ServiceAllocationOpts};

impl NetworkAllocator {
    /// Allocate the network resources a service needs: published ports first,
    /// then the VIP set reconciled against the spec's networks.
    ///
    /// Any failure after the ports were assigned deallocates the service
    /// completely before returning, so a failed call leaves nothing behind.
    pub fn service_allocate(&mut self, service: &mut Service) -> Result<()> {
        self.port_allocator.service_allocate_ports(service)?;

        if let Err(e) = self.service_allocate_vips(service) {
            if let Err(cleanup_err) = self.service_deallocate(service) {
                warn!(
                    service_id = %service.id,
                    error = %cleanup_err,
                    "cleanup failed after service allocation error"
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn service_allocate_vips(&mut self, service: &mut Service) -> Result<()> {
        {
            let endpoint = service.endpoint.get_or_insert_with(Endpoint::default);
            endpoint.spec = service.spec.endpoint.clone();
        }

        // DNSRR services get no VIPs; free any left from a previous state.
        let mode = service.spec.endpoint.as_ref().map(|e| e.mode);
        if mode == Some(ResolutionMode::DnsRoundRobin) {
            let vips = service
                .endpoint
                .as_ref()
                .map(|e| e.virtual_ips.clone())
                .unwrap_or_default();
            for vip in &vips {
                // Deallocate as many as possible.
                if let Err(e) = self.deallocate_vip(vip) {
                    error!(
                        network_id = %vip.network_id,
                        addr = %vip.addr,
                        error = %e,
                        "error deallocating vip"
                    );
                }
            }
            if let Some(endpoint) = service.endpoint.as_mut() {
                endpoint.virtual_ips.clear();
            }
            self.services.remove(&service.id);
            return Ok(());
        }

        let spec_networks: Vec<NetworkAttachmentConfig> = service_networks(service).to_vec();

        let current: Vec<VirtualIp> = service
            .endpoint
            .as_ref()
            .map(|e| e.virtual_ips.clone())
            .unwrap_or_default();
        let mut kept: Vec<VirtualIp> = Vec::new();

        // Reconcile the existing VIPs: keep the ingress VIP while the
        // service still needs ingress, keep VIPs whose network is still in
        // the spec, drop the rest.
        'vip_loop: for mut vip in current {
            if self.is_vip_on_ingress_network(&vip) && is_ingress_network_needed(service) {
                self.allocate_vip(&mut vip)?;
                kept.push(vip);
                continue 'vip_loop;
            }
            for attachment in &spec_networks {
                if attachment.target == vip.network_id {
                    self.allocate_vip(&mut vip)?;
                    kept.push(vip);
                    continue 'vip_loop;
                }
            }
            let _ = self.deallocate_vip(&vip);
        }

        // Add VIPs for the networks that do not have one yet.
        'network_loop: for attachment in &spec_networks {
            for vip in &kept {
                if vip.network_id == attachment.target {
                    continue 'network_loop;
                }
            }

            let mut vip = VirtualIp {
                network_id: attachment.target.clone(),
                addr: String::new(),
            };
            self.allocate_vip(&mut vip)?;
            kept.push(vip);
        }

        if kept.is_empty() {
            self.services.remove(&service.id);
        } else {
            self.services.insert(service.id.clone());
        }

        if let Some(endpoint) = service.endpoint.as_mut() {
            endpoint.virtual_ips = kept;
        }
        debug!(service_id = %service.id, "allocated service");
        Ok(())
    }

    /// Release every VIP and port of the service, best-effort, and drop it
    /// from the index.
    pub fn service_deallocate(&mut self, service: &mut Service) -> Result<()> {
        if service.endpoint.is_none() {
            return Ok(());
        }

        let vips = service
            .endpoint
            .as_ref()
            .map(|e| e.virtual_ips.clone())
            .unwrap_or_default();
        for vip in &vips {
            // Deallocate as many as possible.
            if let Err(e) = self.deallocate_vip(vip) {
                error!(
                    network_id = %vip.network_id,
                    addr = %vip.addr,
                    error = %e,
                    "error deallocating vip"
                );
            }
        }
        if let Some(endpoint) = service.endpoint.as_mut() {
            endpoint.virtual_ips.clear();
        }

        self.port_allocator.service_deallocate_ports(service);
        self.services.remove(&service.id);
        Ok(())
    }

    /// Whether the service's network resources need to be allocated or
    /// updated.
    pub fn service_needs_allocation(
        &self,
        service: &Service,
        opts: ServiceAllocationOpts,
    ) -> bool {
        let spec_networks = service_networks(service);
        let mode = service.spec.endpoint.as_ref().map(|e| e.mode);

        // A VIP-mode service with networks attached needs allocation when it
        // is not in the index or when some spec network has no VIP yet.
        if !spec_networks.is_empty() && mode.map_or(true, |m| m == ResolutionMode::VirtualIp) {
            if !self.services.contains(&service.id) {
                return true;
            }

            match &service.endpoint {
                None => return true,
                Some(endpoint) if endpoint.virtual_ips.is_empty() => return true,
                Some(endpoint) => {
                    'network_loop: for attachment in spec_networks {
                        for vip in &endpoint.virtual_ips {
                            if vip.network_id == attachment.target {
                                continue 'network_loop;
                            }
                        }
                        return true;
                    }
                }
            }
        }

        // A VIP whose network left the spec must be released, unless it is
        // the ingress VIP of a service that still needs ingress.
        if let Some(endpoint) = &service.endpoint {
            'vip_loop: for vip in &endpoint.virtual_ips {
                if self.is_vip_on_ingress_network(vip) && is_ingress_network_needed(service) {
                    continue 'vip_loop;
                }
                for attachment in spec_networks {
                    if vip.network_id == attachment.target {
                        continue 'vip_loop;
                    }
                }
                return true;
            }
        }

        // A DNSRR service still in the VIP index needs a pass to free its
        // resources.
        if mode == Some(ResolutionMode::DnsRoundRobin) && self.services.contains(&service.id) {
            return true;
        }

        let spec_has_ports = service
            .spec
            .endpoint
            .as_ref()
            .map_or(false, |e| !e.ports.is_empty());
        let live_has_ports = service
            .endpoint
            .as_ref()
            .map_or(false, |e| !e.ports.is_empty());
        if spec_has_ports || live_has_ports {
            return !self.port_allocator.is_ports_allocated(service, opts.on_init);
        }

        false
    }

    /// Allocate a virtual IP on its network. Idempotent: a VIP whose address
    /// is already recorded is left untouched.
    pub(crate) fn allocate_vip(&mut self, vip: &mut VirtualIp) -> Result<()> {
        let Some(state) = self.networks.get(&vip.network_id) else {
            return Err(Error::NoNetworkState(vip.network_id.clone()));
        };

        if state.is_node_local {
            return Ok(());
        }

        if state.endpoints.contains_key(&vip.addr) {
            return Ok(());
        }

        let (ipam, _, _) = self.resolve_ipam(&state.network)?;

        let preferred = if vip.addr.is_empty() {
            None
        } else {
            Some(
                vip.addr
                    .parse::<ipnetwork::IpNetwork>()
                    .map_err(|_| Error::InvalidAddress(vip.addr.clone()))?
                    .ip(),
            )
        };

        let mut options = HashMap::new();
        if let Some(driver) = state.network.ipam.as_ref().and_then(|i| i.driver.as_ref()) {
            options = driver.options.clone();
            set_serial_alloc(&mut options);
        }

        let pools: Vec<String> = state.pools.values().cloned().collect();
        let network_id = vip.network_id.clone();

        for pool_id in pools {
            match ipam.request_address(&pool_id, preferred, &options) {
                Err(IpamError::NoAvailableIps) | Err(IpamError::IpOutOfRange) => continue,
                Err(e) => return Err(Error::AddressRequest(e)),
                Ok(assigned) => {
                    let addr = assigned.to_string();
                    if let Some(state) = self.networks.get_mut(&network_id) {
                        state.endpoints.insert(addr.clone(), pool_id);
                    }
                    vip.addr = addr;
                    return Ok(());
                }
            }
        }

        Err(Error::NoAvailableIp)
    }

    /// Release a single virtual IP back to its pool.
    pub(crate) fn deallocate_vip(&mut self, vip: &VirtualIp) -> Result<()> {
        let Some(state) = self.networks.get(&vip.network_id) else {
            return Err(Error::NoNetworkState(vip.network_id.clone()));
        };

        if state.is_node_local {
            return Ok(());
        }

        let (ipam, _, _) = self.resolve_ipam(&state.network)?;

        let network_id = vip.network_id.clone();
        let pool_id = self
            .networks
            .get_mut(&network_id)
            .and_then(|state| state.endpoints.remove(&vip.addr));
        let Some(pool_id) = pool_id else {
            return Err(Error::AddressNotAllocated(vip.addr.clone()));
        };

        let ip = vip
            .addr
            .parse::<ipnetwork::IpNetwork>()
            .map_err(|_| Error::InvalidAddress(vip.addr.clone()))?
            .ip();

        ipam.release_address(&pool_id, ip)
            .map_err(|e| Error::AddressRelease {
                addr: vip.addr.clone(),
                source: e,
            })
    }
}

/// The networks a service's resources are reconciled against. Task-level
/// attachment configs take precedence over service-level ones.
fn service_networks(service: &Service) -> &[NetworkAttachmentConfig] {
    if service.spec.task_networks.is_empty() && !service.spec.networks.is_empty() {
        &service.spec.networks
    } else {
        &service.spec.task_networks
    }
}
