//! Port allocator for service-published endpoints.
//!
//! Each L4 protocol has its own port space. Ports published in ingress mode
//! are real cluster-wide reservations; host-mode ports are host-local and
//! pass through into the endpoint without claiming cluster state. Dynamic
//! assignments come from a dedicated high range.

use std::collections::{BTreeMap, HashMap, HashSet};

use thiserror::Error;

use crate::model::{Endpoint, PortConfig, PortProtocol, PublishMode, Service};

/// First port of the dynamically assigned range.
pub const DYNAMIC_PORT_START: u32 = 30000;

/// Last port of the dynamically assigned range.
pub const DYNAMIC_PORT_END: u32 = 32767;

/// Errors from port reservation.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("port {port}/{proto} is already in use", proto = .protocol.as_str())]
    PortUnavailable { port: u32, protocol: PortProtocol },

    #[error("no {proto} ports available in the dynamic range", proto = .protocol.as_str())]
    DynamicPortsExhausted { protocol: PortProtocol },
}

/// Claimed ports for one protocol.
#[derive(Default)]
struct PortSpace {
    claimed: HashSet<u32>,
    next_dynamic: u32,
}

impl PortSpace {
    fn new() -> Self {
        Self {
            claimed: HashSet::new(),
            next_dynamic: DYNAMIC_PORT_START,
        }
    }

    /// Reserve the requested port, or assign one from the dynamic range when
    /// the config leaves the published port open.
    fn allocate(&mut self, state: &mut PortConfig) -> Result<(), PortError> {
        if state.published_port != 0 {
            if !self.claimed.insert(state.published_port) {
                return Err(PortError::PortUnavailable {
                    port: state.published_port,
                    protocol: state.protocol,
                });
            }
            return Ok(());
        }

        let range = DYNAMIC_PORT_END - DYNAMIC_PORT_START + 1;
        for _ in 0..range {
            let candidate = self.next_dynamic;
            self.next_dynamic = if candidate >= DYNAMIC_PORT_END {
                DYNAMIC_PORT_START
            } else {
                candidate + 1
            };
            if self.claimed.insert(candidate) {
                state.published_port = candidate;
                return Ok(());
            }
        }

        Err(PortError::DynamicPortsExhausted {
            protocol: state.protocol,
        })
    }

    fn free(&mut self, state: &PortConfig) {
        self.claimed.remove(&state.published_port);
    }
}

/// Identity of a port config, ignoring the published assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PortKey {
    name: String,
    protocol: PortProtocol,
    target_port: u32,
}

impl PortKey {
    fn of(port: &PortConfig) -> Self {
        Self {
            name: port.name.clone(),
            protocol: port.protocol,
            target_port: port.target_port,
        }
    }
}

/// Port states indexed by config identity, then by published port.
#[derive(Default)]
struct AllocatedPorts(HashMap<PortKey, BTreeMap<u32, PortConfig>>);

impl AllocatedPorts {
    fn add(&mut self, state: &PortConfig) {
        self.0
            .entry(PortKey::of(state))
            .or_default()
            .insert(state.published_port, state.clone());
    }

    /// Take the state matching `config`: exact published port when the
    /// config pins one, otherwise any state under the same identity.
    fn take(&mut self, config: &PortConfig) -> Option<PortConfig> {
        let key = PortKey::of(config);
        let states = self.0.get_mut(&key)?;

        let taken = if config.published_port != 0 {
            states.remove(&config.published_port)
        } else {
            let port = *states.keys().next()?;
            states.remove(&port)
        };

        if states.is_empty() {
            self.0.remove(&key);
        }
        taken
    }

    fn drain(self) -> impl Iterator<Item = PortConfig> {
        self.0.into_values().flat_map(BTreeMap::into_values)
    }
}

/// Assigns and releases published L4 ports for services.
pub struct PortAllocator {
    spaces: HashMap<PortProtocol, PortSpace>,
}

impl PortAllocator {
    pub fn new() -> Self {
        let mut spaces = HashMap::new();
        for protocol in [PortProtocol::Tcp, PortProtocol::Udp, PortProtocol::Sctp] {
            spaces.insert(protocol, PortSpace::new());
        }
        Self { spaces }
    }

    fn space(&mut self, protocol: PortProtocol) -> &mut PortSpace {
        self.spaces.entry(protocol).or_insert_with(PortSpace::new)
    }

    /// Assign a port state for every port in the service's endpoint spec and
    /// install it on the live endpoint.
    ///
    /// Prior ingress states matching a spec port are reused so reapplying an
    /// unchanged service keeps its assignments; leftover prior states are
    /// released. On failure every port newly reserved by this call is
    /// released before the error is returned.
    pub fn service_allocate_ports(&mut self, service: &mut Service) -> Result<(), PortError> {
        let Some(spec) = service.spec.endpoint.clone() else {
            return Ok(());
        };

        let mut prior = AllocatedPorts::default();
        if let Some(endpoint) = &service.endpoint {
            for state in &endpoint.ports {
                if state.publish_mode == PublishMode::Ingress {
                    prior.add(state);
                }
            }
        }

        let mut allocated = Vec::with_capacity(spec.ports.len());
        let mut reserved_here: Vec<PortConfig> = Vec::new();

        for config in &spec.ports {
            let mut state = config.clone();
            if config.publish_mode == PublishMode::Ingress {
                if let Some(prev) = prior.take(config) {
                    state = prev;
                } else {
                    if let Err(e) = self.space(config.protocol).allocate(&mut state) {
                        for p in &reserved_here {
                            self.space(p.protocol).free(p);
                        }
                        return Err(e);
                    }
                    reserved_here.push(state.clone());
                }
            }
            allocated.push(state);
        }

        // Prior ingress reservations no longer referenced by the spec.
        for state in prior.drain() {
            self.space(state.protocol).free(&state);
        }

        let endpoint = service.endpoint.get_or_insert_with(Endpoint::default);
        endpoint.ports = allocated;
        Ok(())
    }

    /// Release every ingress port reservation on the live endpoint and clear
    /// its port list.
    pub fn service_deallocate_ports(&mut self, service: &mut Service) {
        let Some(endpoint) = service.endpoint.as_mut() else {
            return;
        };
        for state in &endpoint.ports {
            if state.publish_mode == PublishMode::Ingress {
                self.spaces
                    .entry(state.protocol)
                    .or_insert_with(PortSpace::new)
                    .free(state);
            }
        }
        endpoint.ports.clear();
    }

    /// True iff the set of host-mode published ports in the spec differs
    /// from the live endpoint. Only ports with an explicit published port
    /// participate.
    pub fn host_publish_ports_need_update(&self, service: &Service) -> bool {
        if service.endpoint.is_none() && service.spec.endpoint.is_none() {
            return false;
        }

        let mut states = AllocatedPorts::default();
        if let Some(endpoint) = &service.endpoint {
            for state in &endpoint.ports {
                if state.publish_mode == PublishMode::Host && state.published_port != 0 {
                    states.add(state);
                }
            }
        }

        if let Some(spec) = &service.spec.endpoint {
            for config in &spec.ports {
                if config.publish_mode == PublishMode::Host && config.published_port != 0 {
                    if states.take(config).is_none() {
                        return true;
                    }
                }
            }
        }

        false
    }

    /// True iff the live endpoint's port list matches the spec.
    ///
    /// During allocator initialization (`on_init`) dynamically published
    /// ingress ports are not checked: the store already carries their
    /// previous assignment and the claim is rebuilt as-is.
    pub fn is_ports_allocated(&self, service: &Service, on_init: bool) -> bool {
        let (endpoint, spec) = match (&service.endpoint, &service.spec.endpoint) {
            (None, None) => return true,
            (Some(endpoint), Some(spec)) => (endpoint, spec),
            _ => return false,
        };

        if spec.ports.len() != endpoint.ports.len() {
            return false;
        }

        let mut states = AllocatedPorts::default();
        let mut host_target_ports = HashSet::new();
        for state in &endpoint.ports {
            match state.publish_mode {
                PublishMode::Ingress => states.add(state),
                PublishMode::Host => {
                    host_target_ports.insert(state.target_port);
                }
            }
        }

        // Pinned ingress ports need a state with the same assignment.
        for config in &spec.ports {
            if config.publish_mode == PublishMode::Ingress && config.published_port != 0 {
                if states.take(config).is_none() {
                    return false;
                }
            }
        }

        for config in &spec.ports {
            match config.publish_mode {
                PublishMode::Ingress if config.published_port == 0 => {
                    if on_init {
                        continue;
                    }
                    if states.take(config).is_none() {
                        return false;
                    }
                }
                PublishMode::Host => {
                    if !host_target_ports.contains(&config.target_port) {
                        return false;
                    }
                }
                _ => {}
            }
        }

        true
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EndpointSpec, ResolutionMode, ServiceSpec};

    fn service_with_ports(ports: Vec<PortConfig>) -> Service {
        Service {
            id: "svc1".to_string(),
            spec: ServiceSpec {
                endpoint: Some(EndpointSpec {
                    mode: ResolutionMode::VirtualIp,
                    ports,
                }),
                ..ServiceSpec::default()
            },
            endpoint: None,
        }
    }

    fn ingress_port(published: u32) -> PortConfig {
        PortConfig {
            name: "web".to_string(),
            protocol: PortProtocol::Tcp,
            target_port: 8080,
            published_port: published,
            publish_mode: PublishMode::Ingress,
        }
    }

    fn host_port(published: u32) -> PortConfig {
        PortConfig {
            name: "metrics".to_string(),
            protocol: PortProtocol::Tcp,
            target_port: 9090,
            published_port: published,
            publish_mode: PublishMode::Host,
        }
    }

    #[test]
    fn dynamic_assignment_draws_from_range() {
        let mut pa = PortAllocator::new();
        let mut service = service_with_ports(vec![ingress_port(0)]);

        pa.service_allocate_ports(&mut service).unwrap();

        let assigned = service.endpoint.as_ref().unwrap().ports[0].published_port;
        assert!((DYNAMIC_PORT_START..=DYNAMIC_PORT_END).contains(&assigned));
    }

    #[test]
    fn requested_port_is_honored_or_conflicts() {
        let mut pa = PortAllocator::new();
        let mut first = service_with_ports(vec![ingress_port(8443)]);
        pa.service_allocate_ports(&mut first).unwrap();
        assert_eq!(first.endpoint.as_ref().unwrap().ports[0].published_port, 8443);

        let mut second = service_with_ports(vec![ingress_port(8443)]);
        second.id = "svc2".to_string();
        let err = pa.service_allocate_ports(&mut second).unwrap_err();
        assert!(matches!(err, PortError::PortUnavailable { port: 8443, .. }));
    }

    #[test]
    fn reapply_keeps_dynamic_assignment() {
        let mut pa = PortAllocator::new();
        let mut service = service_with_ports(vec![ingress_port(0)]);

        pa.service_allocate_ports(&mut service).unwrap();
        let first = service.endpoint.as_ref().unwrap().ports[0].published_port;

        pa.service_allocate_ports(&mut service).unwrap();
        let second = service.endpoint.as_ref().unwrap().ports[0].published_port;
        assert_eq!(first, second);
    }

    #[test]
    fn dropped_spec_port_is_released() {
        let mut pa = PortAllocator::new();
        let mut service = service_with_ports(vec![ingress_port(8443)]);
        pa.service_allocate_ports(&mut service).unwrap();

        // Spec no longer publishes the port; the claim must be released.
        service.spec.endpoint.as_mut().unwrap().ports.clear();
        pa.service_allocate_ports(&mut service).unwrap();
        assert!(service.endpoint.as_ref().unwrap().ports.is_empty());

        let mut other = service_with_ports(vec![ingress_port(8443)]);
        other.id = "svc2".to_string();
        pa.service_allocate_ports(&mut other).unwrap();
    }

    #[test]
    fn failed_allocation_rolls_back_earlier_ports() {
        let mut pa = PortAllocator::new();
        let mut holder = service_with_ports(vec![ingress_port(8443)]);
        pa.service_allocate_ports(&mut holder).unwrap();

        let mut conflicted = service_with_ports(vec![
            PortConfig {
                name: "a".to_string(),
                target_port: 1000,
                published_port: 9000,
                ..ingress_port(0)
            },
            ingress_port(8443),
        ]);
        conflicted.id = "svc2".to_string();
        assert!(pa.service_allocate_ports(&mut conflicted).is_err());

        // 9000 must have been rolled back.
        let mut retry = service_with_ports(vec![PortConfig {
            name: "b".to_string(),
            target_port: 1000,
            published_port: 9000,
            ..ingress_port(0)
        }]);
        retry.id = "svc3".to_string();
        pa.service_allocate_ports(&mut retry).unwrap();
    }

    #[test]
    fn host_ports_pass_through_without_claims() {
        let mut pa = PortAllocator::new();
        let mut service = service_with_ports(vec![host_port(9090)]);
        pa.service_allocate_ports(&mut service).unwrap();
        assert_eq!(service.endpoint.as_ref().unwrap().ports[0].published_port, 9090);

        // The same host port on another service does not conflict.
        let mut other = service_with_ports(vec![host_port(9090)]);
        other.id = "svc2".to_string();
        pa.service_allocate_ports(&mut other).unwrap();
    }

    #[test]
    fn host_publish_ports_need_update_detects_changes() {
        let mut pa = PortAllocator::new();
        let mut service = service_with_ports(vec![host_port(9090)]);
        pa.service_allocate_ports(&mut service).unwrap();
        assert!(!pa.host_publish_ports_need_update(&service));

        service
            .spec
            .endpoint
            .as_mut()
            .unwrap()
            .ports
            .push(PortConfig {
                name: "debug".to_string(),
                target_port: 6060,
                published_port: 6060,
                ..host_port(0)
            });
        assert!(pa.host_publish_ports_need_update(&service));
    }

    #[test]
    fn ports_allocated_checks() {
        let mut pa = PortAllocator::new();
        let mut service = service_with_ports(vec![ingress_port(0), host_port(9090)]);
        assert!(!pa.is_ports_allocated(&service, false));

        pa.service_allocate_ports(&mut service).unwrap();
        assert!(pa.is_ports_allocated(&service, false));
        assert!(pa.is_ports_allocated(&service, true));

        // Pinning the published port invalidates the old state.
        service.spec.endpoint.as_mut().unwrap().ports[0].published_port = 8443;
        assert!(!pa.is_ports_allocated(&service, false));
    }

    #[test]
    fn deallocate_clears_and_releases() {
        let mut pa = PortAllocator::new();
        let mut service = service_with_ports(vec![ingress_port(8443)]);
        pa.service_allocate_ports(&mut service).unwrap();

        pa.service_deallocate_ports(&mut service);
        assert!(service.endpoint.as_ref().unwrap().ports.is_empty());

        let mut other = service_with_ports(vec![ingress_port(8443)]);
        other.id = "svc2".to_string();
        pa.service_allocate_ports(&mut other).unwrap();
    }
}
