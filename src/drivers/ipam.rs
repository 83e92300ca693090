//! Built-in default IPAM driver.
//!
//! Pools are claimed subnets within a named address space; the pool handle is
//! `"<address-space>/<subnet>"`. Address allocation is offset-based within
//! the subnet: first-fit by default, or monotonically advancing when the
//! request carries the serial option. A fresh pool hands out the first host
//! address, so a `10.0.0.0/24` pool yields `10.0.0.1` for its gateway.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use ipnetwork::IpNetwork;

use crate::driver::{Ipam, IpamError, PoolAllocation, ALLOC_SERIAL_PREFIX};

/// Default address space for node-local pools.
pub const LOCAL_ADDRESS_SPACE: &str = "LocalDefault";

/// Default address space for cluster-wide pools.
pub const GLOBAL_ADDRESS_SPACE: &str = "GlobalDefault";

/// Base network that automatic subnet selection carves /24s out of.
const AUTO_BASE: u32 = 0x0A00_0000; // 10.0.0.0
const AUTO_SUBNET_COUNT: u32 = 1 << 16;
const AUTO_PREFIX: u8 = 24;

struct Pool {
    subnet: IpNetwork,
    /// Optional sub-range address allocation is restricted to.
    range: Option<IpNetwork>,
    /// Allocated offsets from the subnet's network address.
    allocated: BTreeSet<u128>,
    /// Next offset to try in serial mode.
    cursor: u128,
}

impl Pool {
    /// Inclusive window of allocatable host offsets. Network and broadcast
    /// addresses are excluded for IPv4 subnets that have them; IPv6 excludes
    /// only the zero (subnet-router) address.
    fn host_window(&self) -> (u128, u128) {
        let cap = capacity(&self.subnet);
        match self.subnet {
            IpNetwork::V4(_) if cap > 2 => (1, cap - 2),
            IpNetwork::V6(_) if cap > 1 => (1, cap - 1),
            _ => (0, cap - 1),
        }
    }

    /// Host window intersected with the configured sub-range.
    fn alloc_window(&self) -> Option<(u128, u128)> {
        let (mut lo, mut hi) = self.host_window();
        if let Some(range) = &self.range {
            let base = addr_bits(&self.subnet.network());
            let range_lo = addr_bits(&range.network()).saturating_sub(base);
            let range_hi = range_lo + capacity(range) - 1;
            lo = lo.max(range_lo);
            hi = hi.min(range_hi);
        }
        (lo <= hi).then_some((lo, hi))
    }
}

#[derive(Default)]
struct State {
    pools: HashMap<String, Pool>,
}

/// The built-in IPAM driver.
pub struct DefaultIpam {
    state: Mutex<State>,
}

impl DefaultIpam {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Pick the first /24 under 10.0.0.0/8 not yet claimed in
    /// `address_space`.
    fn select_free_subnet(
        &self,
        pools: &HashMap<String, Pool>,
        address_space: &str,
    ) -> Result<IpNetwork, IpamError> {
        for n in 0..AUTO_SUBNET_COUNT {
            let base = Ipv4Addr::from(AUTO_BASE | (n << 8));
            let subnet = IpNetwork::new(IpAddr::V4(base), AUTO_PREFIX)
                .map_err(|e| IpamError::InvalidRequest(e.to_string()))?;
            if !pools.contains_key(&pool_key(address_space, &subnet)) {
                return Ok(subnet);
            }
        }
        Err(IpamError::NoAvailablePool)
    }
}

impl Default for DefaultIpam {
    fn default() -> Self {
        Self::new()
    }
}

impl Ipam for DefaultIpam {
    fn default_address_spaces(&self) -> (String, String) {
        (
            LOCAL_ADDRESS_SPACE.to_string(),
            GLOBAL_ADDRESS_SPACE.to_string(),
        )
    }

    fn request_pool(
        &self,
        address_space: &str,
        subnet: &str,
        sub_pool: &str,
        _options: &HashMap<String, String>,
        v6: bool,
    ) -> Result<PoolAllocation, IpamError> {
        let mut state = self.state.lock().unwrap();

        let subnet = if subnet.is_empty() {
            if v6 {
                return Err(IpamError::InvalidRequest(
                    "automatic subnet selection supports IPv4 only".to_string(),
                ));
            }
            self.select_free_subnet(&state.pools, address_space)?
        } else {
            normalize(
                subnet
                    .parse::<IpNetwork>()
                    .map_err(|_| IpamError::InvalidRequest(format!("invalid subnet {subnet}")))?,
            )?
        };

        let pool_id = pool_key(address_space, &subnet);
        if state.pools.contains_key(&pool_id) {
            return Err(IpamError::PoolOverlap(subnet.to_string()));
        }

        let range = if sub_pool.is_empty() {
            None
        } else {
            let range = normalize(sub_pool.parse::<IpNetwork>().map_err(|_| {
                IpamError::InvalidRequest(format!("invalid sub-pool {sub_pool}"))
            })?)?;
            if !subnet.contains(range.network()) {
                return Err(IpamError::InvalidRequest(format!(
                    "sub-pool {range} is not within {subnet}"
                )));
            }
            Some(range)
        };

        state.pools.insert(
            pool_id.clone(),
            Pool {
                subnet,
                range,
                allocated: BTreeSet::new(),
                cursor: 0,
            },
        );

        Ok(PoolAllocation {
            pool_id,
            pool: subnet,
            meta: HashMap::new(),
        })
    }

    fn release_pool(&self, pool_id: &str) -> Result<(), IpamError> {
        let mut state = self.state.lock().unwrap();
        state
            .pools
            .remove(pool_id)
            .map(|_| ())
            .ok_or_else(|| IpamError::UnknownPool(pool_id.to_string()))
    }

    fn request_address(
        &self,
        pool_id: &str,
        preferred: Option<IpAddr>,
        options: &HashMap<String, String>,
    ) -> Result<IpNetwork, IpamError> {
        let mut state = self.state.lock().unwrap();
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| IpamError::UnknownPool(pool_id.to_string()))?;

        let base = addr_bits(&pool.subnet.network());
        let prefix = pool.subnet.prefix();

        if let Some(ip) = preferred {
            if !pool.subnet.contains(ip) {
                return Err(IpamError::IpOutOfRange);
            }
            if let Some(range) = &pool.range {
                if !range.contains(ip) {
                    return Err(IpamError::IpOutOfRange);
                }
            }
            let offset = addr_bits(&ip) - base;
            if !pool.allocated.insert(offset) {
                return Err(IpamError::AlreadyAllocated);
            }
            pool.cursor = offset + 1;
            return with_prefix(ip, prefix);
        }

        let (lo, hi) = pool.alloc_window().ok_or(IpamError::NoAvailableIps)?;
        let serial = options.get(ALLOC_SERIAL_PREFIX).map(String::as_str) == Some("true");
        let start = if serial { pool.cursor.clamp(lo, hi) } else { lo };

        // Scan forward from the starting offset, wrapping once.
        let offset = (start..=hi)
            .chain(lo..start)
            .find(|off| !pool.allocated.contains(off))
            .ok_or(IpamError::NoAvailableIps)?;

        pool.allocated.insert(offset);
        pool.cursor = offset + 1;
        with_prefix(bits_addr(&pool.subnet, base + offset), prefix)
    }

    fn release_address(&self, pool_id: &str, addr: IpAddr) -> Result<(), IpamError> {
        let mut state = self.state.lock().unwrap();
        let pool = state
            .pools
            .get_mut(pool_id)
            .ok_or_else(|| IpamError::UnknownPool(pool_id.to_string()))?;

        if !pool.subnet.contains(addr) {
            return Err(IpamError::IpOutOfRange);
        }

        let offset = addr_bits(&addr) - addr_bits(&pool.subnet.network());
        if !pool.allocated.remove(&offset) {
            return Err(IpamError::InvalidRequest(format!(
                "address {addr} is not allocated"
            )));
        }
        Ok(())
    }
}

fn pool_key(address_space: &str, subnet: &IpNetwork) -> String {
    format!("{address_space}/{subnet}")
}

/// Mask a parsed network down to its network address.
fn normalize(net: IpNetwork) -> Result<IpNetwork, IpamError> {
    IpNetwork::new(net.network(), net.prefix()).map_err(|e| IpamError::InvalidRequest(e.to_string()))
}

fn with_prefix(ip: IpAddr, prefix: u8) -> Result<IpNetwork, IpamError> {
    IpNetwork::new(ip, prefix).map_err(|e| IpamError::InvalidRequest(e.to_string()))
}

fn addr_bits(ip: &IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(*v4) as u128,
        IpAddr::V6(v6) => u128::from(*v6),
    }
}

fn bits_addr(subnet: &IpNetwork, bits: u128) -> IpAddr {
    match subnet {
        IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

fn capacity(subnet: &IpNetwork) -> u128 {
    match subnet {
        IpNetwork::V4(n) => 1u128 << (32 - n.prefix()),
        IpNetwork::V6(n) => {
            if n.prefix() >= 128 {
                1
            } else {
                1u128 << (128 - n.prefix())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> HashMap<String, String> {
        HashMap::new()
    }

    fn serial_opts() -> HashMap<String, String> {
        let mut opts = HashMap::new();
        opts.insert(ALLOC_SERIAL_PREFIX.to_string(), "true".to_string());
        opts
    }

    #[test]
    fn explicit_pool_and_first_address() {
        let ipam = DefaultIpam::new();
        let pool = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/24", "", &opts(), false)
            .unwrap();
        assert_eq!(pool.pool_id, "GlobalDefault/10.0.0.0/24");
        assert_eq!(pool.pool.to_string(), "10.0.0.0/24");

        let addr = ipam.request_address(&pool.pool_id, None, &opts()).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.1/24");
    }

    #[test]
    fn duplicate_pool_is_rejected() {
        let ipam = DefaultIpam::new();
        ipam.request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/24", "", &opts(), false)
            .unwrap();
        let err = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/24", "", &opts(), false)
            .unwrap_err();
        assert!(matches!(err, IpamError::PoolOverlap(_)));
    }

    #[test]
    fn auto_selection_skips_claimed_subnets() {
        let ipam = DefaultIpam::new();
        ipam.request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/24", "", &opts(), false)
            .unwrap();
        let pool = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "", "", &opts(), false)
            .unwrap();
        assert_eq!(pool.pool.to_string(), "10.0.1.0/24");
    }

    #[test]
    fn preferred_address_is_honored_and_guarded() {
        let ipam = DefaultIpam::new();
        let pool = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/24", "", &opts(), false)
            .unwrap();

        let wanted: IpAddr = "10.0.0.7".parse().unwrap();
        let got = ipam
            .request_address(&pool.pool_id, Some(wanted), &opts())
            .unwrap();
        assert_eq!(got.ip(), wanted);

        let err = ipam
            .request_address(&pool.pool_id, Some(wanted), &opts())
            .unwrap_err();
        assert!(matches!(err, IpamError::AlreadyAllocated));

        let outside: IpAddr = "10.0.1.7".parse().unwrap();
        let err = ipam
            .request_address(&pool.pool_id, Some(outside), &opts())
            .unwrap_err();
        assert!(matches!(err, IpamError::IpOutOfRange));
    }

    #[test]
    fn first_fit_reuses_released_addresses_serial_does_not() {
        let ipam = DefaultIpam::new();
        let pool = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/24", "", &opts(), false)
            .unwrap();

        let a1 = ipam.request_address(&pool.pool_id, None, &opts()).unwrap();
        let a2 = ipam
            .request_address(&pool.pool_id, None, &serial_opts())
            .unwrap();
        assert_eq!(a1.to_string(), "10.0.0.1/24");
        assert_eq!(a2.to_string(), "10.0.0.2/24");

        ipam.release_address(&pool.pool_id, a1.ip()).unwrap();

        // Serial allocation keeps advancing past the freed slot.
        let a3 = ipam
            .request_address(&pool.pool_id, None, &serial_opts())
            .unwrap();
        assert_eq!(a3.to_string(), "10.0.0.3/24");

        // First-fit picks the freed slot back up.
        let a4 = ipam.request_address(&pool.pool_id, None, &opts()).unwrap();
        assert_eq!(a4.to_string(), "10.0.0.1/24");
    }

    #[test]
    fn pool_exhaustion() {
        let ipam = DefaultIpam::new();
        let pool = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/30", "", &opts(), false)
            .unwrap();

        // A /30 has two usable host addresses.
        ipam.request_address(&pool.pool_id, None, &opts()).unwrap();
        ipam.request_address(&pool.pool_id, None, &opts()).unwrap();
        let err = ipam
            .request_address(&pool.pool_id, None, &opts())
            .unwrap_err();
        assert!(matches!(err, IpamError::NoAvailableIps));
    }

    #[test]
    fn sub_pool_restricts_allocation() {
        let ipam = DefaultIpam::new();
        let pool = ipam
            .request_pool(
                GLOBAL_ADDRESS_SPACE,
                "10.0.0.0/24",
                "10.0.0.64/30",
                &opts(),
                false,
            )
            .unwrap();

        let addr = ipam.request_address(&pool.pool_id, None, &opts()).unwrap();
        assert_eq!(addr.to_string(), "10.0.0.64/24");
    }

    #[test]
    fn serial_allocation_wraps() {
        let ipam = DefaultIpam::new();
        let pool = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "10.0.0.0/30", "", &opts(), false)
            .unwrap();

        let a1 = ipam
            .request_address(&pool.pool_id, None, &serial_opts())
            .unwrap();
        let a2 = ipam
            .request_address(&pool.pool_id, None, &serial_opts())
            .unwrap();
        ipam.release_address(&pool.pool_id, a1.ip()).unwrap();

        let a3 = ipam
            .request_address(&pool.pool_id, None, &serial_opts())
            .unwrap();
        assert_eq!(a3.ip(), a1.ip());
        assert_ne!(a3.ip(), a2.ip());
    }

    #[test]
    fn release_unknown_pool() {
        let ipam = DefaultIpam::new();
        assert!(matches!(
            ipam.release_pool("GlobalDefault/10.9.0.0/24"),
            Err(IpamError::UnknownPool(_))
        ));
    }

    #[test]
    fn ipv6_pool() {
        let ipam = DefaultIpam::new();
        let pool = ipam
            .request_pool(GLOBAL_ADDRESS_SPACE, "2001:db8::/120", "", &opts(), true)
            .unwrap();
        let addr = ipam.request_address(&pool.pool_id, None, &opts()).unwrap();
        assert_eq!(addr.to_string(), "2001:db8::1/120");
    }
}
