//! Manager-side overlay driver.
//!
//! The overlay driver's cluster-wide state is one VXLAN network id per
//! subnet. Allocation assigns fresh ids from the VNI space and returns them
//! in the driver options under [`VXLAN_ID_LIST`]; when the incoming options
//! already carry a list (state restored from the store), those ids are
//! re-claimed instead.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::driver::{DriverError, IpamData, NetworkDriver};

/// Driver-state option key carrying the comma-separated VXLAN id list.
pub const VXLAN_ID_LIST: &str = "com.docker.network.driver.overlay.vxlanid_list";

const VNI_MIN: u32 = 4096;
const VNI_MAX: u32 = (1 << 24) - 1;

#[derive(Default)]
struct State {
    next: u32,
    in_use: BTreeSet<u32>,
    networks: HashMap<String, Vec<u32>>,
}

/// The built-in overlay network driver.
pub struct OverlayDriver {
    state: Mutex<State>,
}

impl OverlayDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next: VNI_MIN,
                ..State::default()
            }),
        }
    }
}

impl Default for OverlayDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkDriver for OverlayDriver {
    fn network_allocate(
        &self,
        id: &str,
        options: &HashMap<String, String>,
        ipv4_data: &[IpamData],
        _ipv6_data: &[IpamData],
    ) -> Result<HashMap<String, String>, DriverError> {
        let mut state = self.state.lock().unwrap();

        if state.networks.contains_key(id) {
            return Err(DriverError::Driver(format!(
                "network {id} is already allocated"
            )));
        }

        let vnis = match options.get(VXLAN_ID_LIST) {
            Some(list) => reclaim_vnis(&mut state, list)?,
            None => {
                let count = ipv4_data.len().max(1);
                assign_vnis(&mut state, count)?
            }
        };

        state.networks.insert(id.to_string(), vnis.clone());

        let list = vnis
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        Ok(HashMap::from([(VXLAN_ID_LIST.to_string(), list)]))
    }

    fn network_free(&self, id: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        let vnis = state
            .networks
            .remove(id)
            .ok_or_else(|| DriverError::UnknownNetwork(id.to_string()))?;
        for vni in vnis {
            state.in_use.remove(&vni);
        }
        Ok(())
    }
}

/// Re-claim the ids of a restored network.
fn reclaim_vnis(state: &mut State, list: &str) -> Result<Vec<u32>, DriverError> {
    let mut vnis = Vec::new();
    for part in list.split(',') {
        let vni: u32 = part
            .trim()
            .parse()
            .map_err(|_| DriverError::Driver(format!("invalid vxlan id {part}")))?;
        if !(VNI_MIN..=VNI_MAX).contains(&vni) {
            return Err(DriverError::Driver(format!("vxlan id {vni} out of range")));
        }
        if !state.in_use.insert(vni) {
            return Err(DriverError::Driver(format!(
                "vxlan id {vni} is already in use"
            )));
        }
        vnis.push(vni);
    }
    Ok(vnis)
}

fn assign_vnis(state: &mut State, count: usize) -> Result<Vec<u32>, DriverError> {
    let mut vnis = Vec::with_capacity(count);
    let mut candidate = state.next.clamp(VNI_MIN, VNI_MAX);

    'outer: for _ in 0..count {
        let start = candidate;
        loop {
            if state.in_use.insert(candidate) {
                vnis.push(candidate);
                candidate = next_vni(candidate);
                continue 'outer;
            }
            candidate = next_vni(candidate);
            if candidate == start {
                // Roll back the ids taken in this call before bailing out.
                for vni in &vnis {
                    state.in_use.remove(vni);
                }
                return Err(DriverError::IdExhausted);
            }
        }
    }

    state.next = candidate;
    Ok(vnis)
}

fn next_vni(vni: u32) -> u32 {
    if vni >= VNI_MAX {
        VNI_MIN
    } else {
        vni + 1
    }
}
