//! Node-local built-in drivers (bridge, host, macvlan, ipvlan).
//!
//! These networks are scoped to a single node, so the manager performs no
//! allocation for them; the drivers exist so that name resolution and scope
//! detection work. Their allocate/free entry points are never reached through
//! the allocator, which short-circuits node-local networks first.

use std::collections::HashMap;

use crate::driver::{DriverError, IpamData, NetworkDriver};

/// A name-only driver for networks whose resources are node-local.
pub struct LocalDriver {
    name: String,
}

impl LocalDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl NetworkDriver for LocalDriver {
    fn network_allocate(
        &self,
        _id: &str,
        _options: &HashMap<String, String>,
        _ipv4_data: &[IpamData],
        _ipv6_data: &[IpamData],
    ) -> Result<HashMap<String, String>, DriverError> {
        Err(DriverError::NotSupported(self.name.clone()))
    }

    fn network_free(&self, _id: &str) -> Result<(), DriverError> {
        Err(DriverError::NotSupported(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_not_supported() {
        let driver = LocalDriver::new("bridge");
        let err = driver
            .network_allocate("net1", &HashMap::new(), &[], &[])
            .unwrap_err();
        assert!(matches!(err, DriverError::NotSupported(_)));
        assert!(matches!(
            driver.network_free("net1"),
            Err(DriverError::NotSupported(_))
        ));
    }
}
