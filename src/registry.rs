//! Registry of network drivers and IPAM drivers.
//!
//! The registry maps driver names to implementations plus capabilities. It is
//! populated with the built-in drivers at construction; external network
//! drivers are discovered lazily through the injected [`PluginGetter`] when a
//! lookup misses. IPAM drivers must be pre-registered; there is no lazy load
//! for them.
//!
//! The registry is the one resource shared across allocator instances and
//! performs its own synchronization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::driver::{
    Capability, DataScope, Ipam, NetworkDriver, PluginGetter, RegisteredDriver,
};
use crate::drivers::ipam::DefaultIpam;
use crate::drivers::local::LocalDriver;
use crate::drivers::overlay::OverlayDriver;

/// Name of the built-in default IPAM driver.
pub const DEFAULT_IPAM_DRIVER: &str = "default";

/// Built-in network driver names and the data scope each declares.
const BUILTIN_NETWORK_DRIVERS: &[(&str, DataScope)] = &[
    ("overlay", DataScope::Global),
    ("bridge", DataScope::Local),
    ("host", DataScope::Local),
    ("macvlan", DataScope::Local),
    ("ipvlan", DataScope::Local),
];

/// Returns whether `name` is one of the built-in network drivers.
/// Matching is case-insensitive.
pub fn is_builtin_driver(name: &str) -> bool {
    let name = name.to_lowercase();
    BUILTIN_NETWORK_DRIVERS.iter().any(|(n, _)| *n == name)
}

#[derive(Default)]
struct Tables {
    network_drivers: HashMap<String, RegisteredDriver>,
    ipam_drivers: HashMap<String, Arc<dyn Ipam>>,
}

/// Lookup and registration of network and IPAM drivers by name.
pub struct DriverRegistry {
    tables: Mutex<Tables>,
    plugin_getter: Option<Arc<dyn PluginGetter>>,
}

impl DriverRegistry {
    /// Create a registry populated with the built-in network drivers and the
    /// built-in default IPAM driver.
    pub fn new(plugin_getter: Option<Arc<dyn PluginGetter>>) -> Self {
        let registry = Self {
            tables: Mutex::new(Tables::default()),
            plugin_getter,
        };

        for (name, scope) in BUILTIN_NETWORK_DRIVERS {
            let driver: Arc<dyn NetworkDriver> = match scope {
                DataScope::Global => Arc::new(OverlayDriver::new()),
                DataScope::Local => Arc::new(LocalDriver::new(name)),
            };
            registry.add_driver(name, driver, Capability { data_scope: *scope });
        }

        registry.add_ipam(DEFAULT_IPAM_DRIVER, Arc::new(DefaultIpam::new()));

        registry
    }

    /// Register a network driver under `name`, replacing any existing entry.
    pub fn add_driver(&self, name: &str, driver: Arc<dyn NetworkDriver>, capability: Capability) {
        let mut tables = self.tables.lock().unwrap();
        tables
            .network_drivers
            .insert(name.to_string(), RegisteredDriver { driver, capability });
    }

    /// Register an IPAM driver under `name`, replacing any existing entry.
    pub fn add_ipam(&self, name: &str, driver: Arc<dyn Ipam>) {
        let mut tables = self.tables.lock().unwrap();
        tables.ipam_drivers.insert(name.to_string(), driver);
    }

    /// Look up a network driver and its capability.
    pub fn driver(&self, name: &str) -> Option<RegisteredDriver> {
        let tables = self.tables.lock().unwrap();
        tables.network_drivers.get(name).cloned()
    }

    /// Look up an IPAM driver.
    pub fn ipam(&self, name: &str) -> Option<Arc<dyn Ipam>> {
        let tables = self.tables.lock().unwrap();
        tables.ipam_drivers.get(name).cloned()
    }

    /// The (local, global) default address-space labels of the named IPAM
    /// driver.
    pub fn ipam_default_address_spaces(&self, name: &str) -> Option<(String, String)> {
        self.ipam(name).map(|d| d.default_address_spaces())
    }

    /// The injected plugin lookup handle, if any.
    pub fn plugin_getter(&self) -> Option<&Arc<dyn PluginGetter>> {
        self.plugin_getter.as_ref()
    }
}
