// Driver registry: driver key -> axis driver constructor
//
// Configuration carries keys only. The process-wide table is seeded once with
// the built-in drivers; callers may register further backends at startup.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use tracing::{debug, warn};

use super::driver::{AxisDriver, DriverParams};
use super::mmc;
use crate::error::{Result, StageError};

/// Constructor for one axis driver
pub type DriverFactory = fn(DriverParams) -> Arc<dyn AxisDriver>;

/// Table of available axis drivers
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<&'static str, DriverFactory>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every driver shipped with this crate
    pub fn with_builtin_drivers() -> Self {
        let mut registry = Self::new();
        mmc::register(&mut registry);
        registry
    }

    /// Register a factory. A second registration under the same key replaces the first.
    pub fn register(&mut self, key: &'static str, factory: DriverFactory) {
        if self.factories.insert(key, factory).is_some() {
            warn!("Driver '{}' registered twice; keeping the latest", key);
        } else {
            debug!("Registered driver '{}'", key);
        }
    }

    pub fn get_factory(&self, key: &str) -> Option<DriverFactory> {
        self.factories.get(key).copied()
    }

    /// Instantiate the driver registered under `key`
    pub fn create(&self, key: &str, params: DriverParams) -> Result<Arc<dyn AxisDriver>> {
        let factory = self
            .get_factory(key)
            .ok_or_else(|| StageError::UnknownDriver(key.to_string()))?;
        Ok(factory(params))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Registered keys, sorted
    pub fn list(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.factories.keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

static GLOBAL_REGISTRY: LazyLock<RwLock<DriverRegistry>> =
    LazyLock::new(|| RwLock::new(DriverRegistry::with_builtin_drivers()));

/// Add a driver to the process-wide table
pub fn register_driver(key: &'static str, factory: DriverFactory) {
    GLOBAL_REGISTRY
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(key, factory);
}

/// Instantiate a driver from the process-wide table
pub fn create_driver(key: &str, params: DriverParams) -> Result<Arc<dyn AxisDriver>> {
    // Copy the factory out so the lock is not held while the driver is built
    let factory = GLOBAL_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get_factory(key)
        .ok_or_else(|| StageError::UnknownDriver(key.to_string()))?;
    Ok(factory(params))
}

/// Snapshot of the process-wide table
pub fn global_registry() -> DriverRegistry {
    GLOBAL_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub fn registered_drivers() -> Vec<&'static str> {
    GLOBAL_REGISTRY
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .list()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::StageConfiguration;
    use crate::events::EventBus;
    use crate::motor::{Axis, MmcAxis, SimulatedController, Transport};

    fn params(axis: Axis) -> DriverParams {
        let config = StageConfiguration::default();
        DriverParams {
            axis,
            transport: Transport::from_link(
                "sim://registry",
                Box::new(SimulatedController::new()),
                Duration::from_millis(50),
            ),
            config: config.motor_config(axis).unwrap(),
            timing: config.timing().unwrap(),
            events: EventBus::new(),
        }
    }

    fn create_other(params: DriverParams) -> Arc<dyn AxisDriver> {
        Arc::new(MmcAxis::new(params))
    }

    #[test]
    fn test_builtin_drivers() {
        let registry = DriverRegistry::with_builtin_drivers();
        assert_eq!(registry.list(), vec!["stage_control"]);

        let driver = registry.create("stage_control", params(Axis::Z)).unwrap();
        assert_eq!(driver.axis(), Axis::Z);
        assert_eq!(driver.driver_key(), "stage_control");
    }

    #[test]
    fn test_unknown_driver() {
        let registry = DriverRegistry::new();
        let err = registry.create("piezo", params(Axis::X)).err().unwrap();
        assert_eq!(err, StageError::UnknownDriver("piezo".to_string()));
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = DriverRegistry::with_builtin_drivers();
        registry.register("bench_stage", create_other);
        registry.register("bench_stage", create_other);
        assert!(registry.contains("bench_stage"));
        assert_eq!(registry.list(), vec!["bench_stage", "stage_control"]);
    }

    #[test]
    fn test_global_table() {
        register_driver("global_bench_stage", create_other);
        assert!(registered_drivers().contains(&"stage_control"));
        assert!(global_registry().contains("global_bench_stage"));
        assert!(create_driver("global_bench_stage", params(Axis::Y)).is_ok());
        assert!(matches!(
            create_driver("nope", params(Axis::Y)),
            Err(StageError::UnknownDriver(_))
        ));
    }
}
