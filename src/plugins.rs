//! Named driver factories.
//!
//! Settings name the plugin to use for each device kind. The scanner looks the name up in a
//! [`PluginRegistry`] and asks the factory for a fresh driver every time it is opened.

use log::debug;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::detector::DetectorDriver;
use crate::hardware::HardwareDriver;
use crate::power_supply::PowerSupplyDriver;
use crate::simulated::{EmptyDetector, EmptyHardware, EmptyPowerSupply};

pub type DetectorFactory = Arc<dyn Fn() -> Box<dyn DetectorDriver> + Send + Sync>;
pub type PowerSupplyFactory = Arc<dyn Fn() -> Box<dyn PowerSupplyDriver> + Send + Sync>;
pub type HardwareFactory = Arc<dyn Fn() -> Box<dyn HardwareDriver> + Send + Sync>;

pub const EMPTY_DETECTOR: &str = "empty_detector";
pub const EMPTY_POWER_SUPPLY: &str = "empty_power_supply";
pub const EMPTY_HARDWARE: &str = "empty_hardware";

/// Driver factories by plugin name
#[derive(Clone, Default)]
pub struct PluginRegistry {
    detectors: BTreeMap<String, DetectorFactory>,
    power_supplies: BTreeMap<String, PowerSupplyFactory>,
    hardware: BTreeMap<String, HardwareFactory>,
}

impl PluginRegistry {
    /// Registry without any plugin
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the simulated drivers
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_detector(EMPTY_DETECTOR, || Box::new(EmptyDetector::default()));
        registry.register_power_supply(EMPTY_POWER_SUPPLY, || Box::new(EmptyPowerSupply));
        registry.register_hardware(EMPTY_HARDWARE, || Box::new(EmptyHardware::default()));
        registry
    }

    pub fn register_detector<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn DetectorDriver> + Send + Sync + 'static,
    {
        debug!("Register detector plugin '{}'", name);
        self.detectors.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_power_supply<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn PowerSupplyDriver> + Send + Sync + 'static,
    {
        debug!("Register power supply plugin '{}'", name);
        self.power_supplies.insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_hardware<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn HardwareDriver> + Send + Sync + 'static,
    {
        debug!("Register hardware plugin '{}'", name);
        self.hardware.insert(name.to_string(), Arc::new(factory));
    }

    pub fn detector(&self, name: &str) -> Option<Box<dyn DetectorDriver>> {
        self.detectors.get(name).map(|factory| factory())
    }

    pub fn power_supply(&self, name: &str) -> Option<Box<dyn PowerSupplyDriver>> {
        self.power_supplies.get(name).map(|factory| factory())
    }

    pub fn hardware(&self, name: &str) -> Option<Box<dyn HardwareDriver>> {
        self.hardware.get(name).map(|factory| factory())
    }

    pub fn detector_names(&self) -> Vec<String> {
        self.detectors.keys().cloned().collect()
    }

    pub fn power_supply_names(&self) -> Vec<String> {
        self.power_supplies.keys().cloned().collect()
    }

    pub fn hardware_names(&self) -> Vec<String> {
        self.hardware.keys().cloned().collect()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("detectors", &self.detector_names())
            .field("power_supplies", &self.power_supply_names())
            .field("hardware", &self.hardware_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_plugins_are_registered() {
        let registry = PluginRegistry::with_builtin();
        assert!(registry.detector(EMPTY_DETECTOR).is_some());
        assert!(registry.power_supply(EMPTY_POWER_SUPPLY).is_some());
        assert!(registry.hardware(EMPTY_HARDWARE).is_some());
        assert_eq!(registry.detector_names(), vec![EMPTY_DETECTOR.to_string()]);
    }

    #[test]
    fn unknown_plugin_is_none() {
        let registry = PluginRegistry::new();
        assert!(registry.detector(EMPTY_DETECTOR).is_none());
        assert!(registry.hardware("vendor_rack").is_none());
    }

    #[test]
    fn factory_builds_fresh_drivers() {
        let mut registry = PluginRegistry::new();
        registry.register_hardware("rack", || Box::new(EmptyHardware::default()));
        let first = registry.hardware("rack").unwrap();
        let second = registry.hardware("rack").unwrap();
        assert_eq!(first.name(), second.name());
    }
}
