//! Scanning modes and their on-disk collection.
//!
//! Every mode lives in a directory named after its UUID under the collection root:
//!
//! ```text
//! <root>/<uuid>/ScanningMode.toml   title, limits, binning, rollback coefficients
//! <root>/<uuid>/<device>.toml       configuration of the device driver named <device>
//! ```

use log::{debug, info, warn};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::configuration::DeviceConfiguration;
use crate::constants::{DEVICE_CONFIG_EXTENSION, SCANNING_MODE_FILE};
use crate::error::{Result, ScannerError};

const TITLE: &str = "main/title";
const ENABLED: &str = "main/enabled";
const SORT_ORDER: &str = "main/sort_order";
const CALIBRATION_AMPERAGE: &str = "main/calibration_amperage_ma";
const CALIBRATION_VOLTAGE: &str = "main/calibration_voltage_kv";
const MIN_AMPERAGE: &str = "main/min_amperage_ma";
const MAX_AMPERAGE: &str = "main/max_amperage_ma";
const MIN_VOLTAGE: &str = "main/min_voltage_kv";
const MAX_VOLTAGE: &str = "main/max_voltage_kv";
const SNAPSHOT_WIDTH: &str = "main/snapshot_width_px";
const ROLLBACK_ALPHA: &str = "main/rollback_alpha";
const ROLLBACK_BETA: &str = "main/rollback_beta";
const BINNING_SUM: &str = "binning/sum";
const BINNING_HORIZONTAL: &str = "binning/horizontal";
const BINNING_VERTICAL: &str = "binning/vertical";

/// Named bundle of acquisition limits and per-device configuration
#[derive(Debug, Clone)]
pub struct ScanningMode {
    uuid: Uuid,
    pub title: String,
    pub is_enabled: bool,
    pub sort_order: u16,
    pub calibration_amperage_ma: f64,
    pub calibration_voltage_kv: f64,
    pub min_amperage_ma: f64,
    pub max_amperage_ma: f64,
    pub min_voltage_kv: f64,
    pub max_voltage_kv: f64,
    pub binning_sum: bool,
    pub binning_horizontal: u16,
    pub binning_vertical: u16,
    pub snapshot_width: u16,
    /// Rack travel subtracted from the rollback, ms
    pub rollback_alpha: u16,
    /// Rollback multiplier
    pub rollback_beta: f64,
    /// Device configurations keyed by driver name
    pub devices_configurations: BTreeMap<String, DeviceConfiguration>,
}

impl ScanningMode {
    fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            title: String::new(),
            is_enabled: false,
            sort_order: 0,
            calibration_amperage_ma: 0.0,
            calibration_voltage_kv: 0.0,
            min_amperage_ma: 0.0,
            max_amperage_ma: 0.0,
            min_voltage_kv: 0.0,
            max_voltage_kv: 0.0,
            binning_sum: false,
            binning_horizontal: 0,
            binning_vertical: 0,
            snapshot_width: 0,
            rollback_alpha: 0,
            rollback_beta: 1.0,
            devices_configurations: BTreeMap::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Configuration stored for the driver `name`, empty when there is none
    pub fn device_configuration(&self, name: &str) -> DeviceConfiguration {
        self.devices_configurations
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Copy every field except the UUID
    pub fn copy_from(&mut self, other: &ScanningMode) {
        let uuid = self.uuid;
        *self = other.clone();
        self.uuid = uuid;
    }

    fn sort_cmp(&self, other: &ScanningMode) -> Ordering {
        self.sort_order
            .cmp(&other.sort_order)
            .then_with(|| self.title.cmp(&other.title))
            .then_with(|| self.uuid.cmp(&other.uuid))
    }

    fn to_configuration(&self) -> DeviceConfiguration {
        let mut conf = DeviceConfiguration::new();
        conf.insert(TITLE, self.title.as_str(), "");
        conf.insert(ENABLED, self.is_enabled, "");
        conf.insert(SORT_ORDER, self.sort_order as i64, "");
        conf.insert(CALIBRATION_AMPERAGE, self.calibration_amperage_ma, "");
        conf.insert(CALIBRATION_VOLTAGE, self.calibration_voltage_kv, "");
        conf.insert(MIN_AMPERAGE, self.min_amperage_ma, "");
        conf.insert(MAX_AMPERAGE, self.max_amperage_ma, "");
        conf.insert(MIN_VOLTAGE, self.min_voltage_kv, "");
        conf.insert(MAX_VOLTAGE, self.max_voltage_kv, "");
        conf.insert(SNAPSHOT_WIDTH, self.snapshot_width as i64, "");
        conf.insert(ROLLBACK_ALPHA, self.rollback_alpha as i64, "");
        conf.insert(ROLLBACK_BETA, self.rollback_beta, "");
        conf.insert(BINNING_SUM, self.binning_sum, "");
        conf.insert(BINNING_HORIZONTAL, self.binning_horizontal as i64, "");
        conf.insert(BINNING_VERTICAL, self.binning_vertical as i64, "");
        conf
    }

    fn from_configuration(uuid: Uuid, conf: &DeviceConfiguration) -> Self {
        let mut mode = Self::with_uuid(uuid);
        mode.title = conf
            .item(TITLE)
            .map(|item| item.value.as_text())
            .unwrap_or_default();
        mode.is_enabled = conf.bool_or(ENABLED, false);
        mode.sort_order = to_u16(conf.i64_or(SORT_ORDER, 0));
        mode.calibration_amperage_ma = conf.f64_or(CALIBRATION_AMPERAGE, 0.0);
        mode.calibration_voltage_kv = conf.f64_or(CALIBRATION_VOLTAGE, 0.0);
        mode.min_amperage_ma = conf.f64_or(MIN_AMPERAGE, 0.0);
        mode.max_amperage_ma = conf.f64_or(MAX_AMPERAGE, 0.0);
        mode.min_voltage_kv = conf.f64_or(MIN_VOLTAGE, 0.0);
        mode.max_voltage_kv = conf.f64_or(MAX_VOLTAGE, 0.0);
        mode.snapshot_width = to_u16(conf.i64_or(SNAPSHOT_WIDTH, 0));
        mode.rollback_alpha = to_u16(conf.i64_or(ROLLBACK_ALPHA, 0));
        mode.rollback_beta = conf.f64_or(ROLLBACK_BETA, 1.0);
        mode.binning_sum = conf.bool_or(BINNING_SUM, false);
        mode.binning_horizontal = to_u16(conf.i64_or(BINNING_HORIZONTAL, 0));
        mode.binning_vertical = to_u16(conf.i64_or(BINNING_VERTICAL, 0));
        mode
    }
}

fn to_u16(value: i64) -> u16 {
    value.clamp(0, u16::MAX as i64) as u16
}

/// Relative float comparison, exact for zeros
fn fuzzy_eq(a: f64, b: f64) -> bool {
    (a - b).abs() * 1e12 <= a.abs().min(b.abs())
}

impl PartialEq for ScanningMode {
    /// The rollback multiplier is a tuning value and does not make two modes different.
    fn eq(&self, other: &Self) -> bool {
        self.uuid == other.uuid
            && self.title == other.title
            && self.is_enabled == other.is_enabled
            && self.sort_order == other.sort_order
            && fuzzy_eq(self.calibration_amperage_ma, other.calibration_amperage_ma)
            && fuzzy_eq(self.calibration_voltage_kv, other.calibration_voltage_kv)
            && fuzzy_eq(self.min_amperage_ma, other.min_amperage_ma)
            && fuzzy_eq(self.max_amperage_ma, other.max_amperage_ma)
            && fuzzy_eq(self.min_voltage_kv, other.min_voltage_kv)
            && fuzzy_eq(self.max_voltage_kv, other.max_voltage_kv)
            && self.binning_sum == other.binning_sum
            && self.binning_horizontal == other.binning_horizontal
            && self.binning_vertical == other.binning_vertical
            && self.snapshot_width == other.snapshot_width
            && self.rollback_alpha == other.rollback_alpha
            && self.devices_configurations == other.devices_configurations
    }
}

/// Scanning modes stored under a root directory
#[derive(Debug, Clone, Default)]
pub struct ScanningModesCollection {
    root: Option<PathBuf>,
    items: BTreeMap<Uuid, ScanningMode>,
}

impl ScanningModesCollection {
    /// Collection persisted under `root`. The directory is created when missing and every
    /// mode found in it is loaded.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let mut collection = Self {
            root: Some(root),
            items: BTreeMap::new(),
        };
        collection.load()?;
        Ok(collection)
    }

    /// Collection that lives in memory only
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// New disabled mode with a UUID not used by any stored mode
    pub fn create(&self) -> ScanningMode {
        let mut uuid = Uuid::new_v4();
        while uuid.is_nil() || self.items.contains_key(&uuid) {
            uuid = Uuid::new_v4();
        }
        ScanningMode::with_uuid(uuid)
    }

    pub fn items(&self) -> &BTreeMap<Uuid, ScanningMode> {
        &self.items
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&ScanningMode> {
        self.items.get(uuid)
    }

    /// Stored modes, sorted by sort order, title and UUID when `sorted` is set
    pub fn list(&self, only_enabled: bool, sorted: bool) -> Vec<ScanningMode> {
        let mut modes: Vec<ScanningMode> = self
            .items
            .values()
            .filter(|mode| !only_enabled || mode.is_enabled)
            .cloned()
            .collect();
        if sorted {
            modes.sort_by(|a, b| a.sort_cmp(b));
        }
        modes
    }

    /// Replace every stored mode with `modes`
    pub fn store(&mut self, modes: &[ScanningMode]) -> Result<()> {
        for mode in modes {
            if mode.uuid.is_nil() {
                return Err(ScannerError::InvalidParameter(
                    "scanning mode has an empty UUID".into(),
                ));
            }
            if mode.devices_configurations.keys().any(|name| name.is_empty()) {
                return Err(ScannerError::InvalidParameter(format!(
                    "scanning mode {} has a device configuration without a name",
                    mode.uuid
                )));
            }
        }

        if let Some(root) = &self.root {
            remove_mode_dirs(root)?;
            for mode in modes {
                write_mode(root, mode)?;
            }
            info!("Stored {} scanning modes in {}", modes.len(), root.display());
        }

        self.items = modes.iter().map(|mode| (mode.uuid, mode.clone())).collect();
        Ok(())
    }

    fn load(&mut self) -> Result<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };

        let mut items = BTreeMap::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let Ok(uuid) = Uuid::parse_str(&dir_name) else {
                warn!("Skip directory {}: not a scanning mode", dir_name);
                continue;
            };
            let main = entry.path().join(SCANNING_MODE_FILE);
            if !main.is_file() {
                warn!("Skip scanning mode {}: {} is missing", uuid, SCANNING_MODE_FILE);
                continue;
            }

            let mut mode = ScanningMode::from_configuration(uuid, &DeviceConfiguration::load(&main)?);
            for file in fs::read_dir(entry.path())? {
                let path = file?.path();
                if path.file_name().is_some_and(|name| name == SCANNING_MODE_FILE)
                    || path.extension().map_or(true, |ext| ext != DEVICE_CONFIG_EXTENSION)
                {
                    continue;
                }
                let Some(device) = path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
                else {
                    continue;
                };
                mode.devices_configurations
                    .insert(device, DeviceConfiguration::load(&path)?);
            }
            debug!("Loaded scanning mode {} '{}'", uuid, mode.title);
            items.insert(uuid, mode);
        }

        info!("Loaded {} scanning modes", items.len());
        self.items = items;
        Ok(())
    }
}

fn remove_mode_dirs(root: &Path) -> Result<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if Uuid::parse_str(&name).is_ok() {
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

fn write_mode(root: &Path, mode: &ScanningMode) -> Result<()> {
    let dir = root.join(mode.uuid.to_string());
    fs::create_dir_all(&dir)?;
    mode.to_configuration().save(&dir.join(SCANNING_MODE_FILE))?;
    for (device, configuration) in &mode.devices_configurations {
        let file = dir.join(format!("{}.{}", device, DEVICE_CONFIG_EXTENSION));
        configuration.save(&file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn mode(collection: &ScanningModesCollection, title: &str, order: u16) -> ScanningMode {
        let mut mode = collection.create();
        mode.title = title.to_string();
        mode.sort_order = order;
        mode.is_enabled = true;
        mode.calibration_voltage_kv = 120.0;
        mode.calibration_amperage_ma = 0.4;
        mode.rollback_alpha = 300;
        mode.rollback_beta = 1.1;
        mode
    }

    #[test]
    fn created_mode_has_defaults() {
        let collection = ScanningModesCollection::in_memory();
        let mode = collection.create();
        assert!(!mode.uuid().is_nil());
        assert!(!mode.is_enabled);
        assert_eq!(mode.rollback_beta, 1.0);
        assert_eq!(mode.sort_order, 0);
        assert!(mode.devices_configurations.is_empty());
    }

    #[test]
    fn list_sorts_and_filters() {
        let mut collection = ScanningModesCollection::in_memory();
        let chest = mode(&collection, "Chest", 2);
        let hand = mode(&collection, "Hand", 1);
        let mut disabled = mode(&collection, "Arm", 1);
        disabled.is_enabled = false;
        collection.store(&[chest, hand, disabled]).unwrap();

        let titles: Vec<String> = collection
            .list(true, true)
            .into_iter()
            .map(|m| m.title)
            .collect();
        assert_eq!(titles, vec!["Hand", "Chest"]);

        let all: Vec<String> = collection
            .list(false, true)
            .into_iter()
            .map(|m| m.title)
            .collect();
        assert_eq!(all, vec!["Arm", "Hand", "Chest"]);
    }

    #[test]
    fn copy_keeps_uuid() {
        let collection = ScanningModesCollection::in_memory();
        let source = mode(&collection, "Chest", 2);
        let mut target = collection.create();
        let uuid = target.uuid();
        target.copy_from(&source);
        assert_eq!(target.uuid(), uuid);
        assert_eq!(target.title, "Chest");
        assert_eq!(target.rollback_alpha, 300);
    }

    #[test]
    fn equality_ignores_rollback_beta() {
        let collection = ScanningModesCollection::in_memory();
        let a = mode(&collection, "Chest", 2);
        let mut b = a.clone();
        b.rollback_beta = 2.0;
        assert_eq!(a, b);
        b.calibration_voltage_kv = 121.0;
        assert_ne!(a, b);
    }

    #[test]
    fn store_and_reload() {
        let dir = tempdir().unwrap();
        let mut collection = ScanningModesCollection::open(dir.path()).unwrap();
        let mut chest = mode(&collection, "Chest", 2);
        let mut detector = DeviceConfiguration::new();
        detector.insert("main/width", 576, "");
        chest
            .devices_configurations
            .insert("empty_detector".into(), detector);
        collection.store(&[chest.clone()]).unwrap();

        fs::create_dir_all(dir.path().join("not-a-mode")).unwrap();

        let reloaded = ScanningModesCollection::open(dir.path()).unwrap();
        assert_eq!(reloaded.items().len(), 1);
        let loaded = reloaded.get(&chest.uuid()).unwrap();
        assert_eq!(loaded, &chest);
        assert_eq!(loaded.rollback_beta, 1.1);
        assert_eq!(
            loaded
                .device_configuration("empty_detector")
                .i64_or("main/width", 0),
            576
        );
        assert!(dir.path().join("not-a-mode").exists());
    }

    #[test]
    fn store_replaces_previous_modes() {
        let dir = tempdir().unwrap();
        let mut collection = ScanningModesCollection::open(dir.path()).unwrap();
        let first = mode(&collection, "First", 0);
        collection.store(&[first.clone()]).unwrap();
        let second = mode(&collection, "Second", 0);
        collection.store(&[second.clone()]).unwrap();

        assert!(!dir.path().join(first.uuid().to_string()).exists());
        let reloaded = ScanningModesCollection::open(dir.path()).unwrap();
        assert!(reloaded.get(&first.uuid()).is_none());
        assert!(reloaded.get(&second.uuid()).is_some());
    }

    #[test]
    fn store_rejects_unnamed_device_configuration() {
        let mut collection = ScanningModesCollection::in_memory();
        let mut bad = mode(&collection, "Bad", 0);
        bad.devices_configurations
            .insert(String::new(), DeviceConfiguration::new());
        assert!(collection.store(&[bad]).is_err());
        assert!(collection.items().is_empty());
    }
}
