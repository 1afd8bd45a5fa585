//! Scanner settings loaded from a TOML file.
//!
//! ```toml
//! doors_count = 1
//! flat_field_correction_enabled = true
//! cooling_rate_watt_sec = 120.0
//! run_state_path = "/var/lib/xray/scanner.run.toml"
//!
//! [dispatcher]
//! port_name = "/dev/ttyUSB0"
//! baud_rate = 19200
//!
//! [plugins]
//! detector = "empty_detector"
//! ```

use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::dispatcher::DispatcherParams;
use crate::error::{Result, ScannerError};
use crate::plugins::{EMPTY_DETECTOR, EMPTY_HARDWARE, EMPTY_POWER_SUPPLY};

/// Plugin name per device kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginNames {
    pub detector: String,
    pub power_supply: String,
    pub hardware: String,
}

impl Default for PluginNames {
    fn default() -> Self {
        Self {
            detector: EMPTY_DETECTOR.to_string(),
            power_supply: EMPTY_POWER_SUPPLY.to_string(),
            hardware: EMPTY_HARDWARE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// Number of doors of the cabin. Zero disables door handling.
    pub doors_count: u8,
    pub flat_field_correction_enabled: bool,
    /// Pause between the prepare button and the start of the scan
    pub delay_before_scan_ms: u32,
    /// Delay of the detector capture after the scan started
    pub detector_delay_ms: u32,
    /// Energy the tube dissipates per second
    pub cooling_rate_watt_sec: f64,
    /// Remaining cooldown that still allows an exposure
    pub cooling_threshold_sec: u32,
    /// Calibration coefficients expire after this period. Zero never expires.
    pub calibration_lifetime_sec: i64,
    /// Run-state file holding the cooldown deadline. `None` keeps it in memory.
    pub run_state_path: Option<PathBuf>,
    pub dispatcher: DispatcherParams,
    pub plugins: PluginNames,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            doors_count: 1,
            flat_field_correction_enabled: false,
            delay_before_scan_ms: 500,
            detector_delay_ms: 0,
            cooling_rate_watt_sec: 100.0,
            cooling_threshold_sec: 0,
            calibration_lifetime_sec: 24 * 60 * 60,
            run_state_path: None,
            dispatcher: DispatcherParams::default(),
            plugins: PluginNames::default(),
        }
    }
}

impl ScannerSettings {
    /// Load from a TOML file. Missing keys take their default value.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading scanner settings from: {}", path.display());
        let text = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string(self)?)?;
        Ok(())
    }

    /// Reject values that make the scanner unusable
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.port_name.trim().is_empty() {
            return Err(ScannerError::InvalidParameter("serial port name is empty".into()));
        }
        if self.dispatcher.baud_rate == 0 {
            return Err(ScannerError::InvalidParameter("baud rate must be positive".into()));
        }
        if self.cooling_rate_watt_sec <= 0.0 || !self.cooling_rate_watt_sec.is_finite() {
            return Err(ScannerError::InvalidParameter(format!(
                "cooling rate must be positive, got {}",
                self.cooling_rate_watt_sec
            )));
        }
        Ok(())
    }
}
