//! Thermal bookkeeping of the X-ray tube.
//!
//! Every exposure extends a "cool down until" deadline by the time the tube needs to
//! dissipate the released energy. The deadline is written to the run-state file as soon as
//! it changes so it survives a restart.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, ScannerError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunState {
    #[serde(default)]
    main: RunStateMain,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunStateMain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cooldown: Option<DateTime<Utc>>,
}

/// Persisted cooldown deadline
#[derive(Debug)]
pub struct CooldownLedger {
    path: Option<PathBuf>,
    until: Option<DateTime<Utc>>,
    cooling_rate_watt_sec: f64,
    threshold_secs: u32,
}

impl CooldownLedger {
    /// Ledger persisted in `path`, starting from the deadline stored there
    pub fn open(path: impl Into<PathBuf>, cooling_rate_watt_sec: f64, threshold_secs: u32) -> Result<Self> {
        let path = path.into();
        let until = read_deadline(&path)?;
        if let Some(until) = until {
            info!("Cooldown deadline restored: {}", until);
        }
        Ok(Self {
            path: Some(path),
            until,
            cooling_rate_watt_sec,
            threshold_secs,
        })
    }

    /// Ledger that is not persisted
    pub fn in_memory(cooling_rate_watt_sec: f64, threshold_secs: u32) -> Self {
        Self {
            path: None,
            until: None,
            cooling_rate_watt_sec,
            threshold_secs,
        }
    }

    pub fn until(&self) -> Option<DateTime<Utc>> {
        self.until
    }

    /// Extend the deadline by the cooling time of `kv` × `ma` released for `exposure_ms`
    pub fn accumulate(&mut self, kv: f64, ma: f64, exposure_ms: u16) -> Result<()> {
        if self.cooling_rate_watt_sec <= 0.0 {
            return Err(ScannerError::InvalidParameter(format!(
                "cooling rate must be positive, got {}",
                self.cooling_rate_watt_sec
            )));
        }

        let now = Utc::now();
        let start = match self.until {
            Some(until) if until >= now => until,
            _ => now,
        };
        let energy = kv * ma * exposure_ms as f64 / 1000.0;
        let seconds = (energy / self.cooling_rate_watt_sec).ceil().max(0.0) as i64;
        let until = start + Duration::seconds(seconds);
        debug!("Released {:.1} J, cooldown extended by {} s", energy, seconds);

        self.until = Some(until);
        self.persist()
    }

    /// Seconds left before the next exposure is allowed
    pub fn secs_to_cooldown(&self) -> u32 {
        let Some(until) = self.until else {
            return 0;
        };
        let remaining_ms = (until - Utc::now()).num_milliseconds();
        if remaining_ms <= 0 {
            return 0;
        }
        let remaining = (remaining_ms + 999) / 1000;
        (remaining - self.threshold_secs as i64).clamp(0, u32::MAX as i64) as u32
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = RunState {
            main: RunStateMain {
                cooldown: self.until,
            },
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string(&state)?)?;
        Ok(())
    }
}

fn read_deadline(path: &Path) -> Result<Option<DateTime<Utc>>> {
    if !path.exists() {
        warn!("Run-state file not found: {}", path.display());
        return Ok(None);
    }
    let text = fs::read_to_string(path)?;
    let state: RunState = toml::from_str(&text)?;
    Ok(state.main.cooldown)
}
