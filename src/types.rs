use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::Result;

/// Scanner orchestration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i8)]
pub enum ScannerState {
    Unknown = -1,
    Idle = 0,
    Prepare = 1,
    Calibration = 2,
    Acquisition = 3,
    Finalization = 4,
    Overheat = 5,
    Error = 6,
}

impl ScannerState {
    /// Decode a value stored in an atomic. Unrecognised values map to `Unknown`.
    pub fn from_i8(value: i8) -> Self {
        match value {
            0 => ScannerState::Idle,
            1 => ScannerState::Prepare,
            2 => ScannerState::Calibration,
            3 => ScannerState::Acquisition,
            4 => ScannerState::Finalization,
            5 => ScannerState::Overheat,
            6 => ScannerState::Error,
            _ => ScannerState::Unknown,
        }
    }

    pub fn as_i8(self) -> i8 {
        self as i8
    }
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScannerState::Unknown => "Unknown",
            ScannerState::Idle => "Idle",
            ScannerState::Prepare => "Prepare",
            ScannerState::Calibration => "Calibration",
            ScannerState::Acquisition => "Acquisition",
            ScannerState::Finalization => "Finalization",
            ScannerState::Overheat => "Overheat",
            ScannerState::Error => "Error",
        };
        f.write_str(name)
    }
}

/// Device kinds managed by the scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Detector,
    PowerSupply,
    Hardware,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = match self {
            DeviceKind::Detector => "Detector",
            DeviceKind::PowerSupply => "Power supply",
            DeviceKind::Hardware => "Hardware",
        };
        f.write_str(title)
    }
}

/// Physical size of one detector pixel in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: f64,
    pub height: f64,
}

impl PixelSize {
    pub fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }
}

/// Outcome of a completed acquisition
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AcquisitionResult {
    pub amperage_ma: f64,
    pub voltage_kv: f64,
    pub exposure_ms: u16,
    pub width: i32,
    pub image: Vec<f32>,
    pub pixel_size: PixelSize,
    /// Dark frame captured before exposure. Not part of the wire encoding.
    #[serde(skip)]
    pub dark: Vec<f32>,
}

impl AcquisitionResult {
    /// Number of complete image rows
    pub fn height(&self) -> usize {
        if self.width <= 0 {
            0
        } else {
            self.image.len() / self.width as usize
        }
    }

    /// Encode for transport between threads or processes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Parameters of a single acquisition request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParams {
    pub scanning_mode: Uuid,
    pub height_mm: u16,
    pub voltage_kv: f64,
    pub amperage_ma: f64,
    pub use_door: bool,
}

/// Notifications published by the scanner
#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    Opened,
    Closed,
    ErrorOccurred(String),
    StateChanged(ScannerState),
    XrayToggled(bool),
    AcquisitionResultReady,
    CalibrationProgress { current: usize, total: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_i8() {
        for state in [
            ScannerState::Unknown,
            ScannerState::Idle,
            ScannerState::Prepare,
            ScannerState::Calibration,
            ScannerState::Acquisition,
            ScannerState::Finalization,
            ScannerState::Overheat,
            ScannerState::Error,
        ] {
            assert_eq!(ScannerState::from_i8(state.as_i8()), state);
        }
        assert_eq!(ScannerState::from_i8(42), ScannerState::Unknown);
    }

    #[test]
    fn acquisition_result_wire_layout() {
        let result = AcquisitionResult {
            amperage_ma: 0.5,
            voltage_kv: 140.0,
            exposure_ms: 1200,
            width: 2,
            image: vec![1.0, 2.0, 3.0, 4.0],
            pixel_size: PixelSize::new(0.2, 0.2),
            dark: vec![9.0; 4],
        };
        let bytes = result.to_bytes().unwrap();

        // f64 + f64 + u16 + i32 + (u64 length + 4 * f32) + f64 + f64
        assert_eq!(bytes.len(), 8 + 8 + 2 + 4 + 8 + 16 + 8 + 8);
        assert_eq!(&bytes[0..8], &0.5f64.to_le_bytes());
        assert_eq!(&bytes[16..18], &1200u16.to_le_bytes());

        let decoded = AcquisitionResult::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.image, result.image);
        assert!(decoded.dark.is_empty());
        assert_eq!(decoded.height(), 2);
    }

    #[test]
    fn zero_width_has_no_rows() {
        let result = AcquisitionResult {
            image: vec![1.0; 10],
            ..Default::default()
        };
        assert_eq!(result.height(), 0);
    }
}
