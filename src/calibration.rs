//! Flat-field calibration data.
//!
//! A [`FlatFieldCorrection`] holds one gain per detector column. Gains are computed from an
//! exposed frame and a dark frame; applying them subtracts the dark column means, divides
//! by the gain and shifts the result so no pixel is negative.

use chrono::{DateTime, Duration, Utc};
use log::{error, info};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::constants::CALIBRATION_RECOMMENDED_RATIO;
use crate::error::{Result, ScannerError};
use crate::scanning_modes::ScanningMode;

/// Calibration coefficients per scanning mode, consumed by the scanner
pub trait CalibrationStore: Send {
    /// Part of the lifetime has passed and a new calibration should be planned
    fn update_is_recommended(&self) -> bool;

    /// Coefficients have expired and must not be applied
    fn update_is_required(&self) -> bool;

    /// Recalibrate `mode` from an exposed image and a dark frame
    fn update(&mut self, mode: &Uuid, image: &[f32], dark: &[f32], width: i32) -> Result<()>;

    /// Correct `image` in place with the coefficients of `mode`
    fn apply(&self, mode: &Uuid, image: &mut [f32], dark: &[f32], width: i32) -> Result<()>;
}

fn bad(message: &str) -> ScannerError {
    error!("{}", message);
    ScannerError::InvalidParameter(message.to_string())
}

/// Per-column gains of one scanning mode
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatFieldCorrection {
    gains: Vec<f32>,
    last_calibration: Option<DateTime<Utc>>,
}

impl FlatFieldCorrection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore previously computed gains
    pub fn with_gains(gains: Vec<f32>, calibrated_at: DateTime<Utc>) -> Self {
        Self {
            gains,
            last_calibration: Some(calibrated_at),
        }
    }

    pub fn gains(&self) -> &[f32] {
        &self.gains
    }

    pub fn width(&self) -> usize {
        self.gains.len()
    }

    pub fn last_calibration(&self) -> Option<DateTime<Utc>> {
        self.last_calibration
    }

    fn check_sizes(image: &[f32], dark: &[f32], width: usize) -> Result<()> {
        if image.is_empty() || image.len() % width != 0 || dark.is_empty() || dark.len() % width != 0
        {
            return Err(bad("Bad images sizes"));
        }
        Ok(())
    }

    /// Mean of every column of the dark frame
    fn dark_rates(dark: &[f32], width: usize) -> Vec<f32> {
        let height = dark.len() / width;
        (0..width)
            .map(|column| {
                let sum: f64 = (0..height).map(|row| dark[row * width + column] as f64).sum();
                (sum / height as f64) as f32
            })
            .collect()
    }

    /// Mean dark-corrected signal of the pixels at or above the dark rate of their column
    fn column_signal(image: &[f32], rates: &[f32], width: usize, column: usize) -> Option<f64> {
        let height = image.len() / width;
        let mut sum = 0.0;
        let mut count = 0u64;
        for row in 0..height {
            let value = image[row * width + column];
            if value >= rates[column] {
                sum += (value - rates[column]) as f64;
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }

    pub fn calibrate(&mut self, image: &[f32], dark: &[f32], width: i32) -> Result<()> {
        info!("Starting calibration");
        if width < 1 {
            return Err(bad("Bad width param"));
        }
        let width = width as usize;
        Self::check_sizes(image, dark, width)?;

        let rates = Self::dark_rates(dark, width);
        let height = image.len() / width;
        let mut sum = 0.0;
        let mut count = 0u64;
        for (index, &value) in image.iter().enumerate() {
            let rate = rates[index % width];
            if value >= rate {
                sum += (value - rate) as f64;
                count += 1;
            }
        }
        if count == 0 {
            return Err(bad("Bad image"));
        }
        let average = sum / count as f64;
        if average.abs() <= f64::EPSILON {
            return Err(bad("Average signal is equal to zero"));
        }

        let mut gains = Vec::with_capacity(width);
        for column in 0..width {
            let signal = Self::column_signal(image, &rates, width, column)
                .ok_or_else(|| bad("Bad image"))?;
            gains.push((signal / average) as f32);
        }

        info!("Calibrated {} columns over {} rows", width, height);
        self.gains = gains;
        self.last_calibration = Some(Utc::now());
        Ok(())
    }

    pub fn correct(&self, image: &mut [f32], dark: &[f32], width: i32) -> Result<()> {
        info!("Starting flat field correction");
        if width < 1 || self.gains.len() != width as usize {
            return Err(bad("Bad gains or width param"));
        }
        let width = width as usize;
        Self::check_sizes(image, dark, width)?;

        let rates = Self::dark_rates(dark, width);
        let mut min_value = 0.0f32;
        for (index, pixel) in image.iter_mut().enumerate() {
            let column = index % width;
            let value = ((*pixel - rates[column]) as f64 / self.gains[column].abs() as f64).ceil() as f32;
            min_value = min_value.min(value);
            *pixel = value;
        }
        if min_value < 0.0 {
            image.iter_mut().for_each(|pixel| *pixel -= min_value);
        }
        Ok(())
    }
}

/// In-memory calibration data for every scanning mode
#[derive(Debug, Clone, Default)]
pub struct FlatFieldCalibration {
    corrections: BTreeMap<Uuid, FlatFieldCorrection>,
    lifetime_secs: i64,
}

impl FlatFieldCalibration {
    /// Empty data expiring `lifetime_secs` after calibration. Zero never expires.
    pub fn new(lifetime_secs: i64) -> Self {
        Self {
            corrections: BTreeMap::new(),
            lifetime_secs,
        }
    }

    /// Uncalibrated entries for each of `modes`
    pub fn for_modes(modes: &[ScanningMode], lifetime_secs: i64) -> Self {
        let mut calibration = Self::new(lifetime_secs);
        for mode in modes {
            calibration
                .corrections
                .insert(mode.uuid(), FlatFieldCorrection::new());
        }
        calibration
    }

    pub fn correction(&self, mode: &Uuid) -> Option<&FlatFieldCorrection> {
        self.corrections.get(mode)
    }

    pub fn insert(&mut self, mode: Uuid, correction: FlatFieldCorrection) {
        self.corrections.insert(mode, correction);
    }

    /// Oldest calibration is older than `secs`, or some mode is not calibrated at all
    fn is_expired(&self, secs: i64) -> bool {
        if self.corrections.is_empty() {
            return false;
        }

        let mut oldest: Option<DateTime<Utc>> = None;
        for correction in self.corrections.values() {
            match correction.last_calibration() {
                None => return true,
                Some(at) => {
                    if oldest.map_or(true, |oldest| at < oldest) {
                        oldest = Some(at);
                    }
                }
            }
        }

        match oldest {
            None => true,
            Some(oldest) => secs > 0 && oldest + Duration::seconds(secs) < Utc::now(),
        }
    }
}

impl CalibrationStore for FlatFieldCalibration {
    fn update_is_recommended(&self) -> bool {
        self.is_expired((self.lifetime_secs as f64 * CALIBRATION_RECOMMENDED_RATIO).round() as i64)
    }

    fn update_is_required(&self) -> bool {
        self.is_expired(self.lifetime_secs)
    }

    fn update(&mut self, mode: &Uuid, image: &[f32], dark: &[f32], width: i32) -> Result<()> {
        if width < 1 {
            return Err(bad("Bad width param"));
        }
        let width_px = width as usize;
        let height = image.len() / width_px;
        let start = (width_px * (height as f64 * 0.25).round() as usize).min(image.len());
        let len = width_px * (height as f64 * 0.5).round() as usize;
        let end = (start + len).min(image.len());

        self.corrections
            .entry(*mode)
            .or_default()
            .calibrate(&image[start..end], dark, width)
    }

    fn apply(&self, mode: &Uuid, image: &mut [f32], dark: &[f32], width: i32) -> Result<()> {
        if width < 1 || image.is_empty() || image.len() % width as usize != 0 {
            return Err(bad("Bad images sizes"));
        }
        self.corrections
            .get(mode)
            .ok_or_else(|| bad("No calibration data for scanning mode"))?
            .correct(image, dark, width)
    }
}
