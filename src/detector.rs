use log::debug;
use serde::{Deserialize, Serialize};

use crate::configuration::DeviceConfiguration;
use crate::device::{DeviceContext, DeviceCore, DeviceDriver, ErrorSlot, Lifecycle};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::types::{DeviceKind, PixelSize};

/// Captured lines, row-major, `width` values per line
pub type Frame = Vec<f32>;

/// Geometry and timing of a line detector
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectorProperties {
    pub width: i32,
    pub pixel_size_mm: PixelSize,
    /// Charge time of one line
    pub charge_time_ms: f64,
}

impl DetectorProperties {
    /// Lines needed to cover `height_mm`. Zero pixel height yields zero lines.
    pub fn lines_for_height(&self, height_mm: f64) -> u32 {
        if self.pixel_size_mm.height <= 0.0 {
            return 0;
        }
        (height_mm / self.pixel_size_mm.height).ceil() as u32
    }

    /// Exposure needed to charge `lines` lines
    pub fn exposure_ms(&self, lines: u32) -> u16 {
        (lines as f64 * self.charge_time_ms).ceil().min(u16::MAX as f64) as u16
    }
}

/// Vendor part of a line detector
pub trait DetectorDriver: DeviceDriver {
    /// Valid once the device is open
    fn properties(&self) -> DetectorProperties;

    fn prepare(&mut self, ctx: &DeviceContext, lines: u32) -> Result<()>;

    /// Capture exactly `lines` lines
    fn capture(&mut self, ctx: &DeviceContext, lines: u32) -> Result<Frame>;
}

/// Line detector
pub struct Detector {
    core: DeviceCore<dyn DetectorDriver>,
    lines: u32,
    prepared: bool,
    last_frame: Frame,
}

impl Detector {
    pub fn new(driver: Box<dyn DetectorDriver>) -> Self {
        Self {
            core: DeviceCore::new(DeviceKind::Detector, driver),
            lines: 0,
            prepared: false,
            last_frame: Frame::new(),
        }
    }

    pub fn properties(&self) -> DetectorProperties {
        self.core.driver().properties()
    }

    pub fn current_lines(&self) -> u32 {
        self.lines
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    pub fn last_captured_frame(&self) -> &Frame {
        &self.last_frame
    }

    pub fn prepare(&mut self, lines: u32) -> Result<()> {
        self.core.check_open()?;
        if lines < 1 {
            return Err(self.core.fail("Invalid number of lines"));
        }

        self.lines = lines;
        self.prepared = false;
        self.core.call(|driver, ctx| driver.prepare(ctx, lines))?;
        self.prepared = true;
        debug!("Detector prepared for {} lines", lines);
        Ok(())
    }

    /// Capture the prepared number of lines. A capture consumes the preparation.
    pub fn capture(&mut self) -> Result<()> {
        self.core.check_open()?;
        if !self.prepared {
            return Err(self.core.fail("Detector is not ready"));
        }

        self.prepared = false;
        let lines = self.lines;
        let frame = self.core.call(|driver, ctx| driver.capture(ctx, lines))?;
        debug!("Detector captured {} values", frame.len());
        self.last_frame = frame;
        Ok(())
    }

    fn on_closed(&mut self) {
        self.prepared = false;
    }
}

impl Lifecycle for Detector {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Detector
    }

    fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        self.core.set_dispatcher(dispatcher);
    }

    fn open(&mut self, configuration: &DeviceConfiguration) -> Result<()> {
        self.core.open(configuration)
    }

    fn reopen(&mut self, configuration: &DeviceConfiguration) -> Result<()> {
        let was_open = self.core.is_open();
        let result = self.core.reopen(configuration);
        if was_open && !matches!(result, Ok(false)) {
            self.on_closed();
        }
        result.map(|_| ())
    }

    fn close(&mut self) {
        if self.core.close() {
            self.on_closed();
        }
    }

    fn reset(&mut self) -> Result<()> {
        self.core.reset()
    }

    fn test_connection(&mut self) -> Result<()> {
        self.core.test_connection()
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn last_error(&self) -> String {
        self.core.last_error()
    }

    fn errors(&self) -> ErrorSlot {
        self.core.errors()
    }

    fn default_configuration(&self) -> DeviceConfiguration {
        self.core.default_configuration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedDetector;

    impl DeviceDriver for FixedDetector {
        fn name(&self) -> String {
            "fixed".into()
        }
        fn open(&mut self, _ctx: &DeviceContext) -> Result<()> {
            Ok(())
        }
        fn close(&mut self, _ctx: &DeviceContext) {}
        fn test_connection(&mut self, _ctx: &DeviceContext) -> Result<()> {
            Ok(())
        }
    }

    impl DetectorDriver for FixedDetector {
        fn properties(&self) -> DetectorProperties {
            DetectorProperties {
                width: 4,
                pixel_size_mm: PixelSize::new(0.5, 0.5),
                charge_time_ms: 1.5,
            }
        }
        fn prepare(&mut self, _ctx: &DeviceContext, _lines: u32) -> Result<()> {
            Ok(())
        }
        fn capture(&mut self, _ctx: &DeviceContext, lines: u32) -> Result<Frame> {
            Ok(vec![1.0; 4 * lines as usize])
        }
    }

    fn opened() -> Detector {
        let mut detector = Detector::new(Box::new(FixedDetector));
        detector.open(&DeviceConfiguration::new()).unwrap();
        detector
    }

    #[test]
    fn height_to_lines_and_exposure() {
        let props = FixedDetector.properties();
        assert_eq!(props.lines_for_height(10.0), 20);
        assert_eq!(props.lines_for_height(10.1), 21);
        assert_eq!(props.exposure_ms(21), 32);

        let degenerate = DetectorProperties::default();
        assert_eq!(degenerate.lines_for_height(100.0), 0);
    }

    #[test]
    fn capture_consumes_preparation() {
        let mut detector = opened();
        detector.prepare(3).unwrap();
        detector.capture().unwrap();
        assert_eq!(detector.last_captured_frame().len(), 12);

        let err = detector.capture().unwrap_err();
        assert_eq!(err.to_string(), "Detector error. Detector is not ready");
    }

    #[test]
    fn zero_lines_rejected() {
        let mut detector = opened();
        assert!(detector.prepare(0).is_err());
        assert_eq!(detector.last_error(), "Invalid number of lines");
    }

    #[test]
    fn closing_clears_preparation() {
        let mut detector = opened();
        detector.prepare(2).unwrap();
        detector.close();
        detector.open(&DeviceConfiguration::new()).unwrap();
        assert!(!detector.is_prepared());
    }
}
