//! Simulated devices.
//!
//! These drivers touch no serial line. They model the timing of the real apparatus and are
//! used for demonstrations and for running the scanner without hardware.

use log::{debug, warn};
use rand::Rng;
use serialport::ClearBuffer;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cancelation::CancelationToken;
use crate::configuration::DeviceConfiguration;
use crate::detector::{DetectorDriver, DetectorProperties, Frame};
use crate::device::{DeviceContext, DeviceDriver};
use crate::dispatcher::DispatcherParams;
use crate::error::{Result, ScannerError};
use crate::hardware::{Door, DoorState, HardwareDriver, HardwareState, RackState};
use crate::power_supply::{ButtonsLatch, PowerSupplyDriver, PowerSupplyParams, PowerSupplyResults};
use crate::transport::{PortOpener, SerialLine};
use crate::types::PixelSize;

const DEFAULT_WIDTH: i64 = 576;
const DEFAULT_PIXEL_SIZE: f64 = 0.2;
const DEFAULT_CHARGE_TIME: f64 = 3.0;

const DETECTOR_WIDTH: &str = "main/width";
const DETECTOR_CHARGE_TIME: &str = "main/charge_time";
const DETECTOR_PIXEL_SIZE: &str = "main/pixel_size";

/// Full-scale value of a simulated pixel
const FULL_SCALE: f32 = 65535.0;

/// Detector producing frames of noise near full scale
#[derive(Debug, Default)]
pub struct EmptyDetector {
    properties: DetectorProperties,
}

impl DeviceDriver for EmptyDetector {
    fn name(&self) -> String {
        "empty_detector".into()
    }

    fn default_configuration(&self) -> DeviceConfiguration {
        let mut conf = DeviceConfiguration::new();
        conf.insert(DETECTOR_WIDTH, DEFAULT_WIDTH, "Width, pixels [>0]");
        conf.insert(DETECTOR_CHARGE_TIME, DEFAULT_CHARGE_TIME, "Charge time, ms [>0.0]");
        conf.insert(DETECTOR_PIXEL_SIZE, DEFAULT_PIXEL_SIZE, "Pixel size, mm [>0.0]");
        conf
    }

    fn open(&mut self, ctx: &DeviceContext) -> Result<()> {
        let cfg = &ctx.configuration;
        let mut width = cfg.i64_or(DETECTOR_WIDTH, 0);
        let mut charge_time = cfg.f64_or(DETECTOR_CHARGE_TIME, 0.0);
        let mut pixel = cfg.f64_or(DETECTOR_PIXEL_SIZE, 0.0);

        if width < 1 {
            warn!("Width out of range");
            width = DEFAULT_WIDTH;
        }
        if charge_time <= 0.0 {
            warn!("Charge time out of range");
            charge_time = DEFAULT_CHARGE_TIME;
        }
        if pixel <= 0.0 {
            warn!("Pixel width out of range");
            pixel = DEFAULT_PIXEL_SIZE;
        }

        self.properties = DetectorProperties {
            width: width.min(i32::MAX as i64) as i32,
            pixel_size_mm: PixelSize::new(pixel, pixel),
            charge_time_ms: charge_time,
        };
        Ok(())
    }

    fn close(&mut self, _ctx: &DeviceContext) {}

    fn test_connection(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }
}

impl DetectorDriver for EmptyDetector {
    fn properties(&self) -> DetectorProperties {
        self.properties
    }

    fn prepare(&mut self, _ctx: &DeviceContext, _lines: u32) -> Result<()> {
        Ok(())
    }

    fn capture(&mut self, _ctx: &DeviceContext, lines: u32) -> Result<Frame> {
        let size = self.properties.width.max(0) as usize * lines as usize;
        let mut rng = rand::thread_rng();
        let frame: Frame = (0..size)
            .map(|_| rng.gen_range(FULL_SCALE * 0.99..=FULL_SCALE))
            .collect();
        thread::sleep(Duration::from_secs_f64(
            self.properties.charge_time_ms * lines as f64 / 1000.0,
        ));
        Ok(frame)
    }
}

/// Power supply that only waits for the exposure and the button release
#[derive(Debug, Default)]
pub struct EmptyPowerSupply;

impl DeviceDriver for EmptyPowerSupply {
    fn name(&self) -> String {
        "empty_power_supply".into()
    }

    fn open(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    fn close(&mut self, _ctx: &DeviceContext) {}

    fn test_connection(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }
}

impl PowerSupplyDriver for EmptyPowerSupply {
    fn prepare(&mut self, _ctx: &DeviceContext, _params: &PowerSupplyParams) -> Result<()> {
        Ok(())
    }

    fn on(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    fn off(&mut self, _ctx: &DeviceContext, buttons: &ButtonsLatch) -> Result<()> {
        if !buttons.wait(None) {
            return Err(ScannerError::Orchestration("Buttons are not released".into()));
        }
        Ok(())
    }

    fn results(&mut self, _ctx: &DeviceContext, params: &PowerSupplyParams) -> Result<PowerSupplyResults> {
        Ok(PowerSupplyResults {
            exposure_ms: 0,
            amperage_ma: params.amperage_ma,
            voltage_kv: params.voltage_kv,
        })
    }
}

/// Movement durations of [`EmptyHardware`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmptyHardwareTimings {
    pub door_move: Duration,
    pub rack_move: Duration,
    /// Interval between cancellation checks
    pub poll: Duration,
}

impl Default for EmptyHardwareTimings {
    fn default() -> Self {
        Self {
            door_move: Duration::from_millis(3000),
            rack_move: Duration::from_millis(6000),
            poll: Duration::from_millis(100),
        }
    }
}

/// Rack and doors that move in fixed time
#[derive(Debug, Default)]
pub struct EmptyHardware {
    timings: EmptyHardwareTimings,
    doors: BTreeMap<Door, DoorState>,
    rack: RackState,
}

impl EmptyHardware {
    pub fn with_timings(timings: EmptyHardwareTimings) -> Self {
        Self {
            timings,
            ..Default::default()
        }
    }

    /// Sleep for `duration` in `poll` steps. Returns `false` when canceled.
    fn travel(&self, duration: Duration, token: &CancelationToken) -> bool {
        let started = Instant::now();
        loop {
            thread::sleep(self.timings.poll);
            if token.is_canceled() {
                return false;
            }
            if started.elapsed() >= duration {
                return true;
            }
        }
    }

    fn move_door(&mut self, door: Door, target: DoorState, token: &CancelationToken) -> Result<()> {
        debug!("Moving door {:?} to {:?} ...", door, target);
        if !self.travel(self.timings.door_move, token) {
            debug!("Door movement has been canceled");
            self.doors.insert(door, DoorState::Unknown);
            return Err(ScannerError::Orchestration("Door movement canceled".into()));
        }
        self.doors.insert(door, target);
        Ok(())
    }

    fn move_rack(&mut self, target: RackState, token: &CancelationToken) -> Result<()> {
        debug!("Moving rack to {:?} ...", target);
        if !self.travel(self.timings.rack_move, token) {
            debug!("Rack moving has been canceled");
            self.rack = RackState::Unknown;
            return Err(ScannerError::Orchestration("Rack movement canceled".into()));
        }
        self.rack = target;
        Ok(())
    }

    fn combined_move(&mut self, door: DoorState) {
        let delay = self.timings.door_move.max(self.timings.rack_move);
        debug!("Sleep, ms: {}", delay.as_millis());
        thread::sleep(delay);
        self.doors.insert(Door::First, door);
        self.rack = RackState::Bottom;
    }
}

impl DeviceDriver for EmptyHardware {
    fn name(&self) -> String {
        "empty_hardware".into()
    }

    fn open(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    fn close(&mut self, _ctx: &DeviceContext) {}

    fn test_connection(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }
}

impl HardwareDriver for EmptyHardware {
    fn open_door(&mut self, _ctx: &DeviceContext, door: Door, token: &CancelationToken) -> Result<()> {
        self.move_door(door, DoorState::Open, token)
    }

    fn close_door(&mut self, _ctx: &DeviceContext, door: Door, token: &CancelationToken) -> Result<()> {
        self.move_door(door, DoorState::Closed, token)
    }

    fn move_rack_to_bottom(&mut self, _ctx: &DeviceContext, token: &CancelationToken) -> Result<()> {
        self.move_rack(RackState::Bottom, token)
    }

    fn move_rack_to_bottom_and_open_first_door(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.combined_move(DoorState::Open);
        Ok(())
    }

    fn move_rack_to_bottom_and_close_first_door(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.combined_move(DoorState::Closed);
        Ok(())
    }

    fn move_rack_to_top(&mut self, _ctx: &DeviceContext, token: &CancelationToken) -> Result<()> {
        self.move_rack(RackState::Top, token)
    }

    fn move_rack_up(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.rack = RackState::Unknown;
        Ok(())
    }

    fn move_rack_down(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.rack = RackState::Unknown;
        Ok(())
    }

    fn move_rack_stop(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.rack = RackState::Unknown;
        Ok(())
    }

    fn lock_remote(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    fn unlock_remote(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    fn refresh_state(&mut self, _ctx: &DeviceContext) -> HardwareState {
        HardwareState {
            doors: self.doors.clone(),
            rack: self.rack,
        }
    }

    fn press_prepare_button(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }

    fn start_scan(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.rack = RackState::Unknown;
        Ok(())
    }

    fn stop_scan(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.rack = RackState::Unknown;
        Ok(())
    }

    fn stop(&mut self, _ctx: &DeviceContext) -> Result<()> {
        self.rack = RackState::Unknown;
        Ok(())
    }
}

/// Serial line that accepts every byte and never receives any
#[derive(Debug, Default)]
pub struct NullLine {
    rts: bool,
    dtr: bool,
}

impl SerialLine for NullLine {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        Ok(bytes.len())
    }

    fn bytes_to_write(&mut self) -> Result<u32> {
        Ok(0)
    }

    fn bytes_to_read(&mut self) -> Result<u32> {
        Ok(0)
    }

    fn read(&mut self, _buffer: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn set_request_to_send(&mut self, level: bool) -> Result<()> {
        self.rts = level;
        Ok(())
    }

    fn set_data_terminal_ready(&mut self, level: bool) -> Result<()> {
        self.dtr = level;
        Ok(())
    }

    fn request_to_send(&mut self) -> Result<bool> {
        Ok(self.rts)
    }

    fn data_terminal_ready(&mut self) -> Result<bool> {
        Ok(self.dtr)
    }

    fn clear(&mut self, _buffer: ClearBuffer) -> Result<()> {
        Ok(())
    }
}

/// Opener handing out a [`NullLine`] for any port name
pub fn null_port_opener() -> PortOpener {
    Arc::new(|params: &DispatcherParams| {
        debug!("Opening null line in place of {}", params.port_name);
        Ok(Box::new(NullLine::default()) as Box<dyn SerialLine>)
    })
}
