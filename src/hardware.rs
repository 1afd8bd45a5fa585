use log::info;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cancelation::CancelationToken;
use crate::configuration::DeviceConfiguration;
use crate::device::{DeviceContext, DeviceCore, DeviceDriver, ErrorSlot, Lifecycle};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::power_supply::ButtonsLatch;
use crate::types::DeviceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Door {
    First,
    Second,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DoorState {
    #[default]
    Unknown,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RackState {
    #[default]
    Unknown,
    Bottom,
    Top,
}

/// Door and rack positions reported by the last state refresh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareState {
    pub doors: BTreeMap<Door, DoorState>,
    pub rack: RackState,
}

/// Vendor part of the rack and door mechanics.
///
/// Movements that accept a [`CancelationToken`] poll it while waiting for the movement to
/// complete and fail when it is canceled, leaving the position unknown.
pub trait HardwareDriver: DeviceDriver {
    fn open_door(&mut self, ctx: &DeviceContext, door: Door, token: &CancelationToken) -> Result<()>;

    fn close_door(&mut self, ctx: &DeviceContext, door: Door, token: &CancelationToken) -> Result<()>;

    fn move_rack_to_bottom(&mut self, ctx: &DeviceContext, token: &CancelationToken) -> Result<()>;

    fn move_rack_to_bottom_and_open_first_door(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn move_rack_to_bottom_and_close_first_door(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn move_rack_to_top(&mut self, ctx: &DeviceContext, token: &CancelationToken) -> Result<()>;

    fn move_rack_up(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn move_rack_down(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn move_rack_stop(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn lock_remote(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn unlock_remote(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn refresh_state(&mut self, ctx: &DeviceContext) -> HardwareState;

    fn press_prepare_button(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn start_scan(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn stop_scan(&mut self, ctx: &DeviceContext) -> Result<()>;

    /// Emergency halt of every movement
    fn stop(&mut self, ctx: &DeviceContext) -> Result<()>;
}

/// Rack and door mechanics
pub struct Hardware {
    core: DeviceCore<dyn HardwareDriver>,
    state: Arc<Mutex<HardwareState>>,
    scan_buttons: Option<ButtonsLatch>,
    scan_started: bool,
}

impl Hardware {
    pub fn new(driver: Box<dyn HardwareDriver>) -> Self {
        Self {
            core: DeviceCore::new(DeviceKind::Hardware, driver),
            state: Arc::new(Mutex::new(HardwareState::default())),
            scan_buttons: None,
            scan_started: false,
        }
    }

    pub fn door_state(&self, door: Door) -> DoorState {
        self.state.lock().doors.get(&door).copied().unwrap_or_default()
    }

    pub fn rack_state(&self) -> RackState {
        self.state.lock().rack
    }

    pub fn open_door(&mut self, door: Door, token: &CancelationToken) -> Result<()> {
        self.core.call(|driver, ctx| driver.open_door(ctx, door, token))
    }

    pub fn close_door(&mut self, door: Door, token: &CancelationToken) -> Result<()> {
        self.core.call(|driver, ctx| driver.close_door(ctx, door, token))
    }

    pub fn open_first_door(&mut self, token: &CancelationToken) -> Result<()> {
        self.open_door(Door::First, token)
    }

    pub fn close_first_door(&mut self, token: &CancelationToken) -> Result<()> {
        self.close_door(Door::First, token)
    }

    pub fn move_rack_to_bottom(&mut self, token: &CancelationToken) -> Result<()> {
        self.core.call(|driver, ctx| driver.move_rack_to_bottom(ctx, token))
    }

    pub fn move_rack_to_bottom_and_open_first_door(&mut self) -> Result<()> {
        self.core
            .call(|driver, ctx| driver.move_rack_to_bottom_and_open_first_door(ctx))
    }

    pub fn move_rack_to_bottom_and_close_first_door(&mut self) -> Result<()> {
        self.core
            .call(|driver, ctx| driver.move_rack_to_bottom_and_close_first_door(ctx))
    }

    pub fn move_rack_to_top(&mut self, token: &CancelationToken) -> Result<()> {
        self.core.call(|driver, ctx| driver.move_rack_to_top(ctx, token))
    }

    pub fn move_rack_up(&mut self) -> Result<()> {
        self.core.call(|driver, ctx| driver.move_rack_up(ctx))
    }

    pub fn move_rack_down(&mut self) -> Result<()> {
        self.core.call(|driver, ctx| driver.move_rack_down(ctx))
    }

    pub fn move_rack_stop(&mut self) -> Result<()> {
        self.core.call(|driver, ctx| driver.move_rack_stop(ctx))
    }

    pub fn lock_remote(&mut self) -> Result<()> {
        self.core.call(|driver, ctx| driver.lock_remote(ctx))
    }

    pub fn unlock_remote(&mut self) -> Result<()> {
        self.core.call(|driver, ctx| driver.unlock_remote(ctx))
    }

    /// Query door and rack positions into the state cache
    pub fn refresh_state(&mut self) -> Result<HardwareState> {
        let state = self.core.call(|driver, ctx| Ok(driver.refresh_state(ctx)))?;
        *self.state.lock() = state.clone();
        Ok(state)
    }

    pub fn press_prepare_button(&mut self) -> Result<()> {
        self.core.call(|driver, ctx| driver.press_prepare_button(ctx))
    }

    /// Start the scanning motion. `buttons` is armed here and released when the scan stops.
    pub fn start_scan(&mut self, buttons: ButtonsLatch) -> Result<()> {
        self.scan_started = false;
        buttons.arm();
        self.core.call(|driver, ctx| driver.start_scan(ctx))?;
        self.scan_started = true;
        self.scan_buttons = Some(buttons);
        info!("Scan started");
        Ok(())
    }

    pub fn stop_scan(&mut self) -> Result<()> {
        self.core.check_open()?;
        if !self.scan_started {
            return Err(self.core.fail("Scan is not started"));
        }

        let stopped = self.core.call(|driver, ctx| driver.stop_scan(ctx));
        if let Some(buttons) = self.scan_buttons.take() {
            buttons.release();
        }
        self.scan_started = false;
        stopped?;
        info!("Scan stopped");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.core.call(|driver, ctx| driver.stop(ctx))
    }

    fn on_closed(&mut self) {
        *self.state.lock() = HardwareState::default();
    }
}

impl Lifecycle for Hardware {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Hardware
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
    use crate::simulated::{EmptyHardware, EmptyHardwareTimings};
    use std::time::Duration;

    fn opened() -> Hardware {
        let timings = EmptyHardwareTimings {
            door_move: Duration::from_millis(30),
            rack_move: Duration::from_millis(30),
            poll: Duration::from_millis(5),
        };
        let mut hardware = Hardware::new(Box::new(EmptyHardware::with_timings(timings)));
        hardware.open(&DeviceConfiguration::new()).unwrap();
        hardware
    }

    #[test]
    fn stop_scan_without_start_fails() {
        let mut hardware = opened();
        assert!(hardware.stop_scan().is_err());
        assert_eq!(hardware.last_error(), "Scan is not started");
    }

    #[test]
    fn stop_scan_releases_buttons() {
        let mut hardware = opened();
        let latch = ButtonsLatch::new();
        hardware.start_scan(latch.clone()).unwrap();
        assert!(!latch.is_released());
        hardware.stop_scan().unwrap();
        assert!(latch.is_released());
    }

    #[test]
    fn refresh_fills_the_cache() {
        let mut hardware = opened();
        assert_eq!(hardware.door_state(Door::First), DoorState::Unknown);
        hardware.open_first_door(&CancelationToken::none()).unwrap();
        hardware.move_rack_to_top(&CancelationToken::none()).unwrap();
        hardware.refresh_state().unwrap();
        assert_eq!(hardware.door_state(Door::First), DoorState::Open);
        assert_eq!(hardware.rack_state(), RackState::Top);

        hardware.close();
        assert_eq!(hardware.rack_state(), RackState::Unknown);
    }

    #[test]
    fn closed_hardware_rejects_movements() {
        let mut hardware = Hardware::new(Box::new(EmptyHardware::default()));
        assert!(hardware.move_rack_up().is_err());
        assert_eq!(hardware.last_error(), "Device is not open");
    }
}
