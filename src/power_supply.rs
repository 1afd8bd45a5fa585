use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::configuration::DeviceConfiguration;
use crate::device::{DeviceContext, DeviceCore, DeviceDriver, ErrorSlot, Lifecycle};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::types::DeviceKind;

/// Smallest accepted voltage and amperage
pub const MIN_SETTING: f64 = 0.01;

/// Requested exposure
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerSupplyParams {
    pub exposure_ms: u16,
    pub amperage_ma: f64,
    pub voltage_kv: f64,
}

/// Exposure actually delivered
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PowerSupplyResults {
    pub exposure_ms: u16,
    pub amperage_ma: f64,
    pub voltage_kv: f64,
}

/// Signal from the hardware that the operator buttons have been released
#[derive(Debug, Clone, Default)]
pub struct ButtonsLatch {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ButtonsLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget an earlier release
    pub fn arm(&self) {
        *self.inner.0.lock() = false;
    }

    pub fn release(&self) {
        let (released, condvar) = &*self.inner;
        *released.lock() = true;
        condvar.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.inner.0.lock()
    }

    /// Block until released. `None` waits without limit. Returns whether the release
    /// happened.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let (released, condvar) = &*self.inner;
        let mut guard = released.lock();
        match timeout {
            None => {
                while !*guard {
                    condvar.wait(&mut guard);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*guard {
                    if condvar.wait_until(&mut guard, deadline).timed_out() {
                        break;
                    }
                }
                *guard
            }
        }
    }
}

/// Vendor part of a high-voltage power supply
pub trait PowerSupplyDriver: DeviceDriver {
    fn prepare(&mut self, ctx: &DeviceContext, params: &PowerSupplyParams) -> Result<()>;

    fn on(&mut self, ctx: &DeviceContext) -> Result<()>;

    /// Watch the energised supply. Returns a description of an error that occurred during
    /// the exposure.
    fn wait_for_error(&mut self, _ctx: &DeviceContext, params: &PowerSupplyParams) -> Option<String> {
        thread::sleep(Duration::from_millis(params.exposure_ms as u64));
        None
    }

    fn off(&mut self, ctx: &DeviceContext, buttons: &ButtonsLatch) -> Result<()>;

    fn results(&mut self, ctx: &DeviceContext, params: &PowerSupplyParams) -> Result<PowerSupplyResults>;
}

type ToggleListener = Arc<dyn Fn(bool) + Send + Sync>;

/// High-voltage power supply
pub struct PowerSupply {
    core: DeviceCore<dyn PowerSupplyDriver>,
    params: PowerSupplyParams,
    results: Arc<Mutex<PowerSupplyResults>>,
    is_on: bool,
    prepared: bool,
    buttons: ButtonsLatch,
    last_run: Duration,
    on_toggled: Option<ToggleListener>,
}

impl PowerSupply {
    pub fn new(driver: Box<dyn PowerSupplyDriver>) -> Self {
        Self {
            core: DeviceCore::new(DeviceKind::PowerSupply, driver),
            params: PowerSupplyParams::default(),
            results: Arc::new(Mutex::new(PowerSupplyResults::default())),
            is_on: false,
            prepared: false,
            buttons: ButtonsLatch::new(),
            last_run: Duration::ZERO,
            on_toggled: None,
        }
    }

    /// Called with `true` when the supply is energised and `false` when it is switched off
    pub fn set_on_toggled(&mut self, listener: impl Fn(bool) + Send + Sync + 'static) {
        self.on_toggled = Some(Arc::new(listener));
    }

    /// Latch released by the hardware at the end of a scan
    pub fn buttons(&self) -> ButtonsLatch {
        self.buttons.clone()
    }

    pub fn results(&self) -> PowerSupplyResults {
        *self.results.lock()
    }

    pub fn current_params(&self) -> PowerSupplyParams {
        self.params
    }

    pub fn is_on(&self) -> bool {
        self.is_on
    }

    fn toggled(&self, on: bool) {
        if let Some(listener) = &self.on_toggled {
            listener(on);
        }
    }

    pub fn prepare(&mut self, params: PowerSupplyParams) -> Result<()> {
        self.core.check_open()?;
        if self.is_on {
            return Err(self.core.fail("Power supply is already on"));
        }
        if params.voltage_kv < MIN_SETTING {
            return Err(self.core.fail("Invalid voltage value"));
        }
        if params.amperage_ma < MIN_SETTING {
            return Err(self.core.fail("Invalid amperage value"));
        }
        if params.exposure_ms < 1 {
            return Err(self.core.fail("Invalid exposure time"));
        }

        self.params = params;
        self.prepared = false;
        self.core.call(|driver, ctx| driver.prepare(ctx, &params))?;
        self.prepared = true;
        debug!(
            "Power supply prepared: {} kV, {} mA, {} ms",
            params.voltage_kv, params.amperage_ma, params.exposure_ms
        );
        Ok(())
    }

    /// Switch on, hold for the exposure and switch off
    pub fn launch(&mut self) -> Result<()> {
        self.core.check_open()?;
        if self.is_on {
            return Err(self.core.fail("Power supply is already on"));
        }
        if !self.prepared {
            return Err(self.core.fail("Power supply is not ready"));
        }

        self.prepared = false;
        self.core.call(|driver, ctx| driver.on(ctx))?;
        self.is_on = true;
        let started = Instant::now();
        info!("X-ray on");
        self.toggled(true);

        let params = self.params;
        let exposure_error = self
            .core
            .call(|driver, ctx| Ok(driver.wait_for_error(ctx, &params)))?;

        let buttons = self.buttons.clone();
        self.core.call(|driver, ctx| driver.off(ctx, &buttons))?;
        self.is_on = false;
        self.last_run = started.elapsed();
        info!("X-ray off after {} ms", self.last_run.as_millis());
        self.toggled(false);

        match exposure_error {
            Some(message) => Err(self.core.fail(message)),
            None => Ok(()),
        }
    }

    /// Fetch what the last exposure actually delivered
    pub fn get_results(&mut self) -> Result<PowerSupplyResults> {
        self.core.check_open()?;
        if self.is_on {
            return Err(self.core.fail("Power supply is still on"));
        }

        let params = self.params;
        let mut results = self.core.call(|driver, ctx| driver.results(ctx, &params))?;
        if results.exposure_ms == 0 {
            results.exposure_ms = self.last_run.as_millis().min(u16::MAX as u128) as u16;
        }
        *self.results.lock() = results;
        Ok(results)
    }

    fn on_closed(&mut self) {
        self.is_on = false;
        self.prepared = false;
        self.buttons.arm();
    }
}

impl Lifecycle for PowerSupply {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PowerSupply
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
    use std::sync::atomic::{AtomicBool, Ordering};

    struct InstantSupply {
        report_error: bool,
    }

    const HOLD_MS: u64 = 20;

    impl DeviceDriver for InstantSupply {
        fn name(&self) -> String {
            "instant".into()
        }
        fn open(&mut self, _ctx: &DeviceContext) -> Result<()> {
            Ok(())
        }
        fn close(&mut self, _ctx: &DeviceContext) {}
        fn test_connection(&mut self, _ctx: &DeviceContext) -> Result<()> {
            Ok(())
        }
    }

    impl PowerSupplyDriver for InstantSupply {
        fn prepare(&mut self, _ctx: &DeviceContext, _params: &PowerSupplyParams) -> Result<()> {
            Ok(())
        }
        fn on(&mut self, _ctx: &DeviceContext) -> Result<()> {
            Ok(())
        }
        fn wait_for_error(
            &mut self,
            _ctx: &DeviceContext,
            _params: &PowerSupplyParams,
        ) -> Option<String> {
            if self.report_error {
                return Some("Arc detected".into());
            }
            thread::sleep(Duration::from_millis(HOLD_MS));
            None
        }
        fn off(&mut self, _ctx: &DeviceContext, _buttons: &ButtonsLatch) -> Result<()> {
            Ok(())
        }
        fn results(
            &mut self,
            _ctx: &DeviceContext,
            params: &PowerSupplyParams,
        ) -> Result<PowerSupplyResults> {
            Ok(PowerSupplyResults {
                exposure_ms: 0,
                amperage_ma: params.amperage_ma,
                voltage_kv: params.voltage_kv,
            })
        }
    }

    fn opened(report_error: bool) -> PowerSupply {
        let mut supply = PowerSupply::new(Box::new(InstantSupply { report_error }));
        supply.open(&DeviceConfiguration::new()).unwrap();
        supply
    }

    fn params() -> PowerSupplyParams {
        PowerSupplyParams {
            exposure_ms: 100,
            amperage_ma: 0.5,
            voltage_kv: 120.0,
        }
    }

    #[test]
    fn prepare_validates_settings() {
        let mut supply = opened(false);
        let cases = [
            (PowerSupplyParams { voltage_kv: 0.0, ..params() }, "Invalid voltage value"),
            (PowerSupplyParams { amperage_ma: 0.001, ..params() }, "Invalid amperage value"),
            (PowerSupplyParams { exposure_ms: 0, ..params() }, "Invalid exposure time"),
        ];
        for (bad, message) in cases {
            assert!(supply.prepare(bad).is_err());
            assert_eq!(supply.last_error(), message);
        }
        supply.prepare(params()).unwrap();
    }

    #[test]
    fn launch_requires_preparation() {
        let mut supply = opened(false);
        assert!(supply.launch().is_err());
        assert_eq!(supply.last_error(), "Power supply is not ready");
    }

    #[test]
    fn launch_toggles_and_substitutes_exposure() {
        let mut supply = opened(false);
        let seen_on = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&seen_on);
        supply.set_on_toggled(move |on| {
            if on {
                flag.store(true, Ordering::SeqCst);
            }
        });

        supply.prepare(params()).unwrap();
        supply.launch().unwrap();
        assert!(seen_on.load(Ordering::SeqCst));
        assert!(!supply.is_on());

        let results = supply.get_results().unwrap();
        assert_eq!(results.voltage_kv, 120.0);
        assert!(results.exposure_ms >= HOLD_MS as u16);
        assert_eq!(supply.results(), results);
    }

    #[test]
    fn exposure_error_fails_launch_after_switching_off() {
        let mut supply = opened(true);
        supply.prepare(params()).unwrap();
        let err = supply.launch().unwrap_err();
        assert_eq!(err.to_string(), "Power supply error. Arc detected");
        assert!(!supply.is_on());
    }

    #[test]
    fn latch_wakes_waiter() {
        let latch = ButtonsLatch::new();
        let waiter = latch.clone();
        let handle = thread::spawn(move || waiter.wait(Some(Duration::from_secs(2))));
        thread::sleep(Duration::from_millis(20));
        latch.release();
        assert!(handle.join().unwrap());

        latch.arm();
        assert!(!latch.wait(Some(Duration::from_millis(10))));
    }
}
