//! Device lifecycle shared by detector, power supply and hardware.
//!
//! A concrete device is a [`DeviceDriver`] strategy object. The kind-specific wrappers own
//! a [`DeviceCore`] which merges configuration over the driver defaults, tracks whether the
//! device is open and records the last error. Wrappers live inside a
//! [`Worker`](crate::worker::Worker), so every lifecycle call runs on the device's own thread.

use log::{error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::configuration::DeviceConfiguration;
use crate::dispatcher::{Accessor, Dispatcher};
use crate::error::{Result, ScannerError};
use crate::types::DeviceKind;

/// Last error message of a device, readable from any thread
#[derive(Debug, Clone, Default)]
pub struct ErrorSlot(Arc<Mutex<String>>);

impl ErrorSlot {
    pub fn get(&self) -> String {
        self.0.lock().clone()
    }

    pub fn set(&self, message: &str) {
        *self.0.lock() = message.to_string();
    }
}

/// What a driver sees of its device
pub struct DeviceContext {
    /// Driver defaults overlaid with the configuration the device was opened with
    pub configuration: DeviceConfiguration,
    dispatcher: Option<Dispatcher>,
}

impl DeviceContext {
    pub fn dispatcher(&self) -> Result<&Dispatcher> {
        self.dispatcher
            .as_ref()
            .ok_or_else(|| ScannerError::NotOpen("Dispatcher".into()))
    }

    /// Accessor for `address` on the shared line
    pub fn accessor(&self, address: u8) -> Result<Accessor> {
        Ok(self.dispatcher()?.accessor(address))
    }
}

/// Lifecycle hooks every driver implements
pub trait DeviceDriver: Send {
    fn name(&self) -> String;

    fn default_configuration(&self) -> DeviceConfiguration {
        DeviceConfiguration::new()
    }

    fn open(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn close(&mut self, ctx: &DeviceContext);

    fn test_connection(&mut self, ctx: &DeviceContext) -> Result<()>;

    fn reset(&mut self, _ctx: &DeviceContext) -> Result<()> {
        Ok(())
    }
}

/// Open/close bookkeeping around a driver
pub struct DeviceCore<D: ?Sized> {
    kind: DeviceKind,
    ctx: DeviceContext,
    errors: ErrorSlot,
    is_open: bool,
    driver: Box<D>,
}

impl<D: DeviceDriver + ?Sized> DeviceCore<D> {
    pub fn new(kind: DeviceKind, driver: Box<D>) -> Self {
        Self {
            kind,
            ctx: DeviceContext {
                configuration: DeviceConfiguration::new(),
                dispatcher: None,
            },
            errors: ErrorSlot::default(),
            is_open: false,
            driver,
        }
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.driver.name()
    }

    pub fn set_dispatcher(&mut self, dispatcher: Dispatcher) {
        info!("Set dispatcher for {}", self.kind);
        self.ctx.dispatcher = Some(dispatcher);
    }

    pub fn errors(&self) -> ErrorSlot {
        self.errors.clone()
    }

    pub fn last_error(&self) -> String {
        self.errors.get()
    }

    pub fn is_open(&self) -> bool {
        self.is_open
    }

    pub fn configuration(&self) -> &DeviceConfiguration {
        &self.ctx.configuration
    }

    pub fn default_configuration(&self) -> DeviceConfiguration {
        self.driver.default_configuration()
    }

    /// Record `message` as the last error and build the matching error value
    pub fn fail(&self, message: impl Into<String>) -> ScannerError {
        let message = message.into();
        error!("{}: {}", self.kind, message);
        self.errors.set(&message);
        ScannerError::device(self.kind, message)
    }

    /// Record an error returned by the driver
    pub fn record(&self, err: ScannerError) -> ScannerError {
        self.fail(err.detail())
    }

    pub fn check_open(&self) -> Result<()> {
        if self.is_open {
            Ok(())
        } else {
            Err(self.fail("Device is not open"))
        }
    }

    fn merged(&self, configuration: &DeviceConfiguration) -> DeviceConfiguration {
        let mut merged = self.driver.default_configuration();
        merged.replace_values(configuration, true);
        merged
    }

    fn start(&mut self) -> Result<()> {
        match self.driver.open(&self.ctx) {
            Ok(()) => {
                self.is_open = true;
                Ok(())
            }
            Err(e) => {
                error!("Failed to open {}", self.kind);
                Err(self.record(e))
            }
        }
    }

    pub fn open(&mut self, configuration: &DeviceConfiguration) -> Result<()> {
        info!("Trying to open {}", self.kind);
        if self.is_open {
            return Err(self.fail("Device is already open"));
        }

        self.ctx.configuration = self.merged(configuration);
        self.start()?;
        info!("{} successfully opened", self.kind);
        Ok(())
    }

    /// Reopen with a new configuration. Returns `false` when the device was already open
    /// with an identical configuration and nothing was done.
    pub fn reopen(&mut self, configuration: &DeviceConfiguration) -> Result<bool> {
        info!("Trying to reopen {}", self.kind);
        let merged = self.merged(configuration);

        if self.is_open {
            if merged == self.ctx.configuration {
                info!("Device configurations matching. Do nothing");
                return Ok(false);
            }
            info!("Device configurations mismatch. Closing {}", self.kind);
            self.driver.close(&self.ctx);
            self.is_open = false;
        }

        self.ctx.configuration = merged;
        self.start()?;
        info!("{} successfully reopened", self.kind);
        Ok(true)
    }

    /// Returns `false` when the device was not open
    pub fn close(&mut self) -> bool {
        info!("Trying to close {}", self.kind);
        if !self.is_open {
            warn!("{} is not open yet", self.kind);
            return false;
        }

        self.driver.close(&self.ctx);
        self.is_open = false;
        info!("{} successfully closed", self.kind);
        true
    }

    pub fn reset(&mut self) -> Result<()> {
        info!("Trying to reset {}", self.kind);
        self.check_open()?;
        self.driver.reset(&self.ctx).map_err(|e| self.record(e))?;
        info!("{} successfully reset", self.kind);
        Ok(())
    }

    pub fn test_connection(&mut self) -> Result<()> {
        self.check_open()?;
        self.driver
            .test_connection(&self.ctx)
            .map_err(|e| self.record(e))
    }

    /// Run a kind-specific driver operation on an open device, recording its error
    pub fn call<R>(&mut self, f: impl FnOnce(&mut D, &DeviceContext) -> Result<R>) -> Result<R> {
        self.check_open()?;
        match f(&mut *self.driver, &self.ctx) {
            Ok(value) => Ok(value),
            Err(e) => Err(self.record(e)),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }
}

/// Uniform lifecycle used by the scanner for all three device kinds
pub trait Lifecycle: Send {
    fn kind(&self) -> DeviceKind;

    fn set_dispatcher(&mut self, dispatcher: Dispatcher);

    fn open(&mut self, configuration: &DeviceConfiguration) -> Result<()>;

    fn reopen(&mut self, configuration: &DeviceConfiguration) -> Result<()>;

    fn close(&mut self);

    fn reset(&mut self) -> Result<()>;

    fn test_connection(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn last_error(&self) -> String;

    fn errors(&self) -> ErrorSlot;

    fn default_configuration(&self) -> DeviceConfiguration;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingDriver {
        opens: usize,
        closes: usize,
        fail_open: bool,
    }

    impl DeviceDriver for CountingDriver {
        fn name(&self) -> String {
            "counting".into()
        }

        fn default_configuration(&self) -> DeviceConfiguration {
            let mut config = DeviceConfiguration::new();
            config.insert("main/width", 100, "Width");
            config
        }

        fn open(&mut self, _ctx: &DeviceContext) -> Result<()> {
            if self.fail_open {
                return Err(ScannerError::Transport("no answer".into()));
            }
            self.opens += 1;
            Ok(())
        }

        fn close(&mut self, _ctx: &DeviceContext) {
            self.closes += 1;
        }

        fn test_connection(&mut self, _ctx: &DeviceContext) -> Result<()> {
            Ok(())
        }
    }

    fn core() -> DeviceCore<CountingDriver> {
        DeviceCore::new(
            DeviceKind::Detector,
            Box::new(CountingDriver {
                opens: 0,
                closes: 0,
                fail_open: false,
            }),
        )
    }

    fn width(value: i64) -> DeviceConfiguration {
        let mut config = DeviceConfiguration::new();
        config.insert("main/width", value, "");
        config.insert("unknown", 1, "");
        config
    }

    #[test]
    fn open_merges_over_defaults() {
        let mut core = core();
        core.open(&width(640)).unwrap();
        assert!(core.is_open());
        assert_eq!(core.configuration().i64_or("main/width", 0), 640);
        assert!(core.configuration().item("unknown").is_none());
        assert_eq!(core.configuration().description("main/width"), Some("Width"));
    }

    #[test]
    fn second_open_fails() {
        let mut core = core();
        core.open(&width(640)).unwrap();
        let err = core.open(&width(640)).unwrap_err();
        assert_eq!(err.to_string(), "Detector error. Device is already open");
        assert_eq!(core.last_error(), "Device is already open");
    }

    #[test]
    fn reopen_with_same_configuration_does_nothing() {
        let mut core = core();
        core.open(&width(640)).unwrap();
        assert!(!core.reopen(&width(640)).unwrap());
        assert_eq!(core.driver().opens, 1);

        assert!(core.reopen(&width(320)).unwrap());
        assert_eq!(core.driver().opens, 2);
        assert_eq!(core.driver().closes, 1);
    }

    #[test]
    fn closed_device_rejects_operations() {
        let mut core = core();
        assert!(!core.close());
        let err = core.test_connection().unwrap_err();
        assert_eq!(core.last_error(), "Device is not open");
        assert!(matches!(err, ScannerError::Device { kind: DeviceKind::Detector, .. }));
        assert!(core.reset().is_err());
    }

    #[test]
    fn driver_failure_is_recorded() {
        let mut core = DeviceCore::new(
            DeviceKind::Hardware,
            Box::new(CountingDriver {
                opens: 0,
                closes: 0,
                fail_open: true,
            }),
        );
        let err = core.open(&DeviceConfiguration::new()).unwrap_err();
        assert_eq!(err.to_string(), "Hardware error. no answer");
        assert!(!core.is_open());
    }
}
