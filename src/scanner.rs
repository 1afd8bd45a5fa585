//! Acquisition orchestration.
//!
//! The [`Scanner`] owns one worker thread per device plus the dispatcher and drives them
//! through the acquisition and calibration sequences:
//!
//! ```text
//! Unknown --open--> Idle --make_acquisition--> Prepare -> Acquisition -> Finalization -> Idle
//!                    |  \--make_calibration--> Calibration ----------------------------> Idle
//!                    |
//!                    +-- any failed step -----> Error --reset--> Idle
//! ```
//!
//! Entering `Idle` while the tube is still cooling down yields `Overheat` instead. A timer
//! then polls the cooldown every second and moves on to `Idle` once it has expired.
//!
//! All operations take `&self`. Orchestration is serialized by an internal lock; state, last
//! error, last result, X-ray flag and cooldown can be read from any thread at any time.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::calibration::{CalibrationStore, FlatFieldCalibration};
use crate::cancelation::CancelationToken;
use crate::configuration::DeviceConfiguration;
use crate::constants::*;
use crate::cooldown::CooldownLedger;
use crate::detector::{Detector, DetectorProperties, Frame};
use crate::device::Lifecycle;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, ScannerError};
use crate::hardware::{Door, Hardware, RackState};
use crate::plugins::PluginRegistry;
use crate::power_supply::{ButtonsLatch, PowerSupply, PowerSupplyParams};
use crate::scanning_modes::{ScanningMode, ScanningModesCollection};
use crate::settings::ScannerSettings;
use crate::transport::{system_port_opener, PortOpener};
use crate::types::{AcquisitionParams, AcquisitionResult, DeviceKind, ScannerEvent, ScannerState};
use crate::worker::{Outcome, Worker};

/// Rack rollback time: the upward travel minus `alpha` ms (when longer than `alpha`),
/// scaled by `beta`
pub fn rollback_duration(moving: Duration, alpha: u16, beta: f64) -> Duration {
    let mut millis = moving.as_millis().min(i64::MAX as u128) as i64;
    if millis > alpha as i64 {
        millis -= alpha as i64;
    }
    let scaled = (millis as f64 * beta).max(0.0);
    Duration::from_millis(scaled as u64)
}

/// State readable without the orchestration lock
struct Shared {
    state: AtomicI8,
    xray_on: AtomicBool,
    last_error: Mutex<String>,
    last_result: Mutex<AcquisitionResult>,
    cooldown: Mutex<CooldownLedger>,
    subscribers: Mutex<Vec<Sender<ScannerEvent>>>,
    overheat_timer: Mutex<Option<Sender<()>>>,
}

impl Shared {
    fn state(&self) -> ScannerState {
        ScannerState::from_i8(self.state.load(Ordering::SeqCst))
    }

    fn emit(&self, event: ScannerEvent) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn secs_to_cooldown(&self) -> u32 {
        self.cooldown.lock().secs_to_cooldown()
    }

    fn set_last_error(&self, message: &str) {
        error!("{}", message);
        *self.last_error.lock() = message.to_string();
        self.emit(ScannerEvent::ErrorOccurred(message.to_string()));
    }

    fn set_state(self: &Arc<Self>, requested: ScannerState) {
        let mut state = requested;
        if state == ScannerState::Idle && self.secs_to_cooldown() > 0 {
            state = ScannerState::Overheat;
        }

        let previous = ScannerState::from_i8(self.state.swap(state.as_i8(), Ordering::SeqCst));
        if previous == state {
            return;
        }

        debug!("Change scanner state from {} to {}", previous, state);
        self.emit(ScannerEvent::StateChanged(state));
        if state == ScannerState::Overheat {
            self.start_overheat_timer();
        } else {
            self.stop_overheat_timer();
        }
    }

    /// Leave `Overheat` for `Idle` once the tube has cooled. Any other state is kept, so a
    /// transition made in the meantime wins.
    fn demote_overheat(&self) -> bool {
        if self.secs_to_cooldown() > 0 {
            return false;
        }
        let demoted = self
            .state
            .compare_exchange(
                ScannerState::Overheat.as_i8(),
                ScannerState::Idle.as_i8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if demoted {
            debug!("Change scanner state from Overheat to Idle");
            self.emit(ScannerEvent::StateChanged(ScannerState::Idle));
            self.stop_overheat_timer();
        }
        demoted
    }

    fn start_overheat_timer(self: &Arc<Self>) {
        let (stop, stopped) = mpsc::channel::<()>();
        let shared: Weak<Shared> = Arc::downgrade(self);
        let interval = Duration::from_millis(OVERHEAT_POLL_INTERVAL_MS);

        let spawned = thread::Builder::new()
            .name("overheat".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(shared) = shared.upgrade() else {
                            break;
                        };
                        shared.demote_overheat();
                    }
                    _ => break,
                }
            });

        match spawned {
            Ok(_) => *self.overheat_timer.lock() = Some(stop),
            Err(e) => error!("Failed to start overheat timer: {}", e),
        }
    }

    fn stop_overheat_timer(&self) {
        self.overheat_timer.lock().take();
    }
}

/// Driver names, used to look up per-device configuration in a scanning mode
struct DeviceNames {
    detector: String,
    power_supply: String,
    hardware: String,
}

impl DeviceNames {
    fn configuration(&self, mode: &ScanningMode, kind: DeviceKind) -> DeviceConfiguration {
        let name = match kind {
            DeviceKind::Detector => &self.detector,
            DeviceKind::PowerSupply => &self.power_supply,
            DeviceKind::Hardware => &self.hardware,
        };
        mode.device_configuration(name)
    }
}

type DeviceOutcomes = Vec<(DeviceKind, Outcome<Result<()>>)>;

/// Dispatcher and device workers of an opened scanner
struct Devices {
    dispatcher: Dispatcher,
    detector: Worker<Detector>,
    power_supply: Worker<PowerSupply>,
    hardware: Worker<Hardware>,
    buttons: ButtonsLatch,
    names: Arc<DeviceNames>,
}

impl Devices {
    /// Run `f` on every device concurrently
    fn each<F>(&self, f: F) -> DeviceOutcomes
    where
        F: Fn(DeviceKind, &mut dyn Lifecycle) -> Result<()> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let (detector, power_supply, hardware) = (Arc::clone(&f), Arc::clone(&f), f);
        vec![
            (
                DeviceKind::Detector,
                self.detector
                    .run(move |device| detector(DeviceKind::Detector, device)),
            ),
            (
                DeviceKind::PowerSupply,
                self.power_supply
                    .run(move |device| power_supply(DeviceKind::PowerSupply, device)),
            ),
            (
                DeviceKind::Hardware,
                self.hardware
                    .run(move |device| hardware(DeviceKind::Hardware, device)),
            ),
        ]
    }

    fn properties(&self) -> Result<DetectorProperties> {
        self.detector.run(|detector| detector.properties()).result()
    }
}

/// State guarded by the orchestration lock
struct Core {
    settings: ScannerSettings,
    registry: PluginRegistry,
    opener: PortOpener,
    devices: Option<Devices>,
}

/// X-ray scanner
pub struct Scanner {
    shared: Arc<Shared>,
    core: Mutex<Core>,
    // Held only for single lookups, never across a device call
    modes: Mutex<ScanningModesCollection>,
    calibration: Mutex<Box<dyn CalibrationStore>>,
}

impl Scanner {
    /// Scanner using real serial ports. Fails on invalid settings or an unreadable
    /// run-state file.
    pub fn new(
        settings: ScannerSettings,
        modes: ScanningModesCollection,
        registry: PluginRegistry,
    ) -> Result<Self> {
        settings.validate()?;

        let cooldown = match &settings.run_state_path {
            Some(path) => CooldownLedger::open(
                path,
                settings.cooling_rate_watt_sec,
                settings.cooling_threshold_sec,
            )?,
            None => CooldownLedger::in_memory(
                settings.cooling_rate_watt_sec,
                settings.cooling_threshold_sec,
            ),
        };
        let calibration =
            FlatFieldCalibration::for_modes(&modes.list(true, false), settings.calibration_lifetime_sec);

        Ok(Self {
            shared: Arc::new(Shared {
                state: AtomicI8::new(ScannerState::Unknown.as_i8()),
                xray_on: AtomicBool::new(false),
                last_error: Mutex::new(String::new()),
                last_result: Mutex::new(AcquisitionResult::default()),
                cooldown: Mutex::new(cooldown),
                subscribers: Mutex::new(Vec::new()),
                overheat_timer: Mutex::new(None),
            }),
            core: Mutex::new(Core {
                settings,
                registry,
                opener: system_port_opener(),
                devices: None,
            }),
            modes: Mutex::new(modes),
            calibration: Mutex::new(Box::new(calibration)),
        })
    }

    /// Open the dispatcher port with `opener` instead of a real serial port
    pub fn with_port_opener(mut self, opener: PortOpener) -> Self {
        self.core.get_mut().opener = opener;
        self
    }

    pub fn with_calibration(mut self, calibration: Box<dyn CalibrationStore>) -> Self {
        *self.calibration.get_mut() = calibration;
        self
    }

    pub fn state(&self) -> ScannerState {
        self.shared.state()
    }

    pub fn last_error(&self) -> String {
        self.shared.last_error.lock().clone()
    }

    pub fn last_acquisition_result(&self) -> AcquisitionResult {
        self.shared.last_result.lock().clone()
    }

    pub fn is_xray_on(&self) -> bool {
        self.shared.xray_on.load(Ordering::SeqCst)
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<ScannerEvent> {
        let (sender, receiver) = mpsc::channel();
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    /// Seconds before the tube has cooled down enough for the next exposure
    pub fn secs_to_cooldown(&self) -> u32 {
        self.shared.secs_to_cooldown()
    }

    /// Record an exposure in the thermal bookkeeping
    pub fn accumulate_released_power(&self, kv: f64, ma: f64, exposure_ms: u16) -> Result<()> {
        self.shared.cooldown.lock().accumulate(kv, ma, exposure_ms)
    }

    /// Enabled scanning modes in acquisition order. Does not wait for a running acquisition.
    pub fn scanning_modes(&self) -> Vec<ScanningMode> {
        self.modes.lock().list(true, true)
    }

    pub fn calibration_update_is_recommended(&self) -> bool {
        self.calibration.lock().update_is_recommended()
    }

    fn fail(&self, message: impl Into<String>) -> ScannerError {
        let message = message.into();
        self.shared.set_last_error(&message);
        ScannerError::Orchestration(message)
    }

    /// Record `message` and enter the error state
    fn abort(&self, message: impl Into<String>) -> ScannerError {
        let err = self.fail(message);
        self.set_state(ScannerState::Error);
        err
    }

    fn set_state(&self, state: ScannerState) {
        self.shared.set_state(state);
    }

    fn accumulate(&self, kv: f64, ma: f64, exposure_ms: u16) {
        if let Err(e) = self.accumulate_released_power(kv, ma, exposure_ms) {
            warn!("Failed to record released power: {}", e);
        }
    }

    /// Wait for every outcome. The first failure becomes the last error.
    fn join(&self, outcomes: DeviceOutcomes) -> Result<()> {
        let mut failure = None;
        for (kind, outcome) in outcomes {
            if let Err(e) = outcome.settle() {
                debug!("{} failed: {}", kind, e);
                if failure.is_none() {
                    failure = Some(self.fail(e.to_string()));
                }
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn check_is_open(&self) -> Result<()> {
        if self.state() == ScannerState::Unknown {
            return Err(self.fail("Scanner is not initialized"));
        }
        Ok(())
    }

    fn opened<'a>(&self, devices: &'a Option<Devices>) -> Result<&'a Devices> {
        self.check_is_open()?;
        devices
            .as_ref()
            .ok_or_else(|| self.fail("Scanner is not initialized"))
    }

    /// Create the dispatcher and the device workers
    fn configure(&self, core: &Core) -> Result<Devices> {
        let dispatcher = Dispatcher::new(core.opener.clone())
            .map_err(|e| self.fail(format!("Dispatcher error. {}", e)))?;
        let plugins = &core.settings.plugins;

        let detector = core
            .registry
            .detector(&plugins.detector)
            .ok_or_else(|| self.fail("Detector plugin is not loaded"))?;
        let power_supply = core
            .registry
            .power_supply(&plugins.power_supply)
            .ok_or_else(|| self.fail("Power supply plugin is not loaded"))?;
        let hardware = core
            .registry
            .hardware(&plugins.hardware)
            .ok_or_else(|| self.fail("Hardware plugin is not loaded"))?;

        info!("Using detector plugin: {}", plugins.detector);
        info!("Using power supply plugin: {}", plugins.power_supply);
        info!("Using hardware plugin: {}", plugins.hardware);
        let names = DeviceNames {
            detector: detector.name(),
            power_supply: power_supply.name(),
            hardware: hardware.name(),
        };

        let mut detector = Detector::new(detector);
        detector.set_dispatcher(dispatcher.clone());

        let mut power_supply = PowerSupply::new(power_supply);
        power_supply.set_dispatcher(dispatcher.clone());
        let shared = Arc::downgrade(&self.shared);
        power_supply.set_on_toggled(move |on| {
            if let Some(shared) = shared.upgrade() {
                shared.xray_on.store(on, Ordering::SeqCst);
                shared.emit(ScannerEvent::XrayToggled(on));
            }
        });
        let buttons = power_supply.buttons();

        let mut hardware = Hardware::new(hardware);
        hardware.set_dispatcher(dispatcher.clone());

        let spawn_failed = |e: ScannerError| self.fail(format!("Failed to start device thread. {}", e));
        Ok(Devices {
            detector: Worker::spawn("detector", detector).map_err(spawn_failed)?,
            power_supply: Worker::spawn("power_supply", power_supply).map_err(spawn_failed)?,
            hardware: Worker::spawn("hardware", hardware).map_err(spawn_failed)?,
            dispatcher,
            buttons,
            names: Arc::new(names),
        })
    }

    fn dispatcher_error(&self, dispatcher: &Dispatcher, err: ScannerError) -> ScannerError {
        let detail = dispatcher.last_error();
        let detail = if detail.is_empty() { err.to_string() } else { detail };
        self.fail(format!("Dispatcher error. {}", detail))
    }

    /// Open the port and every device with the configuration of the first scanning mode
    fn open_devices(&self, core: &Core, devices: &Devices) -> Result<()> {
        let mode = self
            .modes
            .lock()
            .list(true, true)
            .into_iter()
            .next()
            .ok_or_else(|| self.fail("No scanning modes available"))?;

        let dispatcher = &devices.dispatcher;
        if !dispatcher.is_open() {
            dispatcher
                .open(&core.settings.dispatcher)
                .map_err(|e| self.dispatcher_error(dispatcher, e))?;
        }
        dispatcher
            .reset()
            .map_err(|e| self.dispatcher_error(dispatcher, e))?;

        let names = Arc::clone(&devices.names);
        self.join(devices.each(move |kind, device| {
            if device.is_open() {
                return Ok(());
            }
            device.open(&names.configuration(&mode, kind))
        }))
    }

    /// Close every device and the port, then stop the workers
    fn dismiss(&self, devices: Devices) {
        for (kind, outcome) in devices.each(|_, device| {
            device.close();
            Ok(())
        }) {
            if let Err(e) = outcome.settle() {
                warn!("Failed to close {}: {}", kind, e);
            }
        }
        devices.dispatcher.close();
        self.shared.xray_on.store(false, Ordering::SeqCst);
    }

    pub fn open(&self) -> Result<()> {
        let mut core = self.core.lock();
        info!("Opening scanner");
        if self.state() != ScannerState::Unknown {
            return Err(self.fail("Scanner is already initialized"));
        }

        let devices = self.configure(&core)?;
        if let Err(e) = self.open_devices(&core, &devices) {
            self.dismiss(devices);
            return Err(e);
        }

        core.devices = Some(devices);
        info!("Scanner opened");
        self.shared.emit(ScannerEvent::Opened);
        self.set_state(ScannerState::Idle);
        Ok(())
    }

    pub fn close(&self) {
        let mut core = self.core.lock();
        if let Some(devices) = core.devices.take() {
            self.dismiss(devices);
        }
        if self.state() != ScannerState::Unknown {
            info!("Scanner closed");
            self.shared.emit(ScannerEvent::Closed);
            self.set_state(ScannerState::Unknown);
        }
    }

    /// Reset every open device and the line, returning to `Idle`
    pub fn reset(&self) -> Result<()> {
        let core = self.core.lock();
        let devices = self.opened(&core.devices)?;

        let mut result = self.join(devices.each(|_, device| {
            if device.is_open() {
                device.reset()
            } else {
                Ok(())
            }
        }));
        if let Err(e) = devices.dispatcher.reset() {
            if result.is_ok() {
                result = Err(self.dispatcher_error(&devices.dispatcher, e));
            }
        }

        if let Err(e) = result {
            self.set_state(ScannerState::Error);
            return Err(e);
        }
        self.set_state(ScannerState::Idle);
        Ok(())
    }

    fn switch_configurations(&self, devices: &Devices, mode: &ScanningMode) -> Result<()> {
        if !mode.is_enabled {
            return Err(self.fail(format!("Scanning mode {} is disabled", mode.uuid())));
        }
        let names = Arc::clone(&devices.names);
        let mode = mode.clone();
        self.join(devices.each(move |kind, device| {
            device.reopen(&names.configuration(&mode, kind))
        }))
    }

    fn ping(&self, devices: &Devices) -> Result<()> {
        self.join(devices.each(|_, device| device.test_connection()))
    }

    /// Prepare the power supply and the detector while the hardware runs `hardware`.
    /// Returns the dark frame.
    fn prepare_exposure(
        &self,
        devices: &Devices,
        hardware: Outcome<Result<()>>,
        params: PowerSupplyParams,
        dark_lines: u32,
        lines: u32,
    ) -> Result<Frame> {
        let power_supply = devices.power_supply.run(move |supply| supply.prepare(params));
        let detector = devices.detector.run(move |detector| {
            detector.prepare(dark_lines)?;
            detector.capture()?;
            let dark = detector.last_captured_frame().clone();
            detector.prepare(lines)?;
            Ok(dark)
        });

        let detector = detector.settle();
        let hardware = hardware.settle();
        let power_supply = power_supply.settle();

        let dark = detector
            .map_err(|e| self.abort(format!("Failed to prepare detector. {}", e.detail())))?;
        hardware.map_err(|e| self.abort(format!("Failed to prepare hardware. {}", e.detail())))?;
        power_supply
            .map_err(|e| self.abort(format!("Failed to prepare power supply. {}", e.detail())))?;

        devices
            .hardware
            .run(|hardware| hardware.press_prepare_button())
            .settle()
            .map_err(|e| self.abort(format!("Failed to press prepare button. {}", e.detail())))?;
        Ok(dark)
    }

    /// Start the scan, expose and capture, stop the scan and record the released power.
    /// Returns the time the rack was moving and whether a fatal error occurred.
    fn expose(
        &self,
        devices: &Devices,
        detector_delay: Duration,
        requested: PowerSupplyParams,
        result: &mut AcquisitionResult,
    ) -> Result<(Duration, bool)> {
        let buttons = devices.buttons.clone();
        devices
            .hardware
            .run(move |hardware| hardware.start_scan(buttons))
            .settle()
            .map_err(|e| self.abort(format!("Failed to start rack movement. {}", e.detail())))?;
        let moving = Instant::now();

        let capture = devices.detector.run_delayed(detector_delay, |detector| {
            detector.capture()?;
            Ok(detector.last_captured_frame().clone())
        });
        let launch = devices.power_supply.run(|supply| supply.launch());

        let mut fatal = false;
        match capture.settle() {
            Ok(frame) => result.image = frame,
            Err(e) => {
                self.fail(format!("Failed to capture detector image. {}", e.detail()));
                fatal = true;
            }
        }

        if let Err(e) = devices.hardware.run(|hardware| hardware.stop_scan()).settle() {
            self.fail(format!("Failed to stop rack movement. {}", e.detail()));
            fatal = true;
        }
        let moved = moving.elapsed();

        if let Err(e) = launch.settle() {
            self.fail(format!("Power supply on/off error. {}", e.detail()));
            fatal = true;
        }

        match devices.power_supply.run(|supply| supply.get_results()).settle() {
            Ok(results) => {
                result.amperage_ma = results.amperage_ma;
                result.voltage_kv = results.voltage_kv;
                result.exposure_ms = results.exposure_ms;
                self.accumulate(results.voltage_kv, results.amperage_ma, results.exposure_ms);
            }
            Err(e) => {
                if !fatal {
                    self.fail(format!("Failed to get power supply results. {}", e.detail()));
                }
                self.accumulate(requested.voltage_kv, requested.amperage_ma, requested.exposure_ms);
            }
        }

        Ok((moved, fatal))
    }

    /// Apply flat-field correction and publish the result
    fn publish(&self, settings: &ScannerSettings, mode: &ScanningMode, mut result: AcquisitionResult) {
        let width = result.width;
        if width < 1 || result.image.is_empty() || result.image.len() % width as usize != 0 {
            warn!("Acquired image does not match detector width {}", width);
            return;
        }

        if settings.flat_field_correction_enabled {
            let dark = std::mem::take(&mut result.dark);
            if let Err(e) = self
                .calibration
                .lock()
                .apply(&mode.uuid(), &mut result.image, &dark, width)
            {
                debug!("Flat field correction: {}", e);
                self.fail("Flat field correction failed");
            }
            result.dark = dark;
        }

        *self.shared.last_result.lock() = result;
        self.shared.emit(ScannerEvent::AcquisitionResultReady);
    }

    fn geometry(&self, devices: &Devices, height_mm: u16) -> Result<(DetectorProperties, u32, u32, u16)> {
        let properties = devices
            .properties()
            .map_err(|e| self.fail(format!("Detector error. {}", e)))?;
        let lines = properties.lines_for_height(height_mm as f64);
        let dark_lines = properties.lines_for_height(DARK_FRAME_HEIGHT_MM as f64);
        let exposure_ms = properties.exposure_ms(lines);
        Ok((properties, lines, dark_lines, exposure_ms))
    }

    /// Expose one image with `params`
    pub fn make_acquisition(&self, params: &AcquisitionParams) -> Result<()> {
        let core = self.core.lock();
        if self.state() != ScannerState::Idle {
            return Err(self.fail("Scanner is not ready"));
        }
        let devices = self.opened(&core.devices)?;
        let settings = &core.settings;

        let mode = self
            .modes
            .lock()
            .get(&params.scanning_mode)
            .cloned()
            .ok_or_else(|| self.fail(format!("Scanning mode {} not found", params.scanning_mode)))?;
        self.switch_configurations(devices, &mode)?;

        if settings.flat_field_correction_enabled && self.calibration.lock().update_is_required() {
            return Err(self.fail("Calibration coefficients are outdated. Perform calibration"));
        }

        let (properties, lines, dark_lines, exposure_ms) = self.geometry(devices, params.height_mm)?;
        let mut result = AcquisitionResult {
            width: properties.width,
            pixel_size: properties.pixel_size_mm,
            ..Default::default()
        };
        let use_door = params.use_door && settings.doors_count >= 1;
        let requested = PowerSupplyParams {
            exposure_ms,
            amperage_ma: params.amperage_ma,
            voltage_kv: params.voltage_kv,
        };
        info!(
            "Acquisition: {} mm, {} lines, {} kV, {} mA, {} ms",
            params.height_mm, lines, params.voltage_kv, params.amperage_ma, exposure_ms
        );

        self.set_state(ScannerState::Prepare);
        self.ping(devices).map_err(|e| {
            self.set_state(ScannerState::Error);
            e
        })?;

        let state = devices
            .hardware
            .run(|hardware| hardware.refresh_state())
            .settle()
            .map_err(|e| self.abort(format!("Failed to get hardware state. {}", e.detail())))?;
        if state.rack == RackState::Top {
            return Err(self.abort("Rack is at the upper limit"));
        }
        devices
            .hardware
            .run(|hardware| hardware.lock_remote())
            .settle()
            .map_err(|e| self.abort(format!("Failed to lock remote control. {}", e.detail())))?;

        let door = if use_door {
            devices
                .hardware
                .run(|hardware| hardware.close_first_door(&CancelationToken::none()))
        } else {
            Outcome::ready(Ok(()))
        };
        result.dark = self.prepare_exposure(devices, door, requested, dark_lines, lines)?;

        thread::sleep(Duration::from_millis(settings.delay_before_scan_ms as u64));
        self.set_state(ScannerState::Acquisition);
        let detector_delay = Duration::from_millis(settings.detector_delay_ms as u64);
        let (moved, fatal) = self.expose(devices, detector_delay, requested, &mut result)?;
        let rollback = rollback_duration(moved, mode.rollback_alpha, mode.rollback_beta);

        self.publish(settings, &mode, result);
        if fatal {
            self.set_state(ScannerState::Error);
            return Err(ScannerError::Orchestration(self.last_error()));
        }

        self.set_state(ScannerState::Finalization);
        if use_door {
            devices
                .hardware
                .run(|hardware| hardware.open_first_door(&CancelationToken::none()))
                .settle()
                .map_err(|_| self.abort("Failed to open door"))?;
        } else {
            thread::sleep(Duration::from_millis(DIRECTION_CHANGE_DELAY_MS));
        }

        debug!("Rolling back for {} ms", rollback.as_millis());
        devices
            .hardware
            .run(|hardware| hardware.move_rack_down())
            .settle()
            .and_then(|_| {
                devices
                    .hardware
                    .run_delayed(rollback, |hardware| hardware.move_rack_stop())
                    .settle()
            })
            .map_err(|_| self.abort("Failed to roll back rack"))?;

        devices
            .hardware
            .run(|hardware| hardware.unlock_remote())
            .settle()
            .map_err(|_| self.abort("Failed to unlock remote control"))?;

        info!("Acquisition finished");
        self.set_state(ScannerState::Idle);
        Ok(())
    }

    /// Recalibrate every enabled scanning mode
    pub fn make_calibration(&self) -> Result<()> {
        let core = self.core.lock();
        if self.state() != ScannerState::Idle {
            return Err(self.fail("Scanner is not ready"));
        }
        let devices = self.opened(&core.devices)?;
        let settings = &core.settings;
        let modes = self.modes.lock().list(true, true);
        if modes.is_empty() {
            return Err(self.fail("Scanning modes list is empty"));
        }
        let doors = settings.doors_count;
        let detector_delay = Duration::from_millis(settings.detector_delay_ms as u64);

        self.set_state(ScannerState::Calibration);
        devices
            .hardware
            .run(|hardware| hardware.lock_remote())
            .settle()
            .map_err(|e| self.abort(format!("Failed to lock remote control. {}", e.detail())))?;
        if doors >= 1 {
            devices
                .hardware
                .run(|hardware| hardware.close_door(Door::First, &CancelationToken::none()))
                .settle()
                .map_err(|e| self.abort(format!("Failed to close door. {}", e.detail())))?;
        }

        let total = modes.len();
        for (index, mode) in modes.iter().enumerate() {
            info!("Calibrating scanning mode {} '{}'", mode.uuid(), mode.title);
            self.switch_configurations(devices, mode).map_err(|e| {
                self.set_state(ScannerState::Error);
                e
            })?;

            let (properties, lines, dark_lines, exposure_ms) =
                self.geometry(devices, CALIBRATION_HEIGHT_MM).map_err(|e| {
                    self.set_state(ScannerState::Error);
                    e
                })?;
            let mut result = AcquisitionResult {
                width: properties.width,
                pixel_size: properties.pixel_size_mm,
                ..Default::default()
            };
            let requested = PowerSupplyParams {
                exposure_ms,
                amperage_ma: mode.calibration_amperage_ma,
                voltage_kv: mode.calibration_voltage_kv,
            };

            self.ping(devices).map_err(|e| {
                self.set_state(ScannerState::Error);
                e
            })?;
            let rack = devices
                .hardware
                .run(|hardware| hardware.move_rack_to_bottom(&CancelationToken::none()));
            result.dark = self.prepare_exposure(devices, rack, requested, dark_lines, lines)?;

            let (_, fatal) = self.expose(devices, detector_delay, requested, &mut result)?;
            if fatal {
                self.set_state(ScannerState::Error);
                return Err(ScannerError::Orchestration(self.last_error()));
            }

            let updated = self.calibration.lock().update(
                &mode.uuid(),
                &result.image,
                &result.dark,
                result.width,
            );
            if let Err(e) = updated {
                debug!("Calibration update: {}", e);
                return Err(self.abort("Failed to update calibration coefficients"));
            }

            thread::sleep(Duration::from_millis(DIRECTION_CHANGE_DELAY_MS));
            self.shared.emit(ScannerEvent::CalibrationProgress {
                current: index + 1,
                total,
            });
        }

        if doors >= 1 {
            devices
                .hardware
                .run(|hardware| hardware.open_first_door(&CancelationToken::none()))
                .settle()
                .map_err(|e| self.abort(format!("Failed to open door. {}", e.detail())))?;
        }
        devices
            .hardware
            .run(|hardware| hardware.unlock_remote())
            .settle()
            .map_err(|e| self.abort(format!("Failed to unlock remote control. {}", e.detail())))?;

        info!("Calibration finished");
        self.set_state(ScannerState::Idle);
        Ok(())
    }

    fn with_hardware<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Hardware) -> Result<()> + Send + 'static,
    {
        let core = self.core.lock();
        let devices = self.opened(&core.devices)?;
        devices.hardware.run(f).settle()
    }

    pub fn move_rack_up(&self) -> Result<()> {
        self.with_hardware(|hardware| hardware.move_rack_up())
    }

    pub fn move_rack_down(&self) -> Result<()> {
        self.with_hardware(|hardware| hardware.move_rack_down())
    }

    pub fn open_first_door(&self, token: CancelationToken) -> Result<()> {
        self.with_hardware(move |hardware| hardware.open_first_door(&token))
    }

    pub fn close_first_door(&self, token: CancelationToken) -> Result<()> {
        self.with_hardware(move |hardware| hardware.close_first_door(&token))
    }

    /// Halt every movement
    pub fn stop(&self) -> Result<()> {
        self.with_hardware(|hardware| hardware.stop())
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        if let Some(devices) = self.core.get_mut().devices.take() {
            self.dismiss(devices);
        }
        self.shared.stop_overheat_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_subtracts_alpha_then_scales() {
        let moving = Duration::from_millis(2000);
        assert_eq!(rollback_duration(moving, 500, 1.0), Duration::from_millis(1500));
        assert_eq!(rollback_duration(moving, 500, 1.5), Duration::from_millis(2250));
        assert_eq!(rollback_duration(moving, 3000, 1.0), moving);
        assert_eq!(rollback_duration(moving, 0, -1.0), Duration::ZERO);
    }

    fn scanner(rate: f64) -> Scanner {
        let settings = ScannerSettings {
            cooling_rate_watt_sec: rate,
            ..Default::default()
        };
        Scanner::new(
            settings,
            ScanningModesCollection::in_memory(),
            PluginRegistry::with_builtin(),
        )
        .unwrap()
    }

    #[test]
    fn idle_request_while_cooling_yields_overheat() {
        let scanner = scanner(1000.0);
        let events = scanner.subscribe();
        scanner.accumulate_released_power(100.0, 10.0, 1000).unwrap();
        assert!(scanner.secs_to_cooldown() > 0);

        scanner.set_state(ScannerState::Idle);
        assert_eq!(scanner.state(), ScannerState::Overheat);
        assert_eq!(
            events.try_recv().unwrap(),
            ScannerEvent::StateChanged(ScannerState::Overheat)
        );

        scanner.set_state(ScannerState::Unknown);
        assert!(scanner.shared.overheat_timer.lock().is_none());
    }

    #[test]
    fn overheat_timer_leaves_a_closed_scanner_closed() {
        let scanner = scanner(1.0);
        scanner.accumulate_released_power(100.0, 10.0, 1000).unwrap();
        scanner.set_state(ScannerState::Idle);
        assert_eq!(scanner.state(), ScannerState::Overheat);

        // Stall the next tick on the cooldown lookup and close underneath it
        let cooldown = scanner.shared.cooldown.lock();
        thread::sleep(Duration::from_millis(OVERHEAT_POLL_INTERVAL_MS + 300));
        scanner.set_state(ScannerState::Unknown);
        drop(cooldown);

        thread::sleep(Duration::from_millis(OVERHEAT_POLL_INTERVAL_MS + 300));
        assert_eq!(scanner.state(), ScannerState::Unknown);
    }

    #[test]
    fn cooled_tube_demotes_only_from_overheat() {
        let scanner = scanner(100.0);
        let events = scanner.subscribe();
        assert!(!scanner.shared.demote_overheat());
        assert_eq!(scanner.state(), ScannerState::Unknown);

        scanner
            .shared
            .state
            .store(ScannerState::Overheat.as_i8(), Ordering::SeqCst);
        assert!(scanner.shared.demote_overheat());
        assert_eq!(scanner.state(), ScannerState::Idle);
        assert_eq!(
            events.try_recv().unwrap(),
            ScannerEvent::StateChanged(ScannerState::Idle)
        );
    }

    #[test]
    fn mode_queries_do_not_wait_for_orchestration() {
        let scanner = &scanner(100.0);
        let _busy = scanner.core.lock();
        let (done, finished) = mpsc::channel();
        thread::scope(|scope| {
            scope.spawn(move || {
                let count = scanner.scanning_modes().len();
                scanner.calibration_update_is_recommended();
                done.send(count).unwrap();
            });
            assert_eq!(finished.recv_timeout(Duration::from_secs(1)).unwrap(), 0);
        });
    }

    #[test]
    fn operations_require_open_scanner() {
        let scanner = scanner(100.0);
        assert!(scanner.move_rack_up().is_err());
        assert_eq!(scanner.last_error(), "Scanner is not initialized");
        assert!(scanner.reset().is_err());

        let params = AcquisitionParams {
            scanning_mode: uuid::Uuid::new_v4(),
            height_mm: 100,
            voltage_kv: 100.0,
            amperage_ma: 1.0,
            use_door: false,
        };
        assert!(scanner.make_acquisition(&params).is_err());
        assert_eq!(scanner.last_error(), "Scanner is not ready");
    }

    #[test]
    fn open_without_modes_stays_closed() {
        let scanner = scanner(100.0).with_port_opener(crate::simulated::null_port_opener());
        assert!(scanner.open().is_err());
        assert_eq!(scanner.last_error(), "No scanning modes available");
        assert_eq!(scanner.state(), ScannerState::Unknown);
    }

    #[test]
    fn missing_plugin_aborts_open() {
        let settings = ScannerSettings::default();
        let scanner = Scanner::new(
            settings,
            ScanningModesCollection::in_memory(),
            PluginRegistry::new(),
        )
        .unwrap()
        .with_port_opener(crate::simulated::null_port_opener());
        assert!(scanner.open().is_err());
        assert_eq!(scanner.last_error(), "Detector plugin is not loaded");
        assert_eq!(scanner.state(), ScannerState::Unknown);
    }
}
