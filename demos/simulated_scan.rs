//! Simulated Scan Example
//!
//! Runs the full scanner against the simulated devices: opens it, calibrates the scanning
//! mode and takes one image. No serial port is touched.
//!
//! Usage:
//!   cargo run --example simulated_scan
//!
//! Set RUST_LOG environment variable to control logging:
//!   RUST_LOG=debug cargo run --example simulated_scan

use log::info;
use std::thread;
use std::time::Duration;
use xray_scanner::plugins::{PluginRegistry, EMPTY_HARDWARE};
use xray_scanner::scanning_modes::ScanningModesCollection;
use xray_scanner::settings::ScannerSettings;
use xray_scanner::simulated::{null_port_opener, EmptyHardware, EmptyHardwareTimings};
use xray_scanner::{AcquisitionParams, Result, Scanner, ScannerEvent, ScannerState};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let workspace = tempfile::tempdir()?;
    let mut modes = ScanningModesCollection::open(workspace.path().join("modes"))?;
    let mut mode = modes.create();
    mode.title = "Luggage".into();
    mode.is_enabled = true;
    mode.calibration_voltage_kv = 140.0;
    mode.calibration_amperage_ma = 0.5;
    mode.rollback_alpha = 100;
    modes.store(&[mode.clone()])?;

    // Simulated mechanics with short travel times
    let mut registry = PluginRegistry::with_builtin();
    registry.register_hardware(EMPTY_HARDWARE, || {
        Box::new(EmptyHardware::with_timings(EmptyHardwareTimings {
            door_move: Duration::from_millis(300),
            rack_move: Duration::from_millis(600),
            poll: Duration::from_millis(20),
        }))
    });

    let settings = ScannerSettings {
        flat_field_correction_enabled: true,
        run_state_path: Some(workspace.path().join("scanner.run.toml")),
        ..Default::default()
    };
    let scanner = Scanner::new(settings, modes, registry)?.with_port_opener(null_port_opener());

    let events = scanner.subscribe();
    thread::spawn(move || {
        for event in events {
            match event {
                ScannerEvent::StateChanged(state) => info!("State: {}", state),
                ScannerEvent::XrayToggled(on) => info!("X-ray {}", if on { "ON" } else { "off" }),
                ScannerEvent::CalibrationProgress { current, total } => {
                    info!("Calibrated {}/{}", current, total)
                }
                ScannerEvent::ErrorOccurred(message) => info!("Error: {}", message),
                _ => {}
            }
        }
    });

    info!("=== Open ===");
    scanner.open()?;

    info!("=== Calibration ===");
    scanner.make_calibration()?;
    while scanner.state() == ScannerState::Overheat {
        info!("Cooling down, {} s left", scanner.secs_to_cooldown());
        thread::sleep(Duration::from_secs(1));
    }

    info!("=== Acquisition ===");
    scanner.make_acquisition(&AcquisitionParams {
        scanning_mode: mode.uuid(),
        height_mm: 300,
        voltage_kv: 140.0,
        amperage_ma: 0.5,
        use_door: true,
    })?;

    let result = scanner.last_acquisition_result();
    info!(
        "Image {}x{} at {} kV, {} mA, {} ms",
        result.width,
        result.height(),
        result.voltage_kv,
        result.amperage_ma,
        result.exposure_ms
    );
    info!("Cooldown: {} s", scanner.secs_to_cooldown());

    scanner.close();
    Ok(())
}
