//! # X-ray Scanner Library
//!
//! A Rust library for driving a line-scan X-ray apparatus whose detector, high-voltage
//! power supply and rack/door mechanics share one half-duplex RS-485 line.
//!
//! ## Features
//!
//! - Serialize access to the shared line through a single dispatcher thread
//! - Switch the RTS/DTR driven line direction with the required settle delays
//! - Route incoming frames to per-address accessors
//! - Orchestrate acquisitions and flat-field calibrations across all devices
//! - Keep the tube cooldown across restarts
//! - Run without hardware through simulated devices
//!
//! ## Example
//!
//! ```no_run
//! use xray_scanner::plugins::PluginRegistry;
//! use xray_scanner::scanning_modes::ScanningModesCollection;
//! use xray_scanner::settings::ScannerSettings;
//! use xray_scanner::{AcquisitionParams, Scanner};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = ScannerSettings::load("scanner.toml".as_ref())?;
//!     let modes = ScanningModesCollection::open("modes")?;
//!     let mode = modes.list(true, true)[0].uuid();
//!
//!     let scanner = Scanner::new(settings, modes, PluginRegistry::with_builtin())?;
//!     scanner.open()?;
//!     scanner.make_acquisition(&AcquisitionParams {
//!         scanning_mode: mode,
//!         height_mm: 1000,
//!         voltage_kv: 140.0,
//!         amperage_ma: 0.5,
//!         use_door: true,
//!     })?;
//!     println!("Image width: {}", scanner.last_acquisition_result().width);
//!     Ok(())
//! }
//! ```

pub mod calibration;
pub mod cancelation;
pub mod configuration;
pub mod constants;
pub mod cooldown;
pub mod detector;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod plugins;
pub mod power_supply;
pub mod scanner;
pub mod scanning_modes;
pub mod settings;
pub mod simulated;
pub mod transport;
pub mod types;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use error::{Result, ScannerError};
pub use scanner::Scanner;
pub use types::*;
