//! Protocol and timing constants.
//!
//! This module defines the settle delays of the half-duplex line modes, the fixed
//! serial framing, the default dispatcher timings and the geometry used by the
//! acquisition and calibration sequences.

/// Data bits on the shared link (8N1, no flow control)
pub const DATA_BITS: serialport::DataBits = serialport::DataBits::Eight;

/// Parity on the shared link
pub const PARITY: serialport::Parity = serialport::Parity::None;

/// Stop bits on the shared link
pub const STOP_BITS: serialport::StopBits = serialport::StopBits::One;

/// Flow control on the shared link
pub const FLOW_CONTROL: serialport::FlowControl = serialport::FlowControl::None;

/// OS-level read/write timeout of the serial port handle
pub const PORT_IO_TIMEOUT_MS: u64 = 50;

/// Settle delay after switching the line to write mode
pub const WRITE_MODE_SETTLE_MS: u64 = 50;

/// Settle delay after switching the line to read mode
pub const READ_MODE_SETTLE_MS: u64 = 0;

/// Settle delay after switching the line to reset mode
pub const RESET_MODE_SETTLE_MS: u64 = 500;

/// Settle delay after switching the line to echo mode
pub const ECHO_MODE_SETTLE_MS: u64 = 500;

/// Default serial port name
pub const DEFAULT_PORT_NAME: &str = "COM1";

/// Default baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time allowed for queued bytes to leave the port
pub const DEFAULT_WRITE_TIMEOUT_MS: u16 = 1000;

/// Default minimum gap between two consecutive writes
pub const DEFAULT_WRITE_DELAY_MS: u16 = 150;

/// Default quiet period after the last byte left the port
pub const DEFAULT_WRITE_PAUSE_MS: u8 = 50;

/// Default silence that terminates an incoming frame
pub const DEFAULT_FRAME_INTERVAL_MS: u8 = 10;

/// Default read timeout used by accessors
pub const DEFAULT_READ_TIMEOUT_MS: u32 = 1000;

/// How often the dispatcher thread polls the port while it is open
pub const PORT_POLL_INTERVAL_MS: u64 = 2;

/// Smallest routable buffer: one address byte plus one payload byte
pub const MIN_ROUTABLE_LENGTH: usize = 2;

/// Pause before reversing the rack (protects the drive controller)
pub const DIRECTION_CHANGE_DELAY_MS: u64 = 500;

/// Height of the dark-frame capture
pub const DARK_FRAME_HEIGHT_MM: u16 = 200;

/// Height of the calibration capture
pub const CALIBRATION_HEIGHT_MM: u16 = 400;

/// Poll period of the overheat timer
pub const OVERHEAT_POLL_INTERVAL_MS: u64 = 1000;

/// Share of the calibration lifetime after which recalibration is recommended
pub const CALIBRATION_RECOMMENDED_RATIO: f64 = 0.9;

/// File holding the main parameters of a scanning mode
pub const SCANNING_MODE_FILE: &str = "ScanningMode.toml";

/// Extension of per-device configuration files
pub const DEVICE_CONFIG_EXTENSION: &str = "toml";
