//! Error types for dispatcher, device and scanner operations.

use thiserror::Error;

use crate::types::DeviceKind;

/// Result type alias for scanner operations.
pub type Result<T> = std::result::Result<T, ScannerError>;

/// Error types for the serial link, the devices and the orchestration.
#[derive(Error, Debug)]
pub enum ScannerError {
    /// Serial port communication error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration could not be written
    #[error("Configuration write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Acquisition result encoding failed
    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Malformed scanning mode identifier
    #[error("Invalid UUID: {0}")]
    Uuid(#[from] uuid::Error),

    /// Parameter rejected before any I/O took place
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Failure on the half-duplex serial link
    #[error("{0}")]
    Transport(String),

    /// Operation did not complete in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Failure reported by a device
    #[error("{kind} error. {message}")]
    Device {
        /// Kind of the failing device
        kind: DeviceKind,
        /// Human-readable description
        message: String,
    },

    /// Acquisition or calibration step failure
    #[error("{0}")]
    Orchestration(String),

    /// Component used before it was opened
    #[error("{0} is not open")]
    NotOpen(String),

    /// Component opened twice
    #[error("{0} is already open")]
    AlreadyOpen(String),

    /// Worker thread has gone away
    #[error("Worker thread '{0}' is not running")]
    WorkerStopped(String),
}

impl ScannerError {
    /// Build a device error.
    pub fn device(kind: DeviceKind, message: impl Into<String>) -> Self {
        ScannerError::Device {
            kind,
            message: message.into(),
        }
    }

    /// Message without the variant prefix, used for last-error slots.
    pub fn detail(&self) -> String {
        match self {
            ScannerError::Device { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_error_display_names_the_kind() {
        let err = ScannerError::device(DeviceKind::Detector, "Invalid number of lines");
        assert_eq!(err.to_string(), "Detector error. Invalid number of lines");
        assert_eq!(err.detail(), "Invalid number of lines");
    }

    #[test]
    fn transport_error_is_bare_message() {
        let err = ScannerError::Transport("Write timeout occurred".into());
        assert_eq!(err.to_string(), "Write timeout occurred");
    }
}
