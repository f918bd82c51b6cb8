//! Custom error types for detector drivers.
//!
//! This module defines `DaqError`, the single error type returned by the
//! [`Detector`](crate::capabilities::Detector) capability and by the SCPI
//! transports underneath it. Using the `thiserror` crate, it gives every
//! failure a stable class that callers can match on.
//!
//! ## Error Classes
//!
//! - **Unsupported operation**: `OperationNotSupported`. A fixed-function
//!   detector was asked to change something it cannot change in software.
//! - **Value errors**: `ValueOutOfRange`, `InvalidChoice`, `ResponseParse`.
//!   A requested setting violates the declared constraint, or an instrument
//!   answer could not be turned into a typed value.
//! - **Connection errors**: `ConnectionFailed`, `SerialPortNotConnected`,
//!   `SerialUnexpectedEof`. The transport could not be opened, was already
//!   closed, or the device went away mid-exchange.
//! - **Timeouts**: `Timeout`. No response line arrived before the configured
//!   read timeout elapsed.
//!
//! Nothing in the drivers retries or swallows these errors: each one
//! surfaces to the caller of the property that triggered it.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Primary error type for detector drivers.
///
/// # Example
///
/// ```rust
/// use daq_core::error::DaqError;
///
/// fn check_gain(volts: f64) -> Result<(), DaqError> {
///     if !(0.5..=1.0).contains(&volts) {
///         return Err(DaqError::ValueOutOfRange {
///             name: "gain".into(),
///             value: format!("{} V", volts),
///             allowed: "[500 mV, 1 V]".into(),
///         });
///     }
///     Ok(())
/// }
///
/// assert!(check_gain(1.5).is_err());
/// ```
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration validation failed.
    ///
    /// Occurs when driver settings parse but are semantically wrong (unknown
    /// model number, malformed VISA resource fields).
    ///
    /// **Recovery Strategy**: Fix the configuration and rebuild the device.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Instrument reported or caused an error that has no more specific class.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The detector does not support the requested operation.
    ///
    /// Fixed-function SiPM modules return this for every mutation and for
    /// gain readback. Never retried.
    ///
    /// **Recovery Strategy**: Check [`Detector::controls`] before calling.
    ///
    /// [`Detector::controls`]: crate::capabilities::Detector::controls
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// A requested setting lies outside the declared inclusive range.
    ///
    /// Raised before anything is written to the transport.
    #[error("{name} {value} is outside the allowed range {allowed}")]
    ValueOutOfRange {
        /// Property being set (e.g. "gain")
        name: String,
        /// Rejected value, rendered with units
        value: String,
        /// Allowed interval, rendered with units
        allowed: String,
    },

    /// A requested setting is not one of the discrete supported values.
    ///
    /// Raised before anything is written to the transport.
    #[error("{name} {value} is not supported; choose one of {allowed}")]
    InvalidChoice {
        /// Property being set (e.g. "bandwidth")
        name: String,
        /// Rejected value, rendered with units
        value: String,
        /// Supported values, rendered with units
        allowed: String,
    },

    /// An instrument response could not be parsed into the expected type.
    #[error("Failed to parse response '{response}' to '{command}': {reason}")]
    ResponseParse {
        /// Command whose answer failed to parse
        command: String,
        /// Raw (trimmed) response line
        response: String,
        /// Parser diagnostic
        reason: String,
    },

    /// The transport could not be opened.
    ///
    /// **Error Type**: Permanent for this construction attempt.
    ///
    /// **Recovery Strategy**: Check cabling, port name and permissions, then
    /// construct the driver again.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// No response arrived within the configured read timeout.
    ///
    /// **Error Type**: Fatal to the call. There is no automatic retry.
    #[error("Timed out waiting for response to '{0}'")]
    Timeout(String),

    /// The transport has been closed by its owner.
    #[error("Serial port not connected")]
    SerialPortNotConnected,

    /// The device closed the line in the middle of an exchange.
    #[error("Unexpected EOF from serial port")]
    SerialUnexpectedEof,

    /// Response line exceeds the maximum allowed size.
    #[error("Response size {bytes} bytes exceeds maximum {max_bytes} bytes")]
    ResponseTooLarge {
        /// Bytes received before giving up
        bytes: usize,
        /// Configured limit
        max_bytes: usize,
    },
}

impl DaqError {
    /// True for the value-error class (bad setting or unparsable answer).
    pub fn is_value_error(&self) -> bool {
        matches!(
            self,
            Self::ValueOutOfRange { .. } | Self::InvalidChoice { .. } | Self::ResponseParse { .. }
        )
    }

    /// True for the connection-error class.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::SerialPortNotConnected | Self::SerialUnexpectedEof
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::Instrument("sensor head missing".to_string());
        assert_eq!(err.to_string(), "Instrument error: sensor head missing");
    }

    #[test]
    fn test_range_error_names_bounds() {
        let err = DaqError::ValueOutOfRange {
            name: "gain".into(),
            value: "1.5 V".into(),
            allowed: "[500 mV, 1 V]".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("gain 1.5 V"));
        assert!(msg.contains("[500 mV, 1 V]"));
        assert!(err.is_value_error());
    }

    #[test]
    fn test_error_classes() {
        assert!(DaqError::SerialPortNotConnected.is_connection_error());
        assert!(DaqError::ConnectionFailed("COM3".into()).is_connection_error());
        assert!(!DaqError::Timeout("*IDN?".into()).is_connection_error());
        assert!(!DaqError::OperationNotSupported("gain".into()).is_value_error());
    }
}
