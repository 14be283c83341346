//! Error types for the scale bridge.
//!
//! Every failure the library can surface is a [`ScaleError`] variant. The
//! retry layer and the session state machine classify errors by kind via
//! [`ScaleError::is_retryable`] instead of inspecting message text, and
//! fatal errors carry an actionable [`ScaleError::suggestion`] for the user.

use thiserror::Error;

/// Main error type for all scale bridge operations.
#[derive(Debug, Error)]
pub enum ScaleError {
    /// The Bluetooth radio is powered off or unauthorized.
    #[error("Bluetooth is turned off or unavailable")]
    BluetoothOff,

    /// No Bluetooth adapter was found on this machine.
    #[error("No Bluetooth adapter found")]
    AdapterUnavailable,

    /// The target scale was not discovered during scanning.
    #[error("Scale not found: {0}")]
    DeviceNotFound(String),

    /// Connecting to the scale failed after the hardware reported an error.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connecting to the scale did not complete within the timeout.
    #[error("Connection timed out after {0} ms")]
    ConnectionTimeout(u64),

    /// An operation that requires an open connection was called without one.
    #[error("No scale connected")]
    NotConnected,

    /// A measurement read was requested while another one is in flight.
    #[error("A measurement read is already in progress")]
    ReadInProgress,

    /// All measurement sources were tried and none produced a weight.
    #[error("Failed to read a measurement from any source")]
    ReadFailed,

    /// A single measurement source timed out before producing data.
    #[error("Measurement source '{0}' timed out")]
    ReadTimeout(&'static str),

    /// The encrypted payload could not be decrypted or failed authentication.
    #[error("Payload decryption failed: {0}")]
    DecryptionFailed(String),

    /// The BLE bind key is not 16 bytes (32 hex characters).
    #[error("Invalid BLE key: expected 32 hex characters, got {0}")]
    InvalidKey(usize),

    /// The encrypted payload is too short to contain counter and MIC.
    #[error("Payload too short: {0} bytes")]
    PayloadTooShort(usize),

    /// A MAC address string could not be parsed.
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// None of the expected GATT characteristics were found on the device.
    #[error("No usable measurement characteristic found")]
    CharacteristicNotFound,

    /// Underlying BLE stack error.
    #[error("Bluetooth error: {0}")]
    Ble(#[from] bluest::Error),

    /// I/O error while reading or writing a config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScaleError {
    /// Stable machine-readable identifier, used by layers above this crate.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BluetoothOff => "BLUETOOTH_OFF",
            Self::AdapterUnavailable => "ADAPTER_UNAVAILABLE",
            Self::DeviceNotFound(_) => "DEVICE_NOT_FOUND",
            Self::ConnectionFailed(_) => "CONNECTION_FAILED",
            Self::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::ReadInProgress => "READ_IN_PROGRESS",
            Self::ReadFailed => "READ_FAILED",
            Self::ReadTimeout(_) => "READ_TIMEOUT",
            Self::DecryptionFailed(_) => "DECRYPTION_FAILED",
            Self::InvalidKey(_) => "INVALID_KEY",
            Self::PayloadTooShort(_) => "PAYLOAD_TOO_SHORT",
            Self::InvalidAddress(_) => "INVALID_ADDRESS",
            Self::CharacteristicNotFound => "CHARACTERISTIC_NOT_FOUND",
            Self::Ble(_) => "BLE_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Transient transport conditions are retryable; structural problems
    /// (bad key, malformed payload, missing hardware) are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionTimeout(_)
                | Self::ReadFailed
                | Self::ReadTimeout(_)
                | Self::Ble(_)
        )
    }

    /// Actionable advice for a non-technical user, present on fatal errors.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::BluetoothOff | Self::AdapterUnavailable => {
                Some("Turn on Bluetooth in your system settings and try again.")
            }
            Self::DeviceNotFound(_) => {
                Some("Make sure the scale is powered on and within a few meters, then step on it briefly to wake it.")
            }
            Self::ConnectionFailed(_) | Self::ConnectionTimeout(_) => {
                Some("Move closer to the scale and make sure no other phone or app is connected to it.")
            }
            Self::InvalidKey(_) => {
                Some("Check the bind key: it must be exactly 32 hexadecimal characters.")
            }
            Self::DecryptionFailed(_) => {
                Some("The bind key may be stale. Re-pair the scale in the Mi Home app and copy the new key.")
            }
            Self::ReadFailed | Self::ReadTimeout(_) => {
                Some("Step on the scale while reading so it has a measurement to send.")
            }
            Self::NotConnected => Some("Connect to the scale before requesting a measurement."),
            Self::ReadInProgress
            | Self::PayloadTooShort(_)
            | Self::InvalidAddress(_)
            | Self::CharacteristicNotFound
            | Self::Ble(_)
            | Self::Io(_) => None,
        }
    }
}

/// Result type alias using ScaleError.
pub type Result<T> = std::result::Result<T, ScaleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification_is_kind_based() {
        assert!(ScaleError::ConnectionTimeout(30_000).is_retryable());
        assert!(ScaleError::ReadFailed.is_retryable());
        assert!(!ScaleError::InvalidKey(30).is_retryable());
        assert!(!ScaleError::PayloadTooShort(3).is_retryable());
        assert!(!ScaleError::DeviceNotFound("AA:BB".into()).is_retryable());
    }

    #[test]
    fn fatal_errors_carry_a_suggestion() {
        for err in [
            ScaleError::BluetoothOff,
            ScaleError::DeviceNotFound("AA:BB".into()),
            ScaleError::InvalidKey(12),
            ScaleError::DecryptionFailed("bad MIC".into()),
            ScaleError::ReadFailed,
        ] {
            assert!(err.suggestion().is_some(), "missing suggestion for {}", err.code());
        }
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ScaleError::BluetoothOff.code(), "BLUETOOTH_OFF");
        assert_eq!(ScaleError::InvalidKey(0).code(), "INVALID_KEY");
        assert_eq!(ScaleError::PayloadTooShort(0).code(), "PAYLOAD_TOO_SHORT");
        assert_eq!(ScaleError::DecryptionFailed(String::new()).code(), "DECRYPTION_FAILED");
    }
}
