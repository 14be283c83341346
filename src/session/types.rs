//! Defines shared data structures for the session module.

use bluest::{Characteristic, Device};
use serde::{Deserialize, Serialize};

/// Represents a discovered scale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Platform-specific unique identifier for the device (especially important on macOS)
    pub id: String,
    /// The name of the device, if available
    pub name: Option<String>,
    /// The address of the device (MAC address on most platforms, may be 00:00:00:00:00:00 on macOS)
    pub address: Option<String>,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
    /// Whether the device is connected
    pub is_connected: bool,
}

/// Connection lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Reading,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reading => "reading",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Represents the state of a successfully connected scale.
/// This struct holds the active handles needed for interaction.
#[derive(Clone)]
pub struct ConnectedScaleState {
    /// The device handle, used for things like checking connection status or disconnecting.
    pub device: Device,
    /// Standard Body Composition Measurement characteristic, when exposed.
    pub body_composition_char: Option<Characteristic>,
    /// Standard Weight Measurement characteristic, when exposed.
    pub weight_char: Option<Characteristic>,
    /// Vendor characteristic carrying encrypted MiBeacon frames.
    pub vendor_char: Option<Characteristic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_serializes_lowercase() {
        let json = serde_json::to_string(&ConnectionState::Scanning).unwrap();
        assert_eq!(json, "\"scanning\"");
        assert_eq!(ConnectionState::Reading.to_string(), "reading");
    }
}
