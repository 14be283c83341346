//! BLE bridge for Xiaomi body composition scales.
//!
//! The crate decodes MiBeacon advertisement frames, decrypts their object
//! payloads with the device bind key, parses weight and impedance readings,
//! and manages the connection lifecycle of a scale session including scan,
//! retrying connects and a fallback chain of measurement sources.

pub mod config;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod session;

pub use config::SessionConfig;
pub use error::{Result, ScaleError};
pub use protocol::measurement::RawMeasurement;
pub use session::{ConnectionState, DeviceInfo, ScaleSession, Subscription};
