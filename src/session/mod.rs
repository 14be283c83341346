//! Connection lifecycle: scanning, connecting and reading measurements.

pub mod connection;
pub mod events;
pub mod manager;
pub mod scanner;
pub mod sources;
pub mod types;

pub use connection::ConnectionManager;
pub use events::{Subscribers, Subscription};
pub use manager::ScaleSession;
pub use scanner::ScaleScanner;
pub use sources::{MeasurementSource, first_success};
pub use types::{ConnectedScaleState, ConnectionState, DeviceInfo};
