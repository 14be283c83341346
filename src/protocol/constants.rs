//! Constants used throughout the scale bridge.
//! This module contains all the constant values used by the protocol and
//! session layers, such as UUIDs, name filters and wire-format sizes.

use uuid::Uuid;

/// Device name prefixes advertised by supported scales.
pub const SCALE_NAME_PREFIXES: [&str; 2] = ["MIBFS", "MIBCS"];

/// Generic fallback prefix for Xiaomi devices.
pub const SCALE_NAME_FALLBACK_PREFIX: &str = "MI";

/// Xiaomi vendor advertisement service identifier (0xFE95).
pub const UUID_XIAOMI_ADVERTISEMENT: Uuid = Uuid::from_u128(0x0000fe95_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_WEIGHT_SCALE_SERVICE: Uuid = Uuid::from_u128(0x0000181d_0000_1000_8000_00805f9b34fb);
pub const UUID_BODY_COMPOSITION_SERVICE: Uuid = Uuid::from_u128(0x0000181b_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_WEIGHT_MEASUREMENT_CHAR: Uuid = Uuid::from_u128(0x00002a9d_0000_1000_8000_00805f9b34fb);
pub const UUID_WEIGHT_SCALE_FEATURE_CHAR: Uuid = Uuid::from_u128(0x00002a9e_0000_1000_8000_00805f9b34fb);
pub const UUID_BODY_COMPOSITION_MEASUREMENT_CHAR: Uuid = Uuid::from_u128(0x00002a9c_0000_1000_8000_00805f9b34fb);
pub const UUID_BODY_COMPOSITION_FEATURE_CHAR: Uuid = Uuid::from_u128(0x00002a9b_0000_1000_8000_00805f9b34fb);

/// Xiaomi custom service carrying encrypted MiBeacon frames in connected mode.
pub const UUID_XIAOMI_SCALE_SERVICE: Uuid = Uuid::from_u128(0x00001530_0000_3512_2118_0009af100700);

/// Notification characteristic on the Xiaomi custom service.
pub const UUID_XIAOMI_MEASUREMENT_CHAR: Uuid = Uuid::from_u128(0x00002a2f_0000_3512_2118_0009af100700);

/// BLE bind key length in hex characters (16 raw bytes).
pub const BLE_KEY_HEX_LEN: usize = 32;

/// Minimum MiBeacon advertisement length: control, product id, counter.
pub const MIN_ADVERTISEMENT_LEN: usize = 5;

/// MiBeacon object record ids.
pub const OBJECT_ID_WEIGHT: u8 = 0x16;
pub const OBJECT_ID_IMPEDANCE: u8 = 0x17;

/// Weight resolution per raw unit: metric mode (kilograms).
pub const WEIGHT_UNIT_KG: f64 = 0.005;

/// Weight resolution per raw unit: catty mode (500 g per catty).
pub const WEIGHT_UNIT_CATTY: f64 = 0.5;

/// Pounds to kilograms, used by imperial GATT readings.
pub const LB_TO_KG: f64 = 0.453592;

/// Impedance readings are complete only strictly below this bound (ohms).
pub const IMPEDANCE_MAX_OHM: u16 = 3000;

/// Physiologically plausible weight range for surfaced readings (kg).
pub const MIN_PLAUSIBLE_WEIGHT_KG: f64 = 1.0;
pub const MAX_PLAUSIBLE_WEIGHT_KG: f64 = 300.0;

/// Encrypted payload trailer: 3-byte extended counter followed by 4-byte MIC.
pub const EXT_COUNTER_LEN: usize = 3;
pub const MIC_LEN: usize = 4;

/// Cipher nonce length: reversed MAC, product id, counter, extended counter.
pub const NONCE_LEN: usize = 12;
