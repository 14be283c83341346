//! Wire-format layer: MiBeacon frames, payload decryption and measurement
//! parsing. Everything here is pure and synchronous; the session layer in
//! [`crate::session`] feeds it bytes from the hardware.

pub mod constants;
pub mod crypto;
pub mod frame;
pub mod measurement;

pub use constants::*;
pub use crypto::{DecryptionParams, build_aad, build_nonce, decrypt, decrypt_unverified,
    decrypt_legacy_ecb, encrypt, is_valid_ble_key, parse_ble_key};
pub use frame::{Advertisement, FrameControl, decode_advertisement, parse_mac};
pub use measurement::{
    GattBodyComposition, GattWeightMeasurement, ImpedanceObject, MeasurementFrame,
    RawMeasurement, StabilityTracker, WeightObject, parse_advertisement_data,
    parse_body_composition, parse_impedance_object, parse_weight_measurement,
    parse_weight_object,
};
