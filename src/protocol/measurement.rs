//! Measurement parsing for all three data representations the scale speaks:
//! MiBeacon object records, the standard GATT Weight Measurement (0x2A9D)
//! and the standard GATT Body Composition Measurement (0x2A9C).
//!
//! Parsing is deliberately tolerant: records that do not fit the remaining
//! buffer end the walk instead of failing it, and readings that fail the
//! validity checks (unstable weight, out-of-range impedance) are dropped
//! without an error so callers can distinguish "nothing yet" from "corrupt".

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::protocol::constants::{
    IMPEDANCE_MAX_OHM, LB_TO_KG, MAX_PLAUSIBLE_WEIGHT_KG, MIN_PLAUSIBLE_WEIGHT_KG,
    OBJECT_ID_IMPEDANCE, OBJECT_ID_WEIGHT, WEIGHT_UNIT_CATTY, WEIGHT_UNIT_KG,
};

/// A weight reading from a MiBeacon object record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightObject {
    pub weight_kg: f64,
    /// The reading has settled; only stable readings are surfaced.
    pub is_stable: bool,
    /// The user stepped off the scale.
    pub weight_removed: bool,
    /// The scale has begun its bio-impedance sweep.
    pub impedance_started: bool,
}

/// A bio-impedance reading from a MiBeacon object record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImpedanceObject {
    pub impedance_ohm: u16,
    /// Complete only strictly inside (0, 3000) ohms.
    pub is_complete: bool,
}

/// Fields extracted from one frame; either side may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeasurementFrame {
    pub weight_kg: Option<f64>,
    pub impedance_ohm: Option<u16>,
}

impl MeasurementFrame {
    pub fn is_empty(&self) -> bool {
        self.weight_kg.is_none() && self.impedance_ohm.is_none()
    }
}

/// The finished measurement handed to the application layer.
///
/// Only fields that passed the validity checks are populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMeasurement {
    pub weight_kg: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impedance_ohm: Option<u16>,
    /// RFC 3339 capture time.
    pub timestamp: String,
}

impl RawMeasurement {
    pub fn new(weight_kg: f64, impedance_ohm: Option<u16>) -> Self {
        Self {
            weight_kg,
            impedance_ohm,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Rounds to two decimal places for presentation-stable weights.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parses a MiBeacon weight object body: control byte then raw u16 LE.
///
/// Control bits: 0 = catty unit, 1 = impedance sweep started, 5 = stable,
/// 7 = weight removed.
pub fn parse_weight_object(bytes: &[u8]) -> Option<WeightObject> {
    if bytes.len() < 3 {
        return None;
    }
    let control = bytes[0];
    let raw = u16::from_le_bytes([bytes[1], bytes[2]]);
    let unit = if control & 0x01 != 0 { WEIGHT_UNIT_CATTY } else { WEIGHT_UNIT_KG };
    Some(WeightObject {
        weight_kg: raw as f64 * unit,
        is_stable: control & (1 << 5) != 0,
        weight_removed: control & (1 << 7) != 0,
        impedance_started: control & (1 << 1) != 0,
    })
}

/// Parses a MiBeacon impedance object body: raw u16 LE in ohms.
pub fn parse_impedance_object(bytes: &[u8]) -> Option<ImpedanceObject> {
    if bytes.len() < 2 {
        return None;
    }
    let impedance_ohm = u16::from_le_bytes([bytes[0], bytes[1]]);
    Some(ImpedanceObject {
        impedance_ohm,
        is_complete: impedance_ohm > 0 && impedance_ohm < IMPEDANCE_MAX_OHM,
    })
}

/// Walks a decrypted object stream of `[id][len][body]` records and
/// collects the validated weight and impedance readings.
///
/// Records whose declared length would overrun the buffer end the walk;
/// unknown record ids are skipped.
pub fn parse_advertisement_data(bytes: &[u8]) -> MeasurementFrame {
    let mut frame = MeasurementFrame::default();
    let mut offset = 0;

    while offset + 2 <= bytes.len() {
        let object_id = bytes[offset];
        let body_len = bytes[offset + 1] as usize;
        let body_end = offset + 2 + body_len;
        if body_end > bytes.len() {
            break;
        }
        let body = &bytes[offset + 2..body_end];

        match object_id {
            OBJECT_ID_WEIGHT => {
                if let Some(weight) = parse_weight_object(body) {
                    if weight.is_stable
                        && !weight.weight_removed
                        && plausible_weight(weight.weight_kg)
                    {
                        frame.weight_kg = Some(round2(weight.weight_kg));
                    }
                }
            }
            OBJECT_ID_IMPEDANCE => {
                if let Some(impedance) = parse_impedance_object(body) {
                    if impedance.is_complete {
                        frame.impedance_ohm = Some(impedance.impedance_ohm);
                    }
                }
            }
            _ => {}
        }
        offset = body_end;
    }

    frame
}

fn plausible_weight(weight_kg: f64) -> bool {
    (MIN_PLAUSIBLE_WEIGHT_KG..=MAX_PLAUSIBLE_WEIGHT_KG).contains(&weight_kg)
}

/// A standard GATT Weight Measurement (0x2A9D) reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GattWeightMeasurement {
    pub weight_kg: f64,
    pub is_imperial: bool,
    pub user_id: Option<u8>,
    pub bmi: Option<f64>,
    pub height_cm: Option<f64>,
}

/// Parses a Weight Measurement (0x2A9D) characteristic value.
///
/// Flag bits, consumed in ascending order: 0 imperial, 1 timestamp
/// (7 bytes), 2 user id (1 byte), 3 BMI and height (4 bytes). The cursor
/// advances over every present field whether or not it is surfaced.
pub fn parse_weight_measurement(data: &[u8]) -> Option<GattWeightMeasurement> {
    if data.len() < 3 {
        return None;
    }

    let flags = data[0];
    let is_imperial = flags & 0x01 != 0;
    let has_timestamp = flags & 0x02 != 0;
    let has_user_id = flags & 0x04 != 0;
    let has_bmi_height = flags & 0x08 != 0;

    let raw = u16::from_le_bytes([data[1], data[2]]);
    let weight_kg = if is_imperial {
        raw as f64 * 0.01 * LB_TO_KG
    } else {
        raw as f64 * WEIGHT_UNIT_KG
    };

    let mut measurement = GattWeightMeasurement {
        weight_kg: round2(weight_kg),
        is_imperial,
        ..Default::default()
    };

    let mut offset = 3;
    if has_timestamp && data.len() >= offset + 7 {
        offset += 7;
    }
    if has_user_id && data.len() >= offset + 1 {
        measurement.user_id = Some(data[offset]);
        offset += 1;
    }
    if has_bmi_height && data.len() >= offset + 4 {
        let bmi_raw = u16::from_le_bytes([data[offset], data[offset + 1]]);
        let height_raw = u16::from_le_bytes([data[offset + 2], data[offset + 3]]);
        measurement.bmi = Some(bmi_raw as f64 * 0.1);
        measurement.height_cm = Some(height_raw as f64 * 0.1);
    }

    Some(measurement)
}

/// A standard GATT Body Composition Measurement (0x2A9C) reading.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GattBodyComposition {
    pub body_fat_percent: f64,
    pub impedance_ohm: Option<u16>,
    pub weight_kg: Option<f64>,
}

/// Parses a Body Composition Measurement (0x2A9C) characteristic value.
///
/// The 16-bit flag field is followed by the mandatory body fat percentage;
/// the optional fields are then consumed strictly in ascending flag-bit
/// order with their fixed widths: timestamp (7), user id (1), basal
/// metabolism (2), muscle percentage (2), muscle mass (2), fat free mass
/// (2), soft lean mass (2), body water mass (2), impedance (2), weight (2),
/// height (2).
pub fn parse_body_composition(data: &[u8]) -> Option<GattBodyComposition> {
    if data.len() < 4 {
        return None;
    }

    let flags = u16::from_le_bytes([data[0], data[1]]);
    let is_imperial = flags & 0x0001 != 0;
    let body_fat_raw = u16::from_le_bytes([data[2], data[3]]);

    let mut measurement = GattBodyComposition {
        body_fat_percent: body_fat_raw as f64 * 0.1,
        ..Default::default()
    };

    let mut offset = 4;
    // (bit, width) for the skipped optional fields before impedance.
    let skipped: [(u16, usize); 7] = [
        (0x0002, 7), // timestamp
        (0x0004, 1), // user id
        (0x0008, 2), // basal metabolism
        (0x0010, 2), // muscle percentage
        (0x0020, 2), // muscle mass
        (0x0040, 2), // fat free mass
        (0x0080, 2), // soft lean mass
    ];
    for (bit, width) in skipped {
        if flags & bit != 0 {
            if data.len() < offset + width {
                return Some(measurement);
            }
            offset += width;
        }
    }
    // body water mass
    if flags & 0x0100 != 0 {
        if data.len() < offset + 2 {
            return Some(measurement);
        }
        offset += 2;
    }
    // impedance, resolution 0.1 ohm
    if flags & 0x0200 != 0 {
        if data.len() < offset + 2 {
            return Some(measurement);
        }
        let raw = u16::from_le_bytes([data[offset], data[offset + 1]]);
        measurement.impedance_ohm = Some((raw as f64 * 0.1).round() as u16);
        offset += 2;
    }
    // weight
    if flags & 0x0400 != 0 {
        if data.len() < offset + 2 {
            return Some(measurement);
        }
        let raw = u16::from_le_bytes([data[offset], data[offset + 1]]);
        let weight_kg = if is_imperial {
            raw as f64 * 0.01 * LB_TO_KG
        } else {
            raw as f64 * WEIGHT_UNIT_KG
        };
        measurement.weight_kg = Some(round2(weight_kg));
    }

    Some(measurement)
}

/// Detects stabilization for standard GATT readings, which unlike MiBeacon
/// carry no stability flag. A reading counts as stable once enough
/// consecutive samples stay within tolerance of each other.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    threshold: u32,
    tolerance_kg: f64,
    stable_count: u32,
    last_weight: Option<f64>,
}

impl StabilityTracker {
    pub fn new(threshold: u32, tolerance_kg: f64) -> Self {
        Self {
            threshold: threshold.max(1),
            tolerance_kg,
            stable_count: 0,
            last_weight: None,
        }
    }

    /// Feeds one reading; returns true once the weight has stabilized.
    pub fn check(&mut self, weight_kg: f64) -> bool {
        match self.last_weight {
            Some(last) if (weight_kg - last).abs() <= self.tolerance_kg => {
                self.stable_count += 1;
            }
            _ => {
                self.stable_count = 1;
            }
        }
        self.last_weight = Some(weight_kg);
        self.stable_count >= self.threshold
    }

    /// Resets the tracker for a new measurement session.
    pub fn reset(&mut self) {
        self.stable_count = 0;
        self.last_weight = None;
    }
}
