//! MiBeacon advertisement frame decoding.
//!
//! A MiBeacon frame starts with a 16-bit control field whose flag bits
//! determine which of the following sections are present: a 6-byte device
//! address, a capability byte and an object payload. Vendor firmware ships
//! truncated frames in the wild, so optional sections that do not fit in
//! the remaining bytes are omitted rather than failing the whole decode.

use crate::protocol::constants::MIN_ADVERTISEMENT_LEN;

/// Flags decoded from the 16-bit MiBeacon frame control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameControl {
    /// The object payload is encrypted with the device bind key.
    pub is_encrypted: bool,
    /// The frame carries the device MAC address.
    pub has_mac: bool,
    /// The frame carries a capability byte.
    pub has_capability: bool,
    /// The frame carries an object payload.
    pub has_object: bool,
    /// The frame was relayed over a mesh network.
    pub is_mesh: bool,
    /// The device has been registered with the vendor cloud.
    pub is_registered: bool,
    /// The binding between device and key has been confirmed.
    pub is_binding_confirmed: bool,
}

impl FrameControl {
    /// Decodes the control flags from the raw 16-bit field.
    pub fn from_bits(bits: u16) -> Self {
        FrameControl {
            is_encrypted: bits & (1 << 3) != 0,
            has_mac: bits & (1 << 4) != 0,
            has_capability: bits & (1 << 5) != 0,
            has_object: bits & (1 << 6) != 0,
            is_mesh: bits & (1 << 7) != 0,
            is_registered: bits & (1 << 8) != 0,
            is_binding_confirmed: bits & (1 << 9) != 0,
        }
    }
}

/// A decoded MiBeacon advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub frame_control: FrameControl,
    /// Raw control bits, kept for AAD construction during decryption.
    pub frame_control_bits: u16,
    pub product_id: u16,
    pub frame_counter: u8,
    /// Colon-separated upper-case address, present iff `has_mac`.
    pub mac: Option<String>,
    /// Capability byte, present iff `has_capability` and not truncated.
    pub capability: Option<u8>,
    /// Object payload, present iff `has_object`.
    pub payload: Option<Vec<u8>>,
}

/// Decodes a MiBeacon advertisement from raw service data bytes.
///
/// Returns `None` for frames shorter than the fixed header. Truncated
/// optional sections are dropped silently.
pub fn decode_advertisement(bytes: &[u8]) -> Option<Advertisement> {
    if bytes.len() < MIN_ADVERTISEMENT_LEN {
        return None;
    }

    let frame_control_bits = u16::from_le_bytes([bytes[0], bytes[1]]);
    let frame_control = FrameControl::from_bits(frame_control_bits);
    let product_id = u16::from_le_bytes([bytes[2], bytes[3]]);
    let frame_counter = bytes[4];

    let mut offset = MIN_ADVERTISEMENT_LEN;

    let mac = if frame_control.has_mac && bytes.len() >= offset + 6 {
        let mac = format_mac_reversed(&bytes[offset..offset + 6]);
        offset += 6;
        Some(mac)
    } else {
        None
    };

    let capability = if frame_control.has_capability && bytes.len() > offset {
        let capability = bytes[offset];
        offset += 1;
        Some(capability)
    } else {
        None
    };

    let payload = if frame_control.has_object {
        Some(bytes[offset..].to_vec())
    } else {
        None
    };

    Some(Advertisement {
        frame_control,
        frame_control_bits,
        product_id,
        frame_counter,
        mac,
        capability,
        payload,
    })
}

/// Formats an on-wire (little-endian) address as `AA:BB:CC:DD:EE:FF`.
fn format_mac_reversed(wire: &[u8]) -> String {
    wire.iter()
        .rev()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses a colon- or dash-separated address into its 6 raw bytes.
pub fn parse_mac(mac: &str) -> crate::error::Result<[u8; 6]> {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(crate::error::ScaleError::InvalidAddress(mac.to_string()));
    }
    let mut out = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16)
            .map_err(|_| crate::error::ScaleError::InvalidAddress(mac.to_string()))?;
    }
    Ok(out)
}
