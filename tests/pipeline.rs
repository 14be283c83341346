//! End-to-end pipeline: advertisement bytes through frame decoding,
//! payload decryption and object parsing to a finished measurement.

use miscale_ble::protocol::crypto::{self, DecryptionParams};
use miscale_ble::protocol::frame::{decode_advertisement, parse_mac};
use miscale_ble::protocol::measurement::{RawMeasurement, parse_advertisement_data};

const KEY: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
    0xff,
];
const MAC: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
const PRODUCT_ID: u16 = 0x181D;
const FRAME_COUNTER: u8 = 5;
// encrypted + mac + object
const FRAME_CONTROL: u16 = 0x0058;

/// Builds a full MiBeacon advertisement around the given encrypted payload.
fn assemble_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&FRAME_CONTROL.to_le_bytes());
    frame.extend_from_slice(&PRODUCT_ID.to_le_bytes());
    frame.push(FRAME_COUNTER);
    // MAC travels reversed on the wire.
    frame.extend(MAC.iter().rev());
    frame.extend_from_slice(payload);
    frame
}

fn decrypt_frame(bytes: &[u8]) -> Vec<u8> {
    let adv = decode_advertisement(bytes).expect("frame decodes");
    assert!(adv.frame_control.is_encrypted);
    assert_eq!(adv.product_id, PRODUCT_ID);
    assert_eq!(adv.frame_counter, FRAME_COUNTER);
    assert_eq!(adv.mac.as_deref(), Some("AA:BB:CC:DD:EE:FF"));

    let mac = parse_mac(adv.mac.as_deref().unwrap()).unwrap();
    let params = DecryptionParams {
        payload: adv.payload.as_deref().unwrap(),
        key: &KEY,
        frame_counter: adv.frame_counter,
        mac,
        product_id: adv.product_id,
        frame_control_bits: adv.frame_control_bits,
    };
    crypto::decrypt(&params).expect("payload decrypts")
}

#[test]
fn stable_weight_survives_the_whole_pipeline() {
    // Weight object: ctrl 0x20 (stable), 15100 raw units = 75.50 kg.
    let plaintext = [0x16, 0x03, 0x20, 0xFC, 0x3A];
    let payload = crypto::encrypt(
        &plaintext,
        &KEY,
        MAC,
        PRODUCT_ID,
        FRAME_COUNTER,
        FRAME_CONTROL,
        [0x01, 0x00, 0x00],
    )
    .unwrap();

    let objects = decrypt_frame(&assemble_frame(&payload));
    assert_eq!(objects, plaintext);

    let parsed = parse_advertisement_data(&objects);
    assert_eq!(parsed.weight_kg, Some(75.5));
    assert_eq!(parsed.impedance_ohm, None);

    let measurement = RawMeasurement::new(parsed.weight_kg.unwrap(), parsed.impedance_ohm);
    assert_eq!(measurement.weight_kg, 75.5);
    assert!(measurement.impedance_ohm.is_none());
}

#[test]
fn weight_and_impedance_objects_in_one_frame() {
    // Weight 62.30 kg (12460 raw) followed by impedance 512 ohm.
    let plaintext = [
        0x16, 0x03, 0x20, 0xAC, 0x30, // weight record
        0x17, 0x02, 0x00, 0x02, // impedance record
    ];
    let payload = crypto::encrypt(
        &plaintext,
        &KEY,
        MAC,
        PRODUCT_ID,
        FRAME_COUNTER,
        FRAME_CONTROL,
        [0x02, 0x00, 0x00],
    )
    .unwrap();

    let objects = decrypt_frame(&assemble_frame(&payload));
    let parsed = parse_advertisement_data(&objects);
    assert_eq!(parsed.weight_kg, Some(62.3));
    assert_eq!(parsed.impedance_ohm, Some(512));
}

#[test]
fn tampered_ciphertext_is_rejected() {
    let plaintext = [0x16, 0x03, 0x20, 0xFC, 0x3A];
    let mut payload = crypto::encrypt(
        &plaintext,
        &KEY,
        MAC,
        PRODUCT_ID,
        FRAME_COUNTER,
        FRAME_CONTROL,
        [0x03, 0x00, 0x00],
    )
    .unwrap();
    payload[0] ^= 0x01;

    let bytes = assemble_frame(&payload);
    let adv = decode_advertisement(&bytes).unwrap();
    let mac = parse_mac(adv.mac.as_deref().unwrap()).unwrap();
    let params = DecryptionParams {
        payload: adv.payload.as_deref().unwrap(),
        key: &KEY,
        frame_counter: adv.frame_counter,
        mac,
        product_id: adv.product_id,
        frame_control_bits: adv.frame_control_bits,
    };
    assert!(crypto::decrypt(&params).is_err());
}

#[test]
fn wrong_key_fails_verification() {
    let plaintext = [0x16, 0x03, 0x20, 0xFC, 0x3A];
    let payload = crypto::encrypt(
        &plaintext,
        &KEY,
        MAC,
        PRODUCT_ID,
        FRAME_COUNTER,
        FRAME_CONTROL,
        [0x04, 0x00, 0x00],
    )
    .unwrap();

    let bytes = assemble_frame(&payload);
    let adv = decode_advertisement(&bytes).unwrap();
    let mac = parse_mac(adv.mac.as_deref().unwrap()).unwrap();
    let wrong_key = [0u8; 16];
    let params = DecryptionParams {
        payload: adv.payload.as_deref().unwrap(),
        key: &wrong_key,
        frame_counter: adv.frame_counter,
        mac,
        product_id: adv.product_id,
        frame_control_bits: adv.frame_control_bits,
    };
    assert!(crypto::decrypt(&params).is_err());
}
