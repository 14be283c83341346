//! MiBeacon payload decryption.
//!
//! Encrypted frames carry `[ciphertext][3-byte extended counter][4-byte MIC]`
//! as their object payload. The cipher nonce is rebuilt from frame metadata
//! (reversed MAC, product id, frame counter, extended counter) and the
//! additional authenticated data binds the frame control bits and product id.
//!
//! Two decryption paths exist. The default verifies the MIC with AES-CCM.
//! [`decrypt_unverified`] reproduces the historical counter-mode decrypt that
//! slices the MIC off without checking it; some firmware revisions emit
//! frames whose MIC does not validate, and development fixtures predate the
//! authenticated path. A third, nonce-free ECB path serves legacy firmware.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit, KeyIvInit, StreamCipher};
use ccm::Ccm;
use ccm::aead::{Aead, Payload};
use ccm::consts::{U4, U12};

use crate::error::{Result, ScaleError};
use crate::protocol::constants::{BLE_KEY_HEX_LEN, EXT_COUNTER_LEN, MIC_LEN, NONCE_LEN};

/// AES-CCM with the 4-byte tag and 12-byte nonce the wire format defines.
type MiBeaconCcm = Ccm<Aes128, U4, U12>;

/// AES-CTR over the 12-byte nonce padded to a 16-byte counter block.
type MiBeaconCtr = ctr::Ctr32BE<Aes128>;

/// Everything needed to decrypt one frame's object payload.
#[derive(Debug, Clone)]
pub struct DecryptionParams<'a> {
    /// Raw object payload including extended counter and MIC trailer.
    pub payload: &'a [u8],
    /// Device bind key; must be exactly 16 bytes.
    pub key: &'a [u8],
    pub frame_counter: u8,
    /// Device address in display order (`AA` first for `AA:BB:...`).
    pub mac: [u8; 6],
    pub product_id: u16,
    /// Raw frame control field, bound into the AAD.
    pub frame_control_bits: u16,
}

/// Returns true for a 32-hex-character bind key (case-insensitive).
pub fn is_valid_ble_key(key: &str) -> bool {
    key.len() == BLE_KEY_HEX_LEN && key.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses a hex bind key into its 16 raw bytes.
pub fn parse_ble_key(key: &str) -> Result<[u8; 16]> {
    if !is_valid_ble_key(key) {
        return Err(ScaleError::InvalidKey(key.len()));
    }
    let bytes = hex::decode(key).map_err(|_| ScaleError::InvalidKey(key.len()))?;
    let mut out = [0u8; 16];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Builds the 12-byte cipher nonce.
///
/// Layout: reversed MAC (6) ‖ product id LE (2) ‖ frame counter (1) ‖ up to
/// 3 extended counter bytes. Pure function of its inputs.
pub fn build_nonce(mac: [u8; 6], product_id: u16, frame_counter: u8, ext: &[u8]) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    for (i, b) in mac.iter().rev().enumerate() {
        nonce[i] = *b;
    }
    nonce[6..8].copy_from_slice(&product_id.to_le_bytes());
    nonce[8] = frame_counter;
    let n = ext.len().min(EXT_COUNTER_LEN);
    nonce[9..9 + n].copy_from_slice(&ext[..n]);
    nonce
}

/// Builds the 4-byte AAD: frame control LE ‖ product id LE.
pub fn build_aad(frame_control_bits: u16, product_id: u16) -> [u8; 4] {
    let mut aad = [0u8; 4];
    aad[..2].copy_from_slice(&frame_control_bits.to_le_bytes());
    aad[2..].copy_from_slice(&product_id.to_le_bytes());
    aad
}

/// Splits a payload into ciphertext, extended counter and MIC.
fn split_payload<'a>(params: &DecryptionParams<'a>) -> Result<(&'a [u8], &'a [u8], &'a [u8])> {
    if params.key.len() != 16 {
        return Err(ScaleError::InvalidKey(params.key.len()));
    }
    let len = params.payload.len();
    if len < EXT_COUNTER_LEN + MIC_LEN {
        return Err(ScaleError::PayloadTooShort(len));
    }
    let mic_start = len - MIC_LEN;
    let ext_start = mic_start - EXT_COUNTER_LEN;
    Ok((
        &params.payload[..ext_start],
        &params.payload[ext_start..mic_start],
        &params.payload[mic_start..],
    ))
}

/// Decrypts and authenticates an encrypted object payload.
///
/// The 4-byte MIC is verified against the AAD; tampered or stale frames
/// fail with [`ScaleError::DecryptionFailed`].
pub fn decrypt(params: &DecryptionParams<'_>) -> Result<Vec<u8>> {
    let (ciphertext, ext, mic) = split_payload(params)?;
    let nonce = build_nonce(params.mac, params.product_id, params.frame_counter, ext);
    let aad = build_aad(params.frame_control_bits, params.product_id);

    let mut sealed = Vec::with_capacity(ciphertext.len() + MIC_LEN);
    sealed.extend_from_slice(ciphertext);
    sealed.extend_from_slice(mic);

    let cipher = MiBeaconCcm::new(GenericArray::from_slice(params.key));
    cipher
        .decrypt(
            GenericArray::from_slice(&nonce),
            Payload { msg: &sealed, aad: &aad },
        )
        .map_err(|_| ScaleError::DecryptionFailed("MIC verification failed".to_string()))
}

/// Decrypts an encrypted object payload without verifying the MIC.
///
/// Counter-mode keystream decrypt over the nonce padded to a 16-byte
/// counter block. The MIC is sliced off and ignored, matching frames whose
/// tag does not validate and pre-authentication fixtures.
pub fn decrypt_unverified(params: &DecryptionParams<'_>) -> Result<Vec<u8>> {
    let (ciphertext, ext, _mic) = split_payload(params)?;
    let nonce = build_nonce(params.mac, params.product_id, params.frame_counter, ext);

    let mut iv = [0u8; 16];
    iv[..NONCE_LEN].copy_from_slice(&nonce);

    let mut cipher = MiBeaconCtr::new(
        GenericArray::from_slice(params.key),
        GenericArray::from_slice(&iv),
    );
    let mut plaintext = ciphertext.to_vec();
    cipher.apply_keystream(&mut plaintext);
    Ok(plaintext)
}

/// Straight AES block decrypt for legacy firmware with no nonce scheme.
///
/// Input must be a whole number of 16-byte blocks; no padding is applied.
pub fn decrypt_legacy_ecb(data: &[u8], key: &[u8; 16]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(ScaleError::PayloadTooShort(data.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = data.to_vec();
    for chunk in out.chunks_exact_mut(16) {
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
    }
    Ok(out)
}

/// Encrypts a plaintext object stream into a full MiBeacon payload.
///
/// Produces `[ciphertext][ext][mic]` with an authenticated MIC, the exact
/// inverse of [`decrypt`]. Used by fixtures and simulated devices.
pub fn encrypt(
    plaintext: &[u8],
    key: &[u8; 16],
    mac: [u8; 6],
    product_id: u16,
    frame_counter: u8,
    frame_control_bits: u16,
    ext: [u8; EXT_COUNTER_LEN],
) -> Result<Vec<u8>> {
    let nonce = build_nonce(mac, product_id, frame_counter, &ext);
    let aad = build_aad(frame_control_bits, product_id);

    let cipher = MiBeaconCcm::new(GenericArray::from_slice(key));
    let sealed = cipher
        .encrypt(
            GenericArray::from_slice(&nonce),
            Payload { msg: plaintext, aad: &aad },
        )
        .map_err(|_| ScaleError::DecryptionFailed("encryption failed".to_string()))?;

    // sealed = ciphertext ‖ tag; the wire trailer interleaves the counter.
    let (ciphertext, mic) = sealed.split_at(sealed.len() - MIC_LEN);
    let mut payload = Vec::with_capacity(sealed.len() + EXT_COUNTER_LEN);
    payload.extend_from_slice(ciphertext);
    payload.extend_from_slice(&ext);
    payload.extend_from_slice(mic);
    Ok(payload)
}
