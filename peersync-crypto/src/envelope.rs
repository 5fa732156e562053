//! Two-tier payload encryption.
//!
//! Every payload is encrypted with its own random key; that payload key is
//! in turn encrypted with the long-lived pairwise key of the recipient. Only
//! the wrapped form of the payload key ever leaves the device.

use crate::cipher::{EncryptedData, NONCE_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::key::{KEY_SIZE, SymmetricKey};
use crate::service::EncryptionService;
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// A payload sealed for one recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub metadata: EnvelopeMetadata,
}

/// What a recipient needs besides the ciphertext to open a payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    /// The payload key, encrypted with the pairwise key (base64).
    pub session_key: String,
    /// The payload nonce (base64).
    pub nonce: String,
}

/// Encrypts `plaintext` under a fresh payload key wrapped with `pairwise_key`.
pub fn seal(
    service: &dyn EncryptionService,
    plaintext: &[u8],
    pairwise_key: &SymmetricKey,
) -> CryptoResult<SealedPayload> {
    let payload_key = service.generate_key();
    let body = service.encrypt(plaintext, &payload_key)?;
    let wrapped = service.encrypt(payload_key.as_bytes(), pairwise_key)?;

    Ok(SealedPayload {
        ciphertext: body.ciphertext,
        metadata: EnvelopeMetadata {
            session_key: wrapped.to_base64(),
            nonce: STANDARD.encode(body.nonce),
        },
    })
}

/// Opens a payload produced by [`seal`].
pub fn open(
    service: &dyn EncryptionService,
    ciphertext: &[u8],
    metadata: &EnvelopeMetadata,
    pairwise_key: &SymmetricKey,
) -> CryptoResult<Vec<u8>> {
    let wrapped = EncryptedData::from_base64(&metadata.session_key)?;
    let mut key_bytes = service.decrypt(&wrapped, pairwise_key)?;
    if key_bytes.len() != KEY_SIZE {
        let actual = key_bytes.len();
        key_bytes.zeroize();
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual,
        });
    }
    let payload_key = SymmetricKey::from_slice(&key_bytes);
    key_bytes.zeroize();
    let payload_key = payload_key?;

    let nonce = STANDARD
        .decode(&metadata.nonce)
        .map_err(|e| CryptoError::Decryption(format!("invalid base64 nonce: {e}")))?;
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonceLength {
            expected: NONCE_SIZE,
            actual: nonce.len(),
        });
    }
    let body = EncryptedData::from_parts(&nonce, ciphertext.to_vec())?;
    service.decrypt(&body, &payload_key)
}
