//! Failures raised while sealing sync payloads or deriving pairing keys.

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Why a payload could not be sealed or opened, or why a key was unusable.
///
/// Variants carrying a `String` hold the underlying library message. None of
/// them ever include key material.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Argon2id rejected its parameters, or a pairing salt could not be read.
    #[error("could not derive key: {0}")]
    KeyDerivation(String),

    /// The AEAD refused to seal a payload.
    #[error("could not seal payload: {0}")]
    Encryption(String),

    /// A sealed payload did not open. A peer holding a different pairwise
    /// key looks the same as a corrupted or truncated chunk.
    #[error("could not open payload: {0}")]
    Decryption(String),

    /// Key bytes from a trust store or an envelope were not 32 bytes.
    #[error("key must be {expected} bytes, found {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Envelope nonce bytes had the wrong size.
    #[error("nonce must be {expected} bytes, found {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },

    /// Envelope metadata was not valid JSON.
    #[error("malformed envelope metadata: {0}")]
    Serialization(#[from] serde_json::Error),
}
