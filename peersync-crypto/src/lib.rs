//! Encryption layer for PeerSync.
//!
//! Sync payloads are protected with ChaCha20-Poly1305 using a two-tier key
//! scheme:
//!
//! 1. Pairwise key: random, established once per device pair during pairing
//! 2. Payload key: random per payload, wrapped with the pairwise key
//!
//! Pairing offers protected by a PIN derive their one-time key with Argon2id.

mod cipher;
mod envelope;
mod error;
mod key;
mod service;

pub use cipher::{EncryptedData, NONCE_SIZE, TAG_SIZE, decrypt, encrypt};
pub use envelope::{EnvelopeMetadata, SealedPayload, open, seal};
pub use error::{CryptoError, CryptoResult};
pub use key::{
    KEY_SIZE, KdfParams, PIN_DIGITS, SALT_SIZE, Salt, SymmetricKey, derive_key, generate_key,
    generate_pin,
};
pub use service::{ChaChaEncryptionService, EncryptionService};
