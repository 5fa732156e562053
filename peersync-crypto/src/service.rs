//! Encryption service abstraction.
//!
//! The sync engine depends on `Arc<dyn EncryptionService>` and never touches
//! the cipher directly, so tests and embedders can substitute their own.

use crate::cipher::{self, EncryptedData};
use crate::error::CryptoResult;
use crate::key::{self, SymmetricKey};

/// Symmetric AEAD operations used to protect sync payloads.
pub trait EncryptionService: Send + Sync {
    /// Generates a fresh random key.
    fn generate_key(&self) -> SymmetricKey;

    /// Encrypts `plaintext`, returning ciphertext and nonce.
    fn encrypt(&self, plaintext: &[u8], key: &SymmetricKey) -> CryptoResult<EncryptedData>;

    /// Decrypts `encrypted`. Fails with [`crate::CryptoError::Decryption`] on
    /// a wrong key or tampered input.
    fn decrypt(&self, encrypted: &EncryptedData, key: &SymmetricKey) -> CryptoResult<Vec<u8>>;
}

/// ChaCha20-Poly1305 with OS randomness.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaEncryptionService;

impl EncryptionService for ChaChaEncryptionService {
    fn generate_key(&self) -> SymmetricKey {
        key::generate_key()
    }

    fn encrypt(&self, plaintext: &[u8], key: &SymmetricKey) -> CryptoResult<EncryptedData> {
        cipher::encrypt(key, plaintext)
    }

    fn decrypt(&self, encrypted: &EncryptedData, key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
        cipher::decrypt(key, encrypted)
    }
}
