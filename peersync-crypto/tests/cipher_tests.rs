use peersync_crypto::{
    ChaChaEncryptionService, CryptoError, EncryptedData, EncryptionService, NONCE_SIZE, decrypt,
    encrypt, generate_key,
};

#[test]
fn encrypt_decrypt_roundtrip() {
    let key = generate_key();
    let encrypted = encrypt(&key, b"Hello, World!").unwrap();
    assert_eq!(decrypt(&key, &encrypted).unwrap(), b"Hello, World!");
}

#[test]
fn encrypt_decrypt_empty() {
    let key = generate_key();
    let encrypted = encrypt(&key, b"").unwrap();
    assert_eq!(decrypt(&key, &encrypted).unwrap(), b"");
}

#[test]
fn nonces_are_unique_per_encryption() {
    let key = generate_key();
    let a = encrypt(&key, b"same").unwrap();
    let b = encrypt(&key, b"same").unwrap();
    assert_ne!(a.nonce, b.nonce);
    assert_ne!(a.ciphertext, b.ciphertext);
}

#[test]
fn wrong_key_fails_decryption() {
    let encrypted = encrypt(&generate_key(), b"Secret").unwrap();
    let err = decrypt(&generate_key(), &encrypted).unwrap_err();
    assert!(matches!(err, CryptoError::Decryption(_)));
}

#[test]
fn tampered_data_fails_decryption() {
    let key = generate_key();
    let mut encrypted = encrypt(&key, b"Secret").unwrap();
    encrypted.ciphertext[0] ^= 0xFF;
    assert!(decrypt(&key, &encrypted).is_err());
}

#[test]
fn base64_roundtrip() {
    let key = generate_key();
    let encrypted = encrypt(&key, b"payload").unwrap();
    let decoded = EncryptedData::from_base64(&encrypted.to_base64()).unwrap();
    assert_eq!(decoded, encrypted);
    assert_eq!(decrypt(&key, &decoded).unwrap(), b"payload");
}

#[test]
fn from_base64_rejects_short_input() {
    assert!(EncryptedData::from_base64("AAAA").is_err());
    assert!(EncryptedData::from_base64("not base64!").is_err());
}

#[test]
fn from_parts_checks_nonce_length() {
    let err = EncryptedData::from_parts(&[0u8; 5], vec![1, 2, 3]).unwrap_err();
    assert!(matches!(
        err,
        CryptoError::InvalidNonceLength { expected: NONCE_SIZE, actual: 5 }
    ));
}

// ── EncryptionService ───────────────────────────────────────────

#[test]
fn service_roundtrip() {
    let service = ChaChaEncryptionService;
    let key = service.generate_key();
    let encrypted = service.encrypt(b"ops", &key).unwrap();
    assert_eq!(service.decrypt(&encrypted, &key).unwrap(), b"ops");
}

#[test]
fn service_rejects_wrong_key() {
    let service = ChaChaEncryptionService;
    let encrypted = service.encrypt(b"ops", &service.generate_key()).unwrap();
    assert!(service.decrypt(&encrypted, &service.generate_key()).is_err());
}
