//! Payload encryption using ChaCha20-Poly1305
//!
//! Every record payload is encrypted under the data-encryption key of a key
//! epoch. The relay and the local index only ever see the output of this
//! module:
//! - **Authenticated**: a tampered ciphertext fails the AEAD tag check and is
//!   reported as corruption, never partially decrypted
//! - **Verifiable**: a BLAKE3 hash of the plaintext rides inside the
//!   ciphertext, so a decrypt can double-check integrity end to end
//! - **Epoch-scoped**: keys are generated per epoch; rotating an epoch means
//!   re-encrypting payloads with a fresh `DataKey`

use std::ops::Deref;

use chacha20poly1305::Key;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of a data-encryption key in bytes (256 bits)
pub const DATA_KEY_SIZE: usize = 32;
/// Size of the BLAKE3 integrity header in bytes
pub const BLAKE3_HASH_SIZE: usize = 32;

/// Errors that can occur during payload encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("cipher error: {0}")]
    Default(#[from] anyhow::Error),
    /// AEAD authentication failed: wrong key or tampered ciphertext.
    ///
    /// Callers must map this to "unauthorized" when the key is in question
    /// and to "corrupt delta" when the ciphertext came off the wire.
    #[error("payload failed authentication")]
    Unauthenticated,
}

/// A 256-bit symmetric data-encryption key for one key epoch
///
/// Ciphertext layout: `nonce (12) || encrypted(hash(32) || plaintext) || tag (16)`.
/// The BLAKE3 hash of the plaintext is prepended before encryption so a
/// successful decrypt can also verify content integrity.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct DataKey([u8; DATA_KEY_SIZE]);

impl Deref for DataKey {
    type Target = [u8; DATA_KEY_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; DATA_KEY_SIZE]> for DataKey {
    fn from(bytes: [u8; DATA_KEY_SIZE]) -> Self {
        DataKey(bytes)
    }
}

impl DataKey {
    /// Generate a new random data key using a cryptographically secure RNG
    pub fn generate() -> Self {
        let mut buff = [0; DATA_KEY_SIZE];
        getrandom::getrandom(&mut buff).expect("failed to generate random bytes");
        Self(buff)
    }

    /// Create a data key from a byte slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length is not exactly `DATA_KEY_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, CipherError> {
        if data.len() != DATA_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid data key size, expected {}, got {}",
                DATA_KEY_SIZE,
                data.len()
            )
            .into());
        }
        let mut buff = [0; DATA_KEY_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    /// Get a reference to the key bytes
    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Encrypt a payload under this key
    ///
    /// A fresh random nonce is generated per call, so encrypting the same
    /// plaintext twice yields different ciphertexts.
    ///
    /// # Errors
    ///
    /// Returns an error only on system RNG failure.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let plaintext_hash = blake3::hash(data);

        let mut data_with_hash = Vec::with_capacity(BLAKE3_HASH_SIZE + data.len());
        data_with_hash.extend_from_slice(plaintext_hash.as_bytes());
        data_with_hash.extend_from_slice(data);

        let key = Key::from_slice(self.bytes());
        let cipher = ChaCha20Poly1305::new(key);

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| anyhow::anyhow!("failed to generate nonce: {}", e))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, data_with_hash.as_ref())
            .map_err(|_| anyhow::anyhow!("encrypt error"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(nonce.as_ref());
        out.extend_from_slice(ciphertext.as_ref());

        Ok(out)
    }

    /// Decrypt a payload under this key
    ///
    /// Expects `nonce (12) || encrypted(hash(32) || plaintext) || tag (16)`.
    /// Returns only the plaintext; the hash header is verified and stripped.
    ///
    /// # Errors
    ///
    /// - [`CipherError::Unauthenticated`] when the AEAD tag check fails
    ///   (wrong key, or the bytes were tampered with in transit/at rest)
    /// - a default error when the input is structurally too short or the
    ///   inner hash does not match
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_SIZE {
            return Err(anyhow::anyhow!("data too short for nonce").into());
        }

        let key = Key::from_slice(self.bytes());
        let nonce = Nonce::from_slice(&data[..NONCE_SIZE]);
        let cipher = ChaCha20Poly1305::new(key);
        let decrypted = cipher
            .decrypt(nonce, &data[NONCE_SIZE..])
            .map_err(|_| CipherError::Unauthenticated)?;

        if decrypted.len() < BLAKE3_HASH_SIZE {
            return Err(anyhow::anyhow!("decrypted data too short for hash header").into());
        }

        let stored_hash = &decrypted[..BLAKE3_HASH_SIZE];
        let plaintext = &decrypted[BLAKE3_HASH_SIZE..];

        let computed_hash = blake3::hash(plaintext);
        if stored_hash != computed_hash.as_bytes() {
            return Err(anyhow::anyhow!("hash verification failed - data corrupted").into());
        }

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = DataKey::generate();
        let data = b"txn: office chair, 214.99 USD, 2026-03-02";

        let encrypted = key.encrypt(data).unwrap();
        let decrypted = key.decrypt(&encrypted).unwrap();

        assert_eq!(data.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_key_size_validation() {
        let too_short = [1u8; 16];
        let too_long = [1u8; 64];

        assert!(DataKey::from_slice(&too_short).is_err());
        assert!(DataKey::from_slice(&too_long).is_err());

        let just_right = [1u8; DATA_KEY_SIZE];
        assert!(DataKey::from_slice(&just_right).is_ok());
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let key = DataKey::generate();
        let other = DataKey::generate();
        let encrypted = key.encrypt(b"confidential").unwrap();

        match other.decrypt(&encrypted) {
            Err(CipherError::Unauthenticated) => {}
            other => panic!("expected Unauthenticated, got {:?}", other),
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let key = DataKey::generate();
        let mut encrypted = key.encrypt(b"ledger entry").unwrap();

        // Flip a byte inside the ciphertext region
        encrypted[NONCE_SIZE + 4] ^= 0xFF;

        match key.decrypt(&encrypted) {
            Err(CipherError::Unauthenticated) => {}
            other => panic!("expected Unauthenticated, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_payload() {
        let key = DataKey::generate();
        let encrypted = key.encrypt(b"").unwrap();
        let decrypted = key.decrypt(&encrypted).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_nonce_freshness() {
        let key = DataKey::generate();
        let a = key.encrypt(b"same plaintext").unwrap();
        let b = key.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
    }
}
