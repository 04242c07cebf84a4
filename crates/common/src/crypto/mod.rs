//! Cryptographic types and operations
//!
//! - Master key derivation from the company passphrase (Argon2id)
//! - Per-epoch data keys and payload AEAD (ChaCha20-Poly1305)
//! - Device/principal keypairs (Ed25519, with X25519 conversion for ECDH)
//! - Key wrapping: master wrap (AES-KW) and per-principal view shares

mod cipher;
mod kdf;
mod keys;
mod wrap;

pub use cipher::{CipherError, DataKey, DATA_KEY_SIZE, NONCE_SIZE};
pub use kdf::{
    derive_master_key, derive_master_key_blocking, estimate_entropy_bits, generate_salt, KdfError,
    MasterKey, MASTER_KEY_SIZE, MIN_PASSPHRASE_BITS, MIN_SALT_SIZE,
};
pub use keys::{KeyError, PublicKey, SecretKey, PRIVATE_KEY_SIZE, PUBLIC_KEY_SIZE};
pub use wrap::{ViewShare, WrapError, WrappedKey, VIEW_SHARE_SIZE, WRAPPED_KEY_SIZE};
