//! Key wrapping for epoch envelopes
//!
//! Each key epoch's data-encryption key is distributed in two wrapped forms:
//!
//! - **Master wrap** ([`WrappedKey`]): AES Key Wrap (RFC 3394) under the
//!   company master key. Deterministic and authenticated — unwrapping with
//!   the wrong master key fails cleanly, which callers must treat as "this
//!   device cannot decrypt this epoch", not a crash.
//! - **View share** ([`ViewShare`]): ephemeral ECDH (X25519) + AES-KW,
//!   wrapping the same data key for one principal's public key. Only the
//!   holder of the matching secret key can recover the data key.
//!
//! The view-share protocol:
//! 1. Generate an ephemeral Ed25519 keypair
//! 2. Convert both keys to X25519 and run Diffie-Hellman
//! 3. Use the shared secret as the AES-KW key-encryption key
//! 4. Emit `ephemeral_pubkey || wrapped_data_key`

use std::convert::TryFrom;

use aes_kw::KekAes256 as Kek;
use serde::{Deserialize, Serialize};

use super::cipher::{DataKey, CipherError, DATA_KEY_SIZE};
use super::kdf::MasterKey;
use super::keys::{KeyError, PublicKey, SecretKey, PUBLIC_KEY_SIZE};

/// AES-KW overhead in bytes
pub const KW_NONCE_SIZE: usize = 8;
/// Size of a master-wrapped data key: 32-byte key + 8-byte AES-KW header
pub const WRAPPED_KEY_SIZE: usize = DATA_KEY_SIZE + KW_NONCE_SIZE;
/// Size of a view share: ephemeral pubkey (32) || wrapped key (40)
pub const VIEW_SHARE_SIZE: usize = PUBLIC_KEY_SIZE + WRAPPED_KEY_SIZE;

/// Errors that can occur while wrapping or unwrapping key material
#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("wrap error: {0}")]
    Default(#[from] anyhow::Error),
    /// The wrapping key does not match: this device or principal cannot
    /// decrypt this epoch.
    #[error("unauthorized key: wrapping key does not match")]
    UnauthorizedKey,
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
}

/// Serde support for fixed byte arrays larger than serde's built-in limit.
///
/// Accepts either byte buffers (bincode) or sequences (JSON).
mod byte_array {
    use serde::de::{Error, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ArrayVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a byte array of length {}", N)
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: Error,
            {
                if v.len() != N {
                    return Err(E::invalid_length(
                        v.len(),
                        &format!("expected {} bytes", N).as_str(),
                    ));
                }
                let mut array = [0u8; N];
                array.copy_from_slice(v);
                Ok(array)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut bytes = Vec::new();
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                if bytes.len() != N {
                    return Err(A::Error::invalid_length(
                        bytes.len(),
                        &format!("expected {} bytes", N).as_str(),
                    ));
                }
                let mut array = [0u8; N];
                array.copy_from_slice(&bytes);
                Ok(array)
            }
        }

        deserializer.deserialize_byte_buf(ArrayVisitor::<N>)
    }
}

/// A data key wrapped under the company master key via AES-KW
///
/// Deterministic: wrapping the same data key under the same master key
/// always produces the same bytes, so envelopes compare by equality.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct WrappedKey(#[serde(with = "byte_array")] [u8; WRAPPED_KEY_SIZE]);

impl From<[u8; WRAPPED_KEY_SIZE]> for WrappedKey {
    fn from(bytes: [u8; WRAPPED_KEY_SIZE]) -> Self {
        WrappedKey(bytes)
    }
}

impl TryFrom<&[u8]> for WrappedKey {
    type Error = WrapError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != WRAPPED_KEY_SIZE {
            return Err(anyhow::anyhow!(
                "invalid wrapped key size, expected {}, got {}",
                WRAPPED_KEY_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut buff = [0u8; WRAPPED_KEY_SIZE];
        buff.copy_from_slice(bytes);
        Ok(WrappedKey(buff))
    }
}

impl WrappedKey {
    /// Wrap a data key under the master key
    pub fn wrap(data_key: &DataKey, master: &MasterKey) -> Result<Self, WrapError> {
        let kek = Kek::from(master.to_bytes());
        let wrapped = kek
            .wrap_vec(data_key.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        WrappedKey::try_from(wrapped.as_slice())
    }

    /// Unwrap the data key with the master key
    ///
    /// # Errors
    ///
    /// [`WrapError::UnauthorizedKey`] if the master key does not match the
    /// one used to wrap.
    pub fn unwrap(&self, master: &MasterKey) -> Result<DataKey, WrapError> {
        let kek = Kek::from(master.to_bytes());
        let unwrapped = kek
            .unwrap_vec(&self.0)
            .map_err(|_| WrapError::UnauthorizedKey)?;

        Ok(DataKey::from_slice(&unwrapped)?)
    }

    /// Get a reference to the raw wrapped bytes
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A data key wrapped for one principal via ephemeral ECDH + AES-KW
///
/// # Wire Format
///
/// ```text
/// [ ephemeral_pubkey: 32 bytes ][ wrapped_data_key: 40 bytes ]
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ViewShare(#[serde(with = "byte_array")] [u8; VIEW_SHARE_SIZE]);

impl Default for ViewShare {
    fn default() -> Self {
        ViewShare([0; VIEW_SHARE_SIZE])
    }
}

impl From<[u8; VIEW_SHARE_SIZE]> for ViewShare {
    fn from(bytes: [u8; VIEW_SHARE_SIZE]) -> Self {
        ViewShare(bytes)
    }
}

impl TryFrom<&[u8]> for ViewShare {
    type Error = WrapError;
    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != VIEW_SHARE_SIZE {
            return Err(anyhow::anyhow!(
                "invalid view share size, expected {}, got {}",
                VIEW_SHARE_SIZE,
                bytes.len()
            )
            .into());
        }
        let mut share = ViewShare::default();
        share.0.copy_from_slice(bytes);
        Ok(share)
    }
}

impl ViewShare {
    /// Parse a view share from a hexadecimal string
    pub fn from_hex(hex: &str) -> Result<Self, WrapError> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let mut buff = [0; VIEW_SHARE_SIZE];
        hex::decode_to_slice(hex, &mut buff).map_err(|_| anyhow::anyhow!("hex decode error"))?;
        Ok(ViewShare::from(buff))
    }

    /// Convert view share to hexadecimal string
    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Wrap a data key for a specific principal
    ///
    /// 1. Generates an ephemeral Ed25519 keypair
    /// 2. Converts both keys to X25519 for ECDH
    /// 3. Performs ECDH to derive a shared secret
    /// 4. Uses AES-KW to wrap the data key with the shared secret
    ///
    /// # Errors
    ///
    /// Returns an error if key conversion or wrapping fails.
    pub fn new(data_key: &DataKey, recipient: &PublicKey) -> Result<Self, WrapError> {
        let ephemeral_private = SecretKey::generate();
        let ephemeral_public = ephemeral_private.public();

        let ephemeral_x25519_private = ephemeral_private.to_x25519();
        let recipient_x25519_public = recipient.to_x25519()?;

        let shared_secret = ephemeral_x25519_private.diffie_hellman(&recipient_x25519_public);

        let mut shared_secret_bytes = [0; DATA_KEY_SIZE];
        shared_secret_bytes.copy_from_slice(shared_secret.as_bytes());
        let kek = Kek::from(shared_secret_bytes);
        let wrapped = kek
            .wrap_vec(data_key.bytes())
            .map_err(|_| anyhow::anyhow!("AES-KW wrap error"))?;

        let mut share = ViewShare::default();
        let ephemeral_bytes = ephemeral_public.to_bytes();

        if ephemeral_bytes.len() + wrapped.len() != VIEW_SHARE_SIZE {
            return Err(anyhow::anyhow!("expected view share size is incorrect").into());
        };

        share.0[..PUBLIC_KEY_SIZE].copy_from_slice(&ephemeral_bytes);
        share.0[PUBLIC_KEY_SIZE..PUBLIC_KEY_SIZE + wrapped.len()].copy_from_slice(&wrapped);

        Ok(share)
    }

    /// Recover the data key using the recipient's secret key
    ///
    /// # Errors
    ///
    /// [`WrapError::UnauthorizedKey`] if the share was created for a
    /// different principal, or the bytes were tampered with.
    pub fn recover(&self, recipient_secret: &SecretKey) -> Result<DataKey, WrapError> {
        let ephemeral_public_bytes = &self.0[..PUBLIC_KEY_SIZE];
        let ephemeral_public = PublicKey::try_from(ephemeral_public_bytes)?;

        let recipient_x25519_private = recipient_secret.to_x25519();
        let ephemeral_x25519_public = ephemeral_public.to_x25519()?;

        let shared_secret = recipient_x25519_private.diffie_hellman(&ephemeral_x25519_public);

        let shared_secret_bytes = *shared_secret.as_bytes();
        let kek = Kek::from(shared_secret_bytes);
        let wrapped_data = &self.0[PUBLIC_KEY_SIZE..];

        let unwrapped = kek
            .unwrap_vec(wrapped_data)
            .map_err(|_| WrapError::UnauthorizedKey)?;

        if unwrapped.len() != DATA_KEY_SIZE {
            return Err(anyhow::anyhow!("unwrapped data key has wrong size").into());
        }

        Ok(DataKey::from_slice(&unwrapped)?)
    }

    /// Get a reference to the raw share bytes
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}
