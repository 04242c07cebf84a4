//! Master key derivation from a company passphrase
//!
//! Uses Argon2id with memory-hard parameters. The derived master key lives
//! only in memory for the session; it is never persisted or shipped. The
//! derivation is deliberately slow and should be run on a blocking thread
//! (see [`derive_master_key_blocking`]).

use std::ops::Deref;

use argon2::{Algorithm, Argon2, Params, Version};

/// Size of the derived master key in bytes (256 bits)
pub const MASTER_KEY_SIZE: usize = 32;
/// Minimum salt length accepted by the KDF
pub const MIN_SALT_SIZE: usize = 16;
/// Minimum estimated passphrase entropy in bits
pub const MIN_PASSPHRASE_BITS: f64 = 50.0;

/// Argon2id memory cost in KiB (64 MiB)
const ARGON2_M_COST: u32 = 64 * 1024;
/// Argon2id iteration count
const ARGON2_T_COST: u32 = 3;
/// Argon2id lane count
const ARGON2_P_COST: u32 = 1;

/// Errors that can occur during master key derivation
#[derive(Debug, thiserror::Error)]
pub enum KdfError {
    /// The passphrase's estimated entropy is below the acceptance threshold.
    #[error("passphrase too weak: estimated {estimated_bits:.0} bits, need {required_bits:.0}")]
    WeakPassphrase {
        estimated_bits: f64,
        required_bits: f64,
    },
    /// Argon2 rejected the parameters or inputs (e.g. undersized salt).
    #[error("key derivation failed: {0}")]
    KdfFailure(String),
}

/// The company master key, derived from the owner passphrase
///
/// Wraps every epoch's data-encryption key via AES-KW (see
/// [`crate::crypto::wrap`]). Held in memory for the session only.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterKey([u8; MASTER_KEY_SIZE]);

impl Deref for MasterKey {
    type Target = [u8; MASTER_KEY_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; MASTER_KEY_SIZE]> for MasterKey {
    fn from(bytes: [u8; MASTER_KEY_SIZE]) -> Self {
        MasterKey(bytes)
    }
}

impl MasterKey {
    /// Get a reference to the key bytes
    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Copy out the raw key bytes (for AES-KW key-encryption-key setup)
    pub fn to_bytes(&self) -> [u8; MASTER_KEY_SIZE] {
        self.0
    }
}

/// Estimate passphrase entropy in bits from length and character classes
///
/// This is the usual charset-size heuristic (`len * log2(pool)`), with a
/// penalty for passphrases made of a single repeated character. It is a
/// gate against obviously weak inputs, not a cracking-resistance proof.
pub fn estimate_entropy_bits(passphrase: &str) -> f64 {
    if passphrase.is_empty() {
        return 0.0;
    }

    let mut pool: u32 = 0;
    if passphrase.chars().any(|c| c.is_ascii_lowercase()) {
        pool += 26;
    }
    if passphrase.chars().any(|c| c.is_ascii_uppercase()) {
        pool += 26;
    }
    if passphrase.chars().any(|c| c.is_ascii_digit()) {
        pool += 10;
    }
    if passphrase
        .chars()
        .any(|c| !c.is_ascii_alphanumeric() && c.is_ascii())
    {
        pool += 33;
    }
    if passphrase.chars().any(|c| !c.is_ascii()) {
        pool += 128;
    }

    let unique: std::collections::HashSet<char> = passphrase.chars().collect();
    if unique.len() == 1 {
        // "aaaaaaaaaaaa" carries roughly one character of information
        return (pool as f64).log2();
    }

    passphrase.chars().count() as f64 * (pool.max(1) as f64).log2()
}

/// Derive the company master key from a passphrase and salt
///
/// # Errors
///
/// - [`KdfError::WeakPassphrase`] if the entropy estimate is below
///   [`MIN_PASSPHRASE_BITS`]
/// - [`KdfError::KdfFailure`] on parameter mismatch (undersized salt,
///   rejected Argon2 parameters)
pub fn derive_master_key(passphrase: &str, salt: &[u8]) -> Result<MasterKey, KdfError> {
    let estimated = estimate_entropy_bits(passphrase);
    if estimated < MIN_PASSPHRASE_BITS {
        return Err(KdfError::WeakPassphrase {
            estimated_bits: estimated,
            required_bits: MIN_PASSPHRASE_BITS,
        });
    }
    if salt.len() < MIN_SALT_SIZE {
        return Err(KdfError::KdfFailure(format!(
            "salt too short: expected at least {} bytes, got {}",
            MIN_SALT_SIZE,
            salt.len()
        )));
    }

    let params = Params::new(
        ARGON2_M_COST,
        ARGON2_T_COST,
        ARGON2_P_COST,
        Some(MASTER_KEY_SIZE),
    )
    .map_err(|e| KdfError::KdfFailure(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut out = [0u8; MASTER_KEY_SIZE];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| KdfError::KdfFailure(e.to_string()))?;

    Ok(MasterKey(out))
}

/// Run the derivation on tokio's blocking pool
///
/// Derivation is CPU-bound by design. Dropping the returned future cancels
/// cleanly: the key never reaches shared state, the blocking task just runs
/// to completion and its output is discarded.
pub async fn derive_master_key_blocking(
    passphrase: String,
    salt: Vec<u8>,
) -> Result<MasterKey, KdfError> {
    tokio::task::spawn_blocking(move || derive_master_key(&passphrase, &salt))
        .await
        .map_err(|e| KdfError::KdfFailure(format!("derivation task failed: {}", e)))?
}

/// Generate a random KDF salt
pub fn generate_salt() -> [u8; MIN_SALT_SIZE] {
    let mut salt = [0u8; MIN_SALT_SIZE];
    getrandom::getrandom(&mut salt).expect("failed to generate random bytes");
    salt
}
