//! Password-based key derivation using Argon2id

use argon2::{Algorithm, Argon2, Params, Version};

use super::secret::SecretBytes;
use crate::error::{Result, VaultError};

/// Raw salt length in bytes
pub const SALT_LEN: usize = 16;

/// Derived key length in bytes (256-bit keys)
pub const KEY_LEN: usize = 32;

/// Parameters for Argon2id key derivation
#[derive(Debug, Clone)]
pub struct KeyDerivationParams {
    /// Memory cost in KiB
    pub memory_cost: u32,
    /// Time cost / iterations
    pub time_cost: u32,
    /// Parallelism
    pub parallelism: u32,
}

impl Default for KeyDerivationParams {
    fn default() -> Self {
        Self {
            memory_cost: 19456, // 19 MB
            time_cost: 2,
            parallelism: 1,
        }
    }
}

/// Derive a 256-bit key from a password and a raw salt using Argon2id
pub fn derive_key(
    password: &str,
    salt: &[u8],
    params: Option<KeyDerivationParams>,
) -> Result<SecretBytes> {
    if salt.len() != SALT_LEN {
        return Err(VaultError::KeyDerivationError(format!(
            "Salt must be {} bytes, got {}",
            SALT_LEN,
            salt.len()
        )));
    }

    let params = params.unwrap_or_default();

    let argon2_params = Params::new(
        params.memory_cost,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::KeyDerivationError(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key_bytes = vec![0u8; KEY_LEN];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| VaultError::KeyDerivationError(e.to_string()))?;

    Ok(SecretBytes::new(key_bytes))
}
