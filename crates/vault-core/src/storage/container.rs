//! Versioned export/import container
//!
//! Unlike the safe file, the container is decoupled from a live safe: the
//! caller picks any single cipher and password. A plain version prefix keeps
//! the format evolvable; the entry payload reuses the obfuscated layout of
//! the safe file.
//!
//! Layout: version (u16 BE, plaintext) | salt | IV | E_key(obfuscated
//! payload).

use std::fs;
use std::path::Path;

use tracing::debug;

use super::payload::{decode_payload, encode_payload};
use crate::crypto::cipher::Cipher;
use crate::data::entry::SafeData;
use crate::error::{Result, VaultError};

/// Highest container version this build can read and write
pub const MAX_VERSION: u16 = 1;

fn check_version(version: u16) -> Result<()> {
    if version < 1 || version > MAX_VERSION {
        return Err(VaultError::UnsupportedVersion(version));
    }
    Ok(())
}

pub fn write(
    path: &Path,
    cipher: &Cipher,
    password: &str,
    version: u16,
    data: &SafeData,
) -> Result<()> {
    check_version(version)?;
    if path.exists() {
        return Err(VaultError::InvalidArgument(format!(
            "Export target already exists: {}",
            path.display()
        )));
    }

    let salt = cipher.generate_salt();
    let key = cipher.derive_key(password, &salt)?;
    let iv = cipher.generate_iv();

    let payload_plain = encode_payload(data)?;
    let payload_ct = cipher.encrypt_bytes(&payload_plain, &key, &iv)?;

    let mut file =
        Vec::with_capacity(2 + salt.len() + iv.len() + payload_ct.len());
    file.extend_from_slice(&version.to_be_bytes());
    file.extend_from_slice(&salt);
    file.extend_from_slice(&iv);
    file.extend_from_slice(&payload_ct);
    fs::write(path, &file)?;

    debug!(
        path = %path.display(),
        version,
        entries = data.len(),
        "Export container written"
    );
    Ok(())
}

pub fn read(path: &Path, cipher: &Cipher, password: &str) -> Result<SafeData> {
    let bytes = fs::read(path)?;
    let min_len = 2 + cipher.salt_size() + cipher.iv_size();
    if bytes.len() < min_len {
        return Err(VaultError::CorruptedData(
            "Container file too short".to_string(),
        ));
    }

    let version = u16::from_be_bytes([bytes[0], bytes[1]]);
    check_version(version)?;

    let (salt, rest) = bytes[2..].split_at(cipher.salt_size());
    let (iv, payload_ct) = rest.split_at(cipher.iv_size());

    let key = cipher.derive_key(password, salt)?;
    let payload_plain = cipher.decrypt_bytes(payload_ct, &key, iv)?;
    let data = decode_payload(&payload_plain)
        .map_err(|e| VaultError::DecryptionError(format!("Unreadable container: {}", e)))?;

    debug!(path = %path.display(), version, entries = data.len(), "Export container read");
    Ok(data)
}
