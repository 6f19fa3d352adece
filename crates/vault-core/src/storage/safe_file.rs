//! The safe file format
//!
//! Two cipher roles: the *internal* cipher protects the header under a key
//! derived from the master password; the *user* cipher protects the entry
//! payload under a random key stored in that header. The file carries no
//! magic bytes, no version and no length fields - without the password even
//! the block boundaries are unknown, because a password-dependent amount of
//! random noise is appended at the end.
//!
//! Layout: salt | header IV | E_file_key(payload key | payload IV) |
//! E_payload_key(obfuscated payload) | end noise.

use std::fs;
use std::path::Path;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;
use zeroize::Zeroizing;

use super::payload::{decode_payload, encode_payload};
use crate::crypto::cipher::{Cipher, CipherRegistry};
use crate::crypto::secret::SecretBytes;
use crate::data::entry::SafeData;
use crate::error::{Result, VaultError};

/// Modulus of the password-derived end-noise length
pub const END_NOISE_MOD: u32 = 1024;

/// The cipher roles of one safe
#[derive(Clone, Copy, Debug)]
pub struct SafeCiphers {
    /// Protects the header (payload key and IV)
    pub internal: &'static Cipher,
    /// Protects the entry payload
    pub user: &'static Cipher,
}

impl SafeCiphers {
    pub fn from_names(internal: &str, user: &str) -> Result<Self> {
        let registry = CipherRegistry::global();
        Ok(Self {
            internal: registry.get(internal)?,
            user: registry.get(user)?,
        })
    }
}

/// Number of end-noise bytes for this password, derived from its first two
/// UTF-16 units. Reading the file back requires the same password, so the
/// length never needs to be stored.
pub fn end_noise_len(password: &str) -> Result<usize> {
    let mut units = password.encode_utf16();
    match (units.next(), units.next()) {
        (Some(u0), Some(u1)) => {
            Ok(((31 * u32::from(u0) + u32::from(u1)) % END_NOISE_MOD) as usize)
        }
        _ => Err(VaultError::InvalidArgument(
            "Password must be at least two characters".to_string(),
        )),
    }
}

pub fn write(path: &Path, password: &str, ciphers: &SafeCiphers, data: &SafeData) -> Result<()> {
    let noise_len = end_noise_len(password)?;
    let internal = ciphers.internal;
    let user = ciphers.user;

    let salt = internal.generate_salt();
    let file_key = internal.derive_key(password, &salt)?;
    let header_iv = internal.generate_iv();

    let payload_key = user.generate_key();
    let payload_iv = user.generate_iv();

    let mut header_plain = Zeroizing::new(Vec::with_capacity(user.key_size() + user.iv_size()));
    header_plain.extend_from_slice(payload_key.expose());
    header_plain.extend_from_slice(&payload_iv);
    let header_ct = internal.encrypt_bytes(&header_plain, &file_key, &header_iv)?;

    let payload_plain = encode_payload(data)?;
    let payload_ct = user.encrypt_bytes(&payload_plain, &payload_key, &payload_iv)?;

    let mut end_noise = vec![0u8; noise_len];
    OsRng.fill_bytes(&mut end_noise);

    let mut file = Vec::with_capacity(
        salt.len() + header_iv.len() + header_ct.len() + payload_ct.len() + end_noise.len(),
    );
    file.extend_from_slice(&salt);
    file.extend_from_slice(&header_iv);
    file.extend_from_slice(&header_ct);
    file.extend_from_slice(&payload_ct);
    file.extend_from_slice(&end_noise);
    fs::write(path, &file)?;

    debug!(
        path = %path.display(),
        entries = data.len(),
        bytes = file.len(),
        "Safe file written"
    );
    Ok(())
}

pub fn read(path: &Path, password: &str, ciphers: &SafeCiphers) -> Result<SafeData> {
    let bytes = fs::read(path)?;
    let noise_len = end_noise_len(password)?;
    let internal = ciphers.internal;
    let user = ciphers.user;

    let salt_len = internal.salt_size();
    let iv_len = internal.iv_size();
    let header_ct_len = internal.encrypted_len(user.key_size() + user.iv_size());
    if bytes.len() < salt_len + iv_len + header_ct_len + noise_len {
        return Err(VaultError::DecryptionError(
            "Safe file too short for this password".to_string(),
        ));
    }

    let (salt, rest) = bytes.split_at(salt_len);
    let (header_iv, rest) = rest.split_at(iv_len);
    let (header_ct, rest) = rest.split_at(header_ct_len);
    let payload_ct = &rest[..rest.len() - noise_len];

    let file_key = internal.derive_key(password, salt)?;
    let header_plain = internal.decrypt_bytes(header_ct, &file_key, header_iv)?;
    if header_plain.len() != user.key_size() + user.iv_size() {
        return Err(VaultError::DecryptionError(
            "Safe file header has an unexpected size".to_string(),
        ));
    }
    let payload_key = SecretBytes::from(&header_plain[..user.key_size()]);
    let payload_iv = &header_plain[user.key_size()..];

    let payload_plain = user.decrypt_bytes(payload_ct, &payload_key, payload_iv)?;
    let data = decode_payload(&payload_plain)
        .map_err(|e| VaultError::DecryptionError(format!("Unreadable safe payload: {}", e)))?;

    debug!(path = %path.display(), entries = data.len(), "Safe file read");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secret::SecretString;
    use crate::data::entry::EntryData;
    use crate::data::totp::{Totp, TotpAlgorithm};
    use chrono::DateTime;
    use std::collections::HashMap;
    use tempfile::TempDir;

    const PASSWORD: &str = "master password 1";

    fn ciphers() -> SafeCiphers {
        SafeCiphers::from_names("AES_GCM", "ChaCha20-Poly1305").unwrap()
    }

    fn stream_ciphers() -> SafeCiphers {
        SafeCiphers::from_names("AES_CTR", "ChaCha20").unwrap()
    }

    fn entry(name: &str, password: &str) -> EntryData {
        EntryData::new(
            name.to_string(),
            SecretString::from(password),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            format!("https://{}.example.com", name),
            "notes".to_string(),
            None,
        )
        .unwrap()
    }

    fn round_trip(data: &SafeData, ciphers: &SafeCiphers) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.safe");
        write(&path, PASSWORD, ciphers, data).unwrap();
        assert_eq!(&read(&path, PASSWORD, ciphers).unwrap(), data);
    }

    #[test]
    fn test_round_trip_empty() {
        round_trip(&SafeData::default(), &ciphers());
    }

    #[test]
    fn test_round_trip_entries() {
        let totp = Totp::new(
            SecretBytes::from(&b"12345678901234567890"[..]),
            "alice".to_string(),
            "Example".to_string(),
            TotpAlgorithm::Sha512,
            7,
            30,
        )
        .unwrap();
        let mut data = SafeData::new(vec![entry("mail", "pw-one"), entry("bank", "pw-two")]);
        data.push(
            EntryData::new(
                "with-totp".to_string(),
                SecretString::from("pw-three"),
                DateTime::from_timestamp(1_500_000_000, 0).unwrap(),
                String::new(),
                String::new(),
                Some(totp),
            )
            .unwrap(),
        );
        round_trip(&data, &ciphers());
        round_trip(&data, &stream_ciphers());
    }

    #[test]
    fn test_round_trip_full_printable_ascii() {
        // all 95 printable ASCII characters, space included
        let printable: String = (' '..='~').collect();
        let data = SafeData::new(vec![EntryData::new(
            printable.clone(),
            SecretString::new(printable.clone()),
            DateTime::from_timestamp(0, 0).unwrap(),
            printable.clone(),
            printable,
            None,
        )
        .unwrap()]);
        round_trip(&data, &ciphers());
    }

    #[test]
    fn test_round_trip_many_entries() {
        let data: SafeData = (0..1000)
            .map(|i| entry(&format!("entry-{}", i), &format!("password-{}", i)))
            .collect();
        round_trip(&data, &ciphers());
    }

    #[test]
    fn test_wrong_password_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.safe");
        let data = SafeData::new(vec![entry("mail", "pw")]);
        for ciphers in [ciphers(), stream_ciphers()] {
            write(&path, PASSWORD, &ciphers, &data).unwrap();
            assert!(read(&path, "other password 9", &ciphers).is_err());
        }
    }

    #[test]
    fn test_writes_differ() {
        let dir = TempDir::new().unwrap();
        let data = SafeData::new(vec![entry("mail", "pw")]);
        let path_a = dir.path().join("a.safe");
        let path_b = dir.path().join("b.safe");
        write(&path_a, PASSWORD, &ciphers(), &data).unwrap();
        write(&path_b, PASSWORD, &ciphers(), &data).unwrap();
        assert_ne!(fs::read(&path_a).unwrap(), fs::read(&path_b).unwrap());
    }

    #[test]
    fn test_end_noise_requires_two_chars() {
        assert!(end_noise_len("").is_err());
        assert!(end_noise_len("x").is_err());
        assert!(end_noise_len("xy").is_ok());
    }

    #[test]
    fn test_end_noise_is_deterministic() {
        assert_eq!(
            end_noise_len("same password").unwrap(),
            end_noise_len("same password").unwrap()
        );
    }

    // Over all two-character passwords from the 94 printable non-space ASCII
    // characters, the noise length must cover all 1024 values roughly
    // uniformly: each count within 2 of the integer expectation 94*94/1024.
    #[test]
    fn test_end_noise_distribution() {
        let mut counts: HashMap<usize, u32> = HashMap::new();
        for a in '!'..='~' {
            for b in '!'..='~' {
                let password: String = [a, b].iter().collect();
                *counts.entry(end_noise_len(&password).unwrap()).or_default() += 1;
            }
        }
        assert_eq!(counts.len(), END_NOISE_MOD as usize);
        let expected = 94 * 94 / END_NOISE_MOD;
        for (len, count) in counts {
            assert!(len < END_NOISE_MOD as usize);
            assert!(
                (expected as i64 - i64::from(count)).abs() <= 2,
                "length {} occurred {} times",
                len,
                count
            );
        }
    }
}
