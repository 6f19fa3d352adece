//! # vault-core
//!
//! Core engine of an encrypted local password safe:
//! - obfuscated binary storage format with password-derived end noise
//! - four cipher suites with Argon2id key derivation and background self-tests
//! - credential entries with change tracking and handle invalidation
//! - RFC 6238 TOTP generation with otpauth URI parsing
//! - versioned export/import containers

pub mod codec;
pub mod crypto;
pub mod data;
pub mod error;
pub mod storage;

pub use error::{Result, VaultError};
pub use crypto::{Cipher, CipherRegistry, CipherSuite, SecretBytes, SecretString, WorkingStatus};
pub use data::{EntryData, EntryHandle, SafeData, SafeDataManager, Totp, TotpAlgorithm};
pub use data::manager::{is_valid_master_password, MIN_MASTER_PASSWORD_CHARS};
pub use storage::SafeCiphers;
