//! Error types for vault-core

use thiserror::Error;

/// Result type alias for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Length exceeds the storable maximum: {0}")]
    LengthFormat(String),

    #[error("Cipher '{0}' failed its self-test and cannot be used")]
    CipherNotWorking(String),

    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationError(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Entry name already in use: {0}")]
    NameAlreadyUsed(String),

    #[error("Entry handle is no longer valid")]
    StaleHandle,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported container version: {0}")]
    UnsupportedVersion(u16),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
