//! Cryptographic primitives: cipher suites, key derivation, secret memory

pub mod cipher;
pub mod key_derivation;
pub mod secret;

pub use cipher::{
    Cipher, CipherRegistry, CipherSuite, DecryptingReader, EncryptingWriter, WorkingStatus,
};
pub use secret::{SecretBytes, SecretString};
