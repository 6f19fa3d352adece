//! Binary codecs: obfuscated safe payload encoding and Base32

pub mod base32;
pub mod obfuscated;

pub use obfuscated::{check_valid_length, NumberRange, ObfuscatedReader, ObfuscatedWriter};
