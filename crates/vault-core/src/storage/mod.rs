//! Encrypted on-disk formats: the safe file and the export container

pub mod container;
mod payload;
pub mod safe_file;

pub use safe_file::SafeCiphers;
