//! The safe's data model: entries, TOTP generators and the manager

pub mod entry;
pub mod manager;
pub mod totp;

pub use entry::{EntryData, EntryHandle, SafeData};
pub use manager::SafeDataManager;
pub use totp::{Totp, TotpAlgorithm};
