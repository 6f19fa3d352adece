//! Credential entries and their lifecycle handles
//!
//! [`EntryData`] is an immutable validated snapshot, the unit the storage
//! codecs work with. [`EntryHandle`] is the shared mutable view handed to
//! callers by the manager; reloading the safe invalidates every previously
//! issued handle, after which all access fails with `StaleHandle` instead of
//! serving stale data.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use zeroize::Zeroize;

use super::totp::Totp;
use crate::codec::obfuscated::check_valid_length;
use crate::crypto::secret::SecretString;
use crate::error::{Result, VaultError};

/// Current time truncated to whole seconds, the precision the safe stores
pub(crate) fn now_secs() -> DateTime<Utc> {
    DateTime::from_timestamp(Utc::now().timestamp(), 0).expect("current time fits a timestamp")
}

pub(crate) fn check_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VaultError::InvalidArgument(
            "Entry name must not be empty".to_string(),
        ));
    }
    check_valid_length(name)?;
    Ok(())
}

pub(crate) fn check_entry_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(VaultError::InvalidArgument(
            "Entry password must not be empty".to_string(),
        ));
    }
    check_valid_length(password)?;
    Ok(())
}

/// A complete, validated credential record
#[derive(Debug, Clone, PartialEq)]
pub struct EntryData {
    name: String,
    password: SecretString,
    last_password_change: DateTime<Utc>,
    site: String,
    info: String,
    totp: Option<Totp>,
}

impl EntryData {
    pub fn new(
        name: String,
        password: SecretString,
        last_password_change: DateTime<Utc>,
        site: String,
        info: String,
        totp: Option<Totp>,
    ) -> Result<Self> {
        check_entry_name(&name)?;
        check_entry_password(password.expose())?;
        check_valid_length(&site)?;
        check_valid_length(&info)?;
        if last_password_change.timestamp_subsec_nanos() != 0 {
            return Err(VaultError::InvalidArgument(
                "Password change time must have whole-second precision".to_string(),
            ));
        }
        Ok(Self {
            name,
            password,
            last_password_change,
            site,
            info,
            totp,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    pub fn last_password_change(&self) -> DateTime<Utc> {
        self.last_password_change
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn info(&self) -> &str {
        &self.info
    }

    pub fn totp(&self) -> Option<&Totp> {
        self.totp.as_ref()
    }
}

impl Drop for EntryData {
    fn drop(&mut self) {
        self.name.zeroize();
        self.site.zeroize();
        self.info.zeroize();
    }
}

/// The ordered entry collection of one safe
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SafeData {
    entries: Vec<EntryData>,
}

impl SafeData {
    pub fn new(entries: Vec<EntryData>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: EntryData) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[EntryData] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<EntryData> {
        self.entries
    }
}

impl FromIterator<EntryData> for SafeData {
    fn from_iter<I: IntoIterator<Item = EntryData>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

struct EntryState {
    /// Snapshot as persisted in the safe file; `None` for a not yet saved
    /// new entry
    committed: Option<EntryData>,
    name: String,
    password: SecretString,
    last_password_change: DateTime<Utc>,
    site: String,
    info: String,
    totp: Option<Totp>,
}

impl EntryState {
    fn blank() -> Self {
        Self {
            committed: None,
            name: String::new(),
            password: SecretString::new(String::new()),
            last_password_change: now_secs(),
            site: String::new(),
            info: String::new(),
            totp: None,
        }
    }

    fn from_committed(data: EntryData) -> Self {
        Self {
            name: data.name.clone(),
            password: data.password.clone(),
            last_password_change: data.last_password_change,
            site: data.site.clone(),
            info: data.info.clone(),
            totp: data.totp.clone(),
            committed: Some(data),
        }
    }

    /// Validated snapshot of the current fields, or `None` while the entry
    /// is still incomplete
    fn snapshot(&self) -> Option<EntryData> {
        if self.name.is_empty() || self.password.expose().is_empty() {
            return None;
        }
        EntryData::new(
            self.name.clone(),
            self.password.clone(),
            self.last_password_change,
            self.site.clone(),
            self.info.clone(),
            self.totp.clone(),
        )
        .ok()
    }

    fn has_unsaved_changes(&self) -> bool {
        match &self.committed {
            None => self.snapshot().is_some(),
            Some(committed) => {
                self.name != committed.name
                    || self.password != committed.password
                    || self.last_password_change != committed.last_password_change
                    || self.site != committed.site
                    || self.info != committed.info
                    || self.totp != committed.totp
            }
        }
    }
}

impl Drop for EntryState {
    fn drop(&mut self) {
        self.name.zeroize();
        self.site.zeroize();
        self.info.zeroize();
    }
}

/// Shared handle to one entry of an open safe
#[derive(Clone)]
pub struct EntryHandle {
    cell: Arc<Mutex<Option<EntryState>>>,
}

impl EntryHandle {
    pub(crate) fn new_blank() -> Self {
        Self {
            cell: Arc::new(Mutex::new(Some(EntryState::blank()))),
        }
    }

    pub(crate) fn from_committed(data: EntryData) -> Self {
        Self {
            cell: Arc::new(Mutex::new(Some(EntryState::from_committed(data)))),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&EntryState) -> R) -> Result<R> {
        let guard = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().map(f).ok_or(VaultError::StaleHandle)
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut EntryState) -> R) -> Result<R> {
        let mut guard = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(f).ok_or(VaultError::StaleHandle)
    }

    /// Drop and wipe the state; every later access fails with `StaleHandle`
    pub(crate) fn invalidate(&self) {
        let mut guard = self.cell.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    pub fn is_invalidated(&self) -> bool {
        self.cell
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    pub fn name(&self) -> Result<String> {
        self.with_state(|s| s.name.clone())
    }

    pub fn password(&self) -> Result<SecretString> {
        self.with_state(|s| s.password.clone())
    }

    pub fn last_password_change(&self) -> Result<DateTime<Utc>> {
        self.with_state(|s| s.last_password_change)
    }

    pub fn site(&self) -> Result<String> {
        self.with_state(|s| s.site.clone())
    }

    pub fn info(&self) -> Result<String> {
        self.with_state(|s| s.info.clone())
    }

    pub fn totp(&self) -> Result<Option<Totp>> {
        self.with_state(|s| s.totp.clone())
    }

    /// True while the entry has never been saved
    pub fn is_new(&self) -> Result<bool> {
        self.with_state(|s| s.committed.is_none())
    }

    /// Complete snapshot, or `None` while a new entry is still missing its
    /// name or password
    pub fn data(&self) -> Result<Option<EntryData>> {
        self.with_state(|s| s.snapshot())
    }

    pub fn has_unsaved_changes(&self) -> Result<bool> {
        self.with_state(|s| s.has_unsaved_changes())
    }

    /// Set the password. The change timestamp refreshes only when the value
    /// actually differs; setting an existing entry back to its saved
    /// password restores the saved timestamp.
    pub fn set_password(&self, password: &str) -> Result<()> {
        check_entry_password(password)?;
        self.with_state_mut(|s| {
            match &s.committed {
                Some(committed) if committed.password.expose() == password => {
                    s.last_password_change = committed.last_password_change;
                }
                _ if s.password.expose() == password => {}
                _ => s.last_password_change = now_secs(),
            }
            s.password.set(password);
        })
    }

    pub fn set_site(&self, site: &str) -> Result<()> {
        check_valid_length(site)?;
        self.with_state_mut(|s| {
            s.site.zeroize();
            s.site.clear();
            s.site.push_str(site);
        })
    }

    pub fn set_info(&self, info: &str) -> Result<()> {
        check_valid_length(info)?;
        self.with_state_mut(|s| {
            s.info.zeroize();
            s.info.clear();
            s.info.push_str(info);
        })
    }

    pub fn set_totp(&self, totp: Option<Totp>) -> Result<()> {
        self.with_state_mut(|s| s.totp = totp)
    }

    /// Rename without a uniqueness check; the manager owns that check
    pub(crate) fn set_name_unchecked(&self, name: &str) -> Result<()> {
        self.with_state_mut(|s| {
            s.name.zeroize();
            s.name.clear();
            s.name.push_str(name);
        })
    }

    /// Adopt the current fields as the saved snapshot
    pub(crate) fn commit(&self) -> Result<()> {
        self.with_state_mut(|s| {
            if let Some(data) = s.snapshot() {
                s.committed = Some(data);
            }
        })
    }
}

impl PartialEq for EntryHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Eq for EntryHandle {}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle")
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::secret::SecretBytes;
    use crate::data::totp::TotpAlgorithm;

    fn sample_data(name: &str) -> EntryData {
        EntryData::new(
            name.to_string(),
            SecretString::from("pass-123"),
            DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            "example.com".to_string(),
            "notes".to_string(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_entry_data_validation() {
        assert!(EntryData::new(
            String::new(),
            SecretString::from("pw"),
            now_secs(),
            String::new(),
            String::new(),
            None
        )
        .is_err());
        assert!(EntryData::new(
            "a".to_string(),
            SecretString::from(""),
            now_secs(),
            String::new(),
            String::new(),
            None
        )
        .is_err());
        // sub-second precision is rejected
        assert!(EntryData::new(
            "a".to_string(),
            SecretString::from("pw"),
            DateTime::from_timestamp(100, 500).unwrap(),
            String::new(),
            String::new(),
            None
        )
        .is_err());
    }

    #[test]
    fn test_new_entry_becomes_valid() {
        let handle = EntryHandle::new_blank();
        assert!(handle.is_new().unwrap());
        assert!(handle.data().unwrap().is_none());
        assert!(!handle.has_unsaved_changes().unwrap());

        handle.set_name_unchecked("mail").unwrap();
        assert!(handle.data().unwrap().is_none());
        handle.set_password("s3cret").unwrap();

        let data = handle.data().unwrap().unwrap();
        assert_eq!(data.name(), "mail");
        assert_eq!(data.password().expose(), "s3cret");
        assert!(handle.has_unsaved_changes().unwrap());
    }

    #[test]
    fn test_existing_entry_change_tracking() {
        let handle = EntryHandle::from_committed(sample_data("mail"));
        assert!(!handle.is_new().unwrap());
        assert!(!handle.has_unsaved_changes().unwrap());

        handle.set_site("other.com").unwrap();
        assert!(handle.has_unsaved_changes().unwrap());
        handle.set_site("example.com").unwrap();
        assert!(!handle.has_unsaved_changes().unwrap());
    }

    #[test]
    fn test_password_change_timestamp() {
        let committed_time = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let handle = EntryHandle::from_committed(sample_data("mail"));

        handle.set_password("different").unwrap();
        assert!(handle.last_password_change().unwrap() > committed_time);

        // setting the saved password back restores the saved timestamp
        handle.set_password("pass-123").unwrap();
        assert_eq!(handle.last_password_change().unwrap(), committed_time);
        assert!(!handle.has_unsaved_changes().unwrap());
    }

    #[test]
    fn test_commit_adopts_changes() {
        let handle = EntryHandle::from_committed(sample_data("mail"));
        handle.set_info("updated").unwrap();
        assert!(handle.has_unsaved_changes().unwrap());
        handle.commit().unwrap();
        assert!(!handle.has_unsaved_changes().unwrap());
        assert_eq!(handle.info().unwrap(), "updated");
    }

    #[test]
    fn test_invalidation() {
        let handle = EntryHandle::from_committed(sample_data("mail"));
        let alias = handle.clone();
        handle.invalidate();

        assert!(alias.is_invalidated());
        assert!(matches!(alias.name(), Err(VaultError::StaleHandle)));
        assert!(matches!(
            alias.set_password("x-new-pass"),
            Err(VaultError::StaleHandle)
        ));
        assert!(matches!(alias.data(), Err(VaultError::StaleHandle)));
    }

    #[test]
    fn test_handle_identity() {
        let a = EntryHandle::new_blank();
        let b = EntryHandle::new_blank();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_totp_round_trips_through_handle() {
        let handle = EntryHandle::from_committed(sample_data("mail"));
        let totp = Totp::new(
            SecretBytes::from(&b"12345678901234567890"[..]),
            "mail".to_string(),
            "Example".to_string(),
            TotpAlgorithm::Sha1,
            6,
            30,
        )
        .unwrap();
        handle.set_totp(Some(totp.clone())).unwrap();
        assert_eq!(handle.totp().unwrap().unwrap(), totp);
        assert!(handle.has_unsaved_changes().unwrap());
        handle.set_totp(None).unwrap();
        assert!(!handle.has_unsaved_changes().unwrap());
    }
}
