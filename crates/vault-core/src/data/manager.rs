//! Lifecycle of one open safe
//!
//! The manager owns the master password, the cipher roles and the entry
//! handles. Dirty state is derived, never tracked: a safe has changes when
//! the deleted set is non-empty, a new entry became complete, or an existing
//! entry differs from its saved snapshot. Deleting and restoring an entry
//! therefore nets out to "no changes".

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::entry::{check_entry_name, EntryHandle, SafeData};
use crate::crypto::cipher::Cipher;
use crate::crypto::secret::SecretString;
use crate::error::{Result, VaultError};
use crate::storage::safe_file::SafeCiphers;
use crate::storage::{container, safe_file};

/// Minimum length of a master password
pub const MIN_MASTER_PASSWORD_CHARS: usize = 10;

const TEMP_FILE_PREFIX: &str = "_temp_-";

pub fn is_valid_master_password(password: &str) -> bool {
    password.chars().count() >= MIN_MASTER_PASSWORD_CHARS
}

pub struct SafeDataManager {
    path: PathBuf,
    password: SecretString,
    ciphers: SafeCiphers,
    entries: Vec<EntryHandle>,
    deleted: Vec<EntryHandle>,
}

impl SafeDataManager {
    /// Bind a manager to a safe file path. The file is not touched yet:
    /// call [`load_safe_file`](Self::load_safe_file) for an existing safe or
    /// [`update_safe_file`](Self::update_safe_file) to create a new one.
    pub fn new(path: impl Into<PathBuf>, password: &str, ciphers: SafeCiphers) -> Result<Self> {
        if !is_valid_master_password(password) {
            return Err(VaultError::InvalidArgument(format!(
                "Master password must have at least {} characters",
                MIN_MASTER_PASSWORD_CHARS
            )));
        }
        Ok(Self {
            path: path.into(),
            password: SecretString::from(password),
            ciphers,
            entries: Vec::new(),
            deleted: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ciphers(&self) -> SafeCiphers {
        self.ciphers
    }

    pub fn is_safe_password(&self, candidate: &str) -> bool {
        self.password.expose() == candidate
    }

    /// Read the safe file and rebuild the entry set. Every previously issued
    /// handle is invalidated, whether active or deleted.
    pub fn load_safe_file(&mut self) -> Result<()> {
        let data = safe_file::read(&self.path, self.password.expose(), &self.ciphers)?;

        let mut names = HashSet::new();
        for entry in data.entries() {
            if !names.insert(entry.name().to_string()) {
                return Err(VaultError::CorruptedData(format!(
                    "Duplicate entry name in safe file: {}",
                    entry.name()
                )));
            }
        }

        for handle in self.entries.drain(..).chain(self.deleted.drain(..)) {
            handle.invalidate();
        }
        self.entries = data
            .into_entries()
            .into_iter()
            .map(EntryHandle::from_committed)
            .collect();

        info!(entries = self.entries.len(), "Safe loaded");
        Ok(())
    }

    /// Persist the current state, keeping all handles valid. The file is
    /// first written to a temporary sibling, read back and verified, and
    /// only then renamed over the safe file.
    pub fn update_safe_file(&mut self) -> Result<()> {
        let password = self.password.clone();
        self.write_safe_file(password.expose())
    }

    fn write_safe_file(&mut self, password: &str) -> Result<()> {
        self.ciphers.internal.wait_working_check();
        self.ciphers.user.wait_working_check();
        for cipher in [self.ciphers.internal, self.ciphers.user] {
            if !cipher.is_working_or_unchecked() {
                return Err(VaultError::CipherNotWorking(cipher.name().to_string()));
            }
        }

        let data = self.collect_valid_data()?;

        let temp = self.temp_path()?;
        if temp.exists() {
            return Err(VaultError::InvalidState(format!(
                "A previous save left a temporary file behind: {}",
                temp.display()
            )));
        }
        safe_file::write(&temp, password, &self.ciphers, &data)?;

        match safe_file::read(&temp, password, &self.ciphers) {
            Ok(read_back) if read_back == data => {}
            Ok(_) => {
                let _ = fs::remove_file(&temp);
                return Err(VaultError::StorageError(
                    "Write verification read back different content".to_string(),
                ));
            }
            Err(e) => {
                let _ = fs::remove_file(&temp);
                return Err(VaultError::StorageError(format!(
                    "Write verification failed: {}",
                    e
                )));
            }
        }
        fs::rename(&temp, &self.path)?;

        for handle in &self.entries {
            handle.commit()?;
        }
        for handle in self.deleted.drain(..) {
            handle.invalidate();
        }

        info!(path = %self.path.display(), entries = data.len(), "Safe file updated");
        Ok(())
    }

    fn temp_path(&self) -> Result<PathBuf> {
        let name = self.path.file_name().ok_or_else(|| {
            VaultError::InvalidArgument(format!(
                "Safe path has no file name: {}",
                self.path.display()
            ))
        })?;
        let mut temp_name = OsString::from(TEMP_FILE_PREFIX);
        temp_name.push(name);
        Ok(self.path.with_file_name(temp_name))
    }

    fn collect_valid_data(&self) -> Result<SafeData> {
        let mut data = SafeData::default();
        for handle in &self.entries {
            if let Some(entry) = handle.data()? {
                data.push(entry);
            }
        }
        Ok(data)
    }

    pub fn has_changes(&self) -> Result<bool> {
        if !self.deleted.is_empty() {
            return Ok(true);
        }
        for handle in &self.entries {
            if handle.has_unsaved_changes()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Append a blank entry. It stays invisible to persistence until it has
    /// a name and a password. Only one unnamed entry may exist at a time.
    pub fn add_new_entry(&mut self) -> Result<EntryHandle> {
        for handle in &self.entries {
            if handle.name()?.is_empty() {
                return Err(VaultError::InvalidState(
                    "An unnamed new entry already exists".to_string(),
                ));
            }
        }
        let handle = EntryHandle::new_blank();
        self.entries.push(handle.clone());
        Ok(handle)
    }

    /// Rename an entry, enforcing name uniqueness among active entries
    pub fn set_entry_name(&mut self, handle: &EntryHandle, name: &str) -> Result<()> {
        check_entry_name(name)?;
        if handle.name()? == name {
            return Ok(());
        }
        if self.position_deleted(handle).is_some() {
            return handle.set_name_unchecked(name);
        }
        if self.position_active(handle).is_none() {
            return Err(VaultError::InvalidArgument(
                "Entry does not belong to this safe".to_string(),
            ));
        }
        for other in &self.entries {
            if other != handle && other.name()? == name {
                return Err(VaultError::NameAlreadyUsed(name.to_string()));
            }
        }
        handle.set_name_unchecked(name)
    }

    /// Move an entry to the deleted set. A never-saved entry is destroyed
    /// outright. Deleting an already deleted entry is a no-op.
    pub fn delete_entry(&mut self, handle: &EntryHandle) -> Result<()> {
        if self.position_deleted(handle).is_some() {
            return Ok(());
        }
        let Some(pos) = self.position_active(handle) else {
            return Err(VaultError::InvalidArgument(
                "Entry does not belong to this safe".to_string(),
            ));
        };
        let is_new = handle.is_new()?;
        let handle = self.entries.remove(pos);
        if is_new {
            handle.invalidate();
        } else {
            self.deleted.push(handle);
        }
        Ok(())
    }

    /// Bring a deleted entry back, provided its name is still free
    pub fn restore_entry(&mut self, handle: &EntryHandle) -> Result<()> {
        if self.position_active(handle).is_some() {
            return Ok(());
        }
        let Some(pos) = self.position_deleted(handle) else {
            return Err(VaultError::InvalidArgument(
                "Entry does not belong to this safe".to_string(),
            ));
        };
        let name = handle.name()?;
        for other in &self.entries {
            if other.name()? == name {
                return Err(VaultError::NameAlreadyUsed(name));
            }
        }
        let handle = self.deleted.remove(pos);
        self.entries.push(handle);
        Ok(())
    }

    pub fn get_entry_by_name(&self, name: &str) -> Result<Option<EntryHandle>> {
        for handle in &self.entries {
            if handle.name()? == name {
                return Ok(Some(handle.clone()));
            }
        }
        Ok(None)
    }

    /// Active entries in insertion order
    pub fn entries(&self) -> Vec<EntryHandle> {
        self.entries.clone()
    }

    pub fn deleted_entries(&self) -> Vec<EntryHandle> {
        self.deleted.clone()
    }

    pub fn is_active(&self, handle: &EntryHandle) -> bool {
        self.position_active(handle).is_some()
    }

    pub fn is_deleted(&self, handle: &EntryHandle) -> bool {
        self.position_deleted(handle).is_some()
    }

    fn position_active(&self, handle: &EntryHandle) -> Option<usize> {
        self.entries.iter().position(|h| h == handle)
    }

    fn position_deleted(&self, handle: &EntryHandle) -> Option<usize> {
        self.deleted.iter().position(|h| h == handle)
    }

    /// Drop and destroy new entries that never became complete
    pub fn clear_invalid_new_entries(&mut self) -> Result<()> {
        let mut invalid = Vec::new();
        for (pos, handle) in self.entries.iter().enumerate() {
            if handle.is_new()? && handle.data()?.is_none() {
                invalid.push(pos);
            }
        }
        for pos in invalid.into_iter().rev() {
            self.entries.remove(pos).invalidate();
        }
        Ok(())
    }

    /// Merge foreign entries and persist immediately. Requires a safe with
    /// no pending changes; on any failure the safe file is reloaded, rolling
    /// the merge back.
    pub fn import_data(&mut self, data: SafeData) -> Result<()> {
        if self.has_changes()? {
            return Err(VaultError::InvalidState(
                "Import requires a safe without pending changes".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for entry in data.entries() {
            if !names.insert(entry.name().to_string()) {
                return Err(VaultError::NameAlreadyUsed(entry.name().to_string()));
            }
            if self.get_entry_by_name(entry.name())?.is_some() {
                return Err(VaultError::NameAlreadyUsed(entry.name().to_string()));
            }
        }

        let count = data.len();
        self.entries.extend(
            data.into_entries()
                .into_iter()
                .map(EntryHandle::from_committed),
        );
        if let Err(e) = self.update_safe_file() {
            warn!(error = %e, "Import failed, reloading the safe to roll back");
            let _ = self.load_safe_file();
            return Err(e);
        }

        info!(imported = count, "Entries imported");
        Ok(())
    }

    /// Read an export container and merge its entries
    pub fn import_data_from(
        &mut self,
        path: &Path,
        cipher: &Cipher,
        password: &str,
    ) -> Result<()> {
        let data = container::read(path, cipher, password)?;
        self.import_data(data)
    }

    /// Write the current valid entries to an export container and verify it
    /// by reading it back
    pub fn export_data_to(
        &self,
        path: &Path,
        cipher: &Cipher,
        password: &str,
        version: u16,
    ) -> Result<()> {
        cipher.wait_working_check();
        let data = self.collect_valid_data()?;
        container::write(path, cipher, password, version, &data)?;

        match container::read(path, cipher, password) {
            Ok(read_back) if read_back == data => Ok(()),
            Ok(_) => {
                let _ = fs::remove_file(path);
                Err(VaultError::StorageError(
                    "Export verification read back different content".to_string(),
                ))
            }
            Err(e) => {
                let _ = fs::remove_file(path);
                Err(VaultError::StorageError(format!(
                    "Export verification failed: {}",
                    e
                )))
            }
        }
    }

    /// Re-encrypt the safe under a new master password. Handles stay valid;
    /// the old password is wiped once the file is rewritten.
    pub fn change_safe_password(&mut self, new_password: &str) -> Result<()> {
        if !is_valid_master_password(new_password) {
            return Err(VaultError::InvalidArgument(format!(
                "Master password must have at least {} characters",
                MIN_MASTER_PASSWORD_CHARS
            )));
        }
        self.write_safe_file(new_password)?;
        self.password.set(new_password);
        info!("Master password changed");
        Ok(())
    }

    /// Switch the cipher roles and rewrite the file; the role change is
    /// rolled back when the rewrite fails
    pub fn change_safe_ciphers(&mut self, internal: &str, user: &str) -> Result<()> {
        let new_ciphers = SafeCiphers::from_names(internal, user)?;
        let old_ciphers = self.ciphers;
        self.ciphers = new_ciphers;
        if let Err(e) = self.update_safe_file() {
            self.ciphers = old_ciphers;
            return Err(e);
        }
        info!(internal, user, "Safe ciphers changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::CipherRegistry;
    use tempfile::TempDir;

    const PASSWORD: &str = "master password 1";

    fn ciphers() -> SafeCiphers {
        SafeCiphers::from_names("AES_GCM", "ChaCha20-Poly1305").unwrap()
    }

    fn new_manager(dir: &TempDir) -> SafeDataManager {
        SafeDataManager::new(dir.path().join("test.safe"), PASSWORD, ciphers()).unwrap()
    }

    fn add_entry(manager: &mut SafeDataManager, name: &str, password: &str) -> EntryHandle {
        let handle = manager.add_new_entry().unwrap();
        manager.set_entry_name(&handle, name).unwrap();
        handle.set_password(password).unwrap();
        handle
    }

    #[test]
    fn test_rejects_short_master_password() {
        let dir = TempDir::new().unwrap();
        assert!(SafeDataManager::new(dir.path().join("x.safe"), "short", ciphers()).is_err());
        assert!(is_valid_master_password("exactly 10"));
        assert!(!is_valid_master_password("not quite"));
    }

    #[test]
    fn test_create_and_reload_empty_safe() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        manager.update_safe_file().unwrap();
        assert!(manager.path().exists());

        manager.load_safe_file().unwrap();
        assert!(manager.entries().is_empty());
        assert!(!manager.has_changes().unwrap());
    }

    #[test]
    fn test_entry_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let handle = add_entry(&mut manager, "mail", "entry-password");
        handle.set_site("mail.example.com").unwrap();
        assert!(manager.has_changes().unwrap());

        manager.update_safe_file().unwrap();
        assert!(!manager.has_changes().unwrap());
        // saving keeps handles valid
        assert_eq!(handle.name().unwrap(), "mail");

        manager.load_safe_file().unwrap();
        assert!(handle.is_invalidated());
        let reloaded = manager.get_entry_by_name("mail").unwrap().unwrap();
        assert_eq!(reloaded.password().unwrap().expose(), "entry-password");
        assert_eq!(reloaded.site().unwrap(), "mail.example.com");
        assert!(!reloaded.is_new().unwrap());
    }

    #[test]
    fn test_incomplete_new_entry_is_not_persisted() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let incomplete = manager.add_new_entry().unwrap();
        manager.set_entry_name(&incomplete, "unfinished").unwrap();
        // no password yet: not dirty, not saved
        assert!(!manager.has_changes().unwrap());
        manager.update_safe_file().unwrap();
        manager.load_safe_file().unwrap();
        assert!(manager.get_entry_by_name("unfinished").unwrap().is_none());
    }

    #[test]
    fn test_only_one_unnamed_entry() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let first = manager.add_new_entry().unwrap();
        assert!(manager.add_new_entry().is_err());
        manager.set_entry_name(&first, "named").unwrap();
        assert!(manager.add_new_entry().is_ok());
    }

    #[test]
    fn test_name_uniqueness() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        add_entry(&mut manager, "mail", "pw-one-entry");
        let second = manager.add_new_entry().unwrap();
        assert!(matches!(
            manager.set_entry_name(&second, "mail"),
            Err(VaultError::NameAlreadyUsed(_))
        ));
        manager.set_entry_name(&second, "bank").unwrap();
    }

    #[test]
    fn test_delete_and_restore_net_out() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let handle = add_entry(&mut manager, "mail", "entry-password");
        manager.update_safe_file().unwrap();

        manager.delete_entry(&handle).unwrap();
        assert!(manager.is_deleted(&handle));
        assert!(!manager.is_active(&handle));
        assert!(manager.has_changes().unwrap());

        manager.restore_entry(&handle).unwrap();
        assert!(manager.is_active(&handle));
        assert!(!manager.has_changes().unwrap());
    }

    #[test]
    fn test_deleting_new_entry_destroys_it() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let handle = add_entry(&mut manager, "mail", "entry-password");
        manager.delete_entry(&handle).unwrap();
        assert!(handle.is_invalidated());
        assert!(manager.entries().is_empty());
        assert!(manager.deleted_entries().is_empty());
    }

    #[test]
    fn test_deleted_entry_is_gone_after_save() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        add_entry(&mut manager, "mail", "pw-one-entry");
        add_entry(&mut manager, "bank", "pw-two-entry");
        manager.update_safe_file().unwrap();

        let handle = manager.get_entry_by_name("mail").unwrap().unwrap();
        manager.delete_entry(&handle).unwrap();
        manager.update_safe_file().unwrap();
        assert!(handle.is_invalidated());

        manager.load_safe_file().unwrap();
        assert!(manager.get_entry_by_name("mail").unwrap().is_none());
        assert!(manager.get_entry_by_name("bank").unwrap().is_some());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        add_entry(&mut manager, "mail", "entry-password");
        manager.update_safe_file().unwrap();
        assert!(!dir.path().join("_temp_-test.safe").exists());
    }

    #[test]
    fn test_clear_invalid_new_entries() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        add_entry(&mut manager, "complete", "entry-password");
        let incomplete = manager.add_new_entry().unwrap();
        manager.set_entry_name(&incomplete, "incomplete").unwrap();

        manager.clear_invalid_new_entries().unwrap();
        assert!(incomplete.is_invalidated());
        assert_eq!(manager.entries().len(), 1);
    }

    #[test]
    fn test_import_merges_and_persists() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        add_entry(&mut manager, "mine", "pw-one-entry");
        manager.update_safe_file().unwrap();

        let mut other = SafeDataManager::new(
            dir.path().join("other.safe"),
            "other password",
            ciphers(),
        )
        .unwrap();
        add_entry(&mut other, "theirs", "pw-two-entry");
        other.update_safe_file().unwrap();
        other.load_safe_file().unwrap();

        let mut imported = SafeData::default();
        for handle in other.entries() {
            imported.push(handle.data().unwrap().unwrap());
        }
        manager.import_data(imported).unwrap();
        assert!(!manager.has_changes().unwrap());

        manager.load_safe_file().unwrap();
        assert!(manager.get_entry_by_name("mine").unwrap().is_some());
        assert!(manager.get_entry_by_name("theirs").unwrap().is_some());
    }

    #[test]
    fn test_import_rejects_collisions_and_pending_changes() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let handle = add_entry(&mut manager, "mail", "pw-one-entry");
        manager.update_safe_file().unwrap();

        let colliding = SafeData::new(vec![handle.data().unwrap().unwrap()]);
        assert!(matches!(
            manager.import_data(colliding),
            Err(VaultError::NameAlreadyUsed(_))
        ));

        handle.set_info("dirty now").unwrap();
        assert!(matches!(
            manager.import_data(SafeData::default()),
            Err(VaultError::InvalidState(_))
        ));
    }

    #[test]
    fn test_export_and_import_via_container() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        add_entry(&mut manager, "mail", "pw-one-entry");
        manager.update_safe_file().unwrap();

        let cipher = CipherRegistry::global().get("AES_CTR").unwrap();
        let export_path = dir.path().join("export.bin");
        manager
            .export_data_to(&export_path, cipher, "transfer password", 1)
            .unwrap();

        let mut receiver = SafeDataManager::new(
            dir.path().join("receiver.safe"),
            "receiver password",
            ciphers(),
        )
        .unwrap();
        receiver.update_safe_file().unwrap();
        receiver
            .import_data_from(&export_path, cipher, "transfer password")
            .unwrap();
        assert!(receiver.get_entry_by_name("mail").unwrap().is_some());
    }

    #[test]
    fn test_change_master_password() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let handle = add_entry(&mut manager, "mail", "entry-password");
        manager.update_safe_file().unwrap();

        manager.change_safe_password("brand new password").unwrap();
        assert!(manager.is_safe_password("brand new password"));
        assert!(!manager.is_safe_password(PASSWORD));
        // no implicit reload: handles stay valid
        assert_eq!(handle.name().unwrap(), "mail");

        // the file now only opens with the new password
        let mut reopened = SafeDataManager::new(
            manager.path().to_path_buf(),
            "brand new password",
            ciphers(),
        )
        .unwrap();
        reopened.load_safe_file().unwrap();
        assert!(reopened.get_entry_by_name("mail").unwrap().is_some());

        let mut stale =
            SafeDataManager::new(manager.path().to_path_buf(), PASSWORD, ciphers()).unwrap();
        assert!(stale.load_safe_file().is_err());

        assert!(manager.change_safe_password("short").is_err());
    }

    #[test]
    fn test_change_safe_ciphers() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        add_entry(&mut manager, "mail", "entry-password");
        manager.update_safe_file().unwrap();

        manager.change_safe_ciphers("ChaCha20", "AES_CTR").unwrap();
        manager.load_safe_file().unwrap();
        assert!(manager.get_entry_by_name("mail").unwrap().is_some());

        assert!(manager.change_safe_ciphers("DES", "AES_CTR").is_err());
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let dir = TempDir::new().unwrap();
        let mut manager = new_manager(&dir);
        let mut other = SafeDataManager::new(
            dir.path().join("other.safe"),
            "other password",
            ciphers(),
        )
        .unwrap();
        let foreign = other.add_new_entry().unwrap();
        assert!(manager.delete_entry(&foreign).is_err());
        assert!(manager.set_entry_name(&foreign, "name").is_err());
        assert!(manager.restore_entry(&foreign).is_err());
    }
}
