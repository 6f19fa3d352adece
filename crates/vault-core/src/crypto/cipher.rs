//! Cipher suites with background self-tests
//!
//! Each cipher carries a liveness status. A one-shot background self-test
//! round-trips probe data through the primitive; encryption and decryption
//! refuse to run on a cipher whose self-test has failed. Key, IV and salt
//! generation are never gated, so a safe remains readable for recovery even
//! when a suite is marked broken.

use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use super::key_derivation::{self, KEY_LEN, SALT_LEN};
use super::secret::SecretBytes;
use crate::error::{Result, VaultError};

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Authentication tag length of the AEAD suites
pub const AEAD_TAG_LEN: usize = 16;

/// The fixed set of supported cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    AesCtr,
    AesGcm,
    ChaCha20,
    ChaCha20Poly1305,
}

impl CipherSuite {
    pub const ALL: [CipherSuite; 4] = [
        CipherSuite::AesCtr,
        CipherSuite::AesGcm,
        CipherSuite::ChaCha20,
        CipherSuite::ChaCha20Poly1305,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CipherSuite::AesCtr => "AES_CTR",
            CipherSuite::AesGcm => "AES_GCM",
            CipherSuite::ChaCha20 => "ChaCha20",
            CipherSuite::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }

    pub fn iv_size(&self) -> usize {
        match self {
            CipherSuite::AesCtr => 16,
            _ => 12,
        }
    }

    /// AEAD suites append an authentication tag to the ciphertext
    pub fn is_aead(&self) -> bool {
        matches!(self, CipherSuite::AesGcm | CipherSuite::ChaCha20Poly1305)
    }
}

/// Outcome of the one-shot cipher self-test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingStatus {
    Unchecked,
    PendingCheck,
    Working,
    NotWorking,
}

struct StatusCell {
    status: Mutex<WorkingStatus>,
    cond: Condvar,
}

impl StatusCell {
    fn lock(&self) -> MutexGuard<'_, WorkingStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A cipher suite plus its self-test status
pub struct Cipher {
    suite: CipherSuite,
    cell: Arc<StatusCell>,
}

impl Cipher {
    fn new(suite: CipherSuite) -> Self {
        Self {
            suite,
            cell: Arc::new(StatusCell {
                status: Mutex::new(WorkingStatus::Unchecked),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.suite.name()
    }

    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    pub fn key_size(&self) -> usize {
        KEY_LEN
    }

    pub fn iv_size(&self) -> usize {
        self.suite.iv_size()
    }

    pub fn salt_size(&self) -> usize {
        SALT_LEN
    }

    /// Ciphertext length for a given plaintext length
    pub fn encrypted_len(&self, plain_len: usize) -> usize {
        if self.suite.is_aead() {
            plain_len + AEAD_TAG_LEN
        } else {
            plain_len
        }
    }

    pub fn generate_key(&self) -> SecretBytes {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        SecretBytes::new(bytes)
    }

    pub fn generate_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_size()];
        OsRng.fill_bytes(&mut iv);
        iv
    }

    pub fn generate_salt(&self) -> Vec<u8> {
        let mut salt = vec![0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Argon2id key derivation from a master password and raw salt
    pub fn derive_key(&self, password: &str, salt: &[u8]) -> Result<SecretBytes> {
        key_derivation::derive_key(password, salt, None)
    }

    pub fn encrypt_bytes(&self, plain: &[u8], key: &SecretBytes, iv: &[u8]) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        raw_encrypt(self.suite, plain, key.expose(), iv)
    }

    pub fn decrypt_bytes(
        &self,
        ciphertext: &[u8],
        key: &SecretBytes,
        iv: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.ensure_usable()?;
        raw_decrypt(self.suite, ciphertext, key.expose(), iv)
    }

    /// Wrap `inner` in a writer that encrypts everything written to it.
    ///
    /// Stream suites push ciphertext through as data arrives. AEAD suites
    /// buffer the plaintext and emit ciphertext plus tag when the writer is
    /// [finished](EncryptingWriter::finish); the tag covers the whole
    /// message, so nothing can go out earlier.
    pub fn encrypt_stream<W: Write>(
        &self,
        inner: W,
        key: &SecretBytes,
        iv: &[u8],
    ) -> Result<EncryptingWriter<W>> {
        self.ensure_usable()?;
        check_key_iv(self.suite, key.expose(), iv)?;
        let cryptor = match self.suite {
            CipherSuite::AesCtr => StreamCryptor::AesCtr(
                Aes256Ctr::new_from_slices(key.expose(), iv)
                    .map_err(|_| encrypt_error(self.suite))?,
            ),
            CipherSuite::ChaCha20 => StreamCryptor::ChaCha20(
                chacha20::ChaCha20::new_from_slices(key.expose(), iv)
                    .map_err(|_| encrypt_error(self.suite))?,
            ),
            CipherSuite::AesGcm | CipherSuite::ChaCha20Poly1305 => StreamCryptor::Aead {
                suite: self.suite,
                key: key.clone(),
                iv: iv.to_vec(),
                buf: Zeroizing::new(Vec::new()),
            },
        };
        Ok(EncryptingWriter { inner, cryptor })
    }

    /// Wrap `inner` in a reader that decrypts everything read from it.
    ///
    /// Stream suites decrypt incrementally. AEAD suites must see the
    /// complete ciphertext to verify the tag, so the first read drains
    /// `inner`; a tag mismatch surfaces as [`io::ErrorKind::InvalidData`].
    pub fn decrypt_stream<R: Read>(
        &self,
        inner: R,
        key: &SecretBytes,
        iv: &[u8],
    ) -> Result<DecryptingReader<R>> {
        self.ensure_usable()?;
        check_key_iv(self.suite, key.expose(), iv)?;
        let state = match self.suite {
            CipherSuite::AesCtr => ReaderState::AesCtr(
                Aes256Ctr::new_from_slices(key.expose(), iv)
                    .map_err(|_| decrypt_error(self.suite))?,
            ),
            CipherSuite::ChaCha20 => ReaderState::ChaCha20(
                chacha20::ChaCha20::new_from_slices(key.expose(), iv)
                    .map_err(|_| decrypt_error(self.suite))?,
            ),
            CipherSuite::AesGcm | CipherSuite::ChaCha20Poly1305 => ReaderState::AeadPending {
                suite: self.suite,
                key: key.clone(),
                iv: iv.to_vec(),
            },
        };
        Ok(DecryptingReader { inner, state })
    }

    fn ensure_usable(&self) -> Result<()> {
        if *self.cell.lock() == WorkingStatus::NotWorking {
            return Err(VaultError::CipherNotWorking(self.name().to_string()));
        }
        Ok(())
    }

    pub fn status(&self) -> WorkingStatus {
        *self.cell.lock()
    }

    pub fn is_checked(&self) -> bool {
        matches!(
            self.status(),
            WorkingStatus::Working | WorkingStatus::NotWorking
        )
    }

    pub fn is_working(&self) -> bool {
        self.status() == WorkingStatus::Working
    }

    /// True unless the self-test has concluded the cipher is broken
    pub fn is_working_or_unchecked(&self) -> bool {
        self.status() != WorkingStatus::NotWorking
    }

    /// Kick off the background self-test. Only the first call spawns a
    /// thread; later calls are no-ops.
    pub fn check_working_async(&self) {
        {
            let mut status = self.cell.lock();
            if *status != WorkingStatus::Unchecked {
                return;
            }
            *status = WorkingStatus::PendingCheck;
        }

        let suite = self.suite;
        let cell = Arc::clone(&self.cell);
        std::thread::spawn(move || {
            let working = run_self_test(suite);
            if working {
                debug!(cipher = suite.name(), "Cipher self-test passed");
            } else {
                warn!(cipher = suite.name(), "Cipher self-test FAILED");
            }
            let mut status = cell.lock();
            *status = if working {
                WorkingStatus::Working
            } else {
                WorkingStatus::NotWorking
            };
            cell.cond.notify_all();
        });
    }

    /// Block until a pending self-test concludes. Returns immediately when
    /// no check has been started.
    pub fn wait_working_check(&self) {
        let mut status = self.cell.lock();
        while *status == WorkingStatus::PendingCheck {
            status = self
                .cell
                .cond
                .wait(status)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`wait_working_check`](Self::wait_working_check) but gives up
    /// after `timeout`. Returns false when the check was still pending.
    pub fn wait_working_check_timeout(&self, timeout: Duration) -> bool {
        let status = self.cell.lock();
        let (status, _) = self
            .cell
            .cond
            .wait_timeout_while(status, timeout, |s| *s == WorkingStatus::PendingCheck)
            .unwrap_or_else(|e| e.into_inner());
        *status != WorkingStatus::PendingCheck
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("suite", &self.suite)
            .field("status", &self.status())
            .finish()
    }
}

enum StreamCryptor {
    AesCtr(Aes256Ctr),
    ChaCha20(chacha20::ChaCha20),
    Aead {
        suite: CipherSuite,
        key: SecretBytes,
        iv: Vec<u8>,
        buf: Zeroizing<Vec<u8>>,
    },
}

/// Encrypting [`Write`] wrapper produced by [`Cipher::encrypt_stream`]
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cryptor: StreamCryptor,
}

impl<W: Write> EncryptingWriter<W> {
    /// Complete the stream and return the inner writer. For AEAD suites
    /// this is where the buffered plaintext is encrypted and written out.
    pub fn finish(self) -> Result<W> {
        let Self { mut inner, cryptor } = self;
        if let StreamCryptor::Aead {
            suite,
            key,
            iv,
            buf,
        } = cryptor
        {
            let ciphertext = raw_encrypt(suite, &buf, key.expose(), &iv)?;
            inner.write_all(&ciphertext)?;
        }
        inner.flush()?;
        Ok(inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.cryptor {
            StreamCryptor::AesCtr(cipher) => {
                let mut chunk = Zeroizing::new(data.to_vec());
                cipher.apply_keystream(&mut chunk);
                self.inner.write_all(&chunk)?;
            }
            StreamCryptor::ChaCha20(cipher) => {
                let mut chunk = Zeroizing::new(data.to_vec());
                cipher.apply_keystream(&mut chunk);
                self.inner.write_all(&chunk)?;
            }
            StreamCryptor::Aead { buf, .. } => buf.extend_from_slice(data),
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum ReaderState {
    AesCtr(Aes256Ctr),
    ChaCha20(chacha20::ChaCha20),
    AeadPending {
        suite: CipherSuite,
        key: SecretBytes,
        iv: Vec<u8>,
    },
    AeadReady {
        plain: Zeroizing<Vec<u8>>,
        pos: usize,
    },
}

/// Decrypting [`Read`] wrapper produced by [`Cipher::decrypt_stream`]
pub struct DecryptingReader<R: Read> {
    inner: R,
    state: ReaderState,
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if let ReaderState::AeadPending { suite, key, iv } = &self.state {
            let mut ciphertext = Vec::new();
            self.inner.read_to_end(&mut ciphertext)?;
            let plain = raw_decrypt(*suite, &ciphertext, key.expose(), iv)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            self.state = ReaderState::AeadReady { plain, pos: 0 };
        }
        match &mut self.state {
            ReaderState::AesCtr(cipher) => {
                let n = self.inner.read(out)?;
                cipher.apply_keystream(&mut out[..n]);
                Ok(n)
            }
            ReaderState::ChaCha20(cipher) => {
                let n = self.inner.read(out)?;
                cipher.apply_keystream(&mut out[..n]);
                Ok(n)
            }
            ReaderState::AeadReady { plain, pos } => {
                let n = (plain.len() - *pos).min(out.len());
                out[..n].copy_from_slice(&plain[*pos..*pos + n]);
                *pos += n;
                Ok(n)
            }
            ReaderState::AeadPending { .. } => unreachable!(),
        }
    }
}

fn check_key_iv(suite: CipherSuite, key: &[u8], iv: &[u8]) -> Result<()> {
    if key.len() != KEY_LEN {
        return Err(VaultError::InvalidArgument(format!(
            "{} requires a {}-byte key, got {}",
            suite.name(),
            KEY_LEN,
            key.len()
        )));
    }
    if iv.len() != suite.iv_size() {
        return Err(VaultError::InvalidArgument(format!(
            "{} requires a {}-byte IV, got {}",
            suite.name(),
            suite.iv_size(),
            iv.len()
        )));
    }
    Ok(())
}

fn encrypt_error(suite: CipherSuite) -> VaultError {
    VaultError::EncryptionError(format!("{} encryption failed", suite.name()))
}

fn decrypt_error(suite: CipherSuite) -> VaultError {
    VaultError::DecryptionError(format!("{} decryption failed", suite.name()))
}

fn raw_encrypt(suite: CipherSuite, plain: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
    check_key_iv(suite, key, iv)?;
    match suite {
        CipherSuite::AesCtr => {
            let mut out = plain.to_vec();
            let mut cipher =
                Aes256Ctr::new_from_slices(key, iv).map_err(|_| encrypt_error(suite))?;
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
        CipherSuite::ChaCha20 => {
            let mut out = plain.to_vec();
            let mut cipher =
                chacha20::ChaCha20::new_from_slices(key, iv).map_err(|_| encrypt_error(suite))?;
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
        CipherSuite::AesGcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| encrypt_error(suite))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(iv), plain)
                .map_err(|_| encrypt_error(suite))
        }
        CipherSuite::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| encrypt_error(suite))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(iv), plain)
                .map_err(|_| encrypt_error(suite))
        }
    }
}

fn raw_decrypt(
    suite: CipherSuite,
    ciphertext: &[u8],
    key: &[u8],
    iv: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    check_key_iv(suite, key, iv)?;
    match suite {
        CipherSuite::AesCtr => {
            let mut out = Zeroizing::new(ciphertext.to_vec());
            let mut cipher =
                Aes256Ctr::new_from_slices(key, iv).map_err(|_| decrypt_error(suite))?;
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
        CipherSuite::ChaCha20 => {
            let mut out = Zeroizing::new(ciphertext.to_vec());
            let mut cipher =
                chacha20::ChaCha20::new_from_slices(key, iv).map_err(|_| decrypt_error(suite))?;
            cipher.apply_keystream(&mut out);
            Ok(out)
        }
        CipherSuite::AesGcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| decrypt_error(suite))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(iv), ciphertext)
                .map(Zeroizing::new)
                .map_err(|_| decrypt_error(suite))
        }
        CipherSuite::ChaCha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| decrypt_error(suite))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(iv), ciphertext)
                .map(Zeroizing::new)
                .map_err(|_| decrypt_error(suite))
        }
    }
}

const PROBE_FIXED: &[u8] = b"abcdef123456abcdef";
const PROBE_PASSWORD: &str = "self-test probe password";

/// Round-trip probe data through the primitive with both a random key and a
/// derived key. Any mismatch or error marks the suite broken.
fn run_self_test(suite: CipherSuite) -> bool {
    let mut rng = rand::thread_rng();

    let mut random_probe = vec![0u8; rng.gen_range(5..=30)];
    rng.fill_bytes(&mut random_probe);

    let mut random_key = vec![0u8; KEY_LEN];
    OsRng.fill_bytes(&mut random_key);

    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let derived_key = match key_derivation::derive_key(PROBE_PASSWORD, &salt, None) {
        Ok(key) => key,
        Err(_) => return false,
    };

    for key in [&random_key[..], derived_key.expose()] {
        for probe in [PROBE_FIXED, &random_probe[..]] {
            let mut iv = vec![0u8; suite.iv_size()];
            OsRng.fill_bytes(&mut iv);

            let ciphertext = match raw_encrypt(suite, probe, key, &iv) {
                Ok(ct) => ct,
                Err(_) => return false,
            };
            let expected_len = if suite.is_aead() {
                probe.len() + AEAD_TAG_LEN
            } else {
                probe.len()
            };
            if ciphertext.len() != expected_len || ciphertext.starts_with(probe) {
                return false;
            }
            match raw_decrypt(suite, &ciphertext, key, &iv) {
                Ok(plain) if *plain == probe => {}
                _ => return false,
            }
        }
    }
    true
}

/// The fixed cipher set, resolved once per process
pub struct CipherRegistry {
    ciphers: Vec<Cipher>,
}

impl CipherRegistry {
    pub fn global() -> &'static CipherRegistry {
        static REGISTRY: OnceLock<CipherRegistry> = OnceLock::new();
        REGISTRY.get_or_init(CipherRegistry::new)
    }

    fn new() -> Self {
        Self {
            ciphers: CipherSuite::ALL.iter().copied().map(Cipher::new).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Result<&Cipher> {
        self.ciphers
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| VaultError::InvalidArgument(format!("Unknown cipher: {}", name)))
    }

    pub fn ciphers(&self) -> &[Cipher] {
        &self.ciphers
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.ciphers.iter().map(|c| c.name()).collect()
    }

    pub fn check_all_working_async(&self) {
        for cipher in &self.ciphers {
            cipher.check_working_async();
        }
    }

    pub fn wait_all_working_checks(&self) {
        for cipher in &self.ciphers {
            cipher.wait_working_check();
        }
    }

    /// Returns false when any check was still pending at the deadline
    pub fn wait_all_working_checks_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for cipher in &self.ciphers {
            let left = deadline.saturating_duration_since(Instant::now());
            if !cipher.wait_working_check_timeout(left) {
                return false;
            }
        }
        true
    }
}
