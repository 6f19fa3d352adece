//! RFC 6238 time-based one-time passwords

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use crate::codec::obfuscated::check_valid_length;
use crate::codec::{base32, NumberRange};
use crate::crypto::secret::SecretBytes;
use crate::error::{Result, VaultError};

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Allowed code lengths
pub const DIGITS_RANGE: NumberRange = NumberRange::new(5, 8);
/// Allowed interval lengths in seconds
pub const PERIOD_RANGE: NumberRange = NumberRange::new(1, 256);

pub const DEFAULT_DIGITS: u8 = 6;
pub const DEFAULT_PERIOD_SECS: u32 = 30;

const URI_PREFIX: &str = "otpauth://totp/";

/// HMAC hash function of a TOTP generator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TotpAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl TotpAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            TotpAlgorithm::Sha1 => "SHA1",
            TotpAlgorithm::Sha256 => "SHA256",
            TotpAlgorithm::Sha512 => "SHA512",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SHA1" => Ok(TotpAlgorithm::Sha1),
            "SHA256" => Ok(TotpAlgorithm::Sha256),
            "SHA512" => Ok(TotpAlgorithm::Sha512),
            _ => Err(VaultError::InvalidArgument(format!(
                "Unknown TOTP algorithm: {}",
                name
            ))),
        }
    }

    /// Stable index used by the storage codec
    pub(crate) fn ordinal(&self) -> u32 {
        match self {
            TotpAlgorithm::Sha1 => 0,
            TotpAlgorithm::Sha256 => 1,
            TotpAlgorithm::Sha512 => 2,
        }
    }

    pub(crate) fn from_ordinal(ordinal: u32) -> Result<Self> {
        match ordinal {
            0 => Ok(TotpAlgorithm::Sha1),
            1 => Ok(TotpAlgorithm::Sha256),
            2 => Ok(TotpAlgorithm::Sha512),
            _ => Err(VaultError::CorruptedData(format!(
                "Unknown TOTP algorithm ordinal: {}",
                ordinal
            ))),
        }
    }
}

/// Cached codes for one time interval
#[derive(Clone)]
struct Window {
    interval: i64,
    current: String,
    next: String,
}

/// A TOTP generator with a cached current/next code window
#[derive(Clone)]
pub struct Totp {
    key: SecretBytes,
    label: String,
    issuer: String,
    algorithm: TotpAlgorithm,
    digits: u8,
    period_secs: u32,
    window: Option<Window>,
}

impl Totp {
    pub fn new(
        key: SecretBytes,
        label: String,
        issuer: String,
        algorithm: TotpAlgorithm,
        digits: u8,
        period_secs: u32,
    ) -> Result<Self> {
        if key.is_empty() {
            return Err(VaultError::InvalidArgument(
                "TOTP key must not be empty".to_string(),
            ));
        }
        if !DIGITS_RANGE.contains(u32::from(digits)) {
            return Err(VaultError::InvalidArgument(format!(
                "TOTP digits {} outside [{}, {}]",
                digits, DIGITS_RANGE.min, DIGITS_RANGE.max
            )));
        }
        if !PERIOD_RANGE.contains(period_secs) {
            return Err(VaultError::InvalidArgument(format!(
                "TOTP period {} outside [{}, {}]",
                period_secs, PERIOD_RANGE.min, PERIOD_RANGE.max
            )));
        }
        check_valid_length(&label)?;
        check_valid_length(&issuer)?;
        Ok(Self {
            key,
            label,
            issuer,
            algorithm,
            digits,
            period_secs,
            window: None,
        })
    }

    /// Parse either an `otpauth://totp/` URI or a bare Base32 secret.
    /// Embedded whitespace in the secret is stripped before decoding.
    pub fn from_uri(input: &str) -> Result<Self> {
        let input = input.trim();
        let Some(rest) = input.strip_prefix(URI_PREFIX) else {
            let key = decode_secret(input)?;
            return Self::new(
                key,
                String::new(),
                String::new(),
                TotpAlgorithm::default(),
                DEFAULT_DIGITS,
                DEFAULT_PERIOD_SECS,
            );
        };

        let (label, query) = rest.split_once('?').ok_or_else(|| {
            VaultError::InvalidArgument("TOTP URI has no query parameters".to_string())
        })?;

        let mut secret = None;
        let mut issuer = String::new();
        let mut algorithm = TotpAlgorithm::default();
        let mut digits = DEFAULT_DIGITS;
        let mut period_secs = DEFAULT_PERIOD_SECS;

        for pair in query.split('&') {
            let (name, value) = pair.split_once('=').ok_or_else(|| {
                VaultError::InvalidArgument(format!("Malformed TOTP URI parameter: {}", pair))
            })?;
            match name {
                "secret" => secret = Some(decode_secret(value)?),
                "issuer" => issuer = value.to_string(),
                "algorithm" => algorithm = TotpAlgorithm::from_name(value)?,
                "digits" => {
                    digits = value.parse().map_err(|_| {
                        VaultError::InvalidArgument(format!("Invalid TOTP digits: {}", value))
                    })?;
                }
                "period" => {
                    period_secs = value.parse().map_err(|_| {
                        VaultError::InvalidArgument(format!("Invalid TOTP period: {}", value))
                    })?;
                }
                _ => {
                    return Err(VaultError::InvalidArgument(format!(
                        "Unknown TOTP URI parameter: {}",
                        name
                    )));
                }
            }
        }

        let key = secret.ok_or_else(|| {
            VaultError::InvalidArgument("TOTP URI is missing the secret".to_string())
        })?;
        Self::new(
            key,
            label.to_string(),
            issuer,
            algorithm,
            digits,
            period_secs,
        )
    }

    /// Canonical URI form: secret, issuer (when set), algorithm, digits, period
    pub fn to_uri(&self) -> String {
        let mut uri = format!(
            "{}{}?secret={}",
            URI_PREFIX,
            self.label,
            base32::encode(self.key.expose())
        );
        if !self.issuer.is_empty() {
            uri.push_str("&issuer=");
            uri.push_str(&self.issuer);
        }
        uri.push_str("&algorithm=");
        uri.push_str(self.algorithm.name());
        uri.push_str(&format!("&digits={}", self.digits));
        uri.push_str(&format!("&period={}", self.period_secs));
        uri
    }

    pub fn key(&self) -> &SecretBytes {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn algorithm(&self) -> TotpAlgorithm {
        self.algorithm
    }

    pub fn digits(&self) -> u8 {
        self.digits
    }

    pub fn period_secs(&self) -> u32 {
        self.period_secs
    }

    /// RFC 4226 code for one counter value
    pub fn code_at(&self, counter: u64) -> Result<String> {
        let digest = self.hmac(&counter.to_be_bytes())?;
        let offset = (digest[digest.len() - 1] & 0x0f) as usize;
        let truncated = u32::from(digest[offset] & 0x7f) << 24
            | u32::from(digest[offset + 1]) << 16
            | u32::from(digest[offset + 2]) << 8
            | u32::from(digest[offset + 3]);
        let code = truncated % 10u32.pow(u32::from(self.digits));
        Ok(format!("{:0width$}", code, width = self.digits as usize))
    }

    /// Move the cached window to the interval containing `time`. Returns
    /// true when the window advanced (or was set for the first time). A
    /// one-interval advance reuses the cached next code.
    pub fn update_current_time(&mut self, time: DateTime<Utc>) -> Result<bool> {
        let interval = time.timestamp().div_euclid(i64::from(self.period_secs));
        match self.window.take() {
            Some(window) if window.interval == interval => {
                self.window = Some(window);
                Ok(false)
            }
            Some(window) if window.interval + 1 == interval => {
                let next = self.code_at((interval + 1) as u64)?;
                self.window = Some(Window {
                    interval,
                    current: window.next,
                    next,
                });
                Ok(true)
            }
            _ => {
                self.window = Some(Window {
                    interval,
                    current: self.code_at(interval as u64)?,
                    next: self.code_at((interval + 1) as u64)?,
                });
                Ok(true)
            }
        }
    }

    fn window(&self) -> Result<&Window> {
        self.window.as_ref().ok_or_else(|| {
            VaultError::InvalidState("No TOTP time window set yet".to_string())
        })
    }

    /// Code for the current interval; requires a prior `update_current_time`
    pub fn current_code(&self) -> Result<&str> {
        Ok(&self.window()?.current)
    }

    /// Code for the interval after the current one
    pub fn next_code(&self) -> Result<&str> {
        Ok(&self.window()?.next)
    }

    /// Start of the interval after the current one
    pub fn next_interval_start(&self) -> Result<DateTime<Utc>> {
        let window = self.window()?;
        let secs = (window.interval + 1) * i64::from(self.period_secs);
        DateTime::from_timestamp(secs, 0).ok_or_else(|| {
            VaultError::InvalidState(format!("Interval start {} out of range", secs))
        })
    }

    fn hmac(&self, message: &[u8]) -> Result<Vec<u8>> {
        let invalid_key =
            |_| VaultError::InvalidArgument("Unusable TOTP key".to_string());
        let digest = match self.algorithm {
            TotpAlgorithm::Sha1 => {
                let mut mac = HmacSha1::new_from_slice(self.key.expose()).map_err(invalid_key)?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            TotpAlgorithm::Sha256 => {
                let mut mac = HmacSha256::new_from_slice(self.key.expose()).map_err(invalid_key)?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
            TotpAlgorithm::Sha512 => {
                let mut mac = HmacSha512::new_from_slice(self.key.expose()).map_err(invalid_key)?;
                mac.update(message);
                mac.finalize().into_bytes().to_vec()
            }
        };
        Ok(digest)
    }
}

impl PartialEq for Totp {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.label == other.label
            && self.issuer == other.issuer
            && self.algorithm == other.algorithm
            && self.digits == other.digits
            && self.period_secs == other.period_secs
    }
}

impl Eq for Totp {}

impl std::fmt::Debug for Totp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Totp")
            .field("key", &"[REDACTED]")
            .field("label", &self.label)
            .field("issuer", &self.issuer)
            .field("algorithm", &self.algorithm)
            .field("digits", &self.digits)
            .field("period_secs", &self.period_secs)
            .finish()
    }
}

fn decode_secret(value: &str) -> Result<SecretBytes> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    let key = base32::decode(&compact)?;
    if key.is_empty() {
        return Err(VaultError::InvalidArgument(
            "TOTP secret must not be empty".to_string(),
        ));
    }
    Ok(SecretBytes::new(key))
}
