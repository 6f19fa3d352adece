//! Obfuscated entry-collection payload shared by the safe file and export
//! containers
//!
//! Layout: noise-length marker, pre-noise, entry count, entries,
//! noise-length marker, post-noise. Both noise runs carry a length marker;
//! the decoder requires the bytes after the last entry to match the
//! post-noise marker exactly, so a buffer that is not a payload fails to
//! decode instead of passing as an empty collection.

use chrono::DateTime;
use rand::{Rng, RngCore};
use zeroize::Zeroizing;

use crate::codec::{NumberRange, ObfuscatedReader, ObfuscatedWriter};
use crate::crypto::secret::{SecretBytes, SecretString};
use crate::data::entry::{EntryData, SafeData};
use crate::data::totp::{Totp, TotpAlgorithm, DIGITS_RANGE, PERIOD_RANGE};
use crate::error::{Result, VaultError};

const NOISE_LEN_RANGE: NumberRange = NumberRange::new(1, 8);
const TOTP_FLAG_RANGE: NumberRange = NumberRange::new(0, 1);
const ALGORITHM_RANGE: NumberRange = NumberRange::new(0, 3);

pub(crate) fn encode_payload(data: &SafeData) -> Result<Zeroizing<Vec<u8>>> {
    let mut rng = rand::thread_rng();
    let mut writer = ObfuscatedWriter::new();

    let pre_len = rng.gen_range(NOISE_LEN_RANGE.min..=NOISE_LEN_RANGE.max);
    writer.write_small_number(pre_len, NOISE_LEN_RANGE)?;
    let mut noise = vec![0u8; pre_len as usize];
    rng.fill_bytes(&mut noise);
    writer.write_raw(&noise);

    writer.write_positive_int(data.len() as u32, 0)?;
    for entry in data.entries() {
        encode_entry(&mut writer, entry)?;
    }

    let post_len = rng.gen_range(NOISE_LEN_RANGE.min..=NOISE_LEN_RANGE.max);
    writer.write_small_number(post_len, NOISE_LEN_RANGE)?;
    let mut post = vec![0u8; post_len as usize];
    rng.fill_bytes(&mut post);
    writer.write_raw(&post);

    Ok(writer.take())
}

fn encode_entry(writer: &mut ObfuscatedWriter, entry: &EntryData) -> Result<()> {
    writer.write_text(entry.name())?;
    let password_units: Zeroizing<Vec<u16>> =
        Zeroizing::new(entry.password().expose().encode_utf16().collect());
    writer.write_chars(&password_units)?;
    writer.write_raw(&entry.last_password_change().timestamp().to_be_bytes());
    writer.write_text(entry.site())?;
    writer.write_text(entry.info())?;
    match entry.totp() {
        None => writer.write_small_number(0, TOTP_FLAG_RANGE)?,
        Some(totp) => {
            writer.write_small_number(1, TOTP_FLAG_RANGE)?;
            encode_totp(writer, totp)?;
        }
    }
    Ok(())
}

fn encode_totp(writer: &mut ObfuscatedWriter, totp: &Totp) -> Result<()> {
    let key = totp.key().expose();
    writer.write_unsigned_short(key.len() as u32)?;
    writer.write_raw(key);
    writer.write_text(totp.label())?;
    writer.write_text(totp.issuer())?;
    writer.write_small_number(totp.algorithm().ordinal(), ALGORITHM_RANGE)?;
    writer.write_small_number(u32::from(totp.digits()), DIGITS_RANGE)?;
    writer.write_small_number(totp.period_secs(), PERIOD_RANGE)?;
    Ok(())
}

pub(crate) fn decode_payload(bytes: &[u8]) -> Result<SafeData> {
    let mut reader = ObfuscatedReader::new(bytes);
    let pre_len = reader.read_small_number(NOISE_LEN_RANGE)?;
    reader.skip(pre_len as usize)?;

    let count = reader.read_positive_int(0)?;
    let mut data = SafeData::default();
    for _ in 0..count {
        data.push(decode_entry(&mut reader)?);
    }
    let post_len = reader.read_small_number(NOISE_LEN_RANGE)?;
    if reader.remaining() != post_len as usize {
        return Err(VaultError::CorruptedData(
            "Trailing noise length mismatch".to_string(),
        ));
    }
    Ok(data)
}

fn decode_entry(reader: &mut ObfuscatedReader<'_>) -> Result<EntryData> {
    let name = reader.read_text()?;
    let password_units = reader.read_chars()?;
    let password = SecretString::new(String::from_utf16(&password_units).map_err(|_| {
        VaultError::CorruptedData("Invalid UTF-16 password".to_string())
    })?);

    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(reader.read_raw(8)?);
    let change_time = DateTime::from_timestamp(i64::from_be_bytes(ts_bytes), 0)
        .ok_or_else(|| VaultError::CorruptedData("Timestamp out of range".to_string()))?;

    let site = reader.read_text()?;
    let info = reader.read_text()?;
    let totp = match reader.read_small_number(TOTP_FLAG_RANGE)? {
        0 => None,
        _ => Some(decode_totp(reader)?),
    };

    EntryData::new(name, password, change_time, site, info, totp)
        .map_err(|e| VaultError::CorruptedData(format!("Invalid entry: {}", e)))
}

fn decode_totp(reader: &mut ObfuscatedReader<'_>) -> Result<Totp> {
    let key_len = reader.read_unsigned_short()? as usize;
    let key = SecretBytes::from(reader.read_raw(key_len)?);
    let label = reader.read_text()?;
    let issuer = reader.read_text()?;
    let algorithm = TotpAlgorithm::from_ordinal(reader.read_small_number(ALGORITHM_RANGE)?)?;
    let digits = reader.read_small_number(DIGITS_RANGE)? as u8;
    let period_secs = reader.read_small_number(PERIOD_RANGE)?;
    Totp::new(key, label, issuer, algorithm, digits, period_secs)
        .map_err(|e| VaultError::CorruptedData(format!("Invalid TOTP settings: {}", e)))
}
