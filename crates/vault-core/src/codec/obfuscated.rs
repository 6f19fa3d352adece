//! Obfuscated binary codec for safe payloads
//!
//! Every value is stored with deliberate slack: unused bits and filler bytes
//! are filled with fresh randomness on each write, so encoding the same value
//! twice yields different bytes. Decoding ignores the randomness and recovers
//! the value exactly.

use rand::Rng;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Inclusive integer range used to bound small-number encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberRange {
    pub min: u32,
    pub max: u32,
}

impl NumberRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: u32) -> bool {
        value >= self.min && value <= self.max
    }

    /// Number of representable values
    pub fn span(&self) -> u64 {
        u64::from(self.max) - u64::from(self.min) + 1
    }
}

/// Range of the byte-count prefix of a positive int
const INT_SIZE_RANGE: NumberRange = NumberRange::new(1, 4);
/// Range of the byte-count prefix of an unsigned short
const SHORT_SIZE_RANGE: NumberRange = NumberRange::new(1, 2);

/// Maximum number of UTF-16 units in a stored string
pub const MAX_TEXT_UNITS: usize = u16::MAX as usize;

fn check_range(range: NumberRange) -> Result<()> {
    if range.min > range.max || range.span() > 256 {
        return Err(VaultError::InvalidArgument(format!(
            "Unusable small-number range [{}, {}]",
            range.min, range.max
        )));
    }
    Ok(())
}

/// Validates that a string fits the u16-unit length prefix, returning it
/// unchanged for call chaining.
pub fn check_valid_length(text: &str) -> Result<&str> {
    if text.encode_utf16().count() > MAX_TEXT_UNITS {
        return Err(VaultError::LengthFormat(format!(
            "Text of {} UTF-16 units exceeds {}",
            text.encode_utf16().count(),
            MAX_TEXT_UNITS
        )));
    }
    Ok(text)
}

/// Writer over an owned buffer. The buffer holds decrypted safe content, so
/// it is zeroized on drop and on `reset()`.
#[derive(Default)]
pub struct ObfuscatedWriter {
    buf: Zeroizing<Vec<u8>>,
}

impl ObfuscatedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Wipe and clear the accumulated bytes
    pub fn reset(&mut self) {
        self.buf = Zeroizing::new(Vec::new());
    }

    /// Consume the writer, returning the encoded bytes (still zeroize-on-drop)
    pub fn take(self) -> Zeroizing<Vec<u8>> {
        self.buf
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Encode `value` from `range` into one byte. The quotient selects the
    /// value; the remainder bits are randomized.
    pub fn write_small_number(&mut self, value: u32, range: NumberRange) -> Result<()> {
        check_range(range)?;
        if !range.contains(value) {
            return Err(VaultError::InvalidArgument(format!(
                "Value {} outside range [{}, {}]",
                value, range.min, range.max
            )));
        }
        let offset = value - range.min;
        let byte = if range.span() == 256 {
            offset as u8
        } else {
            let div = (256 / range.span()) as u32;
            let low = offset * div;
            let high = low + div - 1;
            rand::thread_rng().gen_range(low..=high) as u8
        };
        self.buf.push(byte);
        Ok(())
    }

    /// Encode `value - min` as 1-4 significant big-endian bytes preceded by
    /// a size marker and random filler. Always 5 bytes total.
    pub fn write_positive_int(&mut self, value: u32, min: u32) -> Result<()> {
        if value < min {
            return Err(VaultError::InvalidArgument(format!(
                "Value {} below minimum {}",
                value, min
            )));
        }
        let delta = value - min;
        if delta > i32::MAX as u32 {
            return Err(VaultError::InvalidArgument(format!(
                "Offset {} exceeds the storable maximum",
                delta
            )));
        }

        let mut bytes = delta.to_be_bytes();
        let start = bytes.iter().position(|&b| b != 0).unwrap_or(3).min(3);
        let size = 4 - start;

        let mut rng = rand::thread_rng();
        if size == 4 && rng.gen_bool(0.5) {
            // the top bit is free because delta fits in 31 bits
            bytes[0] |= 0x80;
        }
        self.write_small_number(size as u32, INT_SIZE_RANGE)?;
        for _ in 0..start {
            self.buf.push(rng.gen());
        }
        self.buf.extend_from_slice(&bytes[start..]);
        Ok(())
    }

    /// Encode a value fitting u16 as 3 bytes: size marker, high byte or
    /// random filler, low byte.
    pub fn write_unsigned_short(&mut self, value: u32) -> Result<()> {
        if value > u16::MAX as u32 {
            return Err(VaultError::InvalidArgument(format!(
                "Value {} does not fit an unsigned short",
                value
            )));
        }
        let high = (value >> 8) as u8;
        let low = value as u8;
        let size = if high == 0 { 1 } else { 2 };
        self.write_small_number(size, SHORT_SIZE_RANGE)?;
        if size == 1 {
            self.buf.push(rand::thread_rng().gen());
        } else {
            self.buf.push(high);
        }
        self.buf.push(low);
        Ok(())
    }

    /// UTF-16 code units with a length prefix
    pub fn write_chars(&mut self, units: &[u16]) -> Result<()> {
        if units.len() > MAX_TEXT_UNITS {
            return Err(VaultError::LengthFormat(format!(
                "{} UTF-16 units exceed {}",
                units.len(),
                MAX_TEXT_UNITS
            )));
        }
        self.write_unsigned_short(units.len() as u32)?;
        for unit in units {
            self.buf.extend_from_slice(&unit.to_be_bytes());
        }
        Ok(())
    }

    pub fn write_text(&mut self, text: &str) -> Result<()> {
        let units: Zeroizing<Vec<u16>> = Zeroizing::new(text.encode_utf16().collect());
        self.write_chars(&units)
    }
}

/// Cursor-style reader over encoded bytes
pub struct ObfuscatedReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ObfuscatedReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| VaultError::CorruptedData("Unexpected end of data".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_raw(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(VaultError::CorruptedData(
                "Unexpected end of data".to_string(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_raw(len).map(|_| ())
    }

    pub fn read_small_number(&mut self, range: NumberRange) -> Result<u32> {
        check_range(range)?;
        let byte = u32::from(self.read_byte()?);
        let offset = if range.span() == 256 {
            byte
        } else {
            let div = (256 / range.span()) as u32;
            let offset = byte / div;
            if u64::from(offset) >= range.span() {
                return Err(VaultError::CorruptedData(format!(
                    "Byte {} outside the encodable range [{}, {}]",
                    byte, range.min, range.max
                )));
            }
            offset
        };
        Ok(range.min + offset)
    }

    pub fn read_positive_int(&mut self, min: u32) -> Result<u32> {
        let size = self.read_small_number(INT_SIZE_RANGE)? as usize;
        self.skip(4 - size)?;
        let mut bytes = [0u8; 4];
        bytes[4 - size..].copy_from_slice(self.read_raw(size)?);
        if size == 4 {
            bytes[0] &= 0x7f;
        }
        let delta = u32::from_be_bytes(bytes);
        min.checked_add(delta)
            .ok_or_else(|| VaultError::CorruptedData("Integer value overflows".to_string()))
    }

    pub fn read_unsigned_short(&mut self) -> Result<u32> {
        let size = self.read_small_number(SHORT_SIZE_RANGE)?;
        let first = self.read_byte()?;
        let low = self.read_byte()?;
        let high = if size == 2 { first } else { 0 };
        Ok(u32::from(high) << 8 | u32::from(low))
    }

    pub fn read_chars(&mut self) -> Result<Zeroizing<Vec<u16>>> {
        let len = self.read_unsigned_short()? as usize;
        let mut units = Zeroizing::new(Vec::with_capacity(len));
        for _ in 0..len {
            let high = self.read_byte()?;
            let low = self.read_byte()?;
            units.push(u16::from(high) << 8 | u16::from(low));
        }
        Ok(units)
    }

    pub fn read_text(&mut self) -> Result<String> {
        let units = self.read_chars()?;
        String::from_utf16(&units)
            .map_err(|_| VaultError::CorruptedData("Invalid UTF-16 text".to_string()))
    }
}
