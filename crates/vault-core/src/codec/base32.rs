//! RFC 4648 Base32 encoding for TOTP keys

use crate::error::{Result, VaultError};

const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
const PAD: u8 = b'=';

/// Encode bytes as Base32 with `=` padding
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() + 4) / 5 * 8);

    for chunk in data.chunks(5) {
        let mut block = [0u8; 5];
        block[..chunk.len()].copy_from_slice(chunk);

        // 5 bytes become 8 groups of 5 bits
        let bits = u64::from(block[0]) << 32
            | u64::from(block[1]) << 24
            | u64::from(block[2]) << 16
            | u64::from(block[3]) << 8
            | u64::from(block[4]);

        // Number of output symbols carrying real data for this chunk length
        let symbols = match chunk.len() {
            1 => 2,
            2 => 4,
            3 => 5,
            4 => 7,
            _ => 8,
        };

        for i in 0..8 {
            if i < symbols {
                let idx = ((bits >> (35 - 5 * i)) & 0x1f) as usize;
                out.push(ALPHABET[idx] as char);
            } else {
                out.push(PAD as char);
            }
        }
    }

    out
}

/// Decode a Base32 string, case-insensitively. Trailing `=` padding is
/// allowed; any other character outside the alphabet is rejected.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim_end_matches(PAD as char);
    if trimmed.contains(PAD as char) {
        return Err(VaultError::InvalidArgument(
            "Base32 padding may only appear at the end".to_string(),
        ));
    }

    let mut out = Vec::with_capacity(trimmed.len() * 5 / 8);
    let mut acc: u64 = 0;
    let mut acc_bits: u32 = 0;

    for ch in trimmed.chars() {
        let value = symbol_value(ch).ok_or_else(|| {
            VaultError::InvalidArgument(format!("Invalid Base32 character: {:?}", ch))
        })?;
        acc = acc << 5 | u64::from(value);
        acc_bits += 5;
        if acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
        }
    }

    Ok(out)
}

fn symbol_value(ch: char) -> Option<u8> {
    match ch {
        'A'..='Z' => Some(ch as u8 - b'A'),
        'a'..='z' => Some(ch as u8 - b'a'),
        '2'..='7' => Some(ch as u8 - b'2' + 26),
        _ => None,
    }
}
