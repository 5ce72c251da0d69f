//! The two text encodings CIDs travel in: RFC 4648 base32 (lowercase, no
//! padding) and base58 with the bitcoin alphabet.

use crate::error::{DecodeError, Result};

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Encode bytes as lowercase unpadded base32
pub fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Decode unpadded base32; uppercase input is accepted
pub fn base32_decode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for (position, character) in text.chars().enumerate() {
        let value = match character {
            'a'..='z' => character as u32 - 'a' as u32,
            'A'..='Z' => character as u32 - 'A' as u32,
            '2'..='7' => character as u32 - '2' as u32 + 26,
            _ => {
                return Err(DecodeError::InvalidBaseEncoding {
                    base: "base32",
                    character,
                    position,
                });
            }
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
        buffer &= (1 << bits) - 1;
    }
    Ok(out)
}

/// Encode bytes as base58btc; each leading zero byte becomes a leading `'1'`
pub fn base58_encode(data: &[u8]) -> String {
    let zeros = data.iter().take_while(|&&b| b == 0).count();

    // base58 digits, least significant first
    let mut digits: Vec<u8> = Vec::with_capacity(data.len() * 138 / 100 + 1);
    for &byte in &data[zeros..] {
        let mut carry = u32::from(byte);
        for digit in digits.iter_mut() {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat_n('1', zeros));
    out.extend(
        digits
            .iter()
            .rev()
            .map(|&digit| BASE58_ALPHABET[digit as usize] as char),
    );
    out
}

/// Decode base58btc; each leading `'1'` becomes a leading zero byte
pub fn base58_decode(text: &str) -> Result<Vec<u8>> {
    let zeros = text.bytes().take_while(|&c| c == b'1').count();

    // base256 digits, least significant first
    let mut bytes: Vec<u8> = Vec::with_capacity(text.len() * 733 / 1000 + 1);
    for (position, character) in text.chars().enumerate().skip(zeros) {
        let value = base58_value(character).ok_or(DecodeError::InvalidBaseEncoding {
            base: "base58btc",
            character,
            position,
        })?;
        let mut carry = u32::from(value);
        for byte in bytes.iter_mut() {
            carry += u32::from(*byte) * 58;
            *byte = (carry & 0xff) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xff) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

fn base58_value(character: char) -> Option<u8> {
    if !character.is_ascii() {
        return None;
    }
    BASE58_ALPHABET
        .iter()
        .position(|&c| c == character as u8)
        .map(|index| index as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base32_rfc4648_vectors() {
        let vectors = [
            ("", ""),
            ("f", "my"),
            ("fo", "mzxq"),
            ("foo", "mzxw6"),
            ("foob", "mzxw6yq"),
            ("fooba", "mzxw6ytb"),
            ("foobar", "mzxw6ytboi"),
        ];
        for (plain, encoded) in vectors {
            assert_eq!(base32_encode(plain.as_bytes()), encoded);
            assert_eq!(base32_decode(encoded).unwrap(), plain.as_bytes());
        }
        assert_eq!(base32_decode("MZXW6YTBOI").unwrap(), b"foobar");
    }

    #[test]
    fn base32_rejects_padding_and_junk() {
        assert!(matches!(
            base32_decode("mzxw6===").unwrap_err(),
            DecodeError::InvalidBaseEncoding {
                character: '=',
                position: 5,
                ..
            }
        ));
        assert!(base32_decode("mz1").is_err());
    }

    #[test]
    fn base58_vectors() {
        assert_eq!(base58_encode(b""), "");
        assert_eq!(base58_encode(b"hello world"), "StV1DL6CwTryKyV");
        assert_eq!(base58_encode(&[0, 0, 0x28, 0x7f, 0xb4, 0xcd]), "11233QC4");
        assert_eq!(base58_decode("StV1DL6CwTryKyV").unwrap(), b"hello world");
        assert_eq!(
            base58_decode("11233QC4").unwrap(),
            vec![0, 0, 0x28, 0x7f, 0xb4, 0xcd]
        );
    }

    #[test]
    fn base58_leading_zeros_only() {
        assert_eq!(base58_encode(&[0, 0, 0]), "111");
        assert_eq!(base58_decode("111").unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn base58_rejects_ambiguous_characters() {
        for bad in ["0abc", "Oabc", "Iabc", "labc"] {
            assert!(matches!(
                base58_decode(bad).unwrap_err(),
                DecodeError::InvalidBaseEncoding { position: 0, .. }
            ));
        }
    }
}
