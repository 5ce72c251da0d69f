//! Unsigned base-128 varints (multiformats `unsigned-varint`)
//!
//! Seven payload bits per byte, least significant group first, high bit set on
//! every byte except the last.

use crate::cursor::ByteCursor;
use crate::error::{DecodeError, Result};

/// Longest encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Read one varint from the cursor
///
/// Fails with [`DecodeError::MalformedVarint`] if the value would not fit in 64
/// bits, and with [`DecodeError::TruncatedInput`] if the buffer ends before the
/// terminating byte.
pub fn read_uvarint(cursor: &mut ByteCursor<'_>) -> Result<u64> {
    let start = cursor.position();
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    loop {
        let byte = cursor.read_u8()?;
        let group = u64::from(byte & 0x7f);

        // the tenth byte may only contribute the single remaining bit
        if shift > 63 || (shift == 63 && group > 1) {
            return Err(DecodeError::MalformedVarint { offset: start });
        }

        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Decode a varint from the front of `bytes`, returning the value and its length
pub fn decode(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut cursor = ByteCursor::new(bytes);
    let value = read_uvarint(&mut cursor)?;
    Ok((value, cursor.position()))
}

/// Append the varint encoding of `value` to `out`
pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Varint encoding of `value` as a new buffer
pub fn to_vec(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(value));
    encode(value, &mut out);
    out
}

/// Number of bytes `value` occupies once encoded
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encodings() {
        assert_eq!(to_vec(0), vec![0x00]);
        assert_eq!(to_vec(1), vec![0x01]);
        assert_eq!(to_vec(127), vec![0x7f]);
        assert_eq!(to_vec(128), vec![0x80, 0x01]);
        assert_eq!(to_vec(300), vec![0xac, 0x02]);
        assert_eq!(to_vec(16384), vec![0x80, 0x80, 0x01]);
    }

    #[test]
    fn roundtrip_boundaries() {
        let values = [
            0u64,
            1,
            0x7f,
            0x80,
            0x3fff,
            0x4000,
            u32::MAX as u64,
            (1 << 56) - 1,
            1 << 56,
            (1 << 63) - 1,
            u64::MAX,
        ];
        for value in values {
            let bytes = to_vec(value);
            assert_eq!(bytes.len(), encoded_len(value), "length of {value}");
            assert_eq!(decode(&bytes).unwrap(), (value, bytes.len()), "value {value}");
        }
    }

    #[test]
    fn roundtrip_powers_of_two() {
        for shift in 0..63 {
            let value = 1u64 << shift;
            for n in [value - 1, value, value + 1] {
                assert_eq!(decode(&to_vec(n)).unwrap().0, n);
            }
        }
    }

    #[test]
    fn stops_at_terminator() {
        let mut cursor = ByteCursor::new(&[0xac, 0x02, 0xff]);
        assert_eq!(read_uvarint(&mut cursor).unwrap(), 300);
        assert_eq!(cursor.position(), 2);
    }

    #[test]
    fn truncated() {
        let err = decode(&[0x80, 0x80]).unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedInput { offset: 2, .. }));
        assert!(matches!(
            decode(&[]).unwrap_err(),
            DecodeError::TruncatedInput { offset: 0, .. }
        ));
    }

    #[test]
    fn overflow() {
        let too_long = [0xff; 11];
        assert_eq!(
            decode(&too_long).unwrap_err(),
            DecodeError::MalformedVarint { offset: 0 }
        );

        // ten bytes, but the last one carries more than the final bit
        let mut wide = vec![0xff; 9];
        wide.push(0x02);
        assert_eq!(
            decode(&wide).unwrap_err(),
            DecodeError::MalformedVarint { offset: 0 }
        );
    }
}
