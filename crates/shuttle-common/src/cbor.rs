//! DAG-CBOR decoding
//!
//! A single-pass recursive descent decoder for definite-length CBOR, with tag 42
//! decoded as a [`Cid`] link. Every structural problem, including running off
//! the end of the buffer, is reported as [`DecodeError::MalformedEncoding`] with
//! the offset of the item being decoded.

use std::collections::BTreeMap;

use bytes::Bytes;
use smol_str::SmolStr;

use crate::cid::Cid;
use crate::cursor::ByteCursor;
use crate::error::{DecodeError, Result};
use crate::value::{MapKey, Value};

/// CBOR tag for IPLD links
pub const CID_TAG: u64 = 42;

/// Nesting limit for arrays, maps and tags
pub const MAX_DEPTH: usize = 256;

const MAJOR_UNSIGNED: u8 = 0;
const MAJOR_NEGATIVE: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_TAG: u8 = 6;
const MAJOR_SIMPLE: u8 = 7;

/// Decode a buffer holding exactly one item
pub fn decode(bytes: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(DecodeError::malformed(consumed, "trailing bytes after item"));
    }
    Ok(value)
}

/// Decode the first item in `bytes`, returning it with the number of bytes it used
///
/// Used where items are simply concatenated, like the header and payload of a
/// firehose frame.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Value, usize)> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode_value()?;
    Ok((value, decoder.position()))
}

/// Streaming decoder over a byte buffer
#[derive(Debug, Clone)]
pub struct Decoder<'a> {
    cursor: ByteCursor<'a>,
    depth: usize,
}

impl<'a> Decoder<'a> {
    /// Start decoding at the beginning of `bytes`
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: ByteCursor::new(bytes),
            depth: 0,
        }
    }

    /// Offset of the next unread byte
    pub fn position(&self) -> usize {
        self.cursor.position()
    }

    /// Whether every byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.cursor.is_empty()
    }

    /// Decode the next item
    pub fn decode_value(&mut self) -> Result<Value> {
        let offset = self.cursor.position();
        let initial = self
            .cursor
            .read_u8()
            .map_err(|e| e.into_malformed(offset))?;
        let major = initial >> 5;
        let info = initial & 0x1f;

        match major {
            MAJOR_UNSIGNED => Ok(Value::Integer(i128::from(self.argument(info, offset)?))),
            MAJOR_NEGATIVE => Ok(Value::Integer(-1 - i128::from(self.argument(info, offset)?))),
            MAJOR_BYTES => {
                let bytes = self.payload(info, offset)?;
                Ok(Value::Bytes(Bytes::copy_from_slice(bytes)))
            }
            MAJOR_TEXT => {
                let bytes = self.payload(info, offset)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| DecodeError::malformed(offset, "text string is not valid UTF-8"))?;
                Ok(Value::String(SmolStr::new(text)))
            }
            MAJOR_ARRAY => {
                let len = self.container_len(info, offset)?;
                self.descend(offset)?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(self.decode_value()?);
                }
                self.depth -= 1;
                Ok(Value::Array(items))
            }
            MAJOR_MAP => {
                // each entry needs at least a key byte and a value byte
                let len = self.container_len(info, offset)?;
                if len > self.cursor.remaining() / 2 {
                    return Err(DecodeError::malformed(
                        offset,
                        "map length exceeds remaining input",
                    ));
                }
                self.descend(offset)?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = self.decode_key()?;
                    let value = self.decode_value()?;
                    map.insert(key, value);
                }
                self.depth -= 1;
                Ok(Value::Map(map))
            }
            MAJOR_TAG => {
                let tag = self.argument(info, offset)?;
                self.descend(offset)?;
                let inner = self.decode_value()?;
                self.depth -= 1;
                if tag == CID_TAG {
                    decode_link(inner, offset)
                } else {
                    Ok(inner)
                }
            }
            MAJOR_SIMPLE => self.decode_simple(info, offset),
            _ => unreachable!("major type is three bits"),
        }
    }

    fn decode_key(&mut self) -> Result<MapKey> {
        let offset = self.cursor.position();
        match self.decode_value()? {
            Value::String(s) => Ok(MapKey::String(s)),
            Value::Integer(i) => Ok(MapKey::Integer(i)),
            other => Err(DecodeError::InvalidMapKey {
                offset,
                found: other.kind(),
            }),
        }
    }

    fn decode_simple(&mut self, info: u8, offset: usize) -> Result<Value> {
        match info {
            20 => Ok(Value::Bool(false)),
            21 => Ok(Value::Bool(true)),
            22 | 23 => Ok(Value::Null),
            25 => {
                let bits = u16::from_be_bytes(self.read_array(offset)?);
                Ok(Value::Float(half_to_f64(bits)))
            }
            26 => {
                let bits = u32::from_be_bytes(self.read_array(offset)?);
                Ok(Value::Float(f64::from(f32::from_bits(bits))))
            }
            27 => {
                let bits = u64::from_be_bytes(self.read_array(offset)?);
                Ok(Value::Float(f64::from_bits(bits)))
            }
            31 => Err(DecodeError::malformed(offset, "unexpected break marker")),
            _ => Err(DecodeError::malformed(
                offset,
                smol_str::format_smolstr!("unsupported simple value {}", info),
            )),
        }
    }

    /// Read the length/value argument that follows an initial byte
    fn argument(&mut self, info: u8, offset: usize) -> Result<u64> {
        match info {
            0..=23 => Ok(u64::from(info)),
            24 => Ok(u64::from(self.read_array::<1>(offset)?[0])),
            25 => Ok(u64::from(u16::from_be_bytes(self.read_array(offset)?))),
            26 => Ok(u64::from(u32::from_be_bytes(self.read_array(offset)?))),
            27 => Ok(u64::from_be_bytes(self.read_array(offset)?)),
            31 => Err(DecodeError::malformed(
                offset,
                "indefinite-length items are not supported",
            )),
            _ => Err(DecodeError::malformed(
                offset,
                smol_str::format_smolstr!("reserved additional info {}", info),
            )),
        }
    }

    /// Body of a byte or text string
    fn payload(&mut self, info: u8, offset: usize) -> Result<&'a [u8]> {
        let len = self.argument(info, offset)?;
        let len = usize::try_from(len)
            .ok()
            .filter(|&len| len <= self.cursor.remaining())
            .ok_or_else(|| DecodeError::malformed(offset, "string length exceeds remaining input"))?;
        self.cursor
            .read_bytes(len)
            .map_err(|e| e.into_malformed(offset))
    }

    fn container_len(&mut self, info: u8, offset: usize) -> Result<usize> {
        let len = self.argument(info, offset)?;
        // every element takes at least one byte
        usize::try_from(len)
            .ok()
            .filter(|&len| len <= self.cursor.remaining())
            .ok_or_else(|| {
                DecodeError::malformed(offset, "container length exceeds remaining input")
            })
    }

    fn read_array<const N: usize>(&mut self, offset: usize) -> Result<[u8; N]> {
        self.cursor
            .read_array()
            .map_err(|e| e.into_malformed(offset))
    }

    fn descend(&mut self, offset: usize) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(DecodeError::malformed(offset, "nesting too deep"));
        }
        self.depth += 1;
        Ok(())
    }
}

/// Tag 42: a byte string holding a multibase identity prefix (0x00) and a binary CID
fn decode_link(inner: Value, offset: usize) -> Result<Value> {
    let Value::Bytes(bytes) = inner else {
        return Err(DecodeError::malformed(
            offset,
            "tag 42 must wrap a byte string",
        ));
    };
    match bytes.split_first() {
        Some((0x00, cid)) => Cid::from_bytes(cid).map(Value::Link).map_err(|e| {
            DecodeError::malformed(offset, smol_str::format_smolstr!("invalid link: {e}"))
        }),
        _ => Err(DecodeError::malformed(
            offset,
            "tag 42 byte string must start with 0x00",
        )),
    }
}

/// Expand an IEEE 754 half-precision float
pub fn half_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = i32::from((bits >> 10) & 0x1f);
    let mantissa = f64::from(bits & 0x03ff);

    let magnitude = match exponent {
        0 => mantissa * 2f64.powi(-24),
        0x1f if mantissa == 0.0 => f64::INFINITY,
        0x1f => f64::NAN,
        _ => (1.0 + mantissa / 1024.0) * 2f64.powi(exponent - 15),
    };
    sign * magnitude
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn unsigned_boundaries() {
        let vectors = [
            ("00", 0i128),
            ("17", 23),
            ("1818", 24),
            ("18ff", 255),
            ("190100", 256),
            ("1a000f4240", 1_000_000),
            ("1b000000e8d4a51000", 1_000_000_000_000),
            ("1bffffffffffffffff", u64::MAX as i128),
        ];
        for (input, expected) in vectors {
            assert_eq!(decode(&hex(input)).unwrap(), Value::Integer(expected), "{input}");
        }
    }

    #[test]
    fn negative_integers() {
        assert_eq!(decode(&hex("20")).unwrap(), Value::Integer(-1));
        assert_eq!(decode(&hex("29")).unwrap(), Value::Integer(-10));
        assert_eq!(decode(&hex("3863")).unwrap(), Value::Integer(-100));
        assert_eq!(decode(&hex("3903e7")).unwrap(), Value::Integer(-1000));
        assert_eq!(
            decode(&hex("3bffffffffffffffff")).unwrap(),
            Value::Integer(-(1i128 << 64))
        );
    }

    #[test]
    fn strings() {
        assert_eq!(decode(&hex("40")).unwrap(), Value::Bytes(Bytes::new()));
        assert_eq!(
            decode(&hex("4401020304")).unwrap(),
            Value::Bytes(Bytes::from_static(&[1, 2, 3, 4]))
        );
        assert_eq!(decode(&hex("60")).unwrap(), Value::String("".into()));
        assert_eq!(decode(&hex("6161")).unwrap(), Value::String("a".into()));
        assert_eq!(decode(&hex("6449455446")).unwrap(), Value::String("IETF".into()));
        assert_eq!(decode(&hex("62c3bc")).unwrap(), Value::String("\u{fc}".into()));
    }

    #[test]
    fn simple_values() {
        assert_eq!(decode(&hex("f4")).unwrap(), Value::Bool(false));
        assert_eq!(decode(&hex("f5")).unwrap(), Value::Bool(true));
        assert_eq!(decode(&hex("f6")).unwrap(), Value::Null);
        assert_eq!(decode(&hex("f7")).unwrap(), Value::Null);
    }

    #[test]
    fn floats() {
        assert_eq!(decode(&hex("f90000")).unwrap(), Value::Float(0.0));
        assert_eq!(decode(&hex("f93c00")).unwrap(), Value::Float(1.0));
        assert_eq!(decode(&hex("f93e00")).unwrap(), Value::Float(1.5));
        assert_eq!(decode(&hex("f97bff")).unwrap(), Value::Float(65504.0));
        assert_eq!(decode(&hex("f90001")).unwrap(), Value::Float(2f64.powi(-24)));
        assert_eq!(decode(&hex("f90400")).unwrap(), Value::Float(2f64.powi(-14)));
        assert_eq!(decode(&hex("f9c400")).unwrap(), Value::Float(-4.0));
        assert_eq!(decode(&hex("f97c00")).unwrap(), Value::Float(f64::INFINITY));
        assert_eq!(decode(&hex("f9fc00")).unwrap(), Value::Float(f64::NEG_INFINITY));
        assert!(decode(&hex("f97e00")).unwrap().as_f64().unwrap().is_nan());
        assert_eq!(decode(&hex("fa47c35000")).unwrap(), Value::Float(100000.0));
        assert_eq!(decode(&hex("fb3ff199999999999a")).unwrap(), Value::Float(1.1));
        assert_eq!(
            decode(&hex("fbc010666666666666")).unwrap(),
            Value::Float(-4.1)
        );
    }

    #[test]
    fn arrays_and_maps() {
        assert_eq!(decode(&hex("80")).unwrap(), Value::Array(vec![]));
        assert_eq!(
            decode(&hex("83010203")).unwrap(),
            Value::Array(vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)])
        );
        assert_eq!(decode(&hex("a0")).unwrap(), Value::Map(BTreeMap::new()));

        // {1: 2, 3: 4}
        let map = decode(&hex("a201020304")).unwrap();
        let map = map.as_map().unwrap();
        assert_eq!(map.get(&MapKey::Integer(1)), Some(&Value::Integer(2)));
        assert_eq!(map.get(&MapKey::Integer(3)), Some(&Value::Integer(4)));

        // {"a": 1, "b": [2, 3]}
        let nested = decode(&hex("a26161016162820203")).unwrap();
        assert_eq!(nested.get("a"), Some(&Value::Integer(1)));
        assert_eq!(
            nested.get("b"),
            Some(&Value::Array(vec![Value::Integer(2), Value::Integer(3)]))
        );
    }

    #[test]
    fn non_link_tags_are_unwrapped() {
        // 1(1363896240)
        assert_eq!(
            decode(&hex("c11a514b67b0")).unwrap(),
            Value::Integer(1363896240)
        );
    }

    #[test]
    fn tag_42_link() {
        let cid: Cid = "bafyreih4g7bvo6hdq2juolev5bfzpbo4ewkxh5mzxwgvkjp3kitc6hqkha"
            .parse()
            .unwrap();
        let cid_bytes = cid.to_bytes();

        let mut input = vec![0xd8, 0x2a, 0x58, (cid_bytes.len() + 1) as u8, 0x00];
        input.extend_from_slice(&cid_bytes);
        assert_eq!(decode(&input).unwrap(), Value::Link(cid));

        // missing identity prefix
        let mut bad = vec![0xd8, 0x2a, 0x58, cid_bytes.len() as u8];
        bad.extend_from_slice(&cid_bytes);
        assert!(matches!(
            decode(&bad).unwrap_err(),
            DecodeError::MalformedEncoding { offset: 0, .. }
        ));

        // wrapping something other than bytes
        assert!(matches!(
            decode(&hex("d82a6161")).unwrap_err(),
            DecodeError::MalformedEncoding { offset: 0, .. }
        ));
    }

    #[test]
    fn bad_link_reports_tag_offset() {
        // CID cut off after version and codec
        let err = decode(&[0xd8, 0x2a, 0x43, 0x00, 0x01, 0x71]).unwrap_err();
        assert!(
            matches!(err, DecodeError::MalformedEncoding { offset: 0, .. }),
            "{err:?}"
        );

        // version 2, nested one item deep
        let err = decode(&hex("8201d82a420002")).unwrap_err();
        assert!(
            matches!(err, DecodeError::MalformedEncoding { offset: 2, .. }),
            "{err:?}"
        );

        // multihash length runs past the digest
        let err = decode(&hex("d82a4600017112200a")).unwrap_err();
        assert!(
            matches!(err, DecodeError::MalformedEncoding { offset: 0, .. }),
            "{err:?}"
        );
    }

    #[test]
    fn truncation_reports_item_offset() {
        // array of two, second item is a truncated u16
        let err = decode(&hex("82011901")).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedEncoding { offset: 2, .. }));

        // byte string claims more than is there
        let err = decode(&hex("8144010203")).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedEncoding { offset: 1, .. }));

        assert!(matches!(
            decode(&[]).unwrap_err(),
            DecodeError::MalformedEncoding { offset: 0, .. }
        ));

        // container declares more items than bytes remain
        assert!(matches!(
            decode(&hex("9bffffffffffffffff")).unwrap_err(),
            DecodeError::MalformedEncoding { offset: 0, .. }
        ));
    }

    #[test]
    fn unsupported_encodings() {
        for input in ["9f01ff", "5f4101ff", "1c", "f818", "ff", "f0"] {
            assert!(
                matches!(decode(&hex(input)).unwrap_err(), DecodeError::MalformedEncoding { .. }),
                "{input}"
            );
        }
    }

    #[test]
    fn invalid_map_key() {
        // {[]: 1}
        assert_eq!(
            decode(&hex("a18001")).unwrap_err(),
            DecodeError::InvalidMapKey {
                offset: 1,
                found: "array"
            }
        );
    }

    #[test]
    fn invalid_utf8() {
        assert!(matches!(
            decode(&hex("62c328")).unwrap_err(),
            DecodeError::MalformedEncoding { offset: 0, .. }
        ));
    }

    #[test]
    fn trailing_bytes_and_prefix_decoding() {
        assert!(matches!(
            decode(&hex("0102")).unwrap_err(),
            DecodeError::MalformedEncoding { offset: 1, .. }
        ));
        let (value, used) = decode_prefix(&hex("a0f5")).unwrap();
        assert_eq!(value, Value::Map(BTreeMap::new()));
        assert_eq!(used, 1);
    }

    #[test]
    fn depth_limit() {
        let mut input = vec![0x81; MAX_DEPTH + 1];
        input.push(0x00);
        assert!(matches!(
            decode(&input).unwrap_err(),
            DecodeError::MalformedEncoding { .. }
        ));

        let mut ok = vec![0x81; MAX_DEPTH];
        ok.push(0x00);
        assert!(decode(&ok).is_ok());
    }
}
