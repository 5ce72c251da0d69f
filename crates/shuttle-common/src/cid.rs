//! Content identifiers
//!
//! A CID is a self-describing hash pointer. Two versions are in circulation:
//!
//! - **v0**: a bare sha2-256 multihash, implicitly `dag-pb`, written as base58btc
//!   (`Qm...`)
//! - **v1**: `version ++ codec ++ multihash`, each prefix a varint, written as
//!   multibase text (atproto uses base32, `b...`)
//!
//! The multihash is stored verbatim (`code ++ length ++ digest`) so that binary
//! round-trips are lossless.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cursor::ByteCursor;
use crate::error::{DecodeError, Result};
use crate::{multibase, varint};

/// sha2-256 multihash code, also the first byte of every CIDv0
pub const SHA2_256: u64 = 0x12;

/// dag-pb codec, implied by every CIDv0
pub const DAG_PB_CODEC: u64 = 0x70;

/// DAG-CBOR codec
pub const DAG_CBOR_CODEC: u64 = 0x71;

/// raw bytes codec, used by atproto for blobs
pub const RAW_CODEC: u64 = 0x55;

/// CID version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Version {
    /// Legacy bare multihash
    V0,
    /// Version-prefixed with explicit codec
    V1,
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        match version {
            Version::V0 => 0,
            Version::V1 => 1,
        }
    }
}

/// A decoded content identifier
///
/// Immutable once constructed; equality, ordering and hashing are by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cid {
    version: Version,
    codec: u64,
    multihash: Bytes,
}

impl Cid {
    /// Build a CIDv0 from a sha2-256 multihash
    pub fn new_v0(multihash: impl Into<Bytes>) -> Result<Self> {
        let multihash = multihash.into();
        let (code, _) = split_multihash(&multihash)?;
        if code != SHA2_256 {
            return Err(DecodeError::malformed(0, "CIDv0 requires a sha2-256 multihash"));
        }
        Ok(Self {
            version: Version::V0,
            codec: DAG_PB_CODEC,
            multihash,
        })
    }

    /// Build a CIDv1 from a codec and a multihash
    pub fn new_v1(codec: u64, multihash: impl Into<Bytes>) -> Result<Self> {
        let multihash = multihash.into();
        split_multihash(&multihash)?;
        Ok(Self {
            version: Version::V1,
            codec,
            multihash,
        })
    }

    /// Read one CID from the cursor, leaving it positioned after the CID
    pub fn read_from(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let start = cursor.position();
        let leading = varint::read_uvarint(&mut cursor.clone())?;

        let (version, codec) = match leading {
            SHA2_256 => (Version::V0, DAG_PB_CODEC),
            1 => {
                varint::read_uvarint(cursor)?;
                let codec = varint::read_uvarint(cursor)?;
                (Version::V1, codec)
            }
            other => return Err(DecodeError::UnsupportedCidVersion { version: other }),
        };

        let multihash_start = cursor.position();
        varint::read_uvarint(cursor)?;
        let digest_len = varint::read_uvarint(cursor)?;
        let digest_len = usize::try_from(digest_len)
            .map_err(|_| DecodeError::malformed(start, "multihash digest length overflows"))?;
        cursor.skip(digest_len)?;

        let multihash =
            Bytes::copy_from_slice(&cursor.buffer()[multihash_start..cursor.position()]);
        Ok(Self {
            version,
            codec,
            multihash,
        })
    }

    /// Decode a CID occupying all of `bytes`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = ByteCursor::new(bytes);
        let cid = Self::read_from(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(DecodeError::malformed(
                cursor.position(),
                "trailing bytes after CID",
            ));
        }
        Ok(cid)
    }

    /// Binary form: the bare multihash for v0, `1 ++ codec ++ multihash` for v1
    pub fn to_bytes(&self) -> Vec<u8> {
        match self.version {
            Version::V0 => self.multihash.to_vec(),
            Version::V1 => {
                let mut out = Vec::with_capacity(
                    1 + varint::encoded_len(self.codec) + self.multihash.len(),
                );
                varint::encode(1, &mut out);
                varint::encode(self.codec, &mut out);
                out.extend_from_slice(&self.multihash);
                out
            }
        }
    }

    /// Number of bytes [`Cid::to_bytes`] produces
    pub fn encoded_len(&self) -> usize {
        match self.version {
            Version::V0 => self.multihash.len(),
            Version::V1 => 1 + varint::encoded_len(self.codec) + self.multihash.len(),
        }
    }

    /// CID version
    pub fn version(&self) -> Version {
        self.version
    }

    /// Content codec (always dag-pb for v0)
    pub fn codec(&self) -> u64 {
        self.codec
    }

    /// The full multihash: `code ++ length ++ digest`
    pub fn multihash(&self) -> &[u8] {
        &self.multihash
    }

    /// Hash function code from the multihash
    pub fn hash_code(&self) -> u64 {
        // validated at construction
        split_multihash(&self.multihash)
            .map(|(code, _)| code)
            .unwrap_or_default()
    }

    /// The raw digest bytes
    pub fn digest(&self) -> &[u8] {
        split_multihash(&self.multihash)
            .map(|(_, digest)| digest)
            .unwrap_or_default()
    }
}

/// Split a multihash into its function code and digest, checking the length
fn split_multihash(multihash: &[u8]) -> Result<(u64, &[u8])> {
    let mut cursor = ByteCursor::new(multihash);
    let code = varint::read_uvarint(&mut cursor)?;
    let len = varint::read_uvarint(&mut cursor)?;
    if len != cursor.remaining() as u64 {
        return Err(DecodeError::malformed(
            cursor.position(),
            "multihash length does not match digest",
        ));
    }
    Ok((code, cursor.rest()))
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Version::V0 => f.write_str(&multibase::base58_encode(&self.multihash)),
            Version::V1 => {
                f.write_str("b")?;
                f.write_str(&multibase::base32_encode(&self.to_bytes()))
            }
        }
    }
}

impl FromStr for Cid {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self> {
        let mut chars = s.chars();
        match chars.next() {
            // bare base58btc CIDv0; a leading '1' is a leading zero byte
            Some('Q') | Some('1') => Cid::from_bytes(&multibase::base58_decode(s)?),
            Some('b') => Cid::from_bytes(&multibase::base32_decode(chars.as_str())?),
            Some('z') => Cid::from_bytes(&multibase::base58_decode(chars.as_str())?),
            Some(prefix) => Err(DecodeError::UnsupportedMultibase { prefix }),
            None => Err(DecodeError::malformed(0, "empty CID string")),
        }
    }
}

impl TryFrom<&[u8]> for Cid {
    type Error = DecodeError;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Cid::from_bytes(bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CID: &str = "bafyreih4g7bvo6hdq2juolev5bfzpbo4ewkxh5mzxwgvkjp3kitc6hqkha";
    const TEST_CID_V0: &str = "QmdfTbBqBPQ7VNxZEYEj14VmRuZBkqFbiwReogJgS1zR1n";

    #[test]
    fn parse_v1_base32() {
        let cid: Cid = TEST_CID.parse().unwrap();
        assert_eq!(cid.version(), Version::V1);
        assert_eq!(cid.codec(), DAG_CBOR_CODEC);
        assert_eq!(cid.hash_code(), SHA2_256);
        assert_eq!(cid.digest().len(), 32);
        assert_eq!(cid.to_string(), TEST_CID);
    }

    #[test]
    fn parse_v0_base58() {
        let cid: Cid = TEST_CID_V0.parse().unwrap();
        assert_eq!(cid.version(), Version::V0);
        assert_eq!(cid.codec(), DAG_PB_CODEC);
        assert_eq!(cid.multihash().len(), 34);
        assert_eq!(cid.to_bytes(), cid.multihash());
        assert_eq!(cid.to_string(), TEST_CID_V0);
    }

    #[test]
    fn binary_roundtrip_both_versions() {
        for text in [TEST_CID, TEST_CID_V0] {
            let cid: Cid = text.parse().unwrap();
            let bytes = cid.to_bytes();
            assert_eq!(bytes.len(), cid.encoded_len());
            assert_eq!(Cid::from_bytes(&bytes).unwrap(), cid);
        }
    }

    #[test]
    fn base58_v1_is_accepted() {
        let cid: Cid = TEST_CID.parse().unwrap();
        let z = format!("z{}", multibase::base58_encode(&cid.to_bytes()));
        assert_eq!(z.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn read_from_stops_after_cid() {
        let cid: Cid = TEST_CID.parse().unwrap();
        let mut bytes = cid.to_bytes();
        bytes.extend_from_slice(b"block body");

        let mut cursor = ByteCursor::new(&bytes);
        assert_eq!(Cid::read_from(&mut cursor).unwrap(), cid);
        assert_eq!(cursor.rest(), b"block body");

        assert!(matches!(
            Cid::from_bytes(&bytes).unwrap_err(),
            DecodeError::MalformedEncoding { .. }
        ));
    }

    #[test]
    fn unsupported_version() {
        assert_eq!(
            Cid::from_bytes(&[0x02, 0x71, 0x12, 0x00]).unwrap_err(),
            DecodeError::UnsupportedCidVersion { version: 2 }
        );
    }

    #[test]
    fn truncated_digest() {
        let cid: Cid = TEST_CID.parse().unwrap();
        let bytes = cid.to_bytes();
        assert!(matches!(
            Cid::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err(),
            DecodeError::TruncatedInput { .. }
        ));
    }

    #[test]
    fn unknown_multibase() {
        assert_eq!(
            "mAXESIA".parse::<Cid>().unwrap_err(),
            DecodeError::UnsupportedMultibase { prefix: 'm' }
        );
        assert!("".parse::<Cid>().is_err());
    }

    #[test]
    fn v0_requires_sha256() {
        assert!(Cid::new_v0(vec![0x13, 0x01, 0xff]).is_err());
        assert!(Cid::new_v1(RAW_CODEC, vec![0x12, 0x02, 0xff]).is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let cid: Cid = TEST_CID.parse().unwrap();
        let json = serde_json::to_string(&cid).unwrap();
        assert_eq!(json, format!("\"{}\"", TEST_CID));
        let back: Cid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cid);
    }
}
