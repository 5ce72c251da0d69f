//! CAR (Content Addressable aRchive) block reading
//!
//! A CAR is a varint-length-prefixed header followed by varint-length-prefixed
//! blocks, each block being `CID bytes ++ content bytes`. The CID length is not
//! stored, so it is recovered by decoding the CID from the front of the block.

use std::collections::BTreeMap;

use bytes::Bytes;
use shuttle_common::{ByteCursor, Cid, Value, cbor, varint};

use crate::error::{RepoError, Result};

/// One block from a CAR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarBlock {
    /// Content identifier of the block
    pub cid: Cid,
    /// Raw block content (zero-copy slice of the archive)
    pub data: Bytes,
}

/// Parsed CAR header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarHeader {
    /// Format version (1 for every archive the protocol emits)
    pub version: u64,
    /// Root CIDs, in header order
    pub roots: Vec<Cid>,
}

/// Reader over an in-memory CAR
///
/// Construction only locates the end of the header. Each call to
/// [`CarReader::blocks`] starts a fresh pass over the block section.
#[derive(Debug, Clone)]
pub struct CarReader {
    data: Bytes,
    header_start: usize,
    body_start: usize,
}

impl CarReader {
    /// Locate the header and block section of `data`
    pub fn new(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let mut cursor = ByteCursor::new(&data);
        let header_len = varint::read_uvarint(&mut cursor)
            .map_err(|e| RepoError::decode(e).with_context("CAR header length"))?;
        let header_start = cursor.position();
        let header_len = usize::try_from(header_len)
            .map_err(|_| RepoError::car(format!("header length {} overflows", header_len)))?;
        cursor
            .skip(header_len)
            .map_err(|e| RepoError::decode(e).with_context("CAR header"))?;

        Ok(Self {
            body_start: cursor.position(),
            header_start,
            data,
        })
    }

    /// Parse the header map (`version`, `roots`)
    pub fn header(&self) -> Result<CarHeader> {
        let raw = &self.data[self.header_start..self.body_start];
        let value = cbor::decode(raw).map_err(|e| RepoError::decode(e).with_context("CAR header"))?;

        let version = value
            .get("version")
            .and_then(Value::as_i64)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| RepoError::car("CAR header has no integer 'version'"))?;

        let roots = match value.get("roots") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_link()
                        .cloned()
                        .ok_or_else(|| RepoError::car("CAR header root is not a link"))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(RepoError::car(format!(
                    "CAR header 'roots' is a {}, expected array",
                    other.kind()
                )));
            }
        };

        Ok(CarHeader { version, roots })
    }

    /// First root CID from the header
    pub fn root(&self) -> Result<Cid> {
        self.header()?
            .roots
            .into_iter()
            .next()
            .ok_or_else(|| RepoError::car("CAR file has no roots"))
    }

    /// Iterate over the blocks, starting from the first one
    pub fn blocks(&self) -> CarBlocks {
        CarBlocks {
            data: self.data.clone(),
            pos: self.body_start,
            done: false,
        }
    }

    /// Collect every decodable block into a map keyed by CID text
    pub fn block_map(&self) -> BTreeMap<String, Bytes> {
        let mut blocks = BTreeMap::new();
        for (index, block) in self.blocks().enumerate() {
            match block {
                Ok(block) => {
                    blocks.insert(block.cid.to_string(), block.data);
                }
                Err(error) => {
                    tracing::warn!(block = index, %error, "skipping undecodable CAR block");
                }
            }
        }
        blocks
    }
}

/// Iterator over the blocks of a [`CarReader`]
///
/// A zero-length block or the end of the buffer ends the sequence. A block
/// whose CID fails to decode yields an error and the iterator moves on to the
/// next block; a broken length prefix yields one error and ends the sequence.
#[derive(Debug, Clone)]
pub struct CarBlocks {
    data: Bytes,
    pos: usize,
    done: bool,
}

impl CarBlocks {
    /// Byte offset of the next length prefix
    pub fn position(&self) -> usize {
        self.pos
    }

    fn next_block(&mut self) -> Option<Result<CarBlock>> {
        let mut cursor = ByteCursor::at(&self.data, self.pos);
        if cursor.is_empty() {
            return None;
        }

        let framing = varint::read_uvarint(&mut cursor)
            .map_err(|e| RepoError::decode(e).with_context(format!("block length at offset {}", self.pos)))
            .and_then(|len| {
                usize::try_from(len)
                    .ok()
                    .filter(|len| *len <= cursor.remaining())
                    .ok_or_else(|| {
                        RepoError::car(format!(
                            "block at offset {} declares {} bytes, {} remain",
                            self.pos,
                            len,
                            cursor.remaining()
                        ))
                    })
            });
        let len = match framing {
            Ok(len) => len,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        if len == 0 {
            return None;
        }

        let start = cursor.position();
        let end = start + len;
        self.pos = end;

        let mut block = ByteCursor::new(&self.data[start..end]);
        match Cid::read_from(&mut block) {
            Ok(cid) => {
                let data = self.data.slice(start + block.position()..end);
                Some(Ok(CarBlock { cid, data }))
            }
            Err(e) => Some(Err(
                RepoError::decode(e).with_context(format!("CID of block at offset {}", start))
            )),
        }
    }
}

impl Iterator for CarBlocks {
    type Item = Result<CarBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.next_block();
        if next.is_none() {
            self.done = true;
        }
        next
    }
}

/// Read a CAR into a map of CID text to block content
///
/// Undecodable blocks are logged and skipped.
pub fn read_block_map(data: impl Into<Bytes>) -> Result<BTreeMap<String, Bytes>> {
    Ok(CarReader::new(data)?.block_map())
}
