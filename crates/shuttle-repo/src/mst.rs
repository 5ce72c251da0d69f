//! Merkle Search Tree walking
//!
//! Repository records live in a prefix-compressed MST. Each node is a DAG-CBOR
//! map with an optional left subtree `l` and an ordered entry list `e`; each
//! entry keeps `p` leading bytes of the previous key, appends `k`, and may point
//! at a right subtree `t` and a record `v`.
//!
//! The walker reconstructs full `collection/rkey` keys in tree order and looks
//! up each record in a [`BlockSource`]. Trees from the firehose are frequently
//! partial, so a node whose block is absent ends that branch without error.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use shuttle_common::{Cid, Value, cbor};
use smol_str::SmolStr;

use crate::error::{RepoError, Result};

/// Lookup of raw blocks by CID
pub trait BlockSource {
    /// Raw bytes of the block, if present
    fn get_block(&self, cid: &Cid) -> Option<Bytes>;
}

impl BlockSource for BTreeMap<String, Bytes> {
    fn get_block(&self, cid: &Cid) -> Option<Bytes> {
        self.get(&cid.to_string()).cloned()
    }
}

impl BlockSource for BTreeMap<Cid, Bytes> {
    fn get_block(&self, cid: &Cid) -> Option<Bytes> {
        self.get(cid).cloned()
    }
}

impl<T: BlockSource + ?Sized> BlockSource for &T {
    fn get_block(&self, cid: &Cid) -> Option<Bytes> {
        (**self).get_block(cid)
    }
}

/// Wire-format MST node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    /// Left-most subtree pointer
    pub left: Option<Cid>,
    /// Entries in key order, prefix-compressed
    pub entries: Vec<TreeEntry>,
}

/// Wire-format MST entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    /// Bytes shared with the previous key
    pub prefix_len: usize,
    /// Bytes appended after the shared prefix
    pub key_suffix: Bytes,
    /// Subtree holding keys between this entry and the next
    pub tree: Option<Cid>,
    /// Record pointer
    pub value: Option<Cid>,
}

impl TreeEntry {
    /// Rebuild this entry's full key from the previous one
    pub fn full_key(&self, previous: &[u8]) -> Result<Vec<u8>> {
        if self.prefix_len > previous.len() {
            return Err(RepoError::invalid_mst(format!(
                "prefix length {} exceeds previous key length {}",
                self.prefix_len,
                previous.len()
            )));
        }
        let mut key = Vec::with_capacity(self.prefix_len + self.key_suffix.len());
        key.extend_from_slice(&previous[..self.prefix_len]);
        key.extend_from_slice(&self.key_suffix);
        Ok(key)
    }
}

fn optional_link(node: &Value, field: &str) -> Result<Option<Cid>> {
    match node.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Link(cid)) => Ok(Some(cid.clone())),
        Some(other) => Err(RepoError::invalid_mst(format!(
            "field '{}' is a {}, expected link",
            field,
            other.kind()
        ))),
    }
}

impl TryFrom<&Value> for TreeEntry {
    type Error = RepoError;

    fn try_from(entry: &Value) -> Result<Self> {
        if entry.as_map().is_none() {
            return Err(RepoError::invalid_mst(format!(
                "entry is a {}, expected map",
                entry.kind()
            )));
        }

        let prefix_len = entry
            .get("p")
            .and_then(Value::as_i64)
            .and_then(|p| usize::try_from(p).ok())
            .ok_or_else(|| RepoError::invalid_mst("entry has no non-negative integer 'p'"))?;

        let key_suffix = match entry.get("k") {
            Some(Value::Bytes(bytes)) => bytes.clone(),
            Some(Value::String(s)) => Bytes::copy_from_slice(s.as_bytes()),
            _ => return Err(RepoError::invalid_mst("entry has no byte or text 'k'")),
        };

        Ok(TreeEntry {
            prefix_len,
            key_suffix,
            tree: optional_link(entry, "t")?,
            value: optional_link(entry, "v")?,
        })
    }
}

impl TryFrom<&Value> for NodeData {
    type Error = RepoError;

    fn try_from(node: &Value) -> Result<Self> {
        if node.as_map().is_none() {
            return Err(RepoError::invalid_mst(format!(
                "node is a {}, expected map",
                node.kind()
            )));
        }

        let entries = match node.get("e") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(TreeEntry::try_from)
                .collect::<Result<Vec<_>>>()?,
            Some(other) => {
                return Err(RepoError::invalid_mst(format!(
                    "field 'e' is a {}, expected array",
                    other.kind()
                )));
            }
        };

        Ok(NodeData {
            left: optional_link(node, "l")?,
            entries,
        })
    }
}

impl NodeData {
    /// Decode a node from its DAG-CBOR block
    pub fn from_block(bytes: &[u8]) -> Result<Self> {
        let value = cbor::decode(bytes)?;
        NodeData::try_from(&value)
    }
}

/// A record reached by walking the tree
#[derive(Debug, Clone, PartialEq)]
pub struct MstRecord {
    /// Collection NSID, the part of the key before the first `/`
    pub collection: SmolStr,
    /// Record key, the part after it
    pub rkey: SmolStr,
    /// CID of the record block
    pub cid: Cid,
    /// Decoded record, `None` when its block is not in the source
    pub record: Option<Value>,
}

impl MstRecord {
    /// Full `collection/rkey` path
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.rkey)
    }
}

enum Frame {
    Visit {
        cid: Cid,
        prefix: Vec<u8>,
    },
    Entries {
        entries: std::vec::IntoIter<TreeEntry>,
        last_key: Vec<u8>,
    },
}

/// Depth-first, in-order iterator over the records of an MST
///
/// Errors are yielded per item: a malformed node drops that node's subtree and
/// walking continues with the rest of the tree. A node reached a second time
/// means the links form a cycle; that yields one error and ends the walk.
pub struct MstWalker<S> {
    blocks: S,
    stack: Vec<Frame>,
    visited: HashSet<Cid>,
}

impl<S: BlockSource> MstWalker<S> {
    /// Start a walk at `root`
    pub fn new(root: Cid, blocks: S) -> Self {
        Self {
            blocks,
            stack: vec![Frame::Visit {
                cid: root,
                prefix: Vec::new(),
            }],
            visited: HashSet::new(),
        }
    }

    fn visit(&mut self, cid: &Cid, prefix: Vec<u8>) -> Result<()> {
        if !self.visited.insert(cid.clone()) {
            self.stack.clear();
            return Err(RepoError::invalid_mst(format!(
                "MST node {} is linked more than once",
                cid
            )));
        }
        let Some(block) = self.blocks.get_block(cid) else {
            tracing::trace!(%cid, "MST node not in block source, pruned branch");
            return Ok(());
        };

        let node = NodeData::from_block(&block)
            .map_err(|e| e.with_context(format!("MST node {}", cid)))?;

        let left = node.left;
        self.stack.push(Frame::Entries {
            entries: node.entries.into_iter(),
            last_key: prefix.clone(),
        });
        if let Some(left) = left {
            self.stack.push(Frame::Visit { cid: left, prefix });
        }
        Ok(())
    }

    fn leaf(&self, key: &[u8], cid: Cid) -> Option<Result<MstRecord>> {
        let Ok(key) = std::str::from_utf8(key) else {
            return Some(Err(RepoError::invalid_mst(format!(
                "key {:?} is not UTF-8",
                String::from_utf8_lossy(key)
            ))));
        };
        let Some((collection, rkey)) = key.split_once('/') else {
            tracing::warn!(key, "MST key has no collection separator, skipping");
            return None;
        };

        let record = match self.blocks.get_block(&cid) {
            Some(block) => match cbor::decode(&block) {
                Ok(value) => Some(value),
                Err(e) => {
                    return Some(Err(
                        RepoError::decode(e).with_context(format!("record {}", key))
                    ));
                }
            },
            None => None,
        };

        Some(Ok(MstRecord {
            collection: collection.into(),
            rkey: rkey.into(),
            cid,
            record,
        }))
    }
}

impl<S: BlockSource> Iterator for MstWalker<S> {
    type Item = Result<MstRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Frame::Visit { cid, prefix } => {
                    if let Err(e) = self.visit(&cid, prefix) {
                        return Some(Err(e));
                    }
                }
                Frame::Entries {
                    mut entries,
                    last_key,
                } => {
                    let Some(entry) = entries.next() else {
                        continue;
                    };
                    let key = match entry.full_key(&last_key) {
                        Ok(key) => key,
                        Err(e) => return Some(Err(e)),
                    };

                    self.stack.push(Frame::Entries {
                        entries,
                        last_key: key.clone(),
                    });
                    if let Some(tree) = entry.tree {
                        self.stack.push(Frame::Visit {
                            cid: tree,
                            prefix: key.clone(),
                        });
                    }
                    if let Some(value) = entry.value {
                        if let Some(item) = self.leaf(&key, value) {
                            return Some(item);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoErrorKind;
    use shuttle_common::MapKey;

    fn cid_for(n: u8) -> Cid {
        let mut mh = vec![0x12, 0x20];
        mh.extend([n; 32]);
        Cid::new_v1(0x71, mh).unwrap()
    }

    fn entry(p: i64, k: &str, t: Option<Cid>, v: Option<Cid>) -> Value {
        let mut map = BTreeMap::new();
        map.insert(MapKey::from("p"), Value::Integer(p as i128));
        map.insert(MapKey::from("k"), Value::Bytes(Bytes::copy_from_slice(k.as_bytes())));
        map.insert(MapKey::from("t"), t.map(Value::Link).unwrap_or(Value::Null));
        map.insert(MapKey::from("v"), v.map(Value::Link).unwrap_or(Value::Null));
        Value::Map(map)
    }

    #[test]
    fn parses_node_fields() {
        let mut map = BTreeMap::new();
        map.insert(MapKey::from("l"), Value::Link(cid_for(1)));
        map.insert(
            MapKey::from("e"),
            Value::Array(vec![entry(0, "app.bsky.feed.post/a", None, Some(cid_for(2)))]),
        );
        let node = NodeData::try_from(&Value::Map(map)).unwrap();
        assert_eq!(node.left, Some(cid_for(1)));
        assert_eq!(node.entries.len(), 1);
        assert_eq!(node.entries[0].prefix_len, 0);
        assert_eq!(node.entries[0].value, Some(cid_for(2)));
        assert_eq!(node.entries[0].tree, None);
    }

    #[test]
    fn rejects_non_map_node() {
        let err = NodeData::try_from(&Value::Integer(3)).unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidMst);
    }

    #[test]
    fn full_key_truncates_then_appends() {
        let e = TreeEntry {
            prefix_len: 15,
            key_suffix: Bytes::from_static(b"like/3k"),
            tree: None,
            value: None,
        };
        assert_eq!(
            e.full_key(b"app.bsky.feed.post/3j").unwrap(),
            b"app.bsky.feed.like/3k".to_vec()
        );
        assert!(e.full_key(b"short").is_err());
    }

    #[test]
    fn self_linked_node_ends_walk() {
        // {"e": [], "l": <own cid>}
        let mut node = vec![0xa2, 0x61, b'e', 0x80, 0x61, b'l', 0xd8, 0x2a, 0x58, 0x25, 0x00];
        node.extend(cid_for(4).to_bytes());
        let mut blocks: BTreeMap<Cid, Bytes> = BTreeMap::new();
        blocks.insert(cid_for(4), Bytes::from(node));

        let items: Vec<_> = MstWalker::new(cid_for(4), &blocks).collect();
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap_err().kind(),
            &RepoErrorKind::InvalidMst
        );
    }

    #[test]
    fn missing_root_yields_nothing() {
        let blocks: BTreeMap<Cid, Bytes> = BTreeMap::new();
        assert_eq!(MstWalker::new(cid_for(9), &blocks).count(), 0);
    }
}
