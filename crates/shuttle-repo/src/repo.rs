//! Full-repository snapshots
//!
//! A repository export (`com.atproto.sync.getRepo`) is a CAR whose root is the
//! signed commit; the commit's `data` field links to the MST root.

use std::collections::BTreeMap;

use bytes::Bytes;
use shuttle_common::{Cid, Value, cbor};
use smol_str::SmolStr;

use crate::car::CarReader;
use crate::error::{RepoError, Result};
use crate::mst::{BlockSource, MstWalker};

/// Repository loaded from a CAR export
#[derive(Debug, Clone)]
pub struct RepoSnapshot {
    commit_cid: Cid,
    did: SmolStr,
    rev: SmolStr,
    data: Cid,
    blocks: BTreeMap<Cid, Bytes>,
}

impl RepoSnapshot {
    /// Load the commit and block map from CAR bytes
    pub fn from_car(bytes: impl Into<Bytes>) -> Result<Self> {
        let reader = CarReader::new(bytes)?;
        let commit_cid = reader.root()?;

        let mut blocks = BTreeMap::new();
        for (index, block) in reader.blocks().enumerate() {
            match block {
                Ok(block) => {
                    blocks.insert(block.cid, block.data);
                }
                Err(error) => {
                    tracing::warn!(block = index, %error, "skipping undecodable CAR block");
                }
            }
        }

        let commit_block = blocks
            .get_block(&commit_cid)
            .ok_or_else(|| RepoError::not_found("commit block", &commit_cid))?;
        let commit = cbor::decode(&commit_block)
            .map_err(|e| RepoError::decode(e).with_context("repository commit"))?;

        let field = |name: &str| {
            commit
                .get(name)
                .and_then(Value::as_str)
                .map(SmolStr::new)
                .ok_or_else(|| RepoError::missing_field("repository commit", name))
        };
        let did = field("did")?;
        let rev = field("rev")?;
        let data = commit
            .get("data")
            .and_then(Value::as_link)
            .cloned()
            .ok_or_else(|| RepoError::missing_field("repository commit", "data"))?;

        Ok(Self {
            commit_cid,
            did,
            rev,
            data,
            blocks,
        })
    }

    /// CID of the commit block
    pub fn commit_cid(&self) -> &Cid {
        &self.commit_cid
    }

    /// Repository DID
    pub fn did(&self) -> &str {
        &self.did
    }

    /// Commit revision
    pub fn rev(&self) -> &str {
        &self.rev
    }

    /// CID of the MST root
    pub fn data(&self) -> &Cid {
        &self.data
    }

    /// Number of blocks in the archive
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Walk every record in the repository
    pub fn records(&self) -> MstWalker<&BTreeMap<Cid, Bytes>> {
        MstWalker::new(self.data.clone(), &self.blocks)
    }
}
