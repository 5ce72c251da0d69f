//! AT Protocol repository primitives for stream consumers
//!
//! This crate provides the read-only building blocks a firehose consumer needs:
//!
//! - **CAR reading**: split a Content Addressable aRchive into `(CID, bytes)` blocks
//! - **MST walking**: reconstruct `collection/rkey` paths from a Merkle Search Tree
//!   and materialize the records it points at, tolerating pruned trees
//! - **Repository snapshots**: follow a CAR's root commit to its tree
//! - **Firehose frames**: decode `com.atproto.sync.subscribeRepos` frames
//!
//! Nothing here writes repositories or verifies signatures.
//!
//! # Example
//!
//! ```rust,ignore
//! use shuttle_repo::RepoSnapshot;
//!
//! let snapshot = RepoSnapshot::from_car(car_bytes)?;
//! for record in snapshot.records() {
//!     let record = record?;
//!     println!("{}/{}", record.collection, record.rkey);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod car;
pub mod error;
pub mod firehose;
pub mod mst;
pub mod repo;

pub use car::{CarBlock, CarBlocks, CarHeader, CarReader, read_block_map};
pub use error::{RepoError, RepoErrorKind, Result};
pub use firehose::{
    FirehoseAccount, FirehoseCommit, FirehoseIdentity, FirehoseMessage, FrameHeader, RepoOp,
    decode_frame,
};
pub use mst::{BlockSource, MstRecord, MstWalker, NodeData, TreeEntry};
pub use repo::RepoSnapshot;
