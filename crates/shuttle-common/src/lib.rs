//! Decoding primitives for the shuttle implementation of atproto streams
//!
//! Everything here operates on untrusted bytes straight off the wire:
//!
//! - [`ByteCursor`]: bounds-checked reads over an immutable buffer
//! - [`varint`]: unsigned LEB128 varints as used by multiformats and CAR framing
//! - [`Cid`]: content identifiers (v0 and v1), binary and text forms
//! - [`cbor`]: a DAG-CBOR decoder producing a [`Value`] tree, with tag 42 links

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub use smol_str;

pub mod cbor;
pub mod cid;
pub mod cursor;
pub mod error;
pub mod multibase;
pub mod value;
pub mod varint;

pub use cid::Cid;
pub use cursor::ByteCursor;
pub use error::{DecodeError, Result};
pub use value::{MapKey, Value};
