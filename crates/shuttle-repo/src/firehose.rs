//! Firehose (`com.atproto.sync.subscribeRepos`) frame decoding
//!
//! Every binary WebSocket message is two concatenated DAG-CBOR items: a header
//! `{op, t}` and a payload whose shape is selected by `t`. Only `op == 1`
//! frames carry events; error frames (`op == -1`) and anything else are dropped.

use bytes::Bytes;
use shuttle_common::{Cid, Value, cbor};
use smol_str::SmolStr;

use crate::error::{RepoError, Result};

/// Frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Operation marker, `1` for regular messages
    pub op: i64,
    /// Message type tag such as `#commit`
    pub t: Option<SmolStr>,
}

impl TryFrom<&Value> for FrameHeader {
    type Error = RepoError;

    fn try_from(value: &Value) -> Result<Self> {
        let op = value
            .get("op")
            .and_then(Value::as_i64)
            .ok_or_else(|| RepoError::missing_field("frame header", "op"))?;
        let t = value.get("t").and_then(Value::as_str).map(SmolStr::new);
        Ok(FrameHeader { op, t })
    }
}

/// Decoded firehose message
#[derive(Debug, Clone, PartialEq)]
pub enum FirehoseMessage {
    /// `#commit`: a repository changed
    Commit(FirehoseCommit),
    /// `#identity`: handle or DID document changed
    Identity(FirehoseIdentity),
    /// `#account`: hosting status changed
    Account(FirehoseAccount),
    /// Any other message type (`#sync`, `#info`, ...)
    Unknown {
        /// The header's type tag
        t: SmolStr,
    },
}

impl FirehoseMessage {
    /// Stream sequence number, when the message type carries one
    pub fn seq(&self) -> Option<i64> {
        match self {
            FirehoseMessage::Commit(c) => Some(c.seq),
            FirehoseMessage::Identity(i) => Some(i.seq),
            FirehoseMessage::Account(a) => Some(a.seq),
            FirehoseMessage::Unknown { .. } => None,
        }
    }
}

/// Firehose commit message
#[derive(Debug, Clone, PartialEq)]
pub struct FirehoseCommit {
    /// The stream sequence number of this message
    pub seq: i64,
    /// Deprecated, always false on current relays
    pub rebase: bool,
    /// The commit was too large to include its blocks
    pub too_big: bool,
    /// The repo this event comes from
    pub repo: SmolStr,
    /// Repo commit object CID
    pub commit: Cid,
    /// The rev of the emitted commit
    pub rev: SmolStr,
    /// The rev of the previous commit from this repo
    pub since: Option<SmolStr>,
    /// CAR containing the commit block, changed MST nodes and new records
    pub blocks: Bytes,
    /// Record operations in this commit
    pub ops: Vec<RepoOp>,
    /// When the relay first broadcast the message
    pub time: Option<SmolStr>,
}

/// A single record mutation inside a commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    /// `create`, `update` or `delete`
    pub action: SmolStr,
    /// `collection/rkey`
    pub path: SmolStr,
    /// New record CID, absent for deletes
    pub cid: Option<Cid>,
    /// Previous record CID (sync 1.1)
    pub prev: Option<Cid>,
}

/// Firehose identity message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseIdentity {
    /// The stream sequence number of this message
    pub seq: i64,
    /// Account DID
    pub did: SmolStr,
    /// Broadcast timestamp
    pub time: Option<SmolStr>,
    /// Current handle, if the relay included one
    pub handle: Option<SmolStr>,
}

/// Firehose account message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirehoseAccount {
    /// The stream sequence number of this message
    pub seq: i64,
    /// Account DID
    pub did: SmolStr,
    /// Broadcast timestamp
    pub time: Option<SmolStr>,
    /// Whether the account is active on its host
    pub active: bool,
    /// Reason for inactivity (`takendown`, `suspended`, `deleted`, ...)
    pub status: Option<SmolStr>,
}

struct Fields<'v> {
    message: &'static str,
    value: &'v Value,
}

impl<'v> Fields<'v> {
    fn new(message: &'static str, value: &'v Value) -> Result<Self> {
        if value.as_map().is_none() {
            return Err(RepoError::invalid_frame(format!(
                "{} payload is a {}, expected map",
                message,
                value.kind()
            )));
        }
        Ok(Self { message, value })
    }

    fn get(&self, field: &str) -> Option<&'v Value> {
        self.value.get(field).filter(|v| !v.is_null())
    }

    fn str(&self, field: &str) -> Result<SmolStr> {
        self.opt_str(field)?
            .ok_or_else(|| RepoError::missing_field(self.message, field))
    }

    fn opt_str(&self, field: &str) -> Result<Option<SmolStr>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(RepoError::missing_field(self.message, field)),
        }
    }

    fn i64(&self, field: &str) -> Result<i64> {
        self.get(field)
            .and_then(Value::as_i64)
            .ok_or_else(|| RepoError::missing_field(self.message, field))
    }

    fn bool_or(&self, field: &str, default: bool) -> Result<bool> {
        match self.get(field) {
            None => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(RepoError::missing_field(self.message, field)),
        }
    }

    fn link(&self, field: &str) -> Result<Cid> {
        self.opt_link(field)?
            .ok_or_else(|| RepoError::missing_field(self.message, field))
    }

    fn opt_link(&self, field: &str) -> Result<Option<Cid>> {
        match self.get(field) {
            None => Ok(None),
            Some(Value::Link(cid)) => Ok(Some(cid.clone())),
            Some(_) => Err(RepoError::missing_field(self.message, field)),
        }
    }

    fn bytes(&self, field: &str) -> Result<Bytes> {
        match self.get(field) {
            Some(Value::Bytes(b)) => Ok(b.clone()),
            _ => Err(RepoError::missing_field(self.message, field)),
        }
    }
}

impl TryFrom<&Value> for RepoOp {
    type Error = RepoError;

    fn try_from(value: &Value) -> Result<Self> {
        let fields = Fields::new("repo op", value)?;
        Ok(RepoOp {
            action: fields.str("action")?,
            path: fields.str("path")?,
            cid: fields.opt_link("cid")?,
            prev: fields.opt_link("prev")?,
        })
    }
}

impl TryFrom<&Value> for FirehoseCommit {
    type Error = RepoError;

    fn try_from(value: &Value) -> Result<Self> {
        let fields = Fields::new("#commit", value)?;
        let ops = match fields.get("ops") {
            Some(Value::Array(items)) => items
                .iter()
                .map(RepoOp::try_from)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
            Some(_) => return Err(RepoError::missing_field("#commit", "ops")),
        };

        Ok(FirehoseCommit {
            seq: fields.i64("seq")?,
            rebase: fields.bool_or("rebase", false)?,
            too_big: fields.bool_or("tooBig", false)?,
            repo: fields.str("repo")?,
            commit: fields.link("commit")?,
            rev: fields.str("rev")?,
            since: fields.opt_str("since")?,
            blocks: fields.bytes("blocks")?,
            ops,
            time: fields.opt_str("time")?,
        })
    }
}

impl TryFrom<&Value> for FirehoseIdentity {
    type Error = RepoError;

    fn try_from(value: &Value) -> Result<Self> {
        let fields = Fields::new("#identity", value)?;
        Ok(FirehoseIdentity {
            seq: fields.i64("seq")?,
            did: fields.str("did")?,
            time: fields.opt_str("time")?,
            handle: fields.opt_str("handle")?,
        })
    }
}

impl TryFrom<&Value> for FirehoseAccount {
    type Error = RepoError;

    fn try_from(value: &Value) -> Result<Self> {
        let fields = Fields::new("#account", value)?;
        Ok(FirehoseAccount {
            seq: fields.i64("seq")?,
            did: fields.str("did")?,
            time: fields.opt_str("time")?,
            active: fields.bool_or("active", true)?,
            status: fields.opt_str("status")?,
        })
    }
}

/// Decode one binary firehose frame
///
/// Returns `Ok(None)` for frames whose header `op` is not `1`.
pub fn decode_frame(frame: &[u8]) -> Result<Option<FirehoseMessage>> {
    let (header, used) =
        cbor::decode_prefix(frame).map_err(|e| RepoError::decode(e).with_context("frame header"))?;
    let header = FrameHeader::try_from(&header)?;
    if header.op != 1 {
        tracing::debug!(op = header.op, t = ?header.t, "dropping non-message frame");
        return Ok(None);
    }
    let t = header
        .t
        .ok_or_else(|| RepoError::missing_field("frame header", "t"))?;

    let payload = cbor::decode(&frame[used..])
        .map_err(|e| RepoError::decode(e).with_context(format!("{} payload", t)))?;

    let message = match t.as_str() {
        "#commit" => FirehoseMessage::Commit(FirehoseCommit::try_from(&payload)?),
        "#identity" => FirehoseMessage::Identity(FirehoseIdentity::try_from(&payload)?),
        "#account" => FirehoseMessage::Account(FirehoseAccount::try_from(&payload)?),
        _ => FirehoseMessage::Unknown { t },
    };
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoErrorKind;

    // {"op": 1, "t": "#identity"}
    const IDENTITY_HEADER: &[u8] = &[
        0xa2, 0x61, b't', 0x69, b'#', b'i', b'd', b'e', b'n', b't', b'i', b't', b'y', 0x62, b'o',
        b'p', 0x01,
    ];

    fn text(s: &str) -> Vec<u8> {
        let mut out = vec![0x60 | s.len() as u8];
        out.extend(s.as_bytes());
        out
    }

    #[test]
    fn decodes_identity_frame() {
        let mut frame = IDENTITY_HEADER.to_vec();
        // {"did": "did:plc:abc", "seq": 42, "handle": "alice.test"}
        frame.push(0xa3);
        frame.extend(text("did"));
        frame.extend(text("did:plc:abc"));
        frame.extend(text("seq"));
        frame.push(0x18);
        frame.push(42);
        frame.extend(text("handle"));
        frame.extend(text("alice.test"));

        let message = decode_frame(&frame).unwrap().unwrap();
        assert_eq!(message.seq(), Some(42));
        let FirehoseMessage::Identity(identity) = message else {
            panic!("expected identity");
        };
        assert_eq!(identity.did, "did:plc:abc");
        assert_eq!(identity.handle.as_deref(), Some("alice.test"));
        assert_eq!(identity.time, None);
    }

    #[test]
    fn drops_error_frames() {
        // {"op": -1}, {"error": "FutureCursor"}
        let mut frame = vec![0xa1, 0x62, b'o', b'p', 0x20];
        frame.push(0xa1);
        frame.extend(text("error"));
        frame.extend(text("FutureCursor"));
        assert_eq!(decode_frame(&frame).unwrap(), None);
    }

    #[test]
    fn unknown_types_pass_through() {
        // {"op": 1, "t": "#info"}, {}
        let mut frame = vec![0xa2, 0x61, b't'];
        frame.extend(text("#info"));
        frame.extend([0x62, b'o', b'p', 0x01, 0xa0]);
        assert_eq!(
            decode_frame(&frame).unwrap(),
            Some(FirehoseMessage::Unknown { t: "#info".into() })
        );
    }

    #[test]
    fn missing_required_field_is_invalid_frame() {
        let mut frame = IDENTITY_HEADER.to_vec();
        frame.push(0xa1);
        frame.extend(text("seq"));
        frame.push(0x01);
        let err = decode_frame(&frame).unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::InvalidFrame);
    }

    #[test]
    fn truncated_payload_is_decode_error() {
        let mut frame = IDENTITY_HEADER.to_vec();
        frame.push(0xa3);
        let err = decode_frame(&frame).unwrap_err();
        assert_eq!(err.kind(), &RepoErrorKind::Decode);
    }
}
