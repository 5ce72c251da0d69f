//! Firehose (stream variant B) normalization
//!
//! A `#commit` frame carries any number of record operations plus a CAR of
//! the blocks they reference; each operation becomes one [`Event`] with its
//! record decoded from that CAR. Every event takes the frame's `seq` as its
//! `time_us`.

use std::collections::BTreeMap;

use bytes::Bytes;
use shuttle_common::cbor;
use shuttle_repo::{BlockSource, FirehoseCommit, FirehoseMessage, RepoOp};
use smol_str::SmolStr;

use crate::error::EventDecodeError;
use crate::event::{Account, Commit, Event, EventPayload, Identity, Operation};

/// Decode one binary frame into zero or more events
pub fn decode_frame(frame: &[u8]) -> Result<Vec<Event>, EventDecodeError> {
    match shuttle_repo::decode_frame(frame)? {
        Some(message) => normalize(message),
        None => Ok(Vec::new()),
    }
}

/// Convert a decoded firehose message into canonical events
pub fn normalize(message: FirehoseMessage) -> Result<Vec<Event>, EventDecodeError> {
    match message {
        FirehoseMessage::Commit(commit) => commit_events(commit),
        FirehoseMessage::Identity(identity) => Ok(vec![Event {
            author_id: identity.did.clone(),
            time_us: identity.seq,
            payload: EventPayload::Identity(Identity {
                did: identity.did,
                handle: identity.handle,
                seq: identity.seq,
                time: identity.time,
            }),
        }]),
        FirehoseMessage::Account(account) => Ok(vec![Event {
            author_id: account.did.clone(),
            time_us: account.seq,
            payload: EventPayload::Account(Account {
                did: account.did,
                active: account.active,
                status: account.status,
                seq: account.seq,
                time: account.time,
            }),
        }]),
        FirehoseMessage::Unknown { t } => {
            tracing::debug!(t = %t, "ignoring firehose message type");
            Ok(Vec::new())
        }
    }
}

fn commit_events(commit: FirehoseCommit) -> Result<Vec<Event>, EventDecodeError> {
    let blocks = if commit.blocks.is_empty() {
        BTreeMap::new()
    } else {
        shuttle_repo::read_block_map(commit.blocks.clone())?
    };

    let events = commit
        .ops
        .iter()
        .filter_map(|op| {
            let payload = commit_payload(&commit, op, &blocks)?;
            Some(Event {
                author_id: commit.repo.clone(),
                time_us: commit.seq,
                payload: EventPayload::Commit(payload),
            })
        })
        .collect();
    Ok(events)
}

fn commit_payload(
    commit: &FirehoseCommit,
    op: &RepoOp,
    blocks: &BTreeMap<String, Bytes>,
) -> Option<Commit> {
    let Some((collection, record_key)) = op.path.split_once('/') else {
        tracing::warn!(did = %commit.repo, path = %op.path, "operation path has no collection separator, skipping");
        return None;
    };
    let Some(operation) = Operation::parse(&op.action) else {
        tracing::warn!(did = %commit.repo, action = %op.action, "unknown operation, skipping");
        return None;
    };

    let record = match (&op.cid, operation) {
        (_, Operation::Delete) | (None, _) => None,
        (Some(cid), _) => match blocks.get_block(cid) {
            Some(block) => match cbor::decode(&block) {
                Ok(value) => Some(value.to_json()),
                Err(error) => {
                    tracing::warn!(
                        did = %commit.repo,
                        collection,
                        %cid,
                        %error,
                        "record block failed to decode"
                    );
                    None
                }
            },
            None => {
                tracing::debug!(did = %commit.repo, collection, %cid, "record block not in commit");
                None
            }
        },
    };

    Some(Commit {
        revision: commit.rev.clone(),
        operation,
        collection: SmolStr::new(collection),
        record_key: SmolStr::new(record_key),
        record,
        cid: op.cid.as_ref().map(|cid| SmolStr::new(cid.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shuttle_common::Cid;
    use shuttle_repo::{FirehoseAccount, FirehoseIdentity};

    fn commit_with(ops: Vec<RepoOp>) -> FirehoseCommit {
        FirehoseCommit {
            seq: 900,
            rebase: false,
            too_big: false,
            repo: "did:plc:alice".into(),
            commit: "bafyreih4g7bvo6hdq2juolev5bfzpbo4ewkxh5mzxwgvkjp3kitc6hqkha"
                .parse::<Cid>()
                .unwrap(),
            rev: "3kabc".into(),
            since: None,
            blocks: Bytes::new(),
            ops,
            time: None,
        }
    }

    fn op(action: &str, path: &str) -> RepoOp {
        RepoOp {
            action: action.into(),
            path: path.into(),
            cid: None,
            prev: None,
        }
    }

    #[test]
    fn identity_uses_seq_as_cursor() {
        let events = normalize(FirehoseMessage::Identity(FirehoseIdentity {
            seq: 77,
            did: "did:plc:bob".into(),
            time: Some("2024-01-01T00:00:00Z".into()),
            handle: Some("bob.test".into()),
        }))
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time_us, 77);
        assert_eq!(events[0].author_id, "did:plc:bob");
        assert_eq!(events[0].identity().unwrap().handle.as_deref(), Some("bob.test"));
    }

    #[test]
    fn account_uses_seq_as_cursor() {
        let events = normalize(FirehoseMessage::Account(FirehoseAccount {
            seq: 78,
            did: "did:plc:bob".into(),
            time: None,
            active: false,
            status: Some("suspended".into()),
        }))
        .unwrap();
        assert_eq!(events[0].time_us, 78);
        assert!(!events[0].account().unwrap().active);
    }

    #[test]
    fn one_event_per_valid_op() {
        let events = commit_events(commit_with(vec![
            op("delete", "app.bsky.feed.post/a"),
            op("create", "no-separator"),
            op("upsert", "app.bsky.feed.post/b"),
            op("delete", "app.bsky.graph.follow/c"),
        ]))
        .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.time_us == 900));
        let first = events[0].commit().unwrap();
        assert_eq!(first.operation, Operation::Delete);
        assert_eq!(first.collection, "app.bsky.feed.post");
        assert_eq!(first.record_key, "a");
        assert_eq!(first.revision, "3kabc");
        assert!(first.record.is_none());
        assert_eq!(events[1].collection(), Some("app.bsky.graph.follow"));
    }

    #[test]
    fn unknown_messages_produce_nothing() {
        let events = normalize(FirehoseMessage::Unknown { t: "#info".into() }).unwrap();
        assert!(events.is_empty());
    }
}
