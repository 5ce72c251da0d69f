//! Jetstream (stream variant A) wire types and subscription URLs
//!
//! Jetstream is a simplified JSON-based alternative to the atproto firehose.
//! Each text frame is one JSON document that maps directly onto [`Event`].

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use url::Url;

use crate::event::{Account, Commit, Event, EventPayload, Identity, Operation};

/// Query values are percent-encoded except for unreserved characters and `*`,
/// which Jetstream reads as a collection wildcard.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'*');

/// Parameters for subscribing to Jetstream
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
#[builder(start_fn = new)]
pub struct JetstreamParams {
    /// Filter by collection NSIDs, `*` wildcards allowed at segment ends
    #[builder(into)]
    pub wanted_collections: Option<Vec<SmolStr>>,

    /// Filter by repository DIDs
    #[builder(into)]
    pub wanted_dids: Option<Vec<SmolStr>>,

    /// Unix microseconds timestamp to start playback
    pub cursor: Option<i64>,
}

impl JetstreamParams {
    /// Build `{base}/subscribe?...` for these parameters
    ///
    /// Repeated values are sent once, in first-seen order.
    pub fn subscription_url(&self, base: &Url) -> Result<Url, url::ParseError> {
        let root = base.as_str().trim_end_matches('/');
        let mut url = if root.ends_with("/subscribe") {
            root.to_string()
        } else {
            format!("{}/subscribe", root)
        };

        let mut query: Vec<String> = Vec::new();
        if let Some(cursor) = self.cursor {
            query.push(format!("cursor={}", cursor));
        }
        for (name, values) in [
            ("wantedCollections", &self.wanted_collections),
            ("wantedDids", &self.wanted_dids),
        ] {
            let mut seen: Vec<&str> = Vec::new();
            for value in values.iter().flatten() {
                if seen.contains(&value.as_str()) {
                    continue;
                }
                seen.push(value.as_str());
                query.push(format!(
                    "{}={}",
                    name,
                    utf8_percent_encode(value, QUERY_VALUE)
                ));
            }
        }

        if !query.is_empty() {
            url.push('?');
            url.push_str(&query.join("&"));
        }
        Url::parse(&url)
    }
}

/// Commit event details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JetstreamCommit {
    /// Revision string
    pub rev: SmolStr,
    /// Operation type
    pub operation: Operation,
    /// Collection NSID
    pub collection: SmolStr,
    /// Record key
    pub rkey: SmolStr,
    /// Record data (present for create/update)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<serde_json::Value>,
    /// Content identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<SmolStr>,
}

/// Identity event details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JetstreamIdentity {
    /// DID
    pub did: SmolStr,
    /// Handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<SmolStr>,
    /// Sequence number
    pub seq: i64,
    /// Timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<SmolStr>,
}

/// Account event details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JetstreamAccount {
    /// Account active status
    pub active: bool,
    /// DID
    pub did: SmolStr,
    /// Sequence number
    pub seq: i64,
    /// Timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<SmolStr>,
    /// Optional status message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SmolStr>,
}

/// Jetstream event message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "lowercase")]
pub enum JetstreamMessage {
    /// Commit event
    Commit {
        /// DID
        did: SmolStr,
        /// Unix microseconds timestamp
        time_us: i64,
        /// Commit details
        commit: JetstreamCommit,
    },
    /// Identity event
    Identity {
        /// DID
        did: SmolStr,
        /// Unix microseconds timestamp
        time_us: i64,
        /// Identity details
        identity: JetstreamIdentity,
    },
    /// Account event
    Account {
        /// DID
        did: SmolStr,
        /// Unix microseconds timestamp
        time_us: i64,
        /// Account details
        account: JetstreamAccount,
    },
}

impl From<JetstreamMessage> for Event {
    fn from(message: JetstreamMessage) -> Self {
        match message {
            JetstreamMessage::Commit {
                did,
                time_us,
                commit,
            } => Event {
                author_id: did,
                time_us,
                payload: EventPayload::Commit(Commit {
                    revision: commit.rev,
                    operation: commit.operation,
                    collection: commit.collection,
                    record_key: commit.rkey,
                    record: commit.record,
                    cid: commit.cid,
                }),
            },
            JetstreamMessage::Identity {
                did,
                time_us,
                identity,
            } => Event {
                author_id: did,
                time_us,
                payload: EventPayload::Identity(Identity {
                    did: identity.did,
                    handle: identity.handle,
                    seq: identity.seq,
                    time: identity.time,
                }),
            },
            JetstreamMessage::Account {
                did,
                time_us,
                account,
            } => Event {
                author_id: did,
                time_us,
                payload: EventPayload::Account(Account {
                    did: account.did,
                    active: account.active,
                    status: account.status,
                    seq: account.seq,
                    time: account.time,
                }),
            },
        }
    }
}

/// Decode one Jetstream text frame
pub fn decode_message(text: &str) -> Result<Event, serde_json::Error> {
    let message: JetstreamMessage = serde_json::from_str(text)?;
    Ok(message.into())
}
