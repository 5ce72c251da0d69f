//! Canonical event model shared by both stream variants

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

/// One decoded stream event
///
/// `time_us` is also the resume cursor. On the Jetstream variant it is the
/// native microsecond timestamp; on the firehose variant it is the relay
/// sequence number for every event kind, so the two are not comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// DID of the repository or account the event concerns
    pub author_id: SmolStr,
    /// Cursor position of the event
    pub time_us: i64,
    /// Kind-specific payload
    pub payload: EventPayload,
}

/// Payload of an [`Event`], selected by its kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EventPayload {
    /// A record was created, updated or deleted
    Commit(Commit),
    /// A handle or DID document changed
    Identity(Identity),
    /// Account hosting status changed
    Account(Account),
}

/// Event kind discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Record mutation
    Commit,
    /// Identity update
    Identity,
    /// Account status update
    Account,
}

impl EventKind {
    /// Every kind
    pub const ALL: [EventKind; 3] = [EventKind::Commit, EventKind::Identity, EventKind::Account];

    /// Lowercase name, as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Commit => "commit",
            EventKind::Identity => "identity",
            EventKind::Account => "account",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create a new record
    Create,
    /// Update an existing record
    Update,
    /// Delete a record
    Delete,
}

impl Operation {
    /// Parse the lowercase wire form
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    /// Lowercase name, as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Commit payload: one record operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    /// Repository revision after the commit
    pub revision: SmolStr,
    /// What happened to the record
    pub operation: Operation,
    /// Collection NSID
    pub collection: SmolStr,
    /// Record key within the collection
    pub record_key: SmolStr,
    /// Record body in JSON form, absent for deletes
    pub record: Option<serde_json::Value>,
    /// Record CID in text form
    pub cid: Option<SmolStr>,
}

impl Commit {
    /// Full `collection/rkey` path
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.record_key)
    }
}

/// Identity payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Account DID
    pub did: SmolStr,
    /// Current handle
    pub handle: Option<SmolStr>,
    /// Relay sequence number
    pub seq: i64,
    /// Relay timestamp
    pub time: Option<SmolStr>,
}

/// Account payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account DID
    pub did: SmolStr,
    /// Whether the account is active on its host
    pub active: bool,
    /// Reason for inactivity
    pub status: Option<SmolStr>,
    /// Relay sequence number
    pub seq: i64,
    /// Relay timestamp
    pub time: Option<SmolStr>,
}

impl Event {
    /// Kind of the payload
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::Commit(_) => EventKind::Commit,
            EventPayload::Identity(_) => EventKind::Identity,
            EventPayload::Account(_) => EventKind::Account,
        }
    }

    /// Commit payload, if this is a commit
    pub fn commit(&self) -> Option<&Commit> {
        match &self.payload {
            EventPayload::Commit(commit) => Some(commit),
            _ => None,
        }
    }

    /// Identity payload, if this is an identity event
    pub fn identity(&self) -> Option<&Identity> {
        match &self.payload {
            EventPayload::Identity(identity) => Some(identity),
            _ => None,
        }
    }

    /// Account payload, if this is an account event
    pub fn account(&self) -> Option<&Account> {
        match &self.payload {
            EventPayload::Account(account) => Some(account),
            _ => None,
        }
    }

    /// Collection of a commit event
    pub fn collection(&self) -> Option<&str> {
        self.commit().map(|c| c.collection.as_str())
    }

    /// Operation of a commit event
    pub fn operation(&self) -> Option<Operation> {
        self.commit().map(|c| c.operation)
    }
}
