//! Signals: filters paired with handlers
//!
//! A [`Signal`] declares which events it wants and handles them. Only
//! [`Signal::event_kinds`] and [`Signal::handle`] are required; every other
//! hook has a permissive default. Signals are wrapped in a [`Registration`]
//! once at startup, which compiles their collection patterns.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use smol_str::SmolStr;

use crate::error::{BoxError, ConfigError, DispatchError};
use crate::event::{Event, EventKind, Operation};

/// Where a signal's handler runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueMode {
    /// Inline on the consumer task, before the next signal or message
    #[default]
    Sync,
    /// Handed to the deferred dispatcher
    Deferred,
}

/// An event handler with its filter
pub trait Signal: Send + Sync + 'static {
    /// Event kinds this signal receives
    fn event_kinds(&self) -> Vec<EventKind>;

    /// Handle one matching event
    fn handle(&self, event: &Event) -> Result<(), BoxError>;

    /// Name used in logs and errors
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Collection patterns for commit events; `*` matches any run of characters
    fn collections(&self) -> Option<Vec<SmolStr>> {
        None
    }

    /// Operations for commit events
    fn operations(&self) -> Option<Vec<Operation>> {
        None
    }

    /// Author DIDs
    fn authors(&self) -> Option<Vec<SmolStr>> {
        None
    }

    /// Final check, run after every declarative filter has passed
    fn should_handle(&self, _event: &Event) -> bool {
        true
    }

    /// Inline or deferred execution
    fn queue_mode(&self) -> QueueMode {
        QueueMode::Sync
    }

    /// Called when [`Signal::handle`] fails or panics
    fn failed(&self, event: &Event, error: &DispatchError) {
        tracing::error!(
            signal = self.name(),
            did = %event.author_id,
            kind = %event.kind(),
            collection = event.collection(),
            cursor = event.time_us,
            %error,
            "signal failed"
        );
    }
}

type Handler = dyn Fn(&Event) -> Result<(), BoxError> + Send + Sync;
type Predicate = dyn Fn(&Event) -> bool + Send + Sync;

/// Closure-backed [`Signal`]
///
/// ```rust,ignore
/// let signal = FnSignal::new("posts", [EventKind::Commit], |event| {
///     println!("{:?}", event.commit());
///     Ok(())
/// })
/// .collections(["app.bsky.feed.*"])
/// .operations([Operation::Create]);
/// ```
pub struct FnSignal {
    name: SmolStr,
    kinds: Vec<EventKind>,
    collections: Option<Vec<SmolStr>>,
    operations: Option<Vec<Operation>>,
    authors: Option<Vec<SmolStr>>,
    predicate: Option<Box<Predicate>>,
    mode: QueueMode,
    handler: Box<Handler>,
}

impl FnSignal {
    /// Create a signal for `kinds` that runs `handler`
    pub fn new<F>(
        name: impl Into<SmolStr>,
        kinds: impl IntoIterator<Item = EventKind>,
        handler: F,
    ) -> Self
    where
        F: Fn(&Event) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kinds: kinds.into_iter().collect(),
            collections: None,
            operations: None,
            authors: None,
            predicate: None,
            mode: QueueMode::Sync,
            handler: Box::new(handler),
        }
    }

    /// Restrict to collections matching these patterns
    pub fn collections<S: Into<SmolStr>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.collections = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to these operations
    pub fn operations(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.operations = Some(operations.into_iter().collect());
        self
    }

    /// Restrict to these author DIDs
    pub fn authors<S: Into<SmolStr>>(mut self, authors: impl IntoIterator<Item = S>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    /// Add a custom predicate
    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Run the handler through the deferred dispatcher
    pub fn deferred(mut self) -> Self {
        self.mode = QueueMode::Deferred;
        self
    }
}

impl fmt::Debug for FnSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSignal")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .field("collections", &self.collections)
            .field("operations", &self.operations)
            .field("authors", &self.authors)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Signal for FnSignal {
    fn event_kinds(&self) -> Vec<EventKind> {
        self.kinds.clone()
    }

    fn handle(&self, event: &Event) -> Result<(), BoxError> {
        (self.handler)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn collections(&self) -> Option<Vec<SmolStr>> {
        self.collections.clone()
    }

    fn operations(&self) -> Option<Vec<Operation>> {
        self.operations.clone()
    }

    fn authors(&self) -> Option<Vec<SmolStr>> {
        self.authors.clone()
    }

    fn should_handle(&self, event: &Event) -> bool {
        self.predicate.as_ref().is_none_or(|p| p(event))
    }

    fn queue_mode(&self) -> QueueMode {
        self.mode
    }
}

/// Compiled collection patterns
///
/// Each pattern matches by exact equality first; a pattern containing `*` is
/// also tried as an anchored regex where `*` matches any run of characters
/// and everything else is literal.
#[derive(Debug, Clone)]
pub struct CollectionFilter {
    patterns: Vec<(SmolStr, Option<Regex>)>,
}

impl CollectionFilter {
    /// Compile `patterns`
    pub fn new<S: AsRef<str>>(patterns: impl IntoIterator<Item = S>) -> Result<Self, ConfigError> {
        let patterns = patterns
            .into_iter()
            .map(|pattern| {
                let pattern = pattern.as_ref();
                let regex = if pattern.contains('*') {
                    Some(wildcard_regex(pattern)?)
                } else {
                    None
                };
                Ok((SmolStr::new(pattern), regex))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self { patterns })
    }

    /// Whether `collection` matches any pattern
    pub fn matches(&self, collection: &str) -> bool {
        self.patterns.iter().any(|(raw, regex)| {
            raw == collection || regex.as_ref().is_some_and(|r| r.is_match(collection))
        })
    }

    /// Patterns as registered
    pub fn patterns(&self) -> impl Iterator<Item = &SmolStr> {
        self.patterns.iter().map(|(raw, _)| raw)
    }
}

fn wildcard_regex(pattern: &str) -> Result<Regex, ConfigError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    Regex::new(&format!("^{}$", body)).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Test `collection` against wildcard `patterns`
pub fn collection_matches<S: AsRef<str>>(collection: &str, patterns: &[S]) -> bool {
    CollectionFilter::new(patterns)
        .map(|filter| filter.matches(collection))
        .unwrap_or(false)
}

/// A signal with its filters resolved and compiled
#[derive(Clone)]
pub struct Registration {
    signal: Arc<dyn Signal>,
    name: SmolStr,
    kinds: Vec<EventKind>,
    collections: Option<CollectionFilter>,
    operations: Option<Vec<Operation>>,
    authors: Option<HashSet<SmolStr>>,
    mode: QueueMode,
}

impl Registration {
    /// Resolve the filters of `signal`
    ///
    /// Empty collection, operation or author lists are treated as absent.
    pub fn new(signal: impl Signal) -> Result<Self, ConfigError> {
        Self::from_arc(Arc::new(signal))
    }

    /// Resolve the filters of a shared signal
    pub fn from_arc(signal: Arc<dyn Signal>) -> Result<Self, ConfigError> {
        let collections = match signal.collections() {
            Some(patterns) if !patterns.is_empty() => Some(CollectionFilter::new(&patterns)?),
            _ => None,
        };
        Ok(Self {
            name: SmolStr::new(signal.name()),
            kinds: signal.event_kinds(),
            collections,
            operations: signal.operations().filter(|ops| !ops.is_empty()),
            authors: signal
                .authors()
                .filter(|authors| !authors.is_empty())
                .map(|authors| authors.into_iter().collect()),
            mode: signal.queue_mode(),
            signal,
        })
    }

    /// The wrapped signal
    pub fn signal(&self) -> &Arc<dyn Signal> {
        &self.signal
    }

    /// Signal name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execution mode
    pub fn queue_mode(&self) -> QueueMode {
        self.mode
    }

    /// Event kinds this registration receives
    pub fn event_kinds(&self) -> &[EventKind] {
        &self.kinds
    }

    /// Compiled collection filter, if any
    pub fn collections(&self) -> Option<&CollectionFilter> {
        self.collections.as_ref()
    }

    /// Author filter, if any
    pub fn authors(&self) -> Option<&HashSet<SmolStr>> {
        self.authors.as_ref()
    }

    /// Receives commits from every collection
    pub fn wants_all_collections(&self) -> bool {
        self.kinds.contains(&EventKind::Commit) && self.collections.is_none()
    }

    /// Run the filters in order: kind, collection, operation, author, predicate
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.contains(&event.kind()) {
            return false;
        }

        if let Some(commit) = event.commit() {
            if let Some(filter) = &self.collections {
                if !filter.matches(&commit.collection) {
                    return false;
                }
            }
            if let Some(operations) = &self.operations {
                if !operations.contains(&commit.operation) {
                    return false;
                }
            }
        }

        if let Some(authors) = &self.authors {
            if !authors.contains(&event.author_id) {
                return false;
            }
        }

        self.signal.should_handle(event)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("kinds", &self.kinds)
            .field("collections", &self.collections)
            .field("operations", &self.operations)
            .field("authors", &self.authors)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
