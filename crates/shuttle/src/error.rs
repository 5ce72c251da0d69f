//! Error types for the stream consumer

use std::error::Error;
use std::fmt;

use shuttle_repo::RepoError;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Setup mistakes, reported before any connection attempt
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ConfigError {
    /// Stream variant is not one of the recognized names
    #[error("unknown stream variant {0:?}")]
    #[diagnostic(
        code(shuttle::config::variant),
        help("use \"jetstream\" (or \"a\") for the JSON stream, \"firehose\" (or \"b\") for the binary one")
    )]
    UnknownVariant(String),

    /// Reconnection delays are inconsistent
    #[error("invalid reconnect settings: {0}")]
    #[diagnostic(code(shuttle::config::reconnect))]
    InvalidReconnect(String),

    /// Endpoint cannot be used for a WebSocket subscription
    #[error("invalid endpoint {0:?}")]
    #[diagnostic(
        code(shuttle::config::endpoint),
        help("Jetstream URLs use the ws:// or wss:// scheme; firehose hosts are bare hostnames")
    )]
    InvalidEndpoint(String),

    /// File cursor backend selected without a path
    #[error("file cursor backend requires a path")]
    #[diagnostic(code(shuttle::config::cursor_path))]
    MissingCursorPath,

    /// Deferred dispatcher would never run anything
    #[error("deferred dispatch concurrency must be at least 1")]
    #[diagnostic(code(shuttle::config::concurrency))]
    InvalidConcurrency,

    /// A deferred signal was registered with no deferred dispatcher
    #[error("signal {signal} is deferred but no deferred dispatcher is configured")]
    #[diagnostic(
        code(shuttle::config::deferred),
        help("attach a dispatcher with Dispatcher::with_deferred, or switch the signal to QueueMode::Sync")
    )]
    DeferredWithoutDispatcher {
        /// Name of the offending signal
        signal: String,
    },

    /// Collection pattern could not be compiled
    #[error("invalid collection pattern {pattern:?}")]
    #[diagnostic(code(shuttle::config::pattern))]
    InvalidPattern {
        /// The pattern as registered
        pattern: String,
        /// Compilation failure
        #[source]
        source: regex::Error,
    },
}

/// Fatal consumer failures, the only errors that escape [`Consumer::run`](crate::Consumer::run)
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ConsumerError {
    /// Reconnection attempts are exhausted
    #[error("connection lost after {attempts} reconnect attempts")]
    #[diagnostic(
        code(shuttle::consumer::connection),
        help("check that the endpoint is reachable, or raise reconnect.max_attempts")
    )]
    Connection {
        /// Attempts made before giving up
        attempts: u32,
        /// Last transport failure, if the connection failed rather than closed
        #[source]
        source: Option<BoxError>,
    },

    /// Invalid configuration
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// Cursor store failed while resolving the start position
    #[error(transparent)]
    #[diagnostic(transparent)]
    CursorStore(#[from] CursorStoreError),
}

/// Failure of a single signal's handler
///
/// Always routed to the signal's failure hook, never propagated.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum DispatchError {
    /// Handler returned an error
    #[error("signal {signal} failed: {source}")]
    #[diagnostic(code(shuttle::dispatch::handler))]
    Handler {
        /// Name of the signal
        signal: String,
        /// What the handler returned
        #[source]
        source: BoxError,
    },

    /// Handler panicked
    #[error("signal {signal} panicked: {message}")]
    #[diagnostic(code(shuttle::dispatch::panic))]
    Panicked {
        /// Name of the signal
        signal: String,
        /// Panic payload, when it was a string
        message: String,
    },
}

impl DispatchError {
    pub(crate) fn from_panic(signal: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        DispatchError::Panicked {
            signal: signal.to_string(),
            message,
        }
    }

    /// Name of the signal that failed
    pub fn signal(&self) -> &str {
        match self {
            DispatchError::Handler { signal, .. } | DispatchError::Panicked { signal, .. } => signal,
        }
    }
}

/// A single message could not be turned into events
///
/// Logged and skipped by the consumer.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum EventDecodeError {
    /// Jetstream JSON did not match the event shape
    #[error("failed to decode Jetstream message: {0}")]
    #[diagnostic(code(shuttle::decode::json))]
    Json(
        #[from]
        #[source]
        serde_json::Error,
    ),

    /// Firehose frame could not be decoded
    #[error("failed to decode firehose frame: {0}")]
    #[diagnostic(code(shuttle::decode::frame))]
    Frame(
        #[from]
        #[source]
        RepoError,
    ),

    /// Message type does not belong on this stream
    #[error("unexpected {0} message")]
    #[diagnostic(code(shuttle::decode::message_type))]
    UnexpectedMessage(&'static str),
}

/// Cursor persistence failure
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CursorStoreError {
    /// Backend I/O failed
    #[error("cursor store I/O error: {0}")]
    #[diagnostic(code(shuttle::cursor::io))]
    Io(
        #[from]
        #[source]
        std::io::Error,
    ),

    /// Stored value is not an integer
    #[error("stored cursor {content:?} is not an integer")]
    #[diagnostic(
        code(shuttle::cursor::parse),
        help("delete the cursor file to restart from the live tip")
    )]
    Parse {
        /// What was stored
        content: String,
    },
}

/// Transport-level WebSocket error
#[derive(Debug)]
pub struct StreamError {
    kind: StreamErrorKind,
    source: Option<BoxError>,
}

/// Categories of transport errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// Network or I/O error
    Transport,
    /// Stream or connection closed
    Closed,
    /// Protocol violation or framing error
    Protocol,
}

impl StreamError {
    /// Create a new streaming error
    pub fn new(kind: StreamErrorKind, source: Option<BoxError>) -> Self {
        Self { kind, source }
    }

    /// Get the error kind
    pub fn kind(&self) -> &StreamErrorKind {
        &self.kind
    }

    /// Create a "connection closed" error
    pub fn closed() -> Self {
        Self::new(StreamErrorKind::Closed, None)
    }

    /// Create a transport error with source
    pub fn transport(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(StreamErrorKind::Transport, Some(Box::new(source)))
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(StreamErrorKind::Protocol, Some(msg.into().into()))
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StreamErrorKind::Transport => write!(f, "Transport error"),
            StreamErrorKind::Closed => write!(f, "Stream closed"),
            StreamErrorKind::Protocol => write!(f, "Protocol error"),
        }?;

        if let Some(source) = &self.source {
            write!(f, ": {}", source)?;
        }

        Ok(())
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}
