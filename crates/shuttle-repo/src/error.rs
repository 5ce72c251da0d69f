//! Error types for repository decoding

use std::error::Error;
use std::fmt;

use shuttle_common::DecodeError;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository decoding error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for repository decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoErrorKind {
    /// Bytes could not be decoded (varint, CID or DAG-CBOR)
    Decode,
    /// CAR framing is broken
    Car,
    /// MST node does not have the protocol structure
    InvalidMst,
    /// Firehose frame is missing required fields or has the wrong shape
    InvalidFrame,
    /// A referenced block is absent
    NotFound,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    /// Create a decode error
    pub fn decode(source: DecodeError) -> Self {
        Self::new(RepoErrorKind::Decode, Some(Box::new(source)))
    }

    /// Create a CAR framing error
    pub fn car(source: impl Into<BoxError>) -> Self {
        Self::new(RepoErrorKind::Car, Some(source.into()))
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidMst, Some(msg.into().into()))
            .with_help("MST nodes are maps with an optional 'l' link and an 'e' entry list")
    }

    /// Create an invalid frame error
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidFrame, Some(msg.into().into()))
    }

    /// A required field is absent or has the wrong type
    pub fn missing_field(message: &str, field: &str) -> Self {
        Self::new(RepoErrorKind::InvalidFrame, None)
            .with_context(format!("{} is missing field '{}'", message, field))
    }

    /// Create a not found error
    pub fn not_found(resource: &str, id: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::NotFound, None)
            .with_context(format!("{} not found: {}", resource, id))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

impl From<DecodeError> for RepoError {
    fn from(e: DecodeError) -> Self {
        RepoError::decode(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_source() {
        let err = RepoError::decode(DecodeError::MalformedVarint { offset: 3 })
            .with_context("block 2");
        assert_eq!(err.kind(), &RepoErrorKind::Decode);
        assert_eq!(
            err.to_string(),
            "Decode: block 2: malformed varint at offset 3: value exceeds 64 bits"
        );
    }

    #[test]
    fn missing_field_names_field() {
        let err = RepoError::missing_field("#commit", "repo");
        assert_eq!(err.kind(), &RepoErrorKind::InvalidFrame);
        assert!(err.to_string().contains("'repo'"));
    }
}
