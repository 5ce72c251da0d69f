//! Error types for decoding untrusted bytes

use smol_str::SmolStr;

/// Result type alias for decoding operations
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Decoding failure, always carrying enough context to locate the problem
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, miette::Diagnostic)]
pub enum DecodeError {
    /// Buffer ended before the requested bytes were available
    #[error("truncated input at offset {offset}: needed {needed} more byte(s)")]
    #[diagnostic(code(shuttle::decode::truncated))]
    TruncatedInput {
        /// Offset of the read that ran off the end
        offset: usize,
        /// How many bytes were missing
        needed: usize,
    },

    /// Varint continued past 64 bits
    #[error("malformed varint at offset {offset}: value exceeds 64 bits")]
    #[diagnostic(code(shuttle::decode::varint))]
    MalformedVarint {
        /// Offset of the first byte of the varint
        offset: usize,
    },

    /// Structurally invalid binary-object encoding
    #[error("malformed encoding at offset {offset}: {reason}")]
    #[diagnostic(code(shuttle::decode::malformed))]
    MalformedEncoding {
        /// Offset of the item that failed to decode
        offset: usize,
        /// What was wrong with it
        reason: SmolStr,
    },

    /// CID with a leading version other than 0x12 (v0) or 1
    #[error("unsupported CID version {version}")]
    #[diagnostic(
        code(shuttle::decode::cid_version),
        help("only CIDv0 (bare sha2-256 multihash) and CIDv1 are supported")
    )]
    UnsupportedCidVersion {
        /// The leading varint that was found
        version: u64,
    },

    /// Map key that is neither a string nor an integer
    #[error("invalid map key at offset {offset}: expected string or integer, found {found}")]
    #[diagnostic(code(shuttle::decode::map_key))]
    InvalidMapKey {
        /// Offset of the offending key
        offset: usize,
        /// Kind of value found in key position
        found: &'static str,
    },

    /// Character outside the alphabet of a text encoding
    #[error("invalid {base} character {character:?} at position {position}")]
    #[diagnostic(code(shuttle::decode::base))]
    InvalidBaseEncoding {
        /// Name of the encoding
        base: &'static str,
        /// The offending character
        character: char,
        /// Character position in the input
        position: usize,
    },

    /// CID string with an unknown multibase prefix
    #[error("unsupported multibase prefix {prefix:?}")]
    #[diagnostic(
        code(shuttle::decode::multibase),
        help("CID strings must be base32 ('b...'), base58btc ('z...') or a bare CIDv0 ('Qm...')")
    )]
    UnsupportedMultibase {
        /// The leading character
        prefix: char,
    },
}

impl DecodeError {
    /// Create a malformed encoding error
    pub fn malformed(offset: usize, reason: impl Into<SmolStr>) -> Self {
        Self::MalformedEncoding {
            offset,
            reason: reason.into(),
        }
    }

    /// Re-express a truncation as a malformed item starting at `offset`.
    ///
    /// Binary-object decoding reports every truncated item as malformed, keyed
    /// to the start of the item rather than the failed read.
    pub fn into_malformed(self, offset: usize) -> Self {
        match self {
            DecodeError::TruncatedInput { needed, .. } => DecodeError::MalformedEncoding {
                offset,
                reason: smol_str::format_smolstr!(
                    "unexpected end of input, needed {} more byte(s)",
                    needed
                ),
            },
            other => other,
        }
    }

    /// Byte offset associated with the error, if any
    pub fn offset(&self) -> Option<usize> {
        match self {
            DecodeError::TruncatedInput { offset, .. }
            | DecodeError::MalformedVarint { offset }
            | DecodeError::MalformedEncoding { offset, .. }
            | DecodeError::InvalidMapKey { offset, .. } => Some(*offset),
            DecodeError::InvalidBaseEncoding { position, .. } => Some(*position),
            DecodeError::UnsupportedCidVersion { .. } | DecodeError::UnsupportedMultibase { .. } => {
                None
            }
        }
    }
}
