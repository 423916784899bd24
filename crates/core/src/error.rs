//! Error types for packing, unpacking and patch application.

use thiserror::Error;

use crate::Token;

/// Fatal wire-format errors: a malformed stream or a vocabulary that cannot
/// express the format. Raised immediately; never retried.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("\"{word}\" does not map to a single token in this vocabulary")]
    NotSingleToken { word: String },

    #[error("role \"{role}\" is not a registered element kind")]
    UnknownRole { role: String },

    #[error("expected an element signature at token offset {offset}, found token {token}")]
    BadSignature { token: Token, offset: usize },

    #[error("unknown element signature token {token} at offset {offset}")]
    UnknownSignature { token: Token, offset: usize },

    #[error("missing newline separator after the {after}")]
    MissingSeparator { after: &'static str },

    #[error("message body does not start with a separator space: {text:?}")]
    MissingMessageSeparator { text: String },

    #[error("malformed file header: {text:?}")]
    MalformedFileHeader { text: String },

    #[error("cannot pack a chunk that has no owning file")]
    UnresolvedChunk,
}

/// Fatal patch-application errors. Application is fail-fast: nothing is
/// partially applied and the caller treats these as a generation failure.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("chunk at plan index {plan_n} is unresolved and cannot be applied")]
    UnresolvedChunk { plan_n: usize },

    #[error("sanity check failed in {filename} at line {line_n}: expected to delete {expected:?}, found {found:?}")]
    SanityMismatch {
        filename: String,
        line_n: usize,
        expected: String,
        found: String,
    },
}
