//! Core protocol for serializing localized code edits as bounded token streams.
//!
//! This crate packs a prompt made of source-file context, a natural-language
//! instruction and a sequence of localized edits into one fixed-budget token
//! array plus a parallel training mask, and decodes a model-generated token
//! stream back into structured edits that can be applied to the original
//! files, even when the stated edit location has drifted.

/// Integer token id as produced by the external tokenizer.
pub type Token = u32;

/// Trait for the external token<->text mapping.
///
/// Implementors provide the text codec plus the named single-token ids the
/// wire format relies on. `encode` must never produce any of the named
/// special ids, and the element kind words ("FILE", "CHUNK", "LINE", role
/// names, ...) must each encode to exactly one token; [`Format::new`]
/// verifies the latter.
pub trait Encoding {
    /// Convert text to a token sequence.
    fn encode(&self, text: &str) -> Vec<Token>;

    /// Convert a token sequence back to text.
    fn decode(&self, tokens: &[Token]) -> String;

    /// Separator token starting every element signature.
    fn escape(&self) -> Token;

    /// End-of-text token closing a packed context.
    fn eot(&self) -> Token;

    /// Marker token for a synthetic cursor position inside file context.
    fn cursor(&self) -> Token;
}

// Blanket implementation for references to Encodings
impl<T: Encoding + ?Sized> Encoding for &T {
    fn encode(&self, text: &str) -> Vec<Token> {
        (*self).encode(text)
    }

    fn decode(&self, tokens: &[Token]) -> String {
        (*self).decode(tokens)
    }

    fn escape(&self) -> Token {
        (*self).escape()
    }

    fn eot(&self) -> Token {
        (*self).eot()
    }

    fn cursor(&self) -> Token {
        (*self).cursor()
    }
}

mod chunk;
mod diff_chunks;
mod element;
mod error;
mod file_context;
mod format;
mod message;
mod packer;
mod unpacker;

pub mod pipeline;

#[cfg(test)]
pub(crate) mod testenc;

pub use chunk::{apply_chunks, ChunkElement};
pub use diff_chunks::{plan_from_sources, DiffChunkBuilder, EditSample};
pub use element::{Element, FileId, Plan};
pub use error::{ApplyError, ProtocolError};
pub use file_context::{FileElement, RangeKind};
pub use format::{single_token, Format, LINE_NUMBER_EACH};
pub use message::MsgElement;
pub use packer::{PackParams, Packer, PackingContext};
pub use unpacker::{FileLocation, UnpackContext, Unpacker};

/// Default budget for required file context, in tokens.
pub const DEFAULT_LIMIT_CTX_N: usize = 2048;

/// Default budget for optional (point-of-interest) file context, in tokens.
pub const DEFAULT_LIMIT_AUX_N: usize = 512;
