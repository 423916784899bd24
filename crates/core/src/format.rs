//! Element registry: kind names, signature tokens and format constants.

use crate::error::ProtocolError;
use crate::{Encoding, Token};

/// A `LINE` header is emitted every this many visible file lines.
pub const LINE_NUMBER_EACH: usize = 15;

/// Which element variant a registered kind dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Msg,
    File,
    Chunk,
}

#[derive(Debug, Clone)]
struct RegisteredKind {
    name: String,
    token: Token,
    kind: ElementKind,
}

/// The wire format: owns the encoder and maps element kind names to their
/// two-token start sequences `[ESCAPE, kind_token]`.
#[derive(Debug)]
pub struct Format<E> {
    enc: E,
    escape: Token,
    eot: Token,
    cursor: Token,
    line_token: Token,
    file_end_token: Token,
    file_token: Token,
    chunk_token: Token,
    kinds: Vec<RegisteredKind>,
    pub line_number_each: usize,
}

impl<E: Encoding> Format<E> {
    /// Build the registry, verifying that every kind word is a single token
    /// in the encoder's vocabulary.
    pub fn new(enc: E) -> Result<Self, ProtocolError> {
        let escape = enc.escape();
        let eot = enc.eot();
        let cursor = enc.cursor();
        let line_token = single_token(&enc, "LINE")?;
        let file_end_token = single_token(&enc, "/FILE")?;
        let file_token = single_token(&enc, "FILE")?;
        let chunk_token = single_token(&enc, "CHUNK")?;
        let mut kinds = Vec::new();
        let registry = [
            ("FILE", ElementKind::File),
            ("CHUNK", ElementKind::Chunk),
            ("SYSTEM", ElementKind::Msg),
            ("USER", ElementKind::Msg),
            ("ASSISTANT", ElementKind::Msg),
        ];
        for (name, kind) in registry {
            kinds.push(RegisteredKind {
                name: name.to_string(),
                token: single_token(&enc, name)?,
                kind,
            });
        }
        Ok(Self {
            enc,
            escape,
            eot,
            cursor,
            line_token,
            file_end_token,
            file_token,
            chunk_token,
            kinds,
            line_number_each: LINE_NUMBER_EACH,
        })
    }

    pub fn enc(&self) -> &E {
        &self.enc
    }

    pub fn escape(&self) -> Token {
        self.escape
    }

    pub fn eot(&self) -> Token {
        self.eot
    }

    pub fn cursor_token(&self) -> Token {
        self.cursor
    }

    pub fn line_token(&self) -> Token {
        self.line_token
    }

    pub fn file_end_token(&self) -> Token {
        self.file_end_token
    }

    pub fn file_token(&self) -> Token {
        self.file_token
    }

    pub fn chunk_token(&self) -> Token {
        self.chunk_token
    }

    /// In this protocol version the separator is the only special token.
    pub fn is_special_token(&self, t: Token) -> bool {
        t == self.escape
    }

    /// Signature token and variant for a registered kind name.
    pub fn kind_token(&self, name: &str) -> Option<(Token, ElementKind)> {
        self.kinds
            .iter()
            .find(|k| k.name == name)
            .map(|k| (k.token, k.kind))
    }

    /// Kind name and variant for a signature token.
    pub fn kind_for(&self, token: Token) -> Option<(&str, ElementKind)> {
        self.kinds
            .iter()
            .find(|k| k.token == token)
            .map(|k| (k.name.as_str(), k.kind))
    }

    /// Start token sequence `[ESCAPE, kind_token]` for a kind name.
    pub fn start_tokens(&self, name: &str) -> Option<[Token; 2]> {
        self.kind_token(name).map(|(t, _)| [self.escape, t])
    }
}

/// Encode `word` and demand it maps to exactly one token.
pub fn single_token<E: Encoding>(enc: &E, word: &str) -> Result<Token, ProtocolError> {
    let toks = enc.encode(word);
    match toks.as_slice() {
        [t] => Ok(*t),
        _ => Err(ProtocolError::NotSingleToken {
            word: word.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testenc::TestEncoding;

    #[test]
    fn test_registry_round_trips_kind_tokens() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        for name in ["FILE", "CHUNK", "SYSTEM", "USER", "ASSISTANT"] {
            let (tok, _) = fmt.kind_token(name).unwrap();
            let (back, _) = fmt.kind_for(tok).unwrap();
            assert_eq!(back, name);
            assert_eq!(fmt.start_tokens(name).unwrap()[0], fmt.escape());
        }
        assert!(fmt.kind_token("DIFF").is_none());
    }

    #[test]
    fn test_only_the_separator_is_special() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        assert!(fmt.is_special_token(fmt.escape()));
        assert!(!fmt.is_special_token(fmt.eot()));
        assert!(!fmt.is_special_token(fmt.line_token()));
    }

    #[test]
    fn test_multi_token_word_is_rejected() {
        let enc = TestEncoding::new();
        assert!(single_token(&enc, "LINE").is_ok());
        assert!(matches!(
            single_token(&enc, "not one token"),
            Err(ProtocolError::NotSingleToken { .. })
        ));
    }
}
