//! Deterministic encoding for tests: protocol keywords are single tokens,
//! everything else tokenizes per character. Extra multi-character merges can
//! be injected to imitate a BPE vocabulary straddling token boundaries.

use std::collections::HashMap;

use crate::{Encoding, Token};

pub struct TestEncoding {
    vocab: Vec<String>,
    words: Vec<String>,
    by_text: HashMap<String, Token>,
    escape: Token,
    eot: Token,
    cursor: Token,
}

const KEYWORDS: &[&str] = &["/FILE", "CHUNK", "FILE", "LINE", "SYSTEM", "USER", "ASSISTANT"];

impl TestEncoding {
    pub fn new() -> Self {
        Self::with_merges(&[])
    }

    pub fn with_merges(merges: &[&str]) -> Self {
        let mut vocab: Vec<String> = Vec::new();
        let mut by_text: HashMap<String, Token> = HashMap::new();
        vocab.push("<<ESC>>".to_string());
        vocab.push("<<EOT>>".to_string());
        vocab.push("<<CURSOR>>".to_string());
        let mut words: Vec<String> = Vec::new();
        for w in KEYWORDS.iter().copied().chain(merges.iter().copied()) {
            by_text.insert(w.to_string(), vocab.len() as Token);
            vocab.push(w.to_string());
            words.push(w.to_string());
        }
        words.sort_by_key(|w| std::cmp::Reverse(w.len()));
        for b in 1u8..=126 {
            let s = (b as char).to_string();
            by_text.entry(s.clone()).or_insert(vocab.len() as Token);
            vocab.push(s);
        }
        Self {
            vocab,
            words,
            by_text,
            escape: 0,
            eot: 1,
            cursor: 2,
        }
    }
}

impl Encoding for TestEncoding {
    fn encode(&self, text: &str) -> Vec<Token> {
        let mut out = Vec::new();
        let mut rest = text;
        'outer: while !rest.is_empty() {
            for w in &self.words {
                if rest.starts_with(w.as_str()) {
                    out.push(self.by_text[w]);
                    rest = &rest[w.len()..];
                    continue 'outer;
                }
            }
            let ch = rest.chars().next().unwrap();
            let s = ch.to_string();
            let t = self
                .by_text
                .get(&s)
                .copied()
                .unwrap_or_else(|| panic!("character {:?} not in test vocabulary", ch));
            out.push(t);
            rest = &rest[s.len()..];
        }
        out
    }

    fn decode(&self, tokens: &[Token]) -> String {
        tokens
            .iter()
            .map(|&t| self.vocab[t as usize].as_str())
            .collect()
    }

    fn escape(&self) -> Token {
        self.escape
    }

    fn eot(&self) -> Token {
        self.eot
    }

    fn cursor(&self) -> Token {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let enc = TestEncoding::new();
        for text in [
            "plain text\n",
            "0010 test.py\n",
            "LINE inside a sentence",
            "# this is line 10\n",
        ] {
            assert_eq!(enc.decode(&enc.encode(text)), text);
        }
    }

    #[test]
    fn test_keywords_are_single_tokens() {
        let enc = TestEncoding::new();
        for w in KEYWORDS {
            assert_eq!(enc.encode(w).len(), 1, "{} must be one token", w);
        }
        assert!(enc.encode("plain").len() > 1);
    }

    #[test]
    fn test_merges_tokenize_greedily() {
        let enc = TestEncoding::with_merges(&["\n# ch"]);
        let toks = enc.encode("py\n# changed");
        assert_eq!(enc.decode(&toks), "py\n# changed");
        let merged = enc.encode("\n# ch");
        assert_eq!(merged.len(), 1);
        assert!(toks.contains(&merged[0]));
    }
}
