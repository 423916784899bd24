//! Free-text message element: a role tag plus one blob of text.

use crate::error::ProtocolError;
use crate::format::{ElementKind, Format};
use crate::unpacker::UnpackContext;
use crate::{Encoding, Token};

/// Wire form: `ESCAPE <role-token> <space><text> LF`, fully trainable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgElement {
    pub role: String,
    pub text: String,
    pub located_at: Option<usize>,
    body_toks: Vec<Token>,
}

impl MsgElement {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
            located_at: None,
            body_toks: Vec::new(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new("SYSTEM", text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new("USER", text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new("ASSISTANT", text)
    }

    pub(crate) fn pack_init<E: Encoding>(
        &self,
        fmt: &Format<E>,
    ) -> Result<(Vec<Token>, Vec<u8>), ProtocolError> {
        let (role_tok, kind) = fmt
            .kind_token(&self.role)
            .ok_or_else(|| ProtocolError::UnknownRole {
                role: self.role.clone(),
            })?;
        if kind != ElementKind::Msg {
            return Err(ProtocolError::UnknownRole {
                role: self.role.clone(),
            });
        }
        let mut t = vec![fmt.escape(), role_tok];
        t.extend(fmt.enc().encode(&format!(" {}\n", self.text)));
        let m = vec![1u8; t.len()];
        Ok((t, m))
    }

    pub(crate) fn unpack_init(role: &str, located_at: usize) -> Self {
        Self {
            role: role.to_string(),
            text: String::new(),
            located_at: Some(located_at),
            body_toks: Vec::new(),
        }
    }

    pub(crate) fn unpack_more_tokens<E: Encoding>(&mut self, cx: &mut UnpackContext<'_, E>) -> bool {
        while cx.len() > 1 {
            let t0 = cx.peek(0);
            if cx.fmt.is_special_token(t0) || t0 == cx.fmt.eot() {
                return true;
            }
            let t = cx.pop();
            self.body_toks.push(t);
        }
        false
    }

    pub(crate) fn unpack_finish<E: Encoding>(
        &mut self,
        cx: &UnpackContext<'_, E>,
    ) -> Result<(), ProtocolError> {
        let mut text = cx.fmt.enc().decode(&self.body_toks);
        if text.ends_with('\n') {
            text.pop();
        }
        match text.strip_prefix(' ') {
            Some(rest) => {
                self.text = rest.to_string();
                Ok(())
            }
            None => Err(ProtocolError::MissingMessageSeparator { text }),
        }
    }
}
