//! Localized edit element and the patch-application engine.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::element::{Element, FileId, Plan};
use crate::error::{ApplyError, ProtocolError};
use crate::file_context::split_lines;
use crate::format::Format;
use crate::unpacker::UnpackContext;
use crate::{Encoding, Token};

// Marker format is e.g. "0008 test.py"; the filename can contain spaces,
// slashes, anything but a newline.
static LINE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+) (.+)\n").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Del,
    LineN,
    Ins,
}

/// One localized edit against a file: delete `to_del` at `line_n`, insert
/// `to_ins` in its place.
///
/// Wire form: `ESCAPE CHUNK LF <to_del...> ESCAPE LINE <line_n %04d>
/// <space><filename> LF <to_ins...>`, fully trainable.
#[derive(Debug, Clone)]
pub struct ChunkElement {
    pub file: Option<FileId>,
    pub line_n: usize,
    pub to_del: Vec<String>,
    pub to_ins: Vec<String>,
    /// 0 = the delete text matched its stated location exactly, >0 =
    /// approximate match, -1 = unresolved.
    pub fuzzy: i32,
    pub error: String,
    pub located_at: Option<usize>,
    state: ChunkState,
    del_toks: Vec<Token>,
    ins_toks: Vec<Token>,
    marker_toks: Vec<Token>,
    hint_line: Option<usize>,
    hint_file: String,
}

impl ChunkElement {
    pub fn new(file: FileId) -> Self {
        Self {
            file: Some(file),
            ..Self::blank()
        }
    }

    fn blank() -> Self {
        Self {
            file: None,
            line_n: 0,
            to_del: Vec::new(),
            to_ins: Vec::new(),
            fuzzy: -1,
            error: String::new(),
            located_at: None,
            state: ChunkState::Del,
            del_toks: Vec::new(),
            ins_toks: Vec::new(),
            marker_toks: Vec::new(),
            hint_line: None,
            hint_file: String::new(),
        }
    }

    /// Fill the edit from diff output: replace `orig_lines[i0..i1]` with
    /// `replacement`.
    pub(crate) fn assign_from_diff(
        &mut self,
        orig_lines: &[String],
        i0: usize,
        i1: usize,
        replacement: Vec<String>,
    ) {
        self.line_n = i0;
        self.to_del = orig_lines[i0..i1].to_vec();
        self.to_ins = replacement;
        self.fuzzy = 0;
    }

    pub(crate) fn pack_init<E: Encoding>(
        &self,
        fmt: &Format<E>,
        filename: &str,
    ) -> Result<(Vec<Token>, Vec<u8>), ProtocolError> {
        if self.file.is_none() {
            return Err(ProtocolError::UnresolvedChunk);
        }
        let enc = fmt.enc();
        let mut t = vec![fmt.escape(), fmt.chunk_token()];
        t.extend(enc.encode("\n"));
        for line in &self.to_del {
            t.extend(enc.encode(line));
        }
        t.push(fmt.escape());
        t.push(fmt.line_token());
        t.extend(enc.encode(&format!("{:04} {}\n", self.line_n, filename)));
        for line in &self.to_ins {
            t.extend(enc.encode(line));
        }
        let m = vec![1u8; t.len()];
        Ok((t, m))
    }

    pub(crate) fn unpack_init(located_at: usize) -> Self {
        Self {
            located_at: Some(located_at),
            ..Self::blank()
        }
    }

    pub(crate) fn unpack_more_tokens<E: Encoding>(&mut self, cx: &mut UnpackContext<'_, E>) -> bool {
        while cx.len() > 1 {
            let t0 = cx.peek(0);
            if t0 == cx.fmt.eot() {
                return true;
            }
            let t1 = cx.peek(1);
            if cx.fmt.is_special_token(t0) {
                if self.state == ChunkState::Del && t1 == cx.fmt.line_token() {
                    self.switch_state(cx, ChunkState::LineN);
                    cx.pop();
                    cx.pop();
                    continue;
                }
                // a special token that is not our LINE marker starts the
                // next element, so this chunk's body is over
                return true;
            }
            match self.state {
                ChunkState::LineN => {
                    let t1_txt = cx.fmt.enc().decode(&[t1]);
                    self.marker_toks.push(t0);
                    if t1_txt.contains('\n') {
                        // Hedge inherited from the wire format: the token
                        // closing the marker may contribute to the marker, to
                        // the inserted text, or to both. It is recorded here
                        // and left in the queue for the INS state.
                        self.marker_toks.push(t1);
                        self.switch_state(cx, ChunkState::Ins);
                    }
                    cx.pop();
                }
                ChunkState::Ins => {
                    let t = cx.pop();
                    self.ins_toks.push(t);
                }
                ChunkState::Del => {
                    let t = cx.pop();
                    self.del_toks.push(t);
                    self.locate_in_known_files(cx, false);
                }
            }
        }
        false
    }

    fn switch_state<E: Encoding>(&mut self, cx: &UnpackContext<'_, E>, new_state: ChunkState) {
        if self.state == ChunkState::LineN {
            let marker = cx.fmt.enc().decode(&self.marker_toks);
            if let Some(caps) = LINE_MARKER_RE.captures(&marker) {
                self.hint_line = caps[1].parse::<usize>().ok();
                self.hint_file = caps[2].to_string();
            }
            self.marker_toks.clear();
            // fills fuzzy correctly even when the location is already known
            self.locate_in_known_files(cx, true);
        }
        self.state = new_state;
    }

    fn del_text<E: Encoding>(&self, cx: &UnpackContext<'_, E>) -> Option<String> {
        if self.del_toks.is_empty() {
            return Some(String::new());
        }
        let s = cx.fmt.enc().decode(&self.del_toks);
        s.strip_prefix('\n').map(str::to_string)
    }

    fn ins_text<E: Encoding>(&self, cx: &UnpackContext<'_, E>) -> Option<String> {
        if self.ins_toks.is_empty() {
            return Some(String::new());
        }
        let s = cx.fmt.enc().decode(&self.ins_toks);
        s.strip_prefix('\n').map(str::to_string)
    }

    fn locate_in_known_files<E: Encoding>(&mut self, cx: &UnpackContext<'_, E>, force: bool) {
        if self.file.is_some() && !force {
            return;
        }
        let Some(to_del_str) = self.del_text(cx) else {
            return;
        };
        let cap = if force { None } else { Some(5) };
        let found = cx.lookup_file(&to_del_str, self.hint_line, &self.hint_file, cap);
        if found.len() == 1 {
        } else if force && found.len() > 1 {
            log::warn!(
                "multiple matches ({}) for chunk delete text, using the first one; \
                 lookup was hint_line={:?} hint_file={:?}",
                found.len(),
                self.hint_line,
                self.hint_file
            );
        } else if force {
            log::warn!(
                "no matches for chunk delete text {:?}, lookup was hint_line={:?} hint_file={:?}",
                clip(&to_del_str),
                self.hint_line,
                self.hint_file
            );
            self.error = format!(
                "no location found for delete text (hint_line={:?}, hint_file={:?})",
                self.hint_line, self.hint_file
            );
            return;
        } else {
            // nothing conclusive yet; retried as more tokens arrive
            return;
        }
        let hit = &found[0];
        self.file = Some(hit.file);
        self.line_n = hit.line_n;
        self.fuzzy = hit.fuzzy;
        if force && self.fuzzy != 0 {
            log::warn!(
                "chunk resolved with nonzero fuzzy score {} at line {}",
                self.fuzzy,
                self.line_n
            );
        }
    }

    pub(crate) fn unpack_finish<E: Encoding>(
        &mut self,
        cx: &UnpackContext<'_, E>,
    ) -> Result<(), ProtocolError> {
        let del = self
            .del_text(cx)
            .ok_or(ProtocolError::MissingSeparator { after: "CHUNK signature" })?;
        let ins = self
            .ins_text(cx)
            .ok_or(ProtocolError::MissingSeparator { after: "LINE marker" })?;
        self.to_del = split_lines(&del);
        self.to_ins = split_lines(&ins);
        Ok(())
    }
}

fn clip(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(100)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

/// Apply every chunk of `plan` in plan order, tracking how earlier splices
/// shift the line offsets of later chunks in the same file.
///
/// Returns the patched line arrays keyed by filename; only files touched by
/// at least one chunk appear. Fails fast: an unresolved chunk or a delete
/// text that does not match the current file content aborts the whole
/// application.
pub fn apply_chunks(plan: &Plan) -> Result<HashMap<String, Vec<String>>, ApplyError> {
    let mut code: HashMap<String, Vec<String>> = HashMap::new();
    let mut patched: Vec<Option<isize>> = vec![None; plan.items.len()];
    for (i, el) in plan.items.iter().enumerate() {
        if let Element::Chunk(ch) = el {
            if ch.file.is_none() {
                return Err(ApplyError::UnresolvedChunk { plan_n: i });
            }
            patched[i] = Some(ch.line_n as isize);
        }
    }
    for i in 0..plan.items.len() {
        let Element::Chunk(ch) = &plan.items[i] else {
            continue;
        };
        let Some(file_id) = ch.file else {
            continue;
        };
        let filename = plan.files[file_id.0].filename.clone();
        let offset = patched[i].unwrap_or(0);
        let off = usize::try_from(offset).map_err(|_| ApplyError::SanityMismatch {
            filename: filename.clone(),
            line_n: 0,
            expected: ch.to_del.concat(),
            found: String::new(),
        })?;
        {
            let lines = code
                .entry(filename.clone())
                .or_insert_with(|| plan.files[file_id.0].lines.clone());
            let end = off + ch.to_del.len();
            if end > lines.len() || lines[off..end] != ch.to_del[..] {
                return Err(ApplyError::SanityMismatch {
                    filename,
                    line_n: off,
                    expected: ch.to_del.concat(),
                    found: lines
                        .get(off..end.min(lines.len()))
                        .map(|s| s.concat())
                        .unwrap_or_default(),
                });
            }
            lines.splice(off..end, ch.to_ins.iter().cloned());
        }
        let shift = ch.to_ins.len() as isize - ch.to_del.len() as isize;
        for j in (i + 1)..plan.items.len() {
            let Element::Chunk(later) = &plan.items[j] else {
                continue;
            };
            if later.file != Some(file_id) {
                continue;
            }
            if let Some(p) = patched[j] {
                if p >= offset {
                    patched[j] = Some(p + shift);
                }
            }
        }
    }
    Ok(code)
}
