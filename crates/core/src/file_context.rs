//! Source-file context element with budgeted expanding ranges.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use rand::RngCore;
use regex::Regex;

use crate::error::ProtocolError;
use crate::format::Format;
use crate::packer::PackingContext;
use crate::unpacker::UnpackContext;
use crate::{Encoding, Token};

static FILE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ ?(.+)\n").unwrap());
static LINE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)").unwrap());

/// Priority of a requested visible range. Required ranges anchor actual
/// edits and are satisfied first; optional ranges are points of interest
/// that only grow while the aux budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    Required,
    Optional,
}

#[derive(Debug, Clone)]
struct ExpandingRange {
    line0: usize,
    line1: usize,
    optional: bool,
    grow0: usize,
    grow1: usize,
    works0: u32,
    works1: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileDecodeState {
    Header,
    Body,
    LineMarker,
    Footer,
}

#[derive(Debug, Clone)]
struct FileDecode {
    state: FileDecodeState,
    header_toks: Vec<Token>,
    marker_toks: Vec<Token>,
    segments: Vec<(usize, Vec<Token>)>,
}

/// In-memory view of one source file plus the line ranges that must stay
/// visible when the file is packed into a context window.
///
/// When produced by the [`Unpacker`](crate::Unpacker) it reflects only what
/// was observed in the token stream: lines the stream never mentioned are
/// empty placeholders.
#[derive(Debug, Clone)]
pub struct FileElement {
    pub filename: String,
    pub lines: Vec<String>,
    pub located_at: Option<usize>,
    pub cursor_line: Option<usize>,
    pub(crate) insert_points: BTreeSet<usize>,
    pub(crate) deleted_lines: BTreeSet<usize>,
    pub(crate) replaced_lines: BTreeSet<usize>,
    ranges: Vec<ExpandingRange>,
    line_toks: Vec<Option<Vec<Token>>>,
    footer_toks: Vec<Token>,
    headers_dirty: bool,
    headers_ctx_n: usize,
    headers_aux_n: usize,
    line_header_cost: usize,
    decode: Option<FileDecode>,
}

impl FileElement {
    pub fn new(filename: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            filename: filename.into(),
            lines,
            located_at: None,
            cursor_line: None,
            insert_points: BTreeSet::new(),
            deleted_lines: BTreeSet::new(),
            replaced_lines: BTreeSet::new(),
            ranges: Vec::new(),
            line_toks: Vec::new(),
            footer_toks: Vec::new(),
            headers_dirty: true,
            headers_ctx_n: 0,
            headers_aux_n: 0,
            line_header_cost: 0,
            decode: None,
        }
    }

    pub fn from_text(filename: impl Into<String>, text: &str) -> Self {
        Self::new(filename, split_lines(text))
    }

    /// Request that the inclusive line span `[line0, line1]` stays visible.
    pub fn add_expanding_range(&mut self, line0: usize, line1: usize, kind: RangeKind) {
        if self.lines.is_empty() {
            return;
        }
        let hi = self.lines.len() - 1;
        self.ranges.push(ExpandingRange {
            line0: line0.min(hi),
            line1: line1.min(hi),
            optional: kind == RangeKind::Optional,
            grow0: 0,
            grow1: 0,
            works0: 1,
            works1: 1,
        });
    }

    pub(crate) fn mark_insert_point(&mut self, line: usize) {
        self.insert_points.insert(line);
    }

    pub(crate) fn mark_deleted(&mut self, line0: usize, line1: usize) {
        self.deleted_lines.extend(line0..line1);
    }

    pub(crate) fn mark_replaced(&mut self, line0: usize, line1: usize) {
        self.replaced_lines.extend(line0..line1);
    }

    /// Turn the recorded edit lines into required expanding ranges, one per
    /// contiguous run, widened by `pad` untouched lines on each side.
    pub(crate) fn seed_required_ranges(&mut self, pad: usize) {
        let touched: BTreeSet<usize> = self
            .insert_points
            .iter()
            .chain(self.deleted_lines.iter())
            .chain(self.replaced_lines.iter())
            .copied()
            .collect();
        let mut run: Option<(usize, usize)> = None;
        for l in touched {
            run = match run {
                Some((s, e)) if l <= e + 1 => Some((s, l)),
                Some((s, e)) => {
                    self.add_expanding_range(s.saturating_sub(pad), e + pad, RangeKind::Required);
                    Some((l, l))
                }
                None => Some((l, l)),
            };
        }
        if let Some((s, e)) = run {
            self.add_expanding_range(s.saturating_sub(pad), e + pad, RangeKind::Required);
        }
    }

    fn merge_ranges(&mut self) {
        if self.ranges.len() < 2 {
            return;
        }
        self.ranges.sort_by_key(|er| (er.line0, er.line1));
        let mut merged: Vec<ExpandingRange> = Vec::with_capacity(self.ranges.len());
        for er in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(prev) if er.line0 <= prev.line1 + 1 => {
                    prev.line1 = prev.line1.max(er.line1);
                    prev.optional = prev.optional && er.optional;
                }
                _ => merged.push(er),
            }
        }
        self.ranges = merged;
    }

    pub(crate) fn pack_init<E: Encoding>(
        &mut self,
        fmt: &Format<E>,
        cx: &mut PackingContext,
        rng: &mut dyn RngCore,
    ) -> (Vec<Token>, Vec<u8>) {
        let enc = fmt.enc();
        let mut header = vec![fmt.escape(), fmt.file_token()];
        header.extend(enc.encode(&format!(" {}\n", self.filename.replace('\n', "\\n"))));
        cx.filled_ctx_n += header.len();
        self.footer_toks = vec![fmt.escape(), fmt.file_end_token()];
        self.footer_toks.extend(enc.encode("\n"));
        cx.filled_aux_n += self.footer_toks.len();
        self.line_header_cost = 2 + enc.encode("1234\n").len();
        self.line_toks = vec![None; self.lines.len()];
        self.headers_dirty = true;
        self.headers_ctx_n = 0;
        self.headers_aux_n = 0;
        self.merge_ranges();
        for ri in 0..self.ranges.len() {
            let (line0, line1, optional) = {
                let er = &mut self.ranges[ri];
                er.works0 = if cx.for_training { rng.next_u32() % 51 } else { 1 };
                er.works1 = if cx.for_training { rng.next_u32() % 51 } else { 1 };
                er.grow0 = er.line0;
                er.grow1 = er.line1;
                (er.line0, er.line1, er.optional)
            };
            for line in line0..=line1 {
                self.take_line(&enc, cx, line as isize, optional, true, 0);
            }
        }
        self.estimate_line_headers(cx);
        let mask = vec![1u8; header.len()];
        (header, mask)
    }

    /// Conservative accounting for the `LINE` headers the visible ranges
    /// will need when rendered.
    fn estimate_line_headers(&mut self, cx: &mut PackingContext) {
        if !self.headers_dirty {
            return;
        }
        let each = cx.line_number_each;
        let headers = |optional: bool| -> usize {
            self.ranges
                .iter()
                .filter(|er| er.optional == optional)
                .map(|er| (er.grow1 - er.grow0 + each) / each)
                .sum()
        };
        let ctx_headers = headers(false);
        let aux_headers = headers(true);
        self.headers_dirty = false;
        if ctx_headers != self.headers_ctx_n {
            let delta = ctx_headers as isize - self.headers_ctx_n as isize;
            cx.filled_ctx_n = (cx.filled_ctx_n as isize + delta * self.line_header_cost as isize)
                .max(0) as usize;
            self.headers_ctx_n = ctx_headers;
        }
        if aux_headers != self.headers_aux_n {
            let delta = aux_headers as isize - self.headers_aux_n as isize;
            cx.filled_aux_n = (cx.filled_aux_n as isize + delta * self.line_header_cost as isize)
                .max(0) as usize;
            self.headers_aux_n = aux_headers;
        }
    }

    /// Tokenize line `l` and charge it to the right budget pool. Mandatory
    /// lines are always taken; in training mode byte budgets are ignored.
    fn take_line<E: Encoding>(
        &mut self,
        enc: &E,
        cx: &mut PackingContext,
        l: isize,
        optional: bool,
        mandatory: bool,
        header_slack: usize,
    ) -> bool {
        self.estimate_line_headers(cx);
        if l < 0 || l as usize >= self.lines.len() {
            return false;
        }
        let l = l as usize;
        if self.line_toks[l].is_some() {
            return false;
        }
        let t = enc.encode(&self.lines[l]);
        let mut len_t = t.len();
        if self.cursor_line == Some(l) {
            len_t += 2;
        }
        let need = len_t + header_slack;
        let take = if optional {
            (cx.filled_aux_n + need < cx.limit_aux_n
                && cx.filled_ctx_n + cx.filled_aux_n + need < cx.limit_ctx_n + cx.limit_aux_n)
                || mandatory
                || cx.for_training
        } else {
            // required lines may borrow whatever aux budget is still unused
            cx.filled_ctx_n + need
                < cx.limit_ctx_n + cx.limit_aux_n.saturating_sub(cx.filled_aux_n)
                || mandatory
                || cx.for_training
        };
        if !take {
            return false;
        }
        if optional {
            cx.filled_aux_n += len_t;
        } else {
            cx.filled_ctx_n += len_t;
        }
        self.line_toks[l] = Some(t);
        self.headers_dirty = true;
        true
    }

    /// Grow every range of the given class by at most one line in each
    /// direction. Returns whether any range can still make progress.
    pub(crate) fn pack_inflate<E: Encoding>(
        &mut self,
        fmt: &Format<E>,
        cx: &mut PackingContext,
        optional_pass: bool,
    ) -> bool {
        let optional_pass = if cx.for_training { false } else { optional_pass };
        let enc = fmt.enc();
        let last_line = self.lines.len().saturating_sub(1);
        let mut anything_works = false;
        for ri in 0..self.ranges.len() {
            if self.ranges[ri].optional != optional_pass {
                continue;
            }
            if self.ranges[ri].works0 > 0 {
                let er = &self.ranges[ri];
                let target = er.grow0 as isize - 1;
                let slack = self.header_growth_cost(ri, cx.line_number_each);
                let success = self.take_line(&enc, cx, target, optional_pass, false, slack);
                let er = &mut self.ranges[ri];
                if success {
                    er.grow0 -= 1;
                    if cx.for_training {
                        er.works0 -= 1;
                    }
                } else {
                    er.works0 = 0;
                }
            }
            if self.ranges[ri].works1 > 0 {
                let er = &self.ranges[ri];
                let target = er.grow1 as isize + 1;
                let slack = self.header_growth_cost(ri, cx.line_number_each);
                let success = self.take_line(&enc, cx, target, optional_pass, false, slack);
                let er = &mut self.ranges[ri];
                if success {
                    if cx.for_training && er.works1 > 0 {
                        er.works1 -= 1;
                    }
                    if er.grow1 + 1 >= last_line {
                        er.works1 = 0;
                        er.grow1 = last_line;
                    } else {
                        er.grow1 += 1;
                    }
                } else {
                    er.works1 = 0;
                }
            }
            let er = &self.ranges[ri];
            anything_works |= er.works0 > 0 || er.works1 > 0;
        }
        anything_works
    }

    /// Extra header tokens that growing range `ri` by one line would cost.
    fn header_growth_cost(&self, ri: usize, each: usize) -> usize {
        let er = &self.ranges[ri];
        let visible = er.grow1 - er.grow0 + 1;
        if visible % each == 0 {
            self.line_header_cost
        } else {
            0
        }
    }

    /// Render the visible lines: a `LINE` header at every run start and
    /// every 15 visible lines (mask 0), the cursor marker (mask 0), line
    /// tokens (mask 1) and the `/FILE` footer (mask 1).
    pub(crate) fn pack_finish<E: Encoding>(&mut self, fmt: &Format<E>) -> (Vec<Token>, Vec<u8>) {
        let enc = fmt.enc();
        let mut t: Vec<Token> = Vec::new();
        let mut m: Vec<u8> = Vec::new();
        let mut countdown = 0usize;
        for (line_n, line_toks) in self.line_toks.iter().enumerate() {
            let Some(toks) = line_toks else {
                countdown = 0;
                continue;
            };
            if countdown == 0 {
                let mut h = vec![fmt.escape(), fmt.line_token()];
                h.extend(enc.encode(&format!("{:04}\n", line_n)));
                m.extend(std::iter::repeat(0u8).take(h.len()));
                t.extend(h);
                countdown = fmt.line_number_each;
            }
            if self.cursor_line == Some(line_n) {
                t.push(fmt.escape());
                t.push(fmt.cursor_token());
                m.extend([0u8, 0u8]);
            }
            t.extend(toks.iter().copied());
            m.extend(std::iter::repeat(1u8).take(toks.len()));
            countdown -= 1;
        }
        t.extend(self.footer_toks.iter().copied());
        m.extend(std::iter::repeat(1u8).take(self.footer_toks.len()));
        (t, m)
    }

    pub(crate) fn unpack_init(located_at: usize) -> Self {
        let mut el = Self::new(String::new(), Vec::new());
        el.located_at = Some(located_at);
        el.decode = Some(FileDecode {
            state: FileDecodeState::Header,
            header_toks: Vec::new(),
            marker_toks: Vec::new(),
            segments: Vec::new(),
        });
        el
    }

    pub(crate) fn unpack_more_tokens<E: Encoding>(&mut self, cx: &mut UnpackContext<'_, E>) -> bool {
        let Some(d) = self.decode.as_mut() else {
            return true;
        };
        while cx.len() > 1 {
            let t0 = cx.peek(0);
            if t0 == cx.fmt.eot() {
                return true;
            }
            let t1 = cx.peek(1);
            match d.state {
                FileDecodeState::Header => {
                    if cx.fmt.is_special_token(t0) {
                        return true;
                    }
                    let t = cx.pop();
                    d.header_toks.push(t);
                    if cx.fmt.enc().decode(&[t]).contains('\n') {
                        d.state = FileDecodeState::Body;
                        d.segments.push((0, Vec::new()));
                    }
                }
                FileDecodeState::Body => {
                    if cx.fmt.is_special_token(t0) {
                        if t1 == cx.fmt.line_token() {
                            cx.pop();
                            cx.pop();
                            d.marker_toks.clear();
                            d.state = FileDecodeState::LineMarker;
                        } else if t1 == cx.fmt.cursor_token() {
                            cx.pop();
                            cx.pop();
                            if let Some((start, toks)) = d.segments.last() {
                                let done = cx.fmt.enc().decode(toks).matches('\n').count();
                                self.cursor_line = Some(start + done);
                            }
                        } else if t1 == cx.fmt.file_end_token() {
                            cx.pop();
                            cx.pop();
                            d.state = FileDecodeState::Footer;
                        } else {
                            return true;
                        }
                    } else {
                        let t = cx.pop();
                        if let Some((_, toks)) = d.segments.last_mut() {
                            toks.push(t);
                        }
                    }
                }
                FileDecodeState::LineMarker => {
                    let t = cx.pop();
                    d.marker_toks.push(t);
                    if cx.fmt.enc().decode(&[t]).contains('\n') {
                        let text = cx.fmt.enc().decode(&d.marker_toks);
                        let start = LINE_HEADER_RE
                            .captures(&text)
                            .and_then(|c| c[1].parse().ok())
                            .unwrap_or(0);
                        d.segments.push((start, Vec::new()));
                        d.state = FileDecodeState::Body;
                    }
                }
                FileDecodeState::Footer => {
                    let t = cx.pop();
                    if cx.fmt.enc().decode(&[t]).contains('\n') {
                        return true;
                    }
                }
            }
        }
        false
    }

    pub(crate) fn unpack_finish<E: Encoding>(
        &mut self,
        cx: &UnpackContext<'_, E>,
    ) -> Result<(), ProtocolError> {
        let Some(d) = self.decode.take() else {
            return Ok(());
        };
        let header = cx.fmt.enc().decode(&d.header_toks);
        let caps = FILE_HEADER_RE
            .captures(&header)
            .ok_or_else(|| ProtocolError::MalformedFileHeader {
                text: header.clone(),
            })?;
        self.filename = caps[1].to_string();
        for (start, toks) in &d.segments {
            if toks.is_empty() {
                continue;
            }
            let text = cx.fmt.enc().decode(toks);
            for (k, line) in text.split_inclusive('\n').enumerate() {
                let idx = start + k;
                if self.lines.len() <= idx {
                    self.lines.resize(idx + 1, String::new());
                }
                self.lines[idx] = line.to_string();
            }
        }
        Ok(())
    }
}

pub(crate) fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(String::from).collect()
}
