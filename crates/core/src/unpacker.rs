//! Streaming decoder: tokens back into a plan, resumable one token at a time.

use std::collections::VecDeque;

use crate::chunk::ChunkElement;
use crate::element::{Element, FileId, Plan};
use crate::error::ProtocolError;
use crate::file_context::FileElement;
use crate::format::{ElementKind, Format};
use crate::message::MsgElement;
use crate::{Encoding, Token};

/// One candidate location for a chunk's delete text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLocation {
    pub file: FileId,
    pub line_n: usize,
    pub fuzzy: i32,
}

/// Request-scoped state handed to an element while it consumes tokens.
pub struct UnpackContext<'a, E> {
    pub fmt: &'a Format<E>,
    pending: &'a mut VecDeque<Token>,
    files: &'a [FileElement],
}

impl<'a, E: Encoding> UnpackContext<'a, E> {
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn peek(&self, i: usize) -> Token {
        self.pending[i]
    }

    pub(crate) fn pop(&mut self) -> Token {
        self.pending.pop_front().expect("token queue underflow")
    }

    /// Rank candidate locations for `text` across every file known so far.
    /// Hints order the candidates but never exclude one; `up_to_matches`
    /// caps the result unless `None`.
    pub fn lookup_file(
        &self,
        text: &str,
        hint_line: Option<usize>,
        hint_file: &str,
        up_to_matches: Option<usize>,
    ) -> Vec<FileLocation> {
        lookup_in_files(self.files, text, hint_line, hint_file, up_to_matches)
    }
}

enum OpenElement {
    Msg(MsgElement),
    File(FileElement),
    Chunk(ChunkElement),
}

/// Inverse of the packer: feed it tokens, in full or incrementally, and it
/// reconstructs a plan. Feeding the same tokens one at a time or all at
/// once yields the same result.
pub struct Unpacker<'f, E: Encoding> {
    fmt: &'f Format<E>,
    pub result: Plan,
    pending: VecDeque<Token>,
    current: Option<OpenElement>,
    position: usize,
    eot_seen: bool,
}

impl<'f, E: Encoding> Unpacker<'f, E> {
    /// `known` is the plan prefix the stream continues from (its files are
    /// the lookup targets for chunk relocation); `position` is the absolute
    /// token offset the first fed token will have.
    pub fn new(fmt: &'f Format<E>, known: Plan, position: usize) -> Self {
        Self {
            fmt,
            result: known,
            pending: VecDeque::new(),
            current: None,
            position,
            eot_seen: false,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn eot_seen(&self) -> bool {
        self.eot_seen
    }

    pub fn lookup_file(
        &self,
        text: &str,
        hint_line: Option<usize>,
        hint_file: &str,
        up_to_matches: Option<usize>,
    ) -> Vec<FileLocation> {
        lookup_in_files(&self.result.files, text, hint_line, hint_file, up_to_matches)
    }

    /// Append tokens to the pending queue and consume as much as a
    /// two-token lookahead allows.
    pub fn feed_tokens(&mut self, new_tokens: &[Token]) -> Result<(), ProtocolError> {
        self.pending.extend(new_tokens.iter().copied());
        self.drain()
    }

    /// Close the element still open after the producer stopped without an
    /// end-of-text token.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        self.close_current()
    }

    fn drain(&mut self) -> Result<(), ProtocolError> {
        loop {
            if self.eot_seen {
                self.pending.clear();
                return Ok(());
            }
            if self.pending.front() == Some(&self.fmt.eot()) {
                self.pending.pop_front();
                self.position += 1;
                self.close_current()?;
                self.eot_seen = true;
                continue;
            }
            if self.pending.len() < 2 {
                return Ok(());
            }
            if self.current.is_some() {
                let before = self.pending.len();
                let done = self.advance_current();
                let consumed = before - self.pending.len();
                self.position += consumed;
                if done {
                    self.close_current()?;
                    continue;
                }
                // the element stalled: out of lookahead, or an end-of-text
                // barrier at the queue front (handled at the loop top)
                if consumed == 0 && self.pending.front() != Some(&self.fmt.eot()) {
                    return Ok(());
                }
                continue;
            }
            let t0 = self.pending[0];
            let t1 = self.pending[1];
            if t0 != self.fmt.escape() {
                return Err(ProtocolError::BadSignature {
                    token: t0,
                    offset: self.position,
                });
            }
            let Some((name, kind)) = self.fmt.kind_for(t1) else {
                return Err(ProtocolError::UnknownSignature {
                    token: t1,
                    offset: self.position,
                });
            };
            let name = name.to_string();
            let located_at = self.position;
            self.pending.pop_front();
            self.pending.pop_front();
            self.position += 2;
            self.current = Some(match kind {
                ElementKind::Msg => OpenElement::Msg(MsgElement::unpack_init(&name, located_at)),
                ElementKind::File => OpenElement::File(FileElement::unpack_init(located_at)),
                ElementKind::Chunk => OpenElement::Chunk(ChunkElement::unpack_init(located_at)),
            });
        }
    }

    fn advance_current(&mut self) -> bool {
        let mut cur = self.current.take().expect("no open element");
        let done = {
            let mut cx = UnpackContext {
                fmt: self.fmt,
                pending: &mut self.pending,
                files: &self.result.files,
            };
            match &mut cur {
                OpenElement::Msg(m) => m.unpack_more_tokens(&mut cx),
                OpenElement::File(f) => f.unpack_more_tokens(&mut cx),
                OpenElement::Chunk(c) => c.unpack_more_tokens(&mut cx),
            }
        };
        self.current = Some(cur);
        done
    }

    fn close_current(&mut self) -> Result<(), ProtocolError> {
        let Some(mut cur) = self.current.take() else {
            return Ok(());
        };
        {
            let cx = UnpackContext {
                fmt: self.fmt,
                pending: &mut self.pending,
                files: &self.result.files,
            };
            match &mut cur {
                OpenElement::Msg(m) => m.unpack_finish(&cx)?,
                OpenElement::File(f) => f.unpack_finish(&cx)?,
                OpenElement::Chunk(c) => c.unpack_finish(&cx)?,
            }
        }
        match cur {
            OpenElement::Msg(m) => {
                self.result.items.push(Element::Msg(m));
            }
            OpenElement::Chunk(c) => {
                self.result.items.push(Element::Chunk(c));
            }
            OpenElement::File(f) => {
                self.result.add_file(f);
            }
        }
        Ok(())
    }
}

pub(crate) fn lookup_in_files(
    files: &[FileElement],
    text: &str,
    hint_line: Option<usize>,
    hint_file: &str,
    up_to_matches: Option<usize>,
) -> Vec<FileLocation> {
    if text.is_empty() {
        // a pure insert has no anchor text; only the hints can place it
        if let Some((fi, f)) = files.iter().enumerate().find(|(_, f)| f.filename == hint_file) {
            return vec![FileLocation {
                file: FileId(fi),
                line_n: hint_line.unwrap_or(0).min(f.lines.len()),
                fuzzy: 0,
            }];
        }
        return Vec::new();
    }
    let needle: Vec<&str> = text.split_inclusive('\n').collect();
    let partial_last = !text.ends_with('\n');
    let mut exact: Vec<FileLocation> = Vec::new();
    let mut approx: Vec<FileLocation> = Vec::new();
    for (fi, f) in files.iter().enumerate() {
        if f.lines.len() < needle.len() {
            continue;
        }
        for i in 0..=(f.lines.len() - needle.len()) {
            match match_lines(&f.lines[i..i + needle.len()], &needle, partial_last) {
                Some(0) => exact.push(FileLocation {
                    file: FileId(fi),
                    line_n: i,
                    fuzzy: 0,
                }),
                Some(fz) => approx.push(FileLocation {
                    file: FileId(fi),
                    line_n: i,
                    fuzzy: fz,
                }),
                None => {}
            }
        }
    }
    let mut found = if exact.is_empty() { approx } else { exact };
    found.sort_by_key(|c| {
        (
            c.fuzzy,
            (!hint_file.is_empty() && files[c.file.0].filename != hint_file) as u8,
            hint_line.map(|h| c.line_n.abs_diff(h)).unwrap_or(0),
            c.file.0,
            c.line_n,
        )
    });
    if let Some(cap) = up_to_matches {
        found.truncate(cap);
    }
    found
}

fn match_lines(window: &[String], needle: &[&str], partial_last: bool) -> Option<i32> {
    let mut fuzzy = 0;
    for (k, nl) in needle.iter().enumerate() {
        let fl = window[k].as_str();
        if partial_last && k == needle.len() - 1 {
            if !fl.starts_with(nl) {
                return None;
            }
        } else if fl == *nl {
        } else if fl.trim_end() == nl.trim_end() {
            fuzzy += 1;
        } else {
            return None;
        }
    }
    Some(fuzzy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_context::FileElement;

    fn known_files() -> Vec<FileElement> {
        vec![
            FileElement::from_text("test.py", "alpha\nbravo\ncharlie\nbravo\ndelta\n"),
            FileElement::from_text("lib.py", "bravo\nzulu\n"),
        ]
    }

    #[test]
    fn test_lookup_exact_unique() {
        let files = known_files();
        let found = lookup_in_files(&files, "charlie\n", None, "", None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0], FileLocation { file: FileId(0), line_n: 2, fuzzy: 0 });
    }

    #[test]
    fn test_lookup_hints_rank_but_never_filter() {
        let files = known_files();
        // "bravo" appears three times; the hints pick the closest one
        let found = lookup_in_files(&files, "bravo\n", Some(3), "test.py", None);
        assert_eq!(found.len(), 3);
        assert_eq!((found[0].file, found[0].line_n), (FileId(0), 3));
        // a wrong hint_file still returns the content matches
        let found = lookup_in_files(&files, "charlie\n", Some(0), "nosuch.py", None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fuzzy, 0);
    }

    #[test]
    fn test_lookup_partial_last_line_matches_prefix() {
        let files = known_files();
        let found = lookup_in_files(&files, "char", None, "", None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line_n, 2);
    }

    #[test]
    fn test_lookup_whitespace_drift_scores_nonzero() {
        let files = vec![FileElement::from_text("a.py", "x = 1\ny = 2\n")];
        let found = lookup_in_files(&files, "x = 1  \n", None, "", None);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].fuzzy, 1);
    }

    #[test]
    fn test_lookup_cap_limits_candidates() {
        let files = known_files();
        let found = lookup_in_files(&files, "bravo\n", None, "", Some(2));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_pure_insert_resolves_through_hints_only() {
        let files = known_files();
        let found = lookup_in_files(&files, "", Some(4), "lib.py", None);
        assert_eq!(found.len(), 1);
        assert_eq!((found[0].file, found[0].line_n), (FileId(1), 2));
        assert!(lookup_in_files(&files, "", Some(4), "nosuch.py", None).is_empty());
    }

    // plan-level round trips through Packer and Unpacker

    use crate::chunk::apply_chunks;
    use crate::diff_chunks::{plan_from_sources, DiffChunkBuilder, EditSample};
    use crate::packer::{PackParams, Packer};
    use crate::testenc::TestEncoding;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn expansion_sample() -> EditSample {
        let orig: Vec<String> = (0..30).map(|i| format!("# this is line {}", i)).collect();
        let lib: Vec<String> = (0..1000)
            .map(|i| format!("# this is library line {}", i))
            .collect();
        let mut dest = orig.clone();
        dest[10] = "# changed line".to_string();
        EditSample {
            orig: BTreeMap::from([
                ("test.py".to_string(), orig.join("\n")),
                ("lib.py".to_string(), lib.join("\n")),
            ]),
            dest: BTreeMap::from([("test.py".to_string(), dest.join("\n"))]),
            commitmsg: "Expansion test".to_string(),
            poi_ranges: BTreeMap::from([
                ("test.py".to_string(), vec![(20, 20), (25, 25)]),
                ("lib.py".to_string(), vec![(500, 500)]),
            ]),
        }
    }

    #[test]
    fn test_resume_round_trip_streaming_and_apply() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let sample = expansion_sample();
        let (plan, msg_plan_n) = plan_from_sources(&sample, &DiffChunkBuilder::default());
        assert_eq!(msg_plan_n, 2); // lib.py, test.py, then the message
        let mut pack = Packer::with_plan(&fmt, plan);
        for n_ctx in [250usize, 300, 350] {
            let params = PackParams {
                start_from_plan_n: 0,
                mask_from_plan_n: msg_plan_n,
                limit_ctx_n: n_ctx - 100,
                limit_aux_n: 100,
                add_eot: true,
                for_training: false,
            };
            let mut rng = StdRng::seed_from_u64(0);
            pack.pack_context(&params, &mut rng).unwrap();
            assert_eq!(pack.tokens.len(), pack.mask.len());
            if pack.cx.minimal_context_too_big_warning {
                continue;
            }
            assert!(pack.tokens.len() <= n_ctx, "{} > {}", pack.tokens.len(), n_ctx);

            let resume_at = pack.plan.located_at(msg_plan_n).unwrap();
            let mut u1 = Unpacker::new(&fmt, pack.plan.prefix(msg_plan_n), resume_at);
            u1.feed_tokens(&pack.tokens[resume_at..]).unwrap();
            let mut u2 = Unpacker::new(&fmt, pack.plan.prefix(msg_plan_n), resume_at);
            for &t in &pack.tokens[resume_at..] {
                u2.feed_tokens(&[t]).unwrap();
            }
            assert_eq!(u1.result.items.len(), pack.plan.items.len());
            for i in msg_plan_n..pack.plan.items.len() {
                assert_eq!(u1.result.describe(i), pack.plan.describe(i));
                assert_eq!(u2.result.describe(i), pack.plan.describe(i));
            }

            let code = apply_chunks(&u1.result).unwrap();
            assert!(!code.contains_key("lib.py"));
            let patched = code["test.py"].concat();
            let dest = &sample.dest["test.py"];
            assert!(patched == *dest || patched == format!("{}\n", dest));
        }
    }

    #[test]
    fn test_full_unpack_from_zero_reconstructs_file_context() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let sample = EditSample {
            orig: BTreeMap::from([("test.py".to_string(), "alpha\nbravo\ncharlie".to_string())]),
            dest: BTreeMap::from([("test.py".to_string(), "alpha\nBRAVO\ncharlie".to_string())]),
            commitmsg: "shout".to_string(),
            poi_ranges: BTreeMap::new(),
        };
        let (plan, _) = plan_from_sources(&sample, &DiffChunkBuilder::default());
        let mut pack = Packer::with_plan(&fmt, plan);
        let mut rng = StdRng::seed_from_u64(0);
        pack.pack_context(&PackParams::default(), &mut rng).unwrap();

        let mut u = Unpacker::new(&fmt, Plan::new(), 0);
        u.feed_tokens(&pack.tokens).unwrap();
        assert!(u.eot_seen());
        assert_eq!(u.result.files.len(), 1);
        let file = &u.result.files[0];
        assert_eq!(file.filename, "test.py");
        assert_eq!(
            file.lines,
            vec![
                "alpha\n".to_string(),
                "bravo\n".to_string(),
                "charlie".to_string()
            ]
        );
        let code = apply_chunks(&u.result).unwrap();
        assert_eq!(code["test.py"].concat(), "alpha\nBRAVO\ncharlie");
    }

    #[test]
    fn test_training_mode_packs_and_still_round_trips() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let sample = expansion_sample();
        let (plan, msg_plan_n) = plan_from_sources(&sample, &DiffChunkBuilder::default());
        let mut pack = Packer::with_plan(&fmt, plan);
        let params = PackParams {
            mask_from_plan_n: msg_plan_n,
            limit_ctx_n: 300,
            limit_aux_n: 100,
            for_training: true,
            ..PackParams::default()
        };
        let mut rng = StdRng::seed_from_u64(42);
        pack.pack_context(&params, &mut rng).unwrap();
        assert_eq!(pack.tokens.len(), pack.mask.len());

        let resume_at = pack.plan.located_at(msg_plan_n).unwrap();
        let mut u = Unpacker::new(&fmt, pack.plan.prefix(msg_plan_n), resume_at);
        u.feed_tokens(&pack.tokens[resume_at..]).unwrap();
        let code = apply_chunks(&u.result).unwrap();
        let patched = code["test.py"].concat();
        let dest = &sample.dest["test.py"];
        assert!(patched == *dest || patched == format!("{}\n", dest));
    }

    #[test]
    fn test_stopping_mid_stream_leaves_a_clean_partial_result() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let sample = expansion_sample();
        let (plan, msg_plan_n) = plan_from_sources(&sample, &DiffChunkBuilder::default());
        let mut pack = Packer::with_plan(&fmt, plan);
        let params = PackParams {
            mask_from_plan_n: msg_plan_n,
            limit_ctx_n: 400,
            limit_aux_n: 100,
            ..PackParams::default()
        };
        let mut rng = StdRng::seed_from_u64(0);
        pack.pack_context(&params, &mut rng).unwrap();
        let resume_at = pack.plan.located_at(msg_plan_n).unwrap();
        let chunk_at = pack.plan.located_at(msg_plan_n + 1).unwrap();

        // stop right after the message: the open chunk is not in the result
        let mut u = Unpacker::new(&fmt, pack.plan.prefix(msg_plan_n), resume_at);
        u.feed_tokens(&pack.tokens[resume_at..chunk_at + 4]).unwrap();
        assert_eq!(u.result.items.len(), msg_plan_n + 1);
        assert_eq!(u.result.describe(msg_plan_n), pack.plan.describe(msg_plan_n));

        // an explicit finish closes the half-received chunk as-is
        u.finish().unwrap();
        assert_eq!(u.result.items.len(), msg_plan_n + 2);
        match u.result.items.last() {
            Some(Element::Chunk(c)) => assert_eq!(c.file, None),
            other => panic!("expected a chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_stream_is_a_protocol_error() {
        let fmt = Format::new(TestEncoding::new()).unwrap();
        let mut u = Unpacker::new(&fmt, Plan::new(), 0);
        let garbage = fmt.enc().encode("plain text, no signature");
        assert!(matches!(
            u.feed_tokens(&garbage),
            Err(ProtocolError::BadSignature { .. })
        ));
        // an escape followed by an unregistered token is also fatal
        let mut u = Unpacker::new(&fmt, Plan::new(), 0);
        let mut bad = vec![fmt.escape()];
        bad.extend(fmt.enc().encode("x"));
        assert!(matches!(
            u.feed_tokens(&bad),
            Err(ProtocolError::UnknownSignature { .. })
        ));
    }
}
