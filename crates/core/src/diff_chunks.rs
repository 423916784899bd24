//! Builds edit chunks from (original, destination) file pairs.

use std::collections::BTreeMap;

use serde::Deserialize;
use similar::{capture_diff_slices, Algorithm, DiffTag};

use crate::chunk::ChunkElement;
use crate::element::{Element, FileId, Plan};
use crate::file_context::{split_lines, FileElement, RangeKind};
use crate::message::MsgElement;

/// Equal runs of at most this many lines between two edits are joined into
/// one chunk.
pub const DEFAULT_JOIN_THRESHOLD: usize = 3;

/// Untouched lines added symmetrically around each edit.
pub const DEFAULT_PADDING: usize = 0;

/// Turns line diffs into [`ChunkElement`]s.
#[derive(Debug, Clone)]
pub struct DiffChunkBuilder {
    pub join_threshold: usize,
    pub padding: usize,
}

impl Default for DiffChunkBuilder {
    fn default() -> Self {
        Self {
            join_threshold: DEFAULT_JOIN_THRESHOLD,
            padding: DEFAULT_PADDING,
        }
    }
}

/// One training sample: original and destination text per filename, the
/// commit message, and externally flagged point-of-interest line ranges.
#[derive(Debug, Clone, Deserialize)]
pub struct EditSample {
    pub orig: BTreeMap<String, String>,
    #[serde(default)]
    pub dest: BTreeMap<String, String>,
    pub commitmsg: String,
    #[serde(default)]
    pub poi_ranges: BTreeMap<String, Vec<(usize, usize)>>,
}

impl DiffChunkBuilder {
    pub fn new(join_threshold: usize, padding: usize) -> Self {
        Self {
            join_threshold,
            padding,
        }
    }

    /// Diff the arena file `file_id` against `dest_lines` and emit one chunk
    /// per edit, recording the touched lines on the file for context
    /// selection.
    pub fn build_chunks(
        &self,
        plan: &mut Plan,
        file_id: FileId,
        dest_lines: &[String],
    ) -> Vec<ChunkElement> {
        let orig_lines = plan.files[file_id.0].lines.clone();
        let ops = capture_diff_slices(Algorithm::Myers, &orig_lines, dest_lines);

        let mut edits: Vec<(usize, usize, usize, usize)> = Vec::new();
        let mut open: Option<(usize, usize, usize, usize)> = None;
        for op in ops {
            let (tag, old_range, new_range) = op.as_tag_tuple();
            if tag == DiffTag::Equal {
                // an edit only survives an equal run short enough to join
                if old_range.len() > self.join_threshold {
                    if let Some(e) = open.take() {
                        edits.push(e);
                    }
                }
                continue;
            }
            match open.as_mut() {
                Some(e) => {
                    // extends over the joined equal run, if any
                    e.1 = old_range.end;
                    e.3 = new_range.end;
                }
                None => {
                    open = Some((old_range.start, old_range.end, new_range.start, new_range.end));
                }
            }
        }
        if let Some(e) = open {
            edits.push(e);
        }

        let mut chunks = Vec::new();
        for (i0, i1, j0, j1) in edits {
            let pure_insert = i0 == i1;
            // pure inserts stay unpadded: with no deleted anchor text the
            // only anchor is a fragile line number
            let pad = if pure_insert { 0 } else { self.padding };
            let p0 = i0.saturating_sub(pad);
            let p1 = (i1 + pad).min(orig_lines.len());
            let mut replacement: Vec<String> = Vec::new();
            replacement.extend_from_slice(&orig_lines[p0..i0]);
            replacement.extend(dest_lines[j0..j1].iter().cloned());
            replacement.extend_from_slice(&orig_lines[i1..p1]);
            let mut ch = ChunkElement::new(file_id);
            ch.assign_from_diff(&orig_lines, p0, p1, replacement);
            let f = &mut plan.files[file_id.0];
            if pure_insert {
                f.mark_insert_point(i0);
            } else if j0 == j1 {
                f.mark_deleted(i0, i1);
            } else {
                f.mark_replaced(i0, i1);
            }
            chunks.push(ch);
        }
        chunks
    }
}

/// Build a full plan from a sample: file context first (points of interest
/// as optional ranges, edit lines as required ranges), then the commit
/// message, then the chunks in (file, line) order. Returns the plan and the
/// plan index of the instruction message.
pub fn plan_from_sources(sample: &EditSample, builder: &DiffChunkBuilder) -> (Plan, usize) {
    let mut plan = Plan::new();
    let mut chunks: Vec<ChunkElement> = Vec::new();
    for (filename, text) in &sample.orig {
        let fid = plan.add_file(FileElement::from_text(filename, text));
        if let Some(dest_text) = sample.dest.get(filename) {
            if dest_text != text {
                let dest_lines = split_lines(dest_text);
                chunks.extend(builder.build_chunks(&mut plan, fid, &dest_lines));
            }
        }
        if let Some(ranges) = sample.poi_ranges.get(filename) {
            for &(line0, line1) in ranges {
                plan.files[fid.0].add_expanding_range(line0, line1, RangeKind::Optional);
            }
        }
        plan.files[fid.0].seed_required_ranges(builder.padding);
    }
    let msg_plan_n = plan.push(Element::Msg(MsgElement::user(sample.commitmsg.clone())));
    for ch in chunks {
        plan.push(Element::Chunk(ch));
    }
    (plan, msg_plan_n)
}
