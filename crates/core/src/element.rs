//! Plan structure: the ordered element sequence and the file arena.

use crate::chunk::ChunkElement;
use crate::file_context::FileElement;
use crate::message::MsgElement;

/// Handle into a [`Plan`]'s file arena. Chunks reference their owning file
/// through this instead of a shared pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub usize);

/// One typed unit of the wire protocol.
#[derive(Debug, Clone)]
pub enum Element {
    File(FileId),
    Msg(MsgElement),
    Chunk(ChunkElement),
}

/// Ordered sequence of elements representing one packed prompt/response
/// instance. Owns every `FileElement` in an arena so that chunks can refer
/// back to files by id.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub files: Vec<FileElement>,
    pub items: Vec<Element>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the arena and append it to the element sequence.
    pub fn add_file(&mut self, file: FileElement) -> FileId {
        let id = FileId(self.files.len());
        self.files.push(file);
        self.items.push(Element::File(id));
        id
    }

    /// Append an element, returning its plan index.
    pub fn push(&mut self, el: Element) -> usize {
        self.items.push(el);
        self.items.len() - 1
    }

    pub fn file(&self, id: FileId) -> &FileElement {
        &self.files[id.0]
    }

    pub fn file_mut(&mut self, id: FileId) -> &mut FileElement {
        &mut self.files[id.0]
    }

    /// Clone the first `n` elements (the arena is kept whole so file handles
    /// stay valid). Used to seed an unpacker with the known context.
    pub fn prefix(&self, n: usize) -> Plan {
        Plan {
            files: self.files.clone(),
            items: self.items[..n.min(self.items.len())].to_vec(),
        }
    }

    /// Token offset the element at `plan_n` was packed or unpacked at.
    pub fn located_at(&self, plan_n: usize) -> Option<usize> {
        match &self.items[plan_n] {
            Element::File(id) => self.files[id.0].located_at,
            Element::Msg(m) => m.located_at,
            Element::Chunk(c) => c.located_at,
        }
    }

    /// One-line structural description of an element, stable enough to
    /// compare plans in tests.
    pub fn describe(&self, plan_n: usize) -> String {
        match &self.items[plan_n] {
            Element::File(id) => {
                let f = &self.files[id.0];
                format!(
                    "FILE {} lines={} located_at={:?}",
                    f.filename,
                    f.lines.len(),
                    f.located_at
                )
            }
            Element::Msg(m) => {
                format!("MSG {} {:?} located_at={:?}", m.role, m.text, m.located_at)
            }
            Element::Chunk(c) => {
                let filename = c
                    .file
                    .map(|id| self.files[id.0].filename.as_str())
                    .unwrap_or("?");
                format!(
                    "CHUNK {}:{:04} fuzzy={} del={:?} ins={:?} located_at={:?}",
                    filename, c.line_n, c.fuzzy, c.to_del, c.to_ins, c.located_at
                )
            }
        }
    }

    pub fn dump(&self) -> String {
        (0..self.items.len())
            .map(|i| self.describe(i))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
