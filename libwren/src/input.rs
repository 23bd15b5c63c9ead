//! The in-memory view of the inputs the object-file layer hands us: section byte buffers with
//! their relocation lists, and per-section span maps separating instructions from data.

use crate::symbol::SymbolRef;
use linker_utils::elf::SectionFlags;
use smallvec::SmallVec;
use smallvec::smallvec;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u32);

impl FileId {
    #[must_use]
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId {
    pub file: FileId,
    pub index: u32,
}

impl SectionId {
    #[must_use]
    pub fn new(file: FileId, index: u32) -> Self {
        Self { file, index }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.0, self.index)
    }
}

/// One relocation record as parsed from an input object.
#[derive(Debug, Clone)]
pub struct Relocation {
    pub r_type: u32,
    /// Byte offset within the containing section.
    pub offset: u64,
    pub addend: i64,
    pub target: SymbolRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Code,
    Data,
}

/// Ordered (offset, kind) boundaries within a section, derived from the assembler's mapping
/// symbols. The erratum scanner must never decode data as code.
#[derive(Debug, Clone)]
pub struct SectionSpanMap {
    boundaries: SmallVec<[(u64, SpanKind); 4]>,
}

impl SectionSpanMap {
    /// A map marking the entire section as instructions.
    #[must_use]
    pub fn all_code() -> Self {
        Self {
            boundaries: smallvec![(0, SpanKind::Code)],
        }
    }

    /// `boundaries` must be sorted by offset; each entry starts a span of the given kind that
    /// runs to the next entry (or the end of the section).
    #[must_use]
    pub fn new(boundaries: Vec<(u64, SpanKind)>) -> Self {
        debug_assert!(boundaries.windows(2).all(|w| w[0].0 <= w[1].0));
        Self {
            boundaries: SmallVec::from_vec(boundaries),
        }
    }

    /// Iterates the instruction spans of a section of `len` bytes.
    pub fn code_spans(&self, len: u64) -> impl Iterator<Item = Range<u64>> + '_ {
        self.boundaries
            .iter()
            .enumerate()
            .filter(|(_, (_, kind))| *kind == SpanKind::Code)
            .map(move |(i, (start, _))| {
                let end = self.boundaries.get(i + 1).map_or(len, |(next, _)| *next);
                *start..end
            })
            .filter(|span| !span.is_empty())
    }
}

#[derive(Debug)]
pub struct InputSection {
    pub name: String,
    pub data: Vec<u8>,
    pub flags: SectionFlags,
    pub alignment: u64,
    pub relocations: Vec<Relocation>,
    pub spans: SectionSpanMap,
}

impl InputSection {
    #[must_use]
    pub fn new(name: impl Into<String>, data: Vec<u8>, flags: SectionFlags) -> Self {
        Self {
            name: name.into(),
            data,
            flags,
            alignment: 4,
            relocations: Vec::new(),
            spans: SectionSpanMap::all_code(),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.flags.contains(linker_utils::elf::shf::EXECINSTR)
    }
}

#[derive(Debug)]
pub struct InputFile {
    pub name: String,
    pub sections: Vec<InputSection>,
}

#[derive(Debug, Default)]
pub struct LinkInput {
    pub files: Vec<InputFile>,
}

impl LinkInput {
    #[must_use]
    pub fn new(files: Vec<InputFile>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn section(&self, id: SectionId) -> &InputSection {
        &self.files[id.file.as_usize()].sections[id.index as usize]
    }

    #[must_use]
    pub(crate) fn section_mut(&mut self, id: SectionId) -> &mut InputSection {
        &mut self.files[id.file.as_usize()].sections[id.index as usize]
    }

    #[must_use]
    pub fn file(&self, id: FileId) -> &InputFile {
        &self.files[id.as_usize()]
    }

    /// Iterates all section ids in link order.
    pub(crate) fn section_ids(&self) -> impl Iterator<Item = SectionId> + '_ {
        self.files.iter().enumerate().flat_map(|(file_idx, file)| {
            (0..file.sections.len() as u32)
                .map(move |index| SectionId::new(FileId(file_idx as u32), index))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_spans_skip_data() {
        let map = SectionSpanMap::new(vec![
            (0, SpanKind::Code),
            (16, SpanKind::Data),
            (24, SpanKind::Code),
        ]);
        let spans: Vec<_> = map.code_spans(40).collect();
        assert_eq!(spans, vec![0..16, 24..40]);
    }

    #[test]
    fn empty_trailing_span_is_dropped() {
        let map = SectionSpanMap::new(vec![(0, SpanKind::Data), (32, SpanKind::Code)]);
        let spans: Vec<_> = map.code_spans(32).collect();
        assert!(spans.is_empty());
    }
}
