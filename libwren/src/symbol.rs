//! One symbol abstraction for both global and local symbols. Global symbols live in a single
//! table; local symbols live in one array per input file. Both carry the same GOT/PLT/TLS
//! bookkeeping, so the scanner, allocator and applier are written once against [`SymbolRef`].

use crate::args::OutputKind;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::input::FileId;
use crate::input::SectionId;
use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalSymbolId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolRef {
    Global(GlobalSymbolId),
    Local { file: FileId, index: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolDefinition {
    Undefined { weak: bool },
    Absolute(u64),
    Section { section: SectionId, value: u64 },
    /// Defined by a shared object; the address is unknown until runtime.
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Protected,
    Hidden,
}

bitflags! {
    /// Which kinds of GOT storage a symbol needs. A symbol accessed through more than one TLS
    /// model keeps a bit per model, except that initial-exec displaces the general-dynamic
    /// forms.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct GotKinds: u8 {
        const NORMAL = 1 << 0;
        const TLS_GD = 1 << 1;
        const TLS_IE = 1 << 2;
        const TLSDESC_GD = 1 << 3;
    }
}

impl GotKinds {
    pub(crate) fn any_gd(self) -> bool {
        self.intersects(GotKinds::TLS_GD | GotKinds::TLSDESC_GD)
    }
}

/// Lifecycle of one GOT slot: reserved by the allocator, initialised exactly once when its
/// content is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum GotSlot {
    #[default]
    Unassigned,
    Reserved(u64),
    Initialized(u64),
}

impl GotSlot {
    pub(crate) fn offset(self) -> Option<u64> {
        match self {
            GotSlot::Unassigned => None,
            GotSlot::Reserved(offset) | GotSlot::Initialized(offset) => Some(offset),
        }
    }

    pub(crate) fn reserve(&mut self, offset: u64) -> Result {
        match self {
            GotSlot::Unassigned => {
                *self = GotSlot::Reserved(offset);
                Ok(())
            }
            _ => fail!(
                LinkFailure::InternalInconsistency,
                "GOT slot reserved twice ({self:?})"
            ),
        }
    }

    pub(crate) fn initialize(&mut self) -> Result<u64> {
        match *self {
            GotSlot::Reserved(offset) => {
                *self = GotSlot::Initialized(offset);
                Ok(offset)
            }
            GotSlot::Unassigned => fail!(
                LinkFailure::InternalInconsistency,
                "attempted to initialise an unreserved GOT slot"
            ),
            GotSlot::Initialized(_) => fail!(
                LinkFailure::InternalInconsistency,
                "GOT slot initialised twice"
            ),
        }
    }
}

#[derive(Debug)]
pub struct SymbolEntry {
    pub name: String,
    pub definition: SymbolDefinition,
    pub visibility: Visibility,
    /// Index in the output dynamic symbol table, for symbols that have one.
    pub dynamic_index: Option<u32>,

    pub(crate) is_local: bool,
    pub(crate) got_kinds: GotKinds,
    pub(crate) got_refcount: u32,
    pub(crate) plt_refcount: u32,
    pub(crate) direct_refcount: u32,
    pub(crate) got: GotSlot,
    pub(crate) tlsdesc_got: GotSlot,
    pub(crate) plt_offset: Option<u64>,
    pub(crate) got_plt_offset: Option<u64>,
}

impl SymbolEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, definition: SymbolDefinition) -> Self {
        Self {
            name: name.into(),
            definition,
            visibility: Visibility::Default,
            dynamic_index: None,
            is_local: false,
            got_kinds: GotKinds::empty(),
            got_refcount: 0,
            plt_refcount: 0,
            direct_refcount: 0,
            got: GotSlot::Unassigned,
            tlsdesc_got: GotSlot::Unassigned,
            plt_offset: None,
            got_plt_offset: None,
        }
    }

    #[must_use]
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    #[must_use]
    pub fn with_dynamic_index(mut self, index: u32) -> Self {
        self.dynamic_index = Some(index);
        self
    }

    #[must_use]
    pub(crate) fn is_dynamic(&self) -> bool {
        matches!(self.definition, SymbolDefinition::Dynamic)
    }

    #[must_use]
    pub(crate) fn is_undefined_weak(&self) -> bool {
        matches!(self.definition, SymbolDefinition::Undefined { weak: true })
    }

    /// Whether another module may provide the definition used at runtime.
    #[must_use]
    pub(crate) fn is_interposable(&self, output_kind: OutputKind) -> bool {
        if self.is_local || self.visibility != Visibility::Default {
            return false;
        }
        match self.definition {
            SymbolDefinition::Dynamic => true,
            SymbolDefinition::Undefined { .. } => true,
            SymbolDefinition::Absolute(_) | SymbolDefinition::Section { .. } => {
                output_kind.is_shared_object()
            }
        }
    }

    /// Whether the definition this link sees is the one the program will use, which is what
    /// decides between the local-exec and initial-exec TLS models.
    #[must_use]
    pub(crate) fn resolves_locally(&self, output_kind: OutputKind) -> bool {
        match self.definition {
            SymbolDefinition::Absolute(_) | SymbolDefinition::Section { .. } => {
                !self.is_interposable(output_kind)
            }
            SymbolDefinition::Dynamic | SymbolDefinition::Undefined { .. } => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct SymbolTable {
    globals: Vec<SymbolEntry>,
    locals: Vec<Vec<SymbolEntry>>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_global(&mut self, entry: SymbolEntry) -> GlobalSymbolId {
        let id = GlobalSymbolId(self.globals.len() as u32);
        self.globals.push(entry);
        id
    }

    /// Installs the local symbol array for `file`. Files must be registered in order.
    pub fn set_local_symbols(&mut self, file: FileId, mut entries: Vec<SymbolEntry>) {
        for entry in &mut entries {
            entry.is_local = true;
        }
        assert_eq!(file.as_usize(), self.locals.len());
        self.locals.push(entries);
    }

    #[must_use]
    pub fn entry(&self, symbol: SymbolRef) -> &SymbolEntry {
        match symbol {
            SymbolRef::Global(id) => &self.globals[id.0 as usize],
            SymbolRef::Local { file, index } => &self.locals[file.as_usize()][index as usize],
        }
    }

    #[must_use]
    pub(crate) fn entry_mut(&mut self, symbol: SymbolRef) -> &mut SymbolEntry {
        match symbol {
            SymbolRef::Global(id) => &mut self.globals[id.0 as usize],
            SymbolRef::Local { file, index } => {
                &mut self.locals[file.as_usize()][index as usize]
            }
        }
    }

    /// All symbols, globals first, then per-file locals, in a deterministic order.
    pub(crate) fn all_refs(&self) -> Vec<SymbolRef> {
        let globals = (0..self.globals.len() as u32).map(|i| SymbolRef::Global(GlobalSymbolId(i)));
        let locals = self.locals.iter().enumerate().flat_map(|(file, entries)| {
            (0..entries.len() as u32).map(move |index| SymbolRef::Local {
                file: FileId(file as u32),
                index,
            })
        });
        globals.chain(locals).collect()
    }

    /// The link-time address a symbol resolves to. Undefined and runtime-resolved symbols
    /// resolve to zero.
    #[must_use]
    pub(crate) fn address_of(&self, symbol: SymbolRef, layout: &crate::layout::Layout) -> u64 {
        match self.entry(symbol).definition {
            SymbolDefinition::Section { section, value } => layout.place(section, value),
            SymbolDefinition::Absolute(value) => value,
            SymbolDefinition::Undefined { .. } | SymbolDefinition::Dynamic => 0,
        }
    }

    /// Human-readable name for diagnostics. Anonymous locals are shown by their table position.
    #[must_use]
    pub(crate) fn name_for_display(&self, symbol: SymbolRef) -> String {
        let entry = self.entry(symbol);
        if entry.name.is_empty() {
            match symbol {
                SymbolRef::Global(id) => format!("<global {}>", id.0),
                SymbolRef::Local { file, index } => format!("<local {}:{index}>", file.0),
            }
        } else {
            entry.name.clone()
        }
    }
}
