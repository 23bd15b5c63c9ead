//! The aggregate state owned by one link invocation. Passed by reference through the pipeline;
//! nothing here outlives the link.

use crate::args::Config;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::input::InputFile;
use crate::input::LinkInput;
use crate::input::SectionId;
use crate::layout::Layout;
use crate::stubs::StubTable;
use crate::symbol::SymbolTable;
use crate::tables::OutputTables;

/// Errors reported through driver callbacks. They don't abort the pass that found them, so that
/// all of them are surfaced in one run, but any of them fails the link at the end.
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub(crate) reported_errors: u32,
    first_failure: Option<LinkFailure>,
}

impl Diagnostics {
    pub(crate) fn report(&mut self, kind: LinkFailure) {
        self.reported_errors += 1;
        self.first_failure.get_or_insert(kind);
    }
}

pub(crate) struct LinkState {
    pub(crate) config: Config,
    pub(crate) input: LinkInput,
    pub(crate) symbols: SymbolTable,
    pub(crate) layout: Layout,
    pub(crate) stubs: StubTable,
    pub(crate) tables: OutputTables,
    /// Contents of each stub section, produced once sizing has converged.
    pub(crate) stub_bytes: Vec<Vec<u8>>,
    /// Whether any local-dynamic TLS access survived scanning, requiring the shared module-id
    /// GOT pair.
    pub(crate) uses_tlsld: bool,
    pub(crate) diagnostics: Diagnostics,
}

impl LinkState {
    #[must_use]
    pub(crate) fn new(config: Config, input: LinkInput, symbols: SymbolTable) -> Self {
        Self {
            config,
            layout: Layout::new(&input),
            input,
            symbols,
            stubs: StubTable::default(),
            tables: OutputTables::default(),
            stub_bytes: Vec::new(),
            uses_tlsld: false,
            diagnostics: Diagnostics::default(),
        }
    }

    pub(crate) fn finish(self) -> Result<LinkOutput> {
        if self.diagnostics.reported_errors > 0 {
            let kind = self
                .diagnostics
                .first_failure
                .unwrap_or(LinkFailure::UndefinedSymbol);
            fail!(
                kind,
                "linking failed with {} reported errors",
                self.diagnostics.reported_errors
            );
        }

        let stub_sections = self
            .layout
            .stub_sections
            .iter()
            .zip(self.stub_bytes)
            .map(|(section, bytes)| StubSectionOutput {
                address: section.address,
                after_section: section.after_section,
                bytes,
            })
            .collect();

        Ok(LinkOutput {
            files: self.input.files,
            stub_sections,
            got: self.tables.got_bytes(),
            got_plt: self.tables.got_plt_bytes(),
            plt: self.tables.plt_bytes(),
            got_address: self.layout.got.address,
            got_plt_address: self.layout.got_plt.address,
            plt_address: self.layout.plt.address,
            rela_dyn: self.tables.rela_dyn_bytes(),
            rela_plt: self.tables.rela_plt_bytes(),
        })
    }
}

/// Everything this backend produces: input sections with relocations applied, synthesised stub
/// sections, table contents, and the dynamic relocation records.
#[derive(Debug)]
pub struct LinkOutput {
    pub files: Vec<InputFile>,
    pub stub_sections: Vec<StubSectionOutput>,
    pub got: Vec<u8>,
    pub got_plt: Vec<u8>,
    pub plt: Vec<u8>,
    pub got_address: u64,
    pub got_plt_address: u64,
    pub plt_address: u64,
    pub rela_dyn: Vec<u8>,
    pub rela_plt: Vec<u8>,
}

#[derive(Debug)]
pub struct StubSectionOutput {
    pub address: u64,
    pub after_section: SectionId,
    pub bytes: Vec<u8>,
}
