//! AArch64 relocation backend for a static linker. Given parsed input sections, a resolved
//! symbol table and a link configuration, this crate sizes and fills the GOT/PLT/TLS-descriptor
//! tables, synthesises branch and erratum veneers, relaxes TLS access sequences and applies
//! every relocation, producing position-correct bytes for the driving linker to write out.

pub(crate) mod allocate;
pub(crate) mod apply;
pub mod args;
pub mod driver;
pub(crate) mod elf;
pub(crate) mod errata;
pub mod error;
pub mod input;
pub mod layout;
pub(crate) mod relax;
pub(crate) mod scan;
pub(crate) mod state;
pub(crate) mod stubs;
pub mod symbol;
pub(crate) mod tables;
#[cfg(test)]
pub(crate) mod test_support;

pub use state::LinkOutput;
pub use state::StubSectionOutput;

use args::Config;
use driver::Driver;
use error::Result;
use input::LinkInput;
use state::LinkState;
use symbol::SymbolTable;

/// Runs the whole backend pipeline for one link: scan, allocate, stub sizing to a fixed point
/// (with the erratum scans folded in), TLS relaxation, table emission, relocation application
/// and veneer construction. Strictly ordered and single-threaded; each phase depends on state
/// the previous one finalised. A link either completes or fails with its accumulated
/// diagnostics; nothing is retried.
#[tracing::instrument(skip_all, name = "Link")]
pub fn link(
    config: Config,
    input: LinkInput,
    symbols: SymbolTable,
    driver: &mut dyn Driver,
) -> Result<LinkOutput> {
    let result = run_pipeline(config, input, symbols, driver);
    if let Err(error) = &result {
        driver.error(&format!("{error:#}"));
    }
    result
}

fn run_pipeline(
    config: Config,
    input: LinkInput,
    symbols: SymbolTable,
    driver: &mut dyn Driver,
) -> Result<LinkOutput> {
    let mut state = LinkState::new(config, input, symbols);
    scan::scan_relocations(&mut state, driver)?;
    allocate::allocate_table_entries(&mut state)?;
    stubs::size_stubs(&mut state, driver)?;
    relax::relax_tls_relocations(&mut state)?;
    tables::write_table_entries(&mut state)?;
    apply::apply_relocations(&mut state, driver)?;
    stubs::build_stubs(&mut state)?;
    errata::redirect_to_veneers(&mut state)?;
    state.finish()
}
