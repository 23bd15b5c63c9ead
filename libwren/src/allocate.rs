//! Second pass: turns the scanner's classification into concrete offsets. One walk assigns PLT
//! slots, a second assigns GOT and TLS-descriptor slots and counts the dynamic relocations each
//! slot will need. After this pass every table size is final; only stub sections can still
//! grow.

use crate::args::Config;
use crate::elf::GOT_ENTRY_SIZE;
use crate::elf::GOT_PLT_RESERVED_ENTRIES;
use crate::elf::PLT_ENTRY_SIZE;
use crate::elf::PLT_HEADER_SIZE;
use crate::elf::PLT_TLSDESC_ENTRY_SIZE;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::state::LinkState;
use crate::symbol::GotKinds;
use crate::symbol::SymbolDefinition;
use crate::symbol::SymbolEntry;

#[tracing::instrument(skip_all, name = "Allocate GOT and PLT")]
pub(crate) fn allocate_table_entries(state: &mut LinkState) -> Result {
    let LinkState {
        config,
        symbols,
        layout,
        uses_tlsld,
        ..
    } = state;

    let refs = symbols.all_refs();

    // First walk: PLT. The header is materialised once, lazily, so links with no PLT users
    // produce no `.plt` at all.
    for &symbol in &refs {
        let entry = symbols.entry_mut(symbol);
        if entry.plt_refcount == 0 || !needs_plt_entry(entry, config) {
            continue;
        }
        if layout.plt.size == 0 {
            layout.plt.size = PLT_HEADER_SIZE;
            reserve_got_plt_header(layout);
        }
        entry.plt_offset = Some(layout.plt.size);
        layout.plt.size += PLT_ENTRY_SIZE;
        entry.got_plt_offset = Some(layout.got_plt.size);
        layout.got_plt.size += GOT_ENTRY_SIZE;
        layout.rela_plt_count += 1;
    }

    // Second walk: GOT, TLS-descriptor GOT and their dynamic relocation counts.
    let mut any_tlsdesc = false;
    for &symbol in &refs {
        let entry = symbols.entry_mut(symbol);
        if entry.got_refcount == 0 {
            continue;
        }
        let kinds = entry.got_kinds;
        if kinds.is_empty() {
            continue;
        }
        if kinds.contains(GotKinds::TLS_IE) && kinds.any_gd() {
            fail!(
                LinkFailure::InternalInconsistency,
                "symbol {} holds both general-dynamic and initial-exec reservations",
                entry.name
            );
        }
        if kinds.contains(GotKinds::NORMAL) && kinds.intersects(!GotKinds::NORMAL) {
            fail!(
                LinkFailure::InternalInconsistency,
                "symbol {} is classified as both TLS and non-TLS",
                entry.name
            );
        }

        if kinds.contains(GotKinds::TLSDESC_GD) {
            any_tlsdesc = true;
            reserve_got_plt_header(layout);
            entry.tlsdesc_got.reserve(layout.got_plt.size)?;
            layout.got_plt.size += GOT_ENTRY_SIZE * 2;
            // The descriptor pair is filled by the runtime through a .rela.plt entry.
            layout.rela_plt_count += 1;
        }

        if kinds.contains(GotKinds::TLS_GD) {
            entry.got.reserve(layout.got.size)?;
            layout.got.size += GOT_ENTRY_SIZE * 2;
            if tls_gd_needs_module_reloc(entry, config) {
                layout.rela_dyn_count += 1;
            }
            if tls_gd_needs_offset_reloc(entry) {
                layout.rela_dyn_count += 1;
            }
        }

        if kinds.contains(GotKinds::TLS_IE) {
            entry.got.reserve(layout.got.size)?;
            layout.got.size += GOT_ENTRY_SIZE;
            if tls_ie_needs_reloc(entry, config) {
                layout.rela_dyn_count += 1;
            }
        }

        if kinds.contains(GotKinds::NORMAL) {
            entry.got.reserve(layout.got.size)?;
            layout.got.size += GOT_ENTRY_SIZE;
            if got_entry_dynamic_reloc(entry, config).is_some() {
                layout.rela_dyn_count += 1;
            }
        }
    }

    if *uses_tlsld {
        layout.tlsld_got_offset = Some(layout.got.size);
        layout.got.size += GOT_ENTRY_SIZE * 2;
        if config.output_kind.is_shared_object() {
            layout.rela_dyn_count += 1;
        }
    }

    // The lazy-resolution trampoline is sized once, globally, only when a descriptor exists.
    if any_tlsdesc {
        if layout.plt.size == 0 {
            layout.plt.size = PLT_HEADER_SIZE;
        }
        layout.tlsdesc_plt_offset = Some(layout.plt.size);
        layout.plt.size += PLT_TLSDESC_ENTRY_SIZE;
        layout.tlsdesc_got_offset = Some(layout.got.size);
        layout.got.size += GOT_ENTRY_SIZE;
    }

    tracing::debug!(
        got = layout.got.size,
        got_plt = layout.got_plt.size,
        plt = layout.plt.size,
        rela_dyn = layout.rela_dyn_count,
        rela_plt = layout.rela_plt_count,
        "table allocation complete"
    );
    Ok(())
}

fn reserve_got_plt_header(layout: &mut crate::layout::Layout) {
    if layout.got_plt.size == 0 {
        layout.got_plt.size = GOT_PLT_RESERVED_ENTRIES * GOT_ENTRY_SIZE;
    }
}

fn needs_plt_entry(entry: &SymbolEntry, config: &Config) -> bool {
    if entry.is_undefined_weak() {
        return config.output_kind.is_shared_object();
    }
    entry.is_dynamic() || entry.is_interposable(config.output_kind)
}

/// For executables the TLS module id is known at link time; shared objects and imported
/// symbols need the runtime to fill it in.
pub(crate) fn tls_gd_needs_module_reloc(entry: &SymbolEntry, config: &Config) -> bool {
    config.output_kind.is_shared_object() || entry.is_dynamic()
}

pub(crate) fn tls_gd_needs_offset_reloc(entry: &SymbolEntry) -> bool {
    entry.is_dynamic()
}

pub(crate) fn tls_ie_needs_reloc(entry: &SymbolEntry, config: &Config) -> bool {
    config.output_kind.is_shared_object() || entry.is_dynamic()
}

/// The dynamic relocation (if any) that will sit under a symbol's ordinary GOT word.
pub(crate) fn got_entry_dynamic_reloc(
    entry: &SymbolEntry,
    config: &Config,
) -> Option<linker_utils::elf::DynamicRelocationKind> {
    if entry.is_dynamic() || (entry.is_interposable(config.output_kind) && !entry.is_undefined_weak())
    {
        return Some(linker_utils::elf::DynamicRelocationKind::GotEntry);
    }
    if config.output_kind.is_relocatable()
        && matches!(entry.definition, SymbolDefinition::Section { .. })
    {
        return Some(linker_utils::elf::DynamicRelocationKind::Relative);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::OutputKind;
    use crate::driver::testing::RecordingDriver;
    use crate::input::FileId;
    use crate::input::InputFile;
    use crate::input::LinkInput;
    use crate::input::Relocation;
    use crate::scan::scan_relocations;
    use crate::symbol::GotSlot;
    use crate::symbol::SymbolRef;
    use crate::symbol::SymbolTable;
    use crate::test_support;
    use object::elf;

    fn state_for(relocs: Vec<Relocation>, symbols: SymbolTable) -> LinkState {
        let mut section = test_support::exec_section(".text", vec![0; 64]);
        section.relocations = relocs;
        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![section],
        }]);
        LinkState::new(
            crate::args::Config::new(OutputKind::SharedObject),
            input,
            symbols,
        )
    }

    fn tls_reloc(r_type: u32, offset: u64, target: SymbolRef) -> Relocation {
        Relocation {
            r_type,
            offset,
            addend: 0,
            target,
        }
    }

    #[test]
    fn tls_gd_reserves_two_consecutive_words() {
        let mut symbols = SymbolTable::new();
        let a = symbols.add_global(
            crate::symbol::SymbolEntry::new("a", SymbolDefinition::Dynamic).with_dynamic_index(1),
        );
        let b = symbols.add_global(
            crate::symbol::SymbolEntry::new("b", SymbolDefinition::Dynamic).with_dynamic_index(2),
        );
        let mut state = state_for(
            vec![
                tls_reloc(elf::R_AARCH64_TLSGD_ADR_PAGE21, 0, SymbolRef::Global(a)),
                tls_reloc(elf::R_AARCH64_TLSGD_ADR_PAGE21, 8, SymbolRef::Global(b)),
            ],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();
        allocate_table_entries(&mut state).unwrap();

        assert_eq!(
            state.symbols.entry(SymbolRef::Global(a)).got,
            GotSlot::Reserved(0)
        );
        assert_eq!(
            state.symbols.entry(SymbolRef::Global(b)).got,
            GotSlot::Reserved(16)
        );
        assert_eq!(state.layout.got.size, 32);
    }

    #[test]
    fn ie_access_collapses_gd_to_one_word() {
        let mut symbols = SymbolTable::new();
        let a = symbols.add_global(
            crate::symbol::SymbolEntry::new("a", SymbolDefinition::Dynamic).with_dynamic_index(1),
        );
        let mut state = state_for(
            vec![
                tls_reloc(elf::R_AARCH64_TLSGD_ADR_PAGE21, 0, SymbolRef::Global(a)),
                tls_reloc(
                    elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21,
                    8,
                    SymbolRef::Global(a),
                ),
            ],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();
        allocate_table_entries(&mut state).unwrap();

        let entry = state.symbols.entry(SymbolRef::Global(a));
        assert_eq!(entry.got_kinds, GotKinds::TLS_IE);
        assert_eq!(entry.got, GotSlot::Reserved(0));
        assert_eq!(state.layout.got.size, GOT_ENTRY_SIZE);
    }

    #[test]
    fn unreferenced_symbols_get_no_entries() {
        let mut symbols = SymbolTable::new();
        let unused = symbols.add_global(
            crate::symbol::SymbolEntry::new("unused", SymbolDefinition::Dynamic)
                .with_dynamic_index(1),
        );
        let mut state = state_for(vec![], symbols);
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();
        allocate_table_entries(&mut state).unwrap();

        let entry = state.symbols.entry(SymbolRef::Global(unused));
        assert_eq!(entry.plt_offset, None);
        assert_eq!(entry.got, GotSlot::Unassigned);
        assert_eq!(state.layout.got.size, 0);
        assert_eq!(state.layout.plt.size, 0);
        assert_eq!(state.layout.got_plt.size, 0);
    }

    #[test]
    fn tlsdesc_sizes_trampoline_once() {
        let mut symbols = SymbolTable::new();
        let a = symbols.add_global(
            crate::symbol::SymbolEntry::new("a", SymbolDefinition::Dynamic).with_dynamic_index(1),
        );
        let b = symbols.add_global(
            crate::symbol::SymbolEntry::new("b", SymbolDefinition::Dynamic).with_dynamic_index(2),
        );
        let mut state = state_for(
            vec![
                tls_reloc(elf::R_AARCH64_TLSDESC_ADR_PAGE21, 0, SymbolRef::Global(a)),
                tls_reloc(elf::R_AARCH64_TLSDESC_ADR_PAGE21, 8, SymbolRef::Global(b)),
            ],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();
        allocate_table_entries(&mut state).unwrap();

        // Reserved words, then one descriptor pair per symbol.
        let reserved = GOT_PLT_RESERVED_ENTRIES * GOT_ENTRY_SIZE;
        assert_eq!(
            state.symbols.entry(SymbolRef::Global(a)).tlsdesc_got,
            GotSlot::Reserved(reserved)
        );
        assert_eq!(
            state.symbols.entry(SymbolRef::Global(b)).tlsdesc_got,
            GotSlot::Reserved(reserved + 16)
        );
        assert_eq!(state.layout.got_plt.size, reserved + 32);
        // One trampoline and one resolver word regardless of descriptor count.
        assert_eq!(state.layout.tlsdesc_plt_offset, Some(PLT_HEADER_SIZE));
        assert_eq!(state.layout.plt.size, PLT_HEADER_SIZE + PLT_TLSDESC_ENTRY_SIZE);
        assert_eq!(state.layout.got.size, GOT_ENTRY_SIZE);
        assert_eq!(state.layout.tlsdesc_got_offset, Some(0));
        assert_eq!(state.layout.rela_plt_count, 2);
    }

    #[test]
    fn local_tls_in_shared_object_counts_module_reloc_only() {
        let mut symbols = SymbolTable::new();
        symbols.set_local_symbols(
            FileId(0),
            vec![crate::symbol::SymbolEntry::new(
                "tv",
                SymbolDefinition::Section {
                    section: crate::input::SectionId::new(FileId(0), 0),
                    value: 0,
                },
            )],
        );
        let target = SymbolRef::Local {
            file: FileId(0),
            index: 0,
        };
        let mut state = state_for(
            vec![tls_reloc(elf::R_AARCH64_TLSGD_ADR_PAGE21, 0, target)],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();
        allocate_table_entries(&mut state).unwrap();

        // Module id needs runtime resolution in a shared object; the offset is known.
        assert_eq!(state.layout.rela_dyn_count, 1);
        assert_eq!(state.layout.got.size, 16);
    }
}
