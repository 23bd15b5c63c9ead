//! First pass over every relocation in every input section. Classifies each referenced symbol's
//! required auxiliary storage (GOT, PLT, TLS descriptor) and accumulates reference counts so
//! the allocator can size the tables in one sweep. Ordering only affects diagnostics, never
//! results.

use crate::driver::Driver;
use crate::driver::Location;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::relax::scanned_relocation_type;
use crate::state::LinkState;
use crate::symbol::GotKinds;
use crate::symbol::SymbolDefinition;
use linker_utils::elf::RelocationKind;
use linker_utils::elf::RelocationKindInfo;
use linker_utils::elf::RelocationSize;
use linker_utils::elf::aarch64_rel_type_to_string;

/// The per-architecture classification of which GOT storage a relocation demands. This table is
/// hand-authored; it is a semantic property of the relocation, not derivable from its bit
/// geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GotClass {
    Normal,
    TlsGd,
    TlsIe,
    TlsDescGd,
}

#[must_use]
pub(crate) fn reloc_got_class(kind: RelocationKind) -> Option<GotClass> {
    match kind {
        RelocationKind::Got | RelocationKind::GotRelative => Some(GotClass::Normal),
        RelocationKind::TlsGd | RelocationKind::TlsGdGot => Some(GotClass::TlsGd),
        RelocationKind::GotTpOff | RelocationKind::GotTpOffGot => Some(GotClass::TlsIe),
        RelocationKind::TlsDesc | RelocationKind::TlsDescGot | RelocationKind::TlsDescCall => {
            Some(GotClass::TlsDescGd)
        }
        _ => None,
    }
}

fn merge_got_kinds(kinds: &mut GotKinds, class: GotClass) {
    match class {
        GotClass::Normal => *kinds |= GotKinds::NORMAL,
        GotClass::TlsGd => *kinds |= GotKinds::TLS_GD,
        GotClass::TlsIe => *kinds |= GotKinds::TLS_IE,
        GotClass::TlsDescGd => *kinds |= GotKinds::TLSDESC_GD,
    }
    // When a symbol is reached through both the initial-exec and any general-dynamic model, the
    // general-dynamic accesses can legally load through the initial-exec slot instead, so the
    // double-word reservation is dropped.
    if kinds.contains(GotKinds::TLS_IE) {
        kinds.remove(GotKinds::TLS_GD | GotKinds::TLSDESC_GD);
    }
}

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_relocations(state: &mut LinkState, driver: &mut dyn Driver) -> Result {
    let LinkState {
        config,
        input,
        symbols,
        layout,
        uses_tlsld,
        diagnostics,
        ..
    } = state;

    for file in &input.files {
        for section in &file.sections {
            for rel in &section.relocations {
                let entry = symbols.entry(rel.target);
                let r_type = scanned_relocation_type(
                    rel.r_type,
                    entry.resolves_locally(config.output_kind),
                    config,
                );
                let Some(info) = linker_utils::aarch64::relocation_type_from_raw(r_type) else {
                    fail!(
                        LinkFailure::BadRelocation,
                        "unsupported relocation type {} at {}",
                        aarch64_rel_type_to_string(rel.r_type),
                        Location {
                            file: &file.name,
                            section: &section.name,
                            offset: rel.offset,
                        }
                    );
                };

                if let SymbolDefinition::Undefined { weak: false } = entry.definition {
                    driver.undefined_symbol(
                        &symbols.name_for_display(rel.target),
                        &Location {
                            file: &file.name,
                            section: &section.name,
                            offset: rel.offset,
                        },
                    );
                    diagnostics.report(LinkFailure::UndefinedSymbol);
                }

                check_output_kind(config, &info, r_type, symbols, rel)?;

                match info.kind {
                    RelocationKind::TlsLd | RelocationKind::TlsLdGot => {
                        // The module-id pair is shared by every local-dynamic access, not
                        // per-symbol.
                        *uses_tlsld = true;
                    }
                    RelocationKind::PltRelative => {
                        symbols.entry_mut(rel.target).plt_refcount += 1;
                    }
                    _ => {
                        if let Some(class) = reloc_got_class(info.kind) {
                            let entry = symbols.entry_mut(rel.target);
                            entry.got_refcount += 1;
                            merge_got_kinds(&mut entry.got_kinds, class);
                        } else if info.kind != RelocationKind::None {
                            // Non-GOT references feed later copy-relocation decisions.
                            symbols.entry_mut(rel.target).direct_refcount += 1;
                        }
                    }
                }

                // Absolute words holding addresses need dynamic relocations in
                // position-independent output; reserve the records now.
                if needs_absolute_dynamic_reloc(config, &info, symbols.entry(rel.target)) {
                    layout.rela_dyn_count += 1;
                }
            }
        }
    }

    tracing::debug!(
        rela_dyn = layout.rela_dyn_count,
        uses_tlsld = *uses_tlsld,
        "relocation scan complete"
    );
    Ok(())
}

/// Whether an absolute data relocation will be accompanied by a dynamic relocation when
/// applied. Must agree exactly with the applier's emission logic.
pub(crate) fn needs_absolute_dynamic_reloc(
    config: &crate::args::Config,
    info: &RelocationKindInfo,
    entry: &crate::symbol::SymbolEntry,
) -> bool {
    if info.kind != RelocationKind::Absolute || info.size != RelocationSize::ByteSize(8) {
        return false;
    }
    if entry.is_dynamic() {
        return true;
    }
    config.output_kind.is_relocatable()
        && matches!(entry.definition, SymbolDefinition::Section { .. })
}

/// Position-dependent data relocations cannot be represented in position-independent output
/// unless they span a full word.
fn check_output_kind(
    config: &crate::args::Config,
    info: &RelocationKindInfo,
    r_type: u32,
    symbols: &crate::symbol::SymbolTable,
    rel: &crate::input::Relocation,
) -> Result {
    if info.kind == RelocationKind::Absolute
        && info.size != RelocationSize::ByteSize(8)
        && config.output_kind.is_relocatable()
    {
        let entry = symbols.entry(rel.target);
        if matches!(entry.definition, SymbolDefinition::Section { .. }) || entry.is_dynamic() {
            fail!(
                LinkFailure::Unsupported,
                "relocation {} against {} cannot be used in position-independent output; \
                 recompile with -fPIC",
                aarch64_rel_type_to_string(r_type),
                symbols.name_for_display(rel.target)
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::Config;
    use crate::args::OutputKind;
    use crate::driver::testing::RecordingDriver;
    use crate::error::failure_kind;
    use crate::input::FileId;
    use crate::input::InputFile;
    use crate::input::LinkInput;
    use crate::input::Relocation;
    use crate::symbol::SymbolEntry;
    use crate::symbol::SymbolRef;
    use crate::symbol::SymbolTable;
    use crate::test_support;
    use object::elf;

    fn shared_config() -> Config {
        Config::new(OutputKind::SharedObject)
    }

    fn state_with_relocs(
        config: Config,
        relocs: Vec<Relocation>,
        symbols: SymbolTable,
    ) -> LinkState {
        let mut section = test_support::exec_section(".text", vec![0; 64]);
        section.relocations = relocs;
        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![section],
        }]);
        LinkState::new(config, input, symbols)
    }

    fn reloc(r_type: u32, offset: u64, target: SymbolRef) -> Relocation {
        Relocation {
            r_type,
            offset,
            addend: 0,
            target,
        }
    }

    #[test]
    fn classification_accumulates_counts_and_kinds() {
        let mut symbols = SymbolTable::new();
        let func = symbols.add_global(
            SymbolEntry::new("callee", crate::symbol::SymbolDefinition::Dynamic)
                .with_dynamic_index(1),
        );
        let var = symbols.add_global(
            SymbolEntry::new("var", crate::symbol::SymbolDefinition::Dynamic).with_dynamic_index(2),
        );

        let mut state = state_with_relocs(
            shared_config(),
            vec![
                reloc(elf::R_AARCH64_CALL26, 0, SymbolRef::Global(func)),
                reloc(elf::R_AARCH64_ADR_GOT_PAGE, 4, SymbolRef::Global(var)),
                reloc(elf::R_AARCH64_LD64_GOT_LO12_NC, 8, SymbolRef::Global(var)),
            ],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();

        assert_eq!(state.symbols.entry(SymbolRef::Global(func)).plt_refcount, 1);
        let var_entry = state.symbols.entry(SymbolRef::Global(var));
        assert_eq!(var_entry.got_refcount, 2);
        assert_eq!(var_entry.got_kinds, GotKinds::NORMAL);
        assert!(driver.undefined.is_empty());
    }

    #[test]
    fn ie_displaces_gd_reservation() {
        let mut kinds = GotKinds::empty();
        merge_got_kinds(&mut kinds, GotClass::TlsGd);
        assert_eq!(kinds, GotKinds::TLS_GD);
        merge_got_kinds(&mut kinds, GotClass::TlsIe);
        assert_eq!(kinds, GotKinds::TLS_IE);
        // Once IE is present, later GD accesses reuse its slot.
        merge_got_kinds(&mut kinds, GotClass::TlsDescGd);
        assert_eq!(kinds, GotKinds::TLS_IE);
    }

    #[test]
    fn unknown_relocation_type_is_fatal() {
        let mut symbols = SymbolTable::new();
        let sym = symbols.add_global(SymbolEntry::new(
            "x",
            crate::symbol::SymbolDefinition::Absolute(0x1000),
        ));
        let mut state = state_with_relocs(
            shared_config(),
            vec![reloc(0x40, 0, SymbolRef::Global(sym))],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        let error = scan_relocations(&mut state, &mut driver).unwrap_err();
        assert_eq!(failure_kind(&error), Some(LinkFailure::BadRelocation));
    }

    #[test]
    fn undefined_symbols_are_reported_and_scanning_continues() {
        let mut symbols = SymbolTable::new();
        let missing = symbols.add_global(SymbolEntry::new(
            "missing",
            crate::symbol::SymbolDefinition::Undefined { weak: false },
        ));
        let weak = symbols.add_global(SymbolEntry::new(
            "maybe",
            crate::symbol::SymbolDefinition::Undefined { weak: true },
        ));
        let mut state = state_with_relocs(
            shared_config(),
            vec![
                reloc(elf::R_AARCH64_CALL26, 0, SymbolRef::Global(missing)),
                reloc(elf::R_AARCH64_CALL26, 4, SymbolRef::Global(weak)),
            ],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();
        assert_eq!(driver.undefined.len(), 1);
        assert!(driver.undefined[0].contains("missing"));
        assert_eq!(state.diagnostics.reported_errors, 1);
    }

    #[test]
    fn position_dependent_word_in_shared_object_is_unsupported() {
        let mut symbols = SymbolTable::new();
        let sym = symbols.add_global(SymbolEntry::new(
            "v",
            crate::symbol::SymbolDefinition::Section {
                section: crate::input::SectionId::new(FileId(0), 0),
                value: 0,
            },
        ));
        let mut state = state_with_relocs(
            shared_config(),
            vec![reloc(elf::R_AARCH64_ABS32, 0, SymbolRef::Global(sym))],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        let error = scan_relocations(&mut state, &mut driver).unwrap_err();
        assert_eq!(failure_kind(&error), Some(LinkFailure::Unsupported));
    }

    #[test]
    fn local_dynamic_sets_shared_module_flag() {
        let mut symbols = SymbolTable::new();
        symbols.set_local_symbols(
            FileId(0),
            vec![SymbolEntry::new(
                "tls_local",
                crate::symbol::SymbolDefinition::Section {
                    section: crate::input::SectionId::new(FileId(0), 0),
                    value: 0,
                },
            )],
        );
        let target = SymbolRef::Local {
            file: FileId(0),
            index: 0,
        };
        let mut state = state_with_relocs(
            shared_config(),
            vec![reloc(elf::R_AARCH64_TLSLD_ADR_PAGE21, 0, target)],
            symbols,
        );
        let mut driver = RecordingDriver::new(0x10000);
        scan_relocations(&mut state, &mut driver).unwrap();
        assert!(state.uses_tlsld);
        // No per-symbol GOT storage for local-dynamic accesses.
        assert_eq!(state.symbols.entry(target).got_refcount, 0);
    }
}
