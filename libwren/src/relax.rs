//! TLS access-model relaxation. During a final executable link, general-dynamic and
//! local-dynamic sequences are rewritten to the initial-exec or local-exec models, which skip
//! the runtime resolver entirely. The decision table is consulted twice: once (type-level) by
//! the scanner so that GOT slots are only reserved for the surviving access model, and once
//! here to rewrite the instruction stream.

use crate::args::Config;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::input::Relocation;
use crate::state::LinkState;
use linker_utils::aarch64::RelaxationKind;
use linker_utils::elf::aarch64_rel_type_to_string;
use linker_utils::relaxation::RelocationModifier;
use object::elf;

pub(crate) struct TlsRelaxation {
    pub(crate) kind: RelaxationKind,
    pub(crate) new_r_type: u32,
}

/// Returns the rewrite for `r_type` when the targeted symbol's TLS block location is known at
/// link time (`resolves_locally`), or when it at least lives at a fixed offset discoverable via
/// the initial-exec model. `None` means the relocation is not a relaxation candidate.
#[must_use]
pub(crate) fn tls_relaxation(r_type: u32, resolves_locally: bool) -> Option<TlsRelaxation> {
    let (kind, new_r_type) = match r_type {
        // adrp x0, :tlsgd:var / adrp x0, :tlsdesc:var
        elf::R_AARCH64_TLSGD_ADR_PAGE21 | elf::R_AARCH64_TLSDESC_ADR_PAGE21 => {
            if resolves_locally {
                // => movz x0, :tprel_g1:var
                (
                    RelaxationKind::MovzX0Lsl16,
                    elf::R_AARCH64_TLSLE_MOVW_TPREL_G1,
                )
            } else {
                // => adrp x0, :gottprel:var
                (
                    RelaxationKind::NoOp,
                    elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21,
                )
            }
        }
        // add x0, x0, :tlsgd_lo12:var followed by bl __tls_get_addr
        elf::R_AARCH64_TLSGD_ADD_LO12_NC => {
            if resolves_locally {
                (
                    RelaxationKind::TlsGdToLe,
                    elf::R_AARCH64_TLSLE_MOVW_TPREL_G0_NC,
                )
            } else {
                (
                    RelaxationKind::TlsGdToIe,
                    elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC,
                )
            }
        }
        // ldr xd, [x0, :tlsdesc_lo12:var]
        elf::R_AARCH64_TLSDESC_LD64_LO12 => {
            if resolves_locally {
                (
                    RelaxationKind::MovkX0,
                    elf::R_AARCH64_TLSLE_MOVW_TPREL_G0_NC,
                )
            } else {
                (
                    RelaxationKind::RewriteDestToX0,
                    elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC,
                )
            }
        }
        // add x0, x0, :tlsdesc_lo12:var and blr xd both become nops.
        elf::R_AARCH64_TLSDESC_ADD_LO12 | elf::R_AARCH64_TLSDESC_CALL => {
            (RelaxationKind::ReplaceWithNop, elf::R_AARCH64_NONE)
        }
        // The local-dynamic module is always the executable itself.
        elf::R_AARCH64_TLSLD_ADR_PAGE21 => (RelaxationKind::TlsLdToLeMrs, elf::R_AARCH64_NONE),
        elf::R_AARCH64_TLSLD_ADD_LO12_NC => {
            (RelaxationKind::TlsLdToLeAddTcb, elf::R_AARCH64_NONE)
        }
        _ => return None,
    };
    Some(TlsRelaxation { kind, new_r_type })
}

/// The relocation type the scanner should classify: `r_type` after any relaxation this link
/// mode will perform.
#[must_use]
pub(crate) fn scanned_relocation_type(
    r_type: u32,
    resolves_locally: bool,
    config: &Config,
) -> u32 {
    if !config.tls_relaxation_applies() {
        return r_type;
    }
    tls_relaxation(r_type, resolves_locally).map_or(r_type, |relaxation| relaxation.new_r_type)
}

#[tracing::instrument(skip_all, name = "Relax TLS sequences")]
pub(crate) fn relax_tls_relocations(state: &mut LinkState) -> Result {
    if !state.config.tls_relaxation_applies() {
        return Ok(());
    }

    let LinkState {
        config,
        input,
        symbols,
        ..
    } = state;

    for file in &mut input.files {
        for section in &mut file.sections {
            if !section
                .relocations
                .iter()
                .any(|rel| tls_relaxation(rel.r_type, true).is_some())
            {
                continue;
            }

            // Rewrite into a fresh relocation list rather than mutating the one we're
            // iterating: a rewrite can retype both the current entry and its successor.
            let mut relaxed: Vec<Relocation> = section.relocations.clone();
            let mut index = 0;
            while index < relaxed.len() {
                let rel = &relaxed[index];
                let resolves_locally = symbols
                    .entry(rel.target)
                    .resolves_locally(config.output_kind);
                let Some(relaxation) = tls_relaxation(rel.r_type, resolves_locally) else {
                    index += 1;
                    continue;
                };

                tracing::trace!(
                    r_type = %aarch64_rel_type_to_string(rel.r_type),
                    new_r_type = %aarch64_rel_type_to_string(relaxation.new_r_type),
                    offset = rel.offset,
                    "relaxing TLS sequence"
                );

                let mut offset = rel.offset;
                let mut addend = rel.addend;
                relaxation
                    .kind
                    .apply(&mut section.data, &mut offset, &mut addend);
                relaxed[index].r_type = relaxation.new_r_type;

                if relaxation.kind.next_modifier() == RelocationModifier::SkipNextRelocation {
                    // The rewrite replaced the __tls_get_addr call; its relocation must not be
                    // applied to the instruction that now lives there.
                    match relaxed.get_mut(index + 1) {
                        Some(next) if next.offset == offset + 4 => {
                            next.r_type = elf::R_AARCH64_NONE;
                            index += 1;
                        }
                        _ => fail!(
                            LinkFailure::Unsupported,
                            "TLS call sequence at {}+0x{offset:x} is not followed by a \
                             __tls_get_addr relocation",
                            section.name
                        ),
                    }
                }
                index += 1;
            }
            section.relocations = relaxed;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::OutputKind;
    use crate::args::RelocationModel;
    use crate::input::FileId;
    use crate::input::InputFile;
    use crate::input::LinkInput;
    use crate::input::Relocation;
    use crate::input::SectionId;
    use crate::state::LinkState;
    use crate::symbol::SymbolDefinition;
    use crate::symbol::SymbolEntry;
    use crate::symbol::SymbolRef;
    use crate::symbol::SymbolTable;
    use crate::test_support;

    fn words(insns: &[u32]) -> Vec<u8> {
        insns.iter().flat_map(|insn| insn.to_le_bytes()).collect()
    }

    fn read_insn(data: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
    }

    /// A canonical small-model general-dynamic access to a thread-local defined locally, plus
    /// the call to the resolver.
    fn gd_state(output_kind: OutputKind) -> LinkState {
        let data = words(&[
            0x90000000, // adrp x0, :tlsgd:var
            0x91000000, // add x0, x0, :tlsgd_lo12:var
            0x94000000, // bl __tls_get_addr
            0xd503201f, // nop
        ]);
        let mut section = test_support::exec_section(".text", data);
        let tls_section = test_support::tls_section(".tdata", vec![0; 16]);

        let mut symbols = SymbolTable::new();
        symbols.set_local_symbols(
            FileId(0),
            vec![SymbolEntry::new(
                "var",
                SymbolDefinition::Section {
                    section: SectionId::new(FileId(0), 1),
                    value: 0,
                },
            )],
        );
        let resolver = symbols.add_global(SymbolEntry::new("__tls_get_addr", SymbolDefinition::Dynamic));

        let var = SymbolRef::Local {
            file: FileId(0),
            index: 0,
        };
        section.relocations = vec![
            Relocation {
                r_type: elf::R_AARCH64_TLSGD_ADR_PAGE21,
                offset: 0,
                addend: 0,
                target: var,
            },
            Relocation {
                r_type: elf::R_AARCH64_TLSGD_ADD_LO12_NC,
                offset: 4,
                addend: 0,
                target: var,
            },
            Relocation {
                r_type: elf::R_AARCH64_CALL26,
                offset: 8,
                addend: 0,
                target: SymbolRef::Global(resolver),
            },
        ];

        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![section, tls_section],
        }]);
        LinkState::new(crate::args::Config::new(output_kind), input, symbols)
    }

    #[test]
    fn local_gd_relaxes_to_local_exec_patterns() {
        let mut state = gd_state(OutputKind::StaticExecutable(RelocationModel::NonRelocatable));
        relax_tls_relocations(&mut state).unwrap();

        let section = &state.input.files[0].sections[0];
        assert_eq!(read_insn(&section.data, 0), 0xd2a00000, "movz x0, lsl #16");
        assert_eq!(read_insn(&section.data, 4), 0xf2800000, "movk x0");
        assert_eq!(read_insn(&section.data, 8), 0xd53bd041, "mrs x1, tpidr_el0");
        assert_eq!(read_insn(&section.data, 12), 0x8b000020, "add x0, x1, x0");

        let types: Vec<u32> = section.relocations.iter().map(|r| r.r_type).collect();
        assert_eq!(
            types,
            vec![
                elf::R_AARCH64_TLSLE_MOVW_TPREL_G1,
                elf::R_AARCH64_TLSLE_MOVW_TPREL_G0_NC,
                elf::R_AARCH64_NONE,
            ]
        );
    }

    #[test]
    fn relaxation_is_idempotent() {
        let mut state = gd_state(OutputKind::StaticExecutable(RelocationModel::NonRelocatable));
        relax_tls_relocations(&mut state).unwrap();
        let bytes_after_first = state.input.files[0].sections[0].data.clone();
        let types_after_first: Vec<u32> = state.input.files[0].sections[0]
            .relocations
            .iter()
            .map(|r| r.r_type)
            .collect();

        relax_tls_relocations(&mut state).unwrap();
        let section = &state.input.files[0].sections[0];
        assert_eq!(section.data, bytes_after_first);
        let types_after_second: Vec<u32> =
            section.relocations.iter().map(|r| r.r_type).collect();
        assert_eq!(types_after_first, types_after_second);
    }

    #[test]
    fn shared_objects_pass_tls_through_unchanged() {
        let mut state = gd_state(OutputKind::SharedObject);
        let original = state.input.files[0].sections[0].data.clone();
        relax_tls_relocations(&mut state).unwrap();
        let section = &state.input.files[0].sections[0];
        assert_eq!(section.data, original);
        assert_eq!(
            section.relocations[0].r_type,
            elf::R_AARCH64_TLSGD_ADR_PAGE21
        );
    }

    #[test]
    fn dynamic_symbol_relaxes_to_initial_exec() {
        let relaxation = tls_relaxation(elf::R_AARCH64_TLSGD_ADD_LO12_NC, false).unwrap();
        assert_eq!(
            relaxation.new_r_type,
            elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC
        );

        // Scanner-side view matches the rewrite.
        let config =
            crate::args::Config::new(OutputKind::DynamicExecutable(RelocationModel::NonRelocatable));
        assert_eq!(
            scanned_relocation_type(elf::R_AARCH64_TLSGD_ADR_PAGE21, false, &config),
            elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21
        );
        // Already-relaxed types map to themselves.
        assert_eq!(
            scanned_relocation_type(elf::R_AARCH64_TLSLE_MOVW_TPREL_G1, true, &config),
            elf::R_AARCH64_TLSLE_MOVW_TPREL_G1
        );
    }
}
