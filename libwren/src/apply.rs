//! The final pass: computes each relocation's numeric value from symbol, GOT, PLT and stub
//! addresses, checks it against the descriptor's overflow policy, and writes it into the bit
//! field the descriptor describes. Consecutive relocations at the same offset chain: the value
//! of one becomes the addend of the next, and only the last performs the write.

use crate::args::Config;
use crate::driver::Driver;
use crate::driver::Location;
use crate::elf::get_page_mask;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::input::FileId;
use crate::input::Relocation;
use crate::input::SectionId;
use crate::layout::Layout;
use crate::state::LinkState;
use crate::stubs::GroupId;
use crate::stubs::StubKey;
use crate::stubs::StubTable;
use crate::symbol::SymbolDefinition;
use crate::symbol::SymbolEntry;
use crate::symbol::SymbolTable;
use linker_utils::aarch64::branch_in_range;
use linker_utils::aarch64::relocation_type_from_raw;
use linker_utils::elf::DynamicRelocationKind;
use linker_utils::elf::RelocationKind;
use linker_utils::elf::RelocationKindInfo;
use linker_utils::elf::RelocationSize;
use linker_utils::elf::aarch64_rel_type_to_string;
use linker_utils::elf::write_relocation_to_buffer;
use std::ops::BitAnd;

/// A dynamic relocation to emit alongside an applied value, deferred until we know the value
/// isn't being consumed by a chained successor.
enum DynAction {
    Absolute { symbol: u32 },
    Relative,
}

#[tracing::instrument(skip_all, name = "Apply relocations")]
pub(crate) fn apply_relocations(state: &mut LinkState, driver: &mut dyn Driver) -> Result {
    let LinkState {
        config,
        input,
        symbols,
        layout,
        stubs,
        tables,
        diagnostics,
        ..
    } = state;

    for file_idx in 0..input.files.len() {
        let file_name = input.files[file_idx].name.clone();
        for sec_idx in 0..input.files[file_idx].sections.len() {
            let id = SectionId::new(FileId(file_idx as u32), sec_idx as u32);
            let section_address = layout.input_address(id);
            let group = stubs.groups.group_of(id);
            let section = &mut input.files[file_idx].sections[sec_idx];
            if section.relocations.is_empty() {
                continue;
            }
            let section_name = section.name.clone();
            let crate::input::InputSection {
                data, relocations, ..
            } = section;

            let mut carried: Option<i64> = None;
            for (index, rel) in relocations.iter().enumerate() {
                let Some(info) = relocation_type_from_raw(rel.r_type) else {
                    fail!(
                        LinkFailure::BadRelocation,
                        "unsupported relocation type {} at {}",
                        aarch64_rel_type_to_string(rel.r_type),
                        Location {
                            file: &file_name,
                            section: &section_name,
                            offset: rel.offset,
                        }
                    );
                };
                if info.kind == RelocationKind::None {
                    carried = None;
                    continue;
                }

                let place = section_address + rel.offset;
                let addend = carried.take().unwrap_or(rel.addend);
                let (value, dynamic) = relocation_value(
                    config, symbols, layout, stubs, group, rel, &info, place, addend, &file_name,
                )?;

                // Chained relocation: the computed value feeds the next relocation at the same
                // offset instead of being written.
                if relocations
                    .get(index + 1)
                    .is_some_and(|next| next.offset == rel.offset)
                {
                    carried = Some(value as i64);
                    continue;
                }

                match dynamic {
                    Some(DynAction::Absolute { symbol }) => {
                        tables.push_rela_dyn(
                            place,
                            DynamicRelocationKind::Absolute,
                            symbol,
                            addend,
                        )?;
                    }
                    Some(DynAction::Relative) => {
                        tables.push_rela_dyn(
                            place,
                            DynamicRelocationKind::Relative,
                            0,
                            value as i64,
                        )?;
                    }
                    None => {}
                }

                if let Err(error) =
                    write_relocation_to_buffer(&info, value, &mut data[rel.offset as usize..])
                {
                    let location = Location {
                        file: &file_name,
                        section: &section_name,
                        offset: rel.offset,
                    };
                    tracing::debug!(%error, %location, "relocation overflow");
                    driver.overflow(&aarch64_rel_type_to_string(rel.r_type), &location);
                    diagnostics.report(LinkFailure::Overflow);
                }
            }
        }
    }
    Ok(())
}

fn relocation_value(
    config: &Config,
    symbols: &SymbolTable,
    layout: &Layout,
    stubs: &StubTable,
    group: Option<GroupId>,
    rel: &Relocation,
    info: &RelocationKindInfo,
    place: u64,
    addend: i64,
    file_name: &str,
) -> Result<(u64, Option<DynAction>)> {
    let entry = symbols.entry(rel.target);
    let symbol_address = symbols.address_of(rel.target, layout);
    let addend_u = addend as u64;
    let mask = get_page_mask(info.mask);
    let mut dynamic = None;

    let value = match info.kind {
        RelocationKind::Absolute => {
            if entry.is_dynamic() && info.size != RelocationSize::ByteSize(8) {
                fail!(
                    LinkFailure::Unsupported,
                    "direct {} reference to dynamic symbol {} (copy relocations are not \
                     supported)",
                    aarch64_rel_type_to_string(rel.r_type),
                    entry.name
                );
            }
            let value = symbol_address.wrapping_add(addend_u);
            if entry.is_dynamic() {
                dynamic = Some(DynAction::Absolute {
                    symbol: dynamic_index(entry)?,
                });
            } else if config.output_kind.is_relocatable()
                && info.size == RelocationSize::ByteSize(8)
                && matches!(entry.definition, SymbolDefinition::Section { .. })
            {
                // Interposable definitions stay symbolic so the runtime can rebind them;
                // everything else just slides with the load address.
                dynamic = if entry.is_interposable(config.output_kind)
                    && entry.dynamic_index.is_some()
                {
                    Some(DynAction::Absolute {
                        symbol: dynamic_index(entry)?,
                    })
                } else {
                    Some(DynAction::Relative)
                };
            }
            value
        }
        RelocationKind::AbsoluteAArch64 => symbol_address
            .wrapping_add(addend_u)
            .bitand(mask.symbol_plus_addend),
        RelocationKind::Relative => symbol_address
            .wrapping_add(addend_u)
            .bitand(mask.symbol_plus_addend)
            .wrapping_sub(place.bitand(mask.place)),
        RelocationKind::Got => got_address(entry, symbols, layout, rel)?.wrapping_add(addend_u),
        RelocationKind::GotRelative => got_address(entry, symbols, layout, rel)?
            .bitand(mask.got_entry)
            .wrapping_add(addend_u)
            .wrapping_sub(place.bitand(mask.place)),
        RelocationKind::PltRelative => {
            branch_value(symbols, layout, stubs, group, rel, place, file_name)?
        }
        RelocationKind::TlsGd => got_address(entry, symbols, layout, rel)?
            .bitand(mask.got_entry)
            .wrapping_add(addend_u)
            .wrapping_sub(place.bitand(mask.place)),
        RelocationKind::TlsGdGot => {
            got_address(entry, symbols, layout, rel)?.wrapping_add(addend_u)
        }
        RelocationKind::TlsLd => tlsld_address(layout)?
            .bitand(mask.got_entry)
            .wrapping_add(addend_u)
            .wrapping_sub(place.bitand(mask.place)),
        RelocationKind::TlsLdGot => tlsld_address(layout)?.wrapping_add(addend_u),
        RelocationKind::DtpOff => layout
            .tls
            .dtp_offset(symbol_address.wrapping_add(addend_u)),
        RelocationKind::GotTpOff => got_address(entry, symbols, layout, rel)?
            .bitand(mask.got_entry)
            .wrapping_add(addend_u)
            .wrapping_sub(place.bitand(mask.place)),
        RelocationKind::GotTpOffGot => {
            got_address(entry, symbols, layout, rel)?.wrapping_add(addend_u)
        }
        RelocationKind::TpOff => layout.tls.tp_offset(symbol_address.wrapping_add(addend_u)),
        RelocationKind::TlsDesc => tlsdesc_address(entry, symbols, layout, rel)?
            .bitand(mask.got_entry)
            .wrapping_add(addend_u)
            .wrapping_sub(place.bitand(mask.place)),
        RelocationKind::TlsDescGot => {
            tlsdesc_address(entry, symbols, layout, rel)?.wrapping_add(addend_u)
        }
        RelocationKind::TlsDescCall | RelocationKind::None => 0,
    };

    Ok((value, dynamic))
}

fn dynamic_index(entry: &SymbolEntry) -> Result<u32> {
    match entry.dynamic_index {
        Some(index) => Ok(index),
        None => fail!(
            LinkFailure::InternalInconsistency,
            "dynamic symbol {} has no dynamic symbol table index",
            entry.name
        ),
    }
}

fn got_address(
    entry: &SymbolEntry,
    symbols: &SymbolTable,
    layout: &Layout,
    rel: &Relocation,
) -> Result<u64> {
    match entry.got.offset() {
        Some(offset) => Ok(layout.got_entry_address(offset)),
        None => fail!(
            LinkFailure::InternalInconsistency,
            "{} needs a GOT entry but none was allocated",
            symbols.name_for_display(rel.target)
        ),
    }
}

fn tlsdesc_address(
    entry: &SymbolEntry,
    symbols: &SymbolTable,
    layout: &Layout,
    rel: &Relocation,
) -> Result<u64> {
    match entry.tlsdesc_got.offset() {
        Some(offset) => Ok(layout.got_plt_entry_address(offset)),
        None => fail!(
            LinkFailure::InternalInconsistency,
            "{} needs a TLS descriptor but none was allocated",
            symbols.name_for_display(rel.target)
        ),
    }
}

fn tlsld_address(layout: &Layout) -> Result<u64> {
    match layout.tlsld_got_entry_address() {
        Some(address) => Ok(address),
        None => fail!(
            LinkFailure::InternalInconsistency,
            "local-dynamic TLS access without a module-id GOT entry"
        ),
    }
}

/// Resolves the displacement a call or jump should encode: to the PLT when the symbol has an
/// entry, directly when in range, through the group's veneer otherwise.
fn branch_value(
    symbols: &SymbolTable,
    layout: &Layout,
    stubs: &StubTable,
    group: Option<GroupId>,
    rel: &Relocation,
    place: u64,
    file_name: &str,
) -> Result<u64> {
    let entry = symbols.entry(rel.target);
    let addend_u = rel.addend as u64;
    let destination = match (entry.plt_offset, entry.definition) {
        (Some(plt_offset), _) => layout.plt_entry_address(plt_offset).wrapping_add(addend_u),
        (None, SymbolDefinition::Section { section, value }) => {
            layout.place(section, value).wrapping_add(addend_u)
        }
        (None, SymbolDefinition::Absolute(value)) => value.wrapping_add(addend_u),
        (None, SymbolDefinition::Undefined { .. }) => {
            // Nothing to call; branch to the following instruction.
            return Ok(4);
        }
        (None, SymbolDefinition::Dynamic) => fail!(
            LinkFailure::InternalInconsistency,
            "call to dynamic symbol {} has no PLT entry",
            entry.name
        ),
    };

    if branch_in_range(place, destination) {
        return Ok(destination.wrapping_sub(place));
    }

    let Some(group) = group else {
        fail!(
            LinkFailure::OutOfRange,
            "branch to {} from {file_name} is out of range and its section has no stub group",
            symbols.name_for_display(rel.target)
        );
    };
    let key = StubKey::Branch {
        group,
        target: rel.target,
        addend: rel.addend,
    };
    let Some(stub_id) = stubs.get(&key) else {
        fail!(
            LinkFailure::InternalInconsistency,
            "no stub was created for the out-of-range branch to {}",
            symbols.name_for_display(rel.target)
        );
    };
    let stub_entry = stubs.entry(stub_id);
    let stub_place =
        layout.stub_sections[group.0 as usize].address + stub_entry.offset;
    if !branch_in_range(place, stub_place) {
        fail!(
            LinkFailure::OutOfRange,
            "branch to {} from {file_name} cannot reach its veneer {}",
            symbols.name_for_display(rel.target),
            stub_entry.name
        );
    }
    Ok(stub_place.wrapping_sub(place))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::OutputKind;
    use crate::args::RelocationModel;
    use crate::driver::testing::RecordingDriver;
    use crate::error::failure_kind;
    use crate::input::InputFile;
    use crate::input::LinkInput;
    use crate::symbol::SymbolEntry;
    use crate::symbol::SymbolRef;
    use crate::symbol::SymbolTable;
    use crate::test_support;
    use linker_utils::bits::sign_extend;
    use object::elf;

    fn exe_config() -> crate::args::Config {
        crate::args::Config::new(OutputKind::StaticExecutable(RelocationModel::NonRelocatable))
    }

    #[test]
    fn chained_relocations_feed_the_next_and_write_once() {
        let mut section = test_support::data_section(".data", vec![0; 8]);
        let mut symbols = SymbolTable::new();
        let first = symbols.add_global(SymbolEntry::new(
            "first",
            SymbolDefinition::Absolute(0x100),
        ));
        let second = symbols.add_global(SymbolEntry::new(
            "second",
            SymbolDefinition::Absolute(0x1000),
        ));
        section.relocations = vec![
            Relocation {
                r_type: elf::R_AARCH64_ABS64,
                offset: 0,
                addend: 0x10,
                target: SymbolRef::Global(first),
            },
            Relocation {
                r_type: elf::R_AARCH64_ABS64,
                offset: 0,
                addend: 0,
                target: SymbolRef::Global(second),
            },
        ];
        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![section],
        }]);
        let mut driver = RecordingDriver::new(0x10000);
        let output = crate::link(exe_config(), input, symbols, &mut driver).unwrap();

        // First computes 0x110, which becomes the second's addend: 0x1000 + 0x110.
        let word = u64::from_le_bytes(output.files[0].sections[0].data[0..8].try_into().unwrap());
        assert_eq!(word, 0x1110);
    }

    fn far_call_output(callee_address: u64) -> (crate::LinkOutput, u64) {
        let mut caller = test_support::exec_section(".text", test_support::nops(4));
        let mut symbols = SymbolTable::new();
        let target = symbols.add_global(SymbolEntry::new(
            "far_away",
            SymbolDefinition::Absolute(callee_address),
        ));
        caller.relocations = vec![Relocation {
            r_type: elf::R_AARCH64_CALL26,
            offset: 0,
            addend: 0,
            target: SymbolRef::Global(target),
        }];
        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![caller],
        }]);
        let mut driver = RecordingDriver::new(0x10000);
        let output = crate::link(exe_config(), input, symbols, &mut driver).unwrap();

        // The call site now branches to the veneer, whose field value is in signed range.
        let call = test_support::read_insn(&output.files[0].sections[0].data, 0);
        assert_eq!(call & 0xfc000000, 0x94000000, "still a bl");
        let displacement = sign_extend(u64::from(call & 0x3ffffff) << 2, 27) as i64;
        let stub_address = output.stub_sections[0].address;
        assert_eq!(0x10000_u64.wrapping_add(displacement as u64), stub_address);
        (output, stub_address)
    }

    #[test]
    fn far_call_resolves_through_stub() {
        // 200 MiB exceeds the 128 MiB branch reach but not the veneer's adrp reach, so the
        // sized long-branch stub is downgraded to the page-relative form at build time.
        let callee_address = 0x10000 + 200 * 1024 * 1024u64;
        let (output, stub_address) = far_call_output(callee_address);
        let stub = &output.stub_sections[0];
        let adrp = test_support::read_insn(&stub.bytes, 0);
        assert_eq!(adrp & 0x9f00001f, 0x90000010, "adrp ip0");
        let pages = {
            let immlo = u64::from((adrp >> 29) & 0x3);
            let immhi = u64::from((adrp >> 5) & 0x7ffff);
            (immhi << 2) | immlo
        };
        let add = test_support::read_insn(&stub.bytes, 4);
        let lo12 = u64::from((add >> 10) & 0xfff);
        assert_eq!(
            (stub_address & !0xfff) + (pages << 12) + lo12,
            callee_address
        );
    }

    #[test]
    fn call_beyond_adrp_reach_keeps_the_long_branch_form() {
        // 8 GiB is beyond even adrp reach; the veneer must load the full 64-bit destination.
        let callee_address = 0x10000 + 8 * 1024 * 1024 * 1024u64;
        let (output, stub_address) = far_call_output(callee_address);
        let stub = &output.stub_sections[0];
        assert_eq!(test_support::read_insn(&stub.bytes, 0), 0x58000090, "ldr ip0");
        let literal = u64::from_le_bytes(stub.bytes[16..24].try_into().unwrap());
        assert_eq!(literal.wrapping_add(stub_address + 4), callee_address);
    }

    #[test]
    fn overflow_reports_through_callback_and_fails_the_link() {
        let mut section = test_support::exec_section(".text", test_support::nops(2));
        let mut symbols = SymbolTable::new();
        // A conditional branch reaches +-1 MiB; this target is 2 MiB away.
        let target = symbols.add_global(SymbolEntry::new(
            "too_far",
            SymbolDefinition::Absolute(0x10000 + 2 * 1024 * 1024),
        ));
        section.relocations = vec![Relocation {
            r_type: elf::R_AARCH64_CONDBR19,
            offset: 0,
            addend: 0,
            target: SymbolRef::Global(target),
        }];
        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![section],
        }]);
        let mut driver = RecordingDriver::new(0x10000);
        let error = crate::link(exe_config(), input, symbols, &mut driver).unwrap_err();
        assert_eq!(failure_kind(&error), Some(LinkFailure::Overflow));
        assert_eq!(driver.overflows.len(), 1);
        assert!(driver.overflows[0].contains("R_AARCH64_CONDBR19"));
        // The fatal outcome is also surfaced through the error callback.
        assert_eq!(driver.errors.len(), 1);
    }

    #[test]
    fn in_range_conditional_branch_produces_no_diagnostic() {
        let mut section = test_support::exec_section(".text", test_support::nops(2));
        let mut symbols = SymbolTable::new();
        let target = symbols.add_global(SymbolEntry::new(
            "near",
            SymbolDefinition::Absolute(0x10000 + 0x800),
        ));
        section.relocations = vec![Relocation {
            r_type: elf::R_AARCH64_CONDBR19,
            offset: 0,
            addend: 0,
            target: SymbolRef::Global(target),
        }];
        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![section],
        }]);
        let mut driver = RecordingDriver::new(0x10000);
        let output = crate::link(exe_config(), input, symbols, &mut driver).unwrap();
        assert!(driver.overflows.is_empty());
        let insn = test_support::read_insn(&output.files[0].sections[0].data, 0);
        assert_eq!((insn >> 5) & 0x7ffff, 0x800 >> 2);
    }

    #[test]
    fn got_relative_pair_addresses_the_allocated_slot() {
        let mut section = test_support::exec_section(".text", test_support::nops(2));
        let mut symbols = SymbolTable::new();
        let target = symbols.add_global(SymbolEntry::new(
            "value",
            SymbolDefinition::Absolute(0xdead0000),
        ));
        section.relocations = vec![
            Relocation {
                r_type: elf::R_AARCH64_ADR_GOT_PAGE,
                offset: 0,
                addend: 0,
                target: SymbolRef::Global(target),
            },
            Relocation {
                r_type: elf::R_AARCH64_LD64_GOT_LO12_NC,
                offset: 4,
                addend: 0,
                target: SymbolRef::Global(target),
            },
        ];
        let input = LinkInput::new(vec![InputFile {
            name: "a.o".to_owned(),
            sections: vec![section],
        }]);
        let mut driver = RecordingDriver::new(0x10000);
        let output = crate::link(exe_config(), input, symbols, &mut driver).unwrap();

        // The GOT holds the symbol's address.
        let got_word = u64::from_le_bytes(output.got[0..8].try_into().unwrap());
        assert_eq!(got_word, 0xdead0000);

        // The ldr's scaled immediate selects the slot within the GOT page.
        let ldr = test_support::read_insn(&output.files[0].sections[0].data, 4);
        let imm12 = (ldr >> 10) & 0xfff;
        assert_eq!(u64::from(imm12) * 8, output.got_address & 0xfff);
    }
}
