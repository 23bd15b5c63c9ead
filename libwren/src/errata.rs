//! Scans for the two Cortex-A53 errata this backend works around. Both scans walk only the
//! instruction spans of each section and feed their findings into the stub manager as veneers,
//! so they participate in the same sizing fixed point as branch stubs. The in-place patches
//! that redirect the vulnerable instructions run last, after relocations have been applied.

use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::input::SectionId;
use crate::state::LinkState;
use crate::stubs::StubEntry;
use crate::stubs::StubKey;
use crate::stubs::StubKind;
use crate::stubs::StubPayload;
use crate::stubs::write_branch;
use itertools::Itertools;
use linker_utils::aarch64::MAX_ADRP_IMM;
use linker_utils::aarch64::MIN_ADRP_IMM;
use linker_utils::aarch64::branch_in_range;
use linker_utils::bits::u32_from_slice;
use linker_utils::insn::decode_adrp_offset;
use linker_utils::insn::encode_adr;
use linker_utils::insn::is_adrp;
use linker_utils::insn::is_erratum_835769_sequence;
use linker_utils::insn::is_erratum_843419_sequence;

/// The erratum only fires when the load/store sits at one of these offsets within its 4 KiB
/// page.
const ERRATUM_843419_PAGE_OFFSETS: [u64; 2] = [0xff8, 0xffc];

fn span_words<'a>(
    data: &'a [u8],
    span: &std::ops::Range<u64>,
) -> impl Iterator<Item = (u64, u32)> + 'a {
    let start = span.start;
    let end = span.end.min(data.len() as u64);
    (start..end.saturating_sub(3))
        .step_by(4)
        .map(move |offset| (offset, u32_from_slice(&data[offset as usize..])))
}

#[tracing::instrument(skip_all, name = "Scan for erratum 835769")]
pub(crate) fn scan_erratum_835769(state: &mut LinkState) {
    let mut found = Vec::new();
    let mut fixes = 0u32;

    for id in state.input.section_ids() {
        let section = state.input.section(id);
        if !section.is_executable() {
            continue;
        }
        let Some(group) = state.stubs.groups.group_of(id) else {
            continue;
        };
        for span in section.spans.code_spans(section.size()) {
            for ((_, insn_1), (mla_offset, insn_2)) in
                span_words(&section.data, &span).tuple_windows()
            {
                if !is_erratum_835769_sequence(insn_1, insn_2) {
                    continue;
                }
                let key = StubKey::Erratum835769 {
                    section: id,
                    mla_offset,
                };
                if state.stubs.get(&key).is_some() {
                    continue;
                }
                found.push((
                    key,
                    StubEntry {
                        kind: StubKind::Erratum835769Veneer,
                        group,
                        offset: 0,
                        name: format!("__erratum_835769_veneer_{fixes}"),
                        payload: StubPayload::Erratum835769 {
                            section: id,
                            mla_offset,
                            veneered_insn: insn_2,
                        },
                    },
                ));
                fixes += 1;
            }
        }
    }

    tracing::debug!(fixes = found.len(), "erratum 835769 scan complete");
    for (key, entry) in found {
        state.stubs.add(key, entry);
    }
}

#[tracing::instrument(skip_all, name = "Scan for erratum 843419")]
pub(crate) fn scan_erratum_843419(state: &mut LinkState) {
    let mut found = Vec::new();

    for id in state.input.section_ids() {
        let section = state.input.section(id);
        if !section.is_executable() {
            continue;
        }
        let Some(group) = state.stubs.groups.group_of(id) else {
            continue;
        };
        let section_address = state.layout.input_address(id);
        for span in section.spans.code_spans(section.size()) {
            for (offset, insn_1) in span_words(&section.data, &span) {
                let address = section_address + offset;
                if !ERRATUM_843419_PAGE_OFFSETS.contains(&(address & 0xfff)) {
                    continue;
                }
                if !is_adrp(insn_1) {
                    continue;
                }
                // The vulnerable load/store is the third or fourth instruction of the
                // sequence; both positions must still be inside the instruction span.
                if span.end < offset + 12 {
                    continue;
                }
                let insn_2 = u32_from_slice(&section.data[offset as usize + 4..]);
                let insn_3 = u32_from_slice(&section.data[offset as usize + 8..]);
                let ldst_offset = if is_erratum_843419_sequence(insn_1, insn_2, insn_3) {
                    offset + 8
                } else if span.end >= offset + 16
                    && is_erratum_843419_sequence(
                        insn_1,
                        insn_2,
                        u32_from_slice(&section.data[offset as usize + 12..]),
                    )
                {
                    offset + 12
                } else {
                    continue;
                };

                let key = StubKey::Erratum843419 {
                    section: id,
                    ldst_offset,
                };
                // Overlapping 3- and 4-instruction windows can nominate the same load/store.
                if state.stubs.get(&key).is_some()
                    || found.iter().any(|(existing, _)| *existing == key)
                {
                    continue;
                }
                found.push((
                    key,
                    StubEntry {
                        kind: StubKind::Erratum843419Veneer,
                        group,
                        offset: 0,
                        name: format!(
                            "__e843419_{}_{}_{ldst_offset:x}_veneer",
                            id.file.0, id.index
                        ),
                        payload: StubPayload::Erratum843419 {
                            section: id,
                            adrp_offset: offset,
                            ldst_offset,
                        },
                    },
                ));
            }
        }
    }

    tracing::debug!(fixes = found.len(), "erratum 843419 scan complete");
    for (key, entry) in found {
        state.stubs.add(key, entry);
    }
}

enum Patch {
    Branch {
        section: SectionId,
        offset: u64,
        stub_place: u64,
    },
    RewriteAdrp {
        section: SectionId,
        adrp_offset: u64,
        ldst_offset: u64,
        stub_place: u64,
    },
}

/// Replaces each veneered instruction with a branch to its veneer. For erratum 843419, the
/// leading ADRP is instead rewritten to a single ADR when the displacement fits and the
/// configuration allows it.
#[tracing::instrument(skip_all, name = "Redirect erratum sites")]
pub(crate) fn redirect_to_veneers(state: &mut LinkState) -> Result {
    let mut patches = Vec::new();
    for entry in state.stubs.entries() {
        let stub_section = &state.layout.stub_sections[entry.group.0 as usize];
        let stub_place = stub_section.address + entry.offset;
        match entry.payload {
            StubPayload::Branch { .. } => {}
            StubPayload::Erratum835769 {
                section,
                mla_offset,
                ..
            } => patches.push(Patch::Branch {
                section,
                offset: mla_offset,
                stub_place,
            }),
            StubPayload::Erratum843419 {
                section,
                adrp_offset,
                ldst_offset,
            } => patches.push(Patch::RewriteAdrp {
                section,
                adrp_offset,
                ldst_offset,
                stub_place,
            }),
        }
    }

    for patch in patches {
        match patch {
            Patch::Branch {
                section,
                offset,
                stub_place,
            } => {
                patch_branch_to_veneer(state, section, offset, stub_place)?;
            }
            Patch::RewriteAdrp {
                section,
                adrp_offset,
                ldst_offset,
                stub_place,
            } => {
                let adrp_place = state.layout.place(section, adrp_offset);
                let data = &mut state.input.section_mut(section).data;
                let insn = u32_from_slice(&data[adrp_offset as usize..]);
                if !is_adrp(insn) {
                    fail!(
                        LinkFailure::InternalInconsistency,
                        "erratum 843419 site at {section}+0x{adrp_offset:x} is no longer an adrp"
                    );
                }
                let adr_imm = decode_adrp_offset(insn) - (adrp_place & 0xfff) as i64;
                if state.config.fix_erratum_843419_adr
                    && (MIN_ADRP_IMM..=MAX_ADRP_IMM).contains(&adr_imm)
                {
                    let adr = encode_adr(insn & 0x1f, adr_imm);
                    data[adrp_offset as usize..adrp_offset as usize + 4]
                        .copy_from_slice(&adr.to_le_bytes());
                } else {
                    patch_branch_to_veneer(state, section, ldst_offset, stub_place)?;
                }
            }
        }
    }
    Ok(())
}

fn patch_branch_to_veneer(
    state: &mut LinkState,
    section: SectionId,
    offset: u64,
    stub_place: u64,
) -> Result {
    let place = state.layout.place(section, offset);
    if !branch_in_range(place, stub_place) {
        fail!(
            LinkFailure::OutOfRange,
            "erratum veneer for {}+0x{offset:x} is out of range (input file too large)",
            state.input.file(section.file).name
        );
    }
    let data = &mut state.input.section_mut(section).data;
    write_branch(&mut data[offset as usize..], place, stub_place)
}
