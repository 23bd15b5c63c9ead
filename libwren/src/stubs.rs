//! Branch veneers ("stubs"). Input sections are partitioned into groups small enough that any
//! branch within a group can reach a stub section placed at its end; branches whose target lies
//! outside the architectural range are then routed through a synthesized veneer in their
//! group's stub section. Because inserting veneers grows sections and therefore moves
//! addresses, sizing iterates with the driver's layout until a pass creates no new stub.

use crate::driver::Driver;
use crate::errata;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::input::SectionId;
use crate::layout::StubSection;
use crate::layout::align_up;
use crate::state::LinkState;
use crate::symbol::SymbolDefinition;
use crate::symbol::SymbolRef;
use linker_utils::aarch64::branch_in_range;
use linker_utils::aarch64::relocation_type_from_raw;
use linker_utils::aarch64::valid_for_adrp;
use linker_utils::elf::write_relocation_to_buffer;
use std::collections::HashMap;

/// Default stub-group limit: the 128 MiB unconditional-branch reach, less 1 MiB of headroom for
/// the stub section itself and layout slack.
pub(crate) const DEFAULT_STUB_GROUP_SIZE: u64 = 127 * 1024 * 1024;

/// Sizing converges because every iteration either creates at least one stub or is the last.
/// The cap turns a hypothetical non-terminating defect into a reported error instead of a hang.
const MAX_SIZING_ITERATIONS: u32 = 32;

/// After the erratum scans, stub sections are padded so that growing them cannot shift later
/// code within its 4 KiB page and thereby mint new erratum sequences.
const ERRATUM_STUB_ALIGNMENT: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct GroupId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StubId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubKind {
    /// adrp/add/br - reaches anywhere within +-4 GiB of the stub.
    AdrpBranch,
    /// Loads the full 64-bit destination; always in range.
    LongBranch,
    Erratum835769Veneer,
    Erratum843419Veneer,
}

impl StubKind {
    /// Sizes are padded to 8 bytes, matching the template layout below.
    #[must_use]
    pub(crate) fn size(self) -> u64 {
        match self {
            StubKind::AdrpBranch => 16,
            StubKind::LongBranch => 24,
            StubKind::Erratum835769Veneer | StubKind::Erratum843419Veneer => 8,
        }
    }
}

/// Identity of a stub. Branch veneers are shared by every call site in the group with the same
/// destination and addend; erratum veneers are per-site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StubKey {
    Branch {
        group: GroupId,
        target: SymbolRef,
        addend: i64,
    },
    Erratum835769 {
        section: SectionId,
        mla_offset: u64,
    },
    Erratum843419 {
        section: SectionId,
        ldst_offset: u64,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum StubPayload {
    Branch {
        target: SymbolRef,
        addend: i64,
    },
    Erratum835769 {
        section: SectionId,
        /// Offset of the multiply-accumulate that moves into the veneer.
        mla_offset: u64,
        veneered_insn: u32,
    },
    Erratum843419 {
        section: SectionId,
        adrp_offset: u64,
        /// Offset of the load/store that moves into the veneer.
        ldst_offset: u64,
    },
}

#[derive(Debug)]
pub(crate) struct StubEntry {
    pub(crate) kind: StubKind,
    pub(crate) group: GroupId,
    /// Byte offset within the group's stub section; assigned when sizing converges.
    pub(crate) offset: u64,
    pub(crate) name: String,
    pub(crate) payload: StubPayload,
}

/// Maps every executable input section to the group whose stub section serves it. A strict
/// partition: each section belongs to exactly one group.
#[derive(Debug, Default)]
pub(crate) struct StubGroups {
    group_of_section: Vec<Vec<Option<GroupId>>>,
    count: u32,
}

impl StubGroups {
    #[must_use]
    pub(crate) fn group_of(&self, id: SectionId) -> Option<GroupId> {
        self.group_of_section[id.file.as_usize()][id.index as usize]
    }

    #[must_use]
    pub(crate) fn count(&self) -> u32 {
        self.count
    }
}

#[derive(Debug, Default)]
pub(crate) struct StubTable {
    pub(crate) groups: StubGroups,
    entries: Vec<StubEntry>,
    by_key: HashMap<StubKey, StubId, foldhash::fast::RandomState>,
    by_group: Vec<Vec<StubId>>,
}

impl StubTable {
    #[must_use]
    pub(crate) fn get(&self, key: &StubKey) -> Option<StubId> {
        self.by_key.get(key).copied()
    }

    pub(crate) fn add(&mut self, key: StubKey, entry: StubEntry) -> StubId {
        debug_assert!(!self.by_key.contains_key(&key));
        let id = StubId(self.entries.len() as u32);
        self.by_group[entry.group.0 as usize].push(id);
        self.entries.push(entry);
        self.by_key.insert(key, id);
        id
    }

    #[must_use]
    pub(crate) fn entry(&self, id: StubId) -> &StubEntry {
        &self.entries[id.0 as usize]
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &StubEntry> {
        self.entries.iter()
    }

    fn init_groups(&mut self, groups: StubGroups) {
        self.by_group = vec![Vec::new(); groups.count() as usize];
        self.groups = groups;
    }
}

/// Walks sections in link order, closing a group once the running size would exceed the
/// threshold. When permitted, sections that follow a full group are still assigned to it (up to
/// one more threshold's worth): their branches to the group's stubs are backward and therefore
/// reach.
fn group_input_sections(state: &LinkState) -> (StubGroups, Vec<StubSection>) {
    let limit = state
        .config
        .stub_group_size
        .unwrap_or(DEFAULT_STUB_GROUP_SIZE);

    let mut groups = StubGroups {
        group_of_section: state
            .input
            .files
            .iter()
            .map(|file| vec![None; file.sections.len()])
            .collect(),
        count: 0,
    };
    let mut stub_sections = Vec::new();

    let mut core_size = 0u64;
    let mut extension_size = 0u64;
    let mut extending = false;
    let mut last_in_group: Option<SectionId> = None;

    let exec_sections: Vec<SectionId> = state
        .input
        .section_ids()
        .filter(|id| state.input.section(*id).is_executable())
        .collect();

    for &id in &exec_sections {
        let size = state.input.section(id).size();
        if last_in_group.is_some() {
            if !extending && core_size + size > limit {
                if state.config.stubs_after_branch {
                    extending = true;
                    extension_size = 0;
                } else {
                    close_group(&mut stub_sections, &mut last_in_group);
                }
            }
            if extending && extension_size + size > limit {
                close_group(&mut stub_sections, &mut last_in_group);
                extending = false;
            }
        }

        if last_in_group.is_none() {
            groups.count += 1;
            core_size = 0;
            extension_size = 0;
            extending = false;
        }
        let group = GroupId(groups.count - 1);
        groups.group_of_section[id.file.as_usize()][id.index as usize] = Some(group);
        if extending {
            extension_size += size;
        } else {
            core_size += size;
            last_in_group = Some(id);
        }
    }
    close_group(&mut stub_sections, &mut last_in_group);

    (groups, stub_sections)
}

fn close_group(stub_sections: &mut Vec<StubSection>, last_in_group: &mut Option<SectionId>) {
    if let Some(last) = last_in_group.take() {
        stub_sections.push(StubSection {
            size: 0,
            address: 0,
            after_section: last,
        });
    }
}

/// Resolves where a call-type relocation lands: through the PLT when the symbol has an entry,
/// directly otherwise. `None` means the destination is unknown (undefined or import without a
/// PLT slot) and no stub can or should be created.
fn branch_destination(state: &LinkState, target: SymbolRef, addend: i64) -> Option<u64> {
    let entry = state.symbols.entry(target);
    if let Some(plt_offset) = entry.plt_offset {
        return Some(
            state
                .layout
                .plt_entry_address(plt_offset)
                .wrapping_add(addend as u64),
        );
    }
    let base = match entry.definition {
        SymbolDefinition::Section { section, value } => state.layout.place(section, value),
        SymbolDefinition::Absolute(value) => value,
        SymbolDefinition::Undefined { .. } | SymbolDefinition::Dynamic => return None,
    };
    Some(base.wrapping_add(addend as u64))
}

#[tracing::instrument(skip_all, name = "Size stubs")]
pub(crate) fn size_stubs(state: &mut LinkState, driver: &mut dyn Driver) -> Result {
    if let Some(group_size) = state.config.stub_group_size {
        if group_size as i64 > linker_utils::aarch64::MAX_FWD_BRANCH_OFFSET {
            driver.warning(&format!(
                "stub group size 0x{group_size:x} exceeds the branch range; out-of-range \
                 branches may remain"
            ));
        }
    }

    let (groups, stub_sections) = group_input_sections(state);
    tracing::debug!(groups = groups.count(), "grouped input sections");
    state.stubs.init_groups(groups);
    state.layout.stub_sections = stub_sections;
    driver.layout_sections_again(&state.input, &mut state.layout);

    if state.config.fix_erratum_835769 {
        errata::scan_erratum_835769(state);
        resize_stub_sections(state);
        driver.layout_sections_again(&state.input, &mut state.layout);
    }
    if state.config.fix_erratum_843419 {
        errata::scan_erratum_843419(state);
        resize_stub_sections(state);
        driver.layout_sections_again(&state.input, &mut state.layout);
    }

    let mut iteration = 0;
    loop {
        if iteration >= MAX_SIZING_ITERATIONS {
            fail!(
                LinkFailure::InternalInconsistency,
                "stub sizing did not converge after {MAX_SIZING_ITERATIONS} iterations"
            );
        }
        let created = create_branch_stubs(state);
        if created == 0 {
            break;
        }
        tracing::debug!(iteration, created, "stub sizing pass created new stubs");
        resize_stub_sections(state);
        driver.layout_sections_again(&state.input, &mut state.layout);
        iteration += 1;
    }
    Ok(())
}

/// One pass over every call-type relocation. Returns the number of stubs created.
fn create_branch_stubs(state: &mut LinkState) -> usize {
    let mut new_stubs = Vec::new();
    let mut pending: std::collections::HashSet<StubKey, foldhash::fast::RandomState> =
        std::collections::HashSet::default();

    for id in state.input.section_ids() {
        let section = state.input.section(id);
        if !section.is_executable() || section.relocations.is_empty() {
            continue;
        }
        let Some(group) = state.stubs.groups.group_of(id) else {
            continue;
        };
        for rel in &section.relocations {
            if !matches!(
                rel.r_type,
                object::elf::R_AARCH64_CALL26 | object::elf::R_AARCH64_JUMP26
            ) {
                continue;
            }
            let Some(destination) = branch_destination(state, rel.target, rel.addend) else {
                continue;
            };
            let place = state.layout.place(id, rel.offset);
            if branch_in_range(place, destination) {
                continue;
            }
            let key = StubKey::Branch {
                group,
                target: rel.target,
                addend: rel.addend,
            };
            if state.stubs.get(&key).is_some() || pending.contains(&key) {
                continue;
            }
            pending.insert(key);
            let name = format!("__{}_veneer", state.symbols.name_for_display(rel.target));
            new_stubs.push((
                key,
                StubEntry {
                    kind: StubKind::LongBranch,
                    group,
                    offset: 0,
                    name,
                    payload: StubPayload::Branch {
                        target: rel.target,
                        addend: rel.addend,
                    },
                },
            ));
        }
    }

    let created = new_stubs.len();
    for (key, entry) in new_stubs {
        tracing::trace!(name = %entry.name, "new branch stub");
        state.stubs.add(key, entry);
    }
    created
}

/// Recomputes every stub section's size and every stub's offset within it. Sizes only ever
/// grow, since stubs are never removed.
pub(crate) fn resize_stub_sections(state: &mut LinkState) {
    for (group_idx, stub_ids) in state.stubs.by_group.iter().enumerate() {
        let mut size = 0u64;
        for &stub_id in stub_ids {
            let entry = &mut state.stubs.entries[stub_id.0 as usize];
            entry.offset = size;
            size += entry.kind.size();
        }
        if size > 0 {
            size += 4;
            if state.config.fix_erratum_843419 {
                size = align_up(size, ERRATUM_STUB_ALIGNMENT);
            }
        }
        let section = &mut state.layout.stub_sections[group_idx];
        debug_assert!(size >= section.size);
        section.size = size;
    }
}

const ADRP_BRANCH_STUB: [u32; 3] = [
    0x90000010, // adrp ip0, X
    0x91000210, // add  ip0, ip0, :lo12:X
    0xd61f0200, // br   ip0
];

const LONG_BRANCH_STUB: [u32; 4] = [
    0x58000090, // ldr  ip0, 1f
    0x10000011, // adr  ip1, #0
    0x8b110210, // add  ip0, ip0, ip1
    0xd61f0200, // br   ip0
];

const BRANCH_TEMPLATE: u32 = 0x14000000;

/// Writes `b <destination>` at `place` into `word`.
pub(crate) fn write_branch(word: &mut [u8], place: u64, destination: u64) -> Result {
    let info = const { relocation_type_from_raw(object::elf::R_AARCH64_JUMP26).unwrap() };
    word[..4].copy_from_slice(&BRANCH_TEMPLATE.to_le_bytes());
    write_relocation_to_buffer(&info, destination.wrapping_sub(place), word)
}

#[tracing::instrument(skip_all, name = "Build stubs")]
pub(crate) fn build_stubs(state: &mut LinkState) -> Result {
    let mut outputs: Vec<Vec<u8>> = state
        .layout
        .stub_sections
        .iter()
        .map(|section| vec![0; section.size as usize])
        .collect();

    for stub_index in 0..state.stubs.entries.len() {
        let entry = &state.stubs.entries[stub_index];
        let stub_section = &state.layout.stub_sections[entry.group.0 as usize];
        let stub_place = stub_section.address + entry.offset;

        match entry.payload {
            StubPayload::Branch { target, addend } => {
                let Some(destination) = branch_destination(state, target, addend) else {
                    fail!(
                        LinkFailure::InternalInconsistency,
                        "stub {} lost its destination after sizing",
                        entry.name
                    );
                };
                // A long-branch stub whose destination turned out to be close enough is
                // downgraded to the cheaper page-relative form. Never the reverse: the sized
                // slot fits either.
                let kind = if entry.kind == StubKind::LongBranch
                    && valid_for_adrp(stub_place, destination)
                {
                    StubKind::AdrpBranch
                } else {
                    entry.kind
                };
                let buffer =
                    &mut outputs[entry.group.0 as usize][entry.offset as usize..];
                write_branch_stub(buffer, kind, stub_place, destination)?;
                state.stubs.entries[stub_index].kind = kind;
            }
            StubPayload::Erratum835769 {
                section,
                mla_offset,
                veneered_insn,
            } => {
                let site = state.layout.place(section, mla_offset);
                if !branch_in_range(stub_place, site) {
                    fail!(
                        LinkFailure::OutOfRange,
                        "erratum 835769 veneer for {} is out of range (input file too large)",
                        section
                    );
                }
                let buffer = &mut outputs[entry.group.0 as usize][entry.offset as usize..];
                buffer[..4].copy_from_slice(&veneered_insn.to_le_bytes());
                // Branching from veneer+4 with a displacement of (site - veneer) resumes at
                // the instruction after the veneered one.
                write_branch(&mut buffer[4..], stub_place, site)?;
            }
            StubPayload::Erratum843419 {
                section,
                ldst_offset,
                ..
            } => {
                let site = state.layout.place(section, ldst_offset);
                if !branch_in_range(stub_place, site) {
                    fail!(
                        LinkFailure::OutOfRange,
                        "erratum 843419 veneer for {} is out of range (input file too large)",
                        section
                    );
                }
                // The veneered load/store is copied after relocations have been applied to
                // it, so the copy carries its final immediate.
                let insn_bytes = {
                    let data = &state.input.section(section).data;
                    let offset = ldst_offset as usize;
                    let mut word = [0u8; 4];
                    word.copy_from_slice(&data[offset..offset + 4]);
                    word
                };
                let buffer = &mut outputs[entry.group.0 as usize][entry.offset as usize..];
                buffer[..4].copy_from_slice(&insn_bytes);
                write_branch(&mut buffer[4..], stub_place, site)?;
            }
        }
    }

    state.stub_bytes = outputs;
    Ok(())
}

fn write_branch_stub(
    buffer: &mut [u8],
    kind: StubKind,
    stub_place: u64,
    destination: u64,
) -> Result {
    match kind {
        StubKind::AdrpBranch => {
            for (i, insn) in ADRP_BRANCH_STUB.iter().enumerate() {
                buffer[i * 4..i * 4 + 4].copy_from_slice(&insn.to_le_bytes());
            }
            let adrp =
                const { relocation_type_from_raw(object::elf::R_AARCH64_ADR_PREL_PG_HI21).unwrap() };
            write_relocation_to_buffer(
                &adrp,
                page(destination).wrapping_sub(page(stub_place)),
                &mut buffer[0..4],
            )?;
            let add =
                const { relocation_type_from_raw(object::elf::R_AARCH64_ADD_ABS_LO12_NC).unwrap() };
            write_relocation_to_buffer(&add, destination, &mut buffer[4..8])?;
        }
        StubKind::LongBranch => {
            for (i, insn) in LONG_BRANCH_STUB.iter().enumerate() {
                buffer[i * 4..i * 4 + 4].copy_from_slice(&insn.to_le_bytes());
            }
            // The literal is added to the address of the adr at +4, so bias it accordingly.
            let literal = destination
                .wrapping_add(12)
                .wrapping_sub(stub_place.wrapping_add(16));
            buffer[16..24].copy_from_slice(&literal.to_le_bytes());
        }
        StubKind::Erratum835769Veneer | StubKind::Erratum843419Veneer => {
            unreachable!("erratum veneers are written by the caller")
        }
    }
    Ok(())
}

#[must_use]
fn page(address: u64) -> u64 {
    address & linker_utils::aarch64::DEFAULT_AARCH64_PAGE_IGNORED_MASK
}
