//! Emits the contents of the sections this backend synthesises, once addresses are final and
//! TLS relaxation has settled which slots are still needed: `.got`, `.got.plt`, `.plt`, the
//! TLS-descriptor trampoline, and the `.rela.dyn`/`.rela.plt` record buffers that the applier
//! continues to fill.

use crate::allocate::got_entry_dynamic_reloc;
use crate::allocate::tls_gd_needs_module_reloc;
use crate::allocate::tls_gd_needs_offset_reloc;
use crate::allocate::tls_ie_needs_reloc;
use crate::elf::CURRENT_EXE_TLS_MOD;
use crate::elf::PLT_ENTRY_SIZE;
use crate::elf::PLT_HEADER_SIZE;
use crate::elf::PLT_HEADER_TEMPLATE;
use crate::elf::PLT_TLSDESC_TEMPLATE;
use crate::elf::RELA_ENTRY_SIZE;
use crate::elf::write_add_lo12;
use crate::elf::write_adrp;
use crate::elf::write_ldr_lo12;
use crate::elf::write_plt_entry;
use crate::error::LinkFailure;
use crate::error::Result;
use crate::error::fail;
use crate::layout::Layout;
use crate::state::LinkState;
use crate::symbol::GotKinds;
use crate::symbol::SymbolRef;
use linker_utils::elf::DynamicRelocationKind;
use object::LittleEndian;
use object::elf::Rela64;

#[derive(Debug, Default)]
pub(crate) struct OutputTables {
    got: Vec<u64>,
    got_plt: Vec<u64>,
    plt: Vec<u8>,
    rela_dyn: Vec<u64>,
    rela_plt: Vec<u64>,
    rela_dyn_used: usize,
    rela_plt_used: usize,
}

impl OutputTables {
    #[must_use]
    pub(crate) fn with_layout(layout: &Layout) -> Self {
        Self {
            got: vec![0; (layout.got.size / 8) as usize],
            got_plt: vec![0; (layout.got_plt.size / 8) as usize],
            plt: vec![0; layout.plt.size as usize],
            rela_dyn: vec![0; layout.rela_dyn_count * 3],
            rela_plt: vec![0; layout.rela_plt_count * 3],
            rela_dyn_used: 0,
            rela_plt_used: 0,
        }
    }

    pub(crate) fn set_got_word(&mut self, offset: u64, value: u64) -> Result {
        let Some(word) = self.got.get_mut((offset / 8) as usize) else {
            fail!(
                LinkFailure::InternalInconsistency,
                "GOT offset 0x{offset:x} is outside the allocated table"
            );
        };
        *word = value;
        Ok(())
    }

    pub(crate) fn set_got_plt_word(&mut self, offset: u64, value: u64) -> Result {
        let Some(word) = self.got_plt.get_mut((offset / 8) as usize) else {
            fail!(
                LinkFailure::InternalInconsistency,
                ".got.plt offset 0x{offset:x} is outside the allocated table"
            );
        };
        *word = value;
        Ok(())
    }

    pub(crate) fn push_rela_dyn(
        &mut self,
        place: u64,
        kind: DynamicRelocationKind,
        symbol: u32,
        addend: i64,
    ) -> Result {
        push_record(
            &mut self.rela_dyn,
            &mut self.rela_dyn_used,
            ".rela.dyn",
            place,
            kind.aarch64_r_type(),
            symbol,
            addend,
        )
    }

    pub(crate) fn push_rela_plt(
        &mut self,
        place: u64,
        kind: DynamicRelocationKind,
        symbol: u32,
        addend: i64,
    ) -> Result {
        push_record(
            &mut self.rela_plt,
            &mut self.rela_plt_used,
            ".rela.plt",
            place,
            kind.aarch64_r_type(),
            symbol,
            addend,
        )
    }

    #[must_use]
    pub(crate) fn got_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.got).to_vec()
    }

    #[must_use]
    pub(crate) fn got_plt_bytes(&self) -> Vec<u8> {
        bytemuck::cast_slice(&self.got_plt).to_vec()
    }

    #[must_use]
    pub(crate) fn plt_bytes(&self) -> Vec<u8> {
        self.plt.clone()
    }

    #[must_use]
    pub(crate) fn rela_dyn_bytes(&self) -> Vec<u8> {
        rela_bytes(&self.rela_dyn, self.rela_dyn_used)
    }

    #[must_use]
    pub(crate) fn rela_plt_bytes(&self) -> Vec<u8> {
        rela_bytes(&self.rela_plt, self.rela_plt_used)
    }

    #[cfg(test)]
    pub(crate) fn got_words(&self) -> &[u64] {
        &self.got
    }
}

fn rela_bytes(storage: &[u64], used: usize) -> Vec<u8> {
    let bytes: &[u8] = bytemuck::cast_slice(storage);
    bytes[..used * RELA_ENTRY_SIZE as usize].to_vec()
}

fn push_record(
    storage: &mut [u64],
    used: &mut usize,
    section_name: &'static str,
    place: u64,
    r_type: u32,
    symbol: u32,
    addend: i64,
) -> Result {
    let e = LittleEndian;
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(storage);
    let count = bytes.len() / size_of::<Rela64<LittleEndian>>();
    let (records, _) = object::slice_from_bytes_mut::<Rela64<LittleEndian>>(bytes, count)
        .expect("record storage is 8-aligned and sized in whole records");
    let Some(rela) = records.get_mut(*used) else {
        fail!(
            LinkFailure::InternalInconsistency,
            "insufficient {section_name} allocation"
        );
    };
    rela.r_offset.set(e, place);
    rela.r_addend.set(e, addend);
    rela.set_r_info(e, false, symbol, r_type);
    *used += 1;
    Ok(())
}

/// The dynamic symbol index a runtime-resolved record must carry.
fn required_dynamic_index(entry: &crate::symbol::SymbolEntry) -> Result<u32> {
    match entry.dynamic_index {
        Some(index) => Ok(index),
        None => fail!(
            LinkFailure::InternalInconsistency,
            "symbol {} needs a dynamic relocation but has no dynamic symbol table index",
            entry.name
        ),
    }
}

#[tracing::instrument(skip_all, name = "Write GOT and PLT")]
pub(crate) fn write_table_entries(state: &mut LinkState) -> Result {
    state.tables = OutputTables::with_layout(&state.layout);
    let LinkState {
        config,
        symbols,
        layout,
        tables,
        ..
    } = state;

    if layout.plt.size > 0 {
        write_plt_header(tables, layout);
    }

    for symbol in symbols.all_refs() {
        write_symbol_entries(symbol, config, symbols, layout, tables)?;
    }

    if let Some(offset) = layout.tlsld_got_offset {
        if config.output_kind.is_shared_object() {
            tables.push_rela_dyn(
                layout.got_entry_address(offset),
                DynamicRelocationKind::DtpMod,
                0,
                0,
            )?;
        } else {
            tables.set_got_word(offset, CURRENT_EXE_TLS_MOD)?;
        }
    }

    if let Some(plt_offset) = layout.tlsdesc_plt_offset {
        write_tlsdesc_trampoline(tables, layout, plt_offset)?;
    }

    Ok(())
}

fn write_symbol_entries(
    symbol: SymbolRef,
    config: &crate::args::Config,
    symbols: &mut crate::symbol::SymbolTable,
    layout: &Layout,
    tables: &mut OutputTables,
) -> Result {
    let address = symbols.address_of(symbol, layout);

    // Snapshot the decisions that depend on the entry, then transition the slot states through
    // a fresh mutable borrow.
    let entry = symbols.entry(symbol);
    let kinds = entry.got_kinds;
    let dynamic_index = entry.dynamic_index;
    let plt_slots = (entry.plt_offset, entry.got_plt_offset);
    let gd_module_reloc = tls_gd_needs_module_reloc(entry, config);
    let gd_offset_reloc = tls_gd_needs_offset_reloc(entry);
    let ie_reloc = tls_ie_needs_reloc(entry, config);
    let normal_reloc = got_entry_dynamic_reloc(entry, config);

    if let (Some(plt_offset), Some(got_plt_offset)) = plt_slots {
        let plt_address = layout.plt_entry_address(plt_offset);
        let got_plt_address = layout.got_plt_entry_address(got_plt_offset);
        let plt_entry =
            &mut tables.plt[plt_offset as usize..(plt_offset + PLT_ENTRY_SIZE) as usize];
        write_plt_entry(plt_entry, got_plt_address, plt_address);
        // Until the runtime binds the symbol, the slot points back at PLT entry 0.
        tables.set_got_plt_word(got_plt_offset, layout.plt.address)?;
        tables.push_rela_plt(
            got_plt_address,
            DynamicRelocationKind::JumpSlot,
            required_dynamic_index(symbols.entry(symbol))?,
            0,
        )?;
    }

    if kinds.is_empty() {
        return Ok(());
    }

    if kinds.contains(GotKinds::TLSDESC_GD) {
        let offset = symbols.entry_mut(symbol).tlsdesc_got.initialize()?;
        let place = layout.got_plt_entry_address(offset);
        let (index, addend) = match dynamic_index {
            Some(index) => (index, 0),
            None => (0, layout.tls.dtp_offset(address) as i64),
        };
        tables.push_rela_plt(place, DynamicRelocationKind::TlsDesc, index, addend)?;
    }

    if kinds.contains(GotKinds::TLS_GD) {
        let offset = symbols.entry_mut(symbol).got.initialize()?;
        let place = layout.got_entry_address(offset);
        if gd_module_reloc {
            tables.push_rela_dyn(
                place,
                DynamicRelocationKind::DtpMod,
                dynamic_index.unwrap_or(0),
                0,
            )?;
        } else {
            tables.set_got_word(offset, CURRENT_EXE_TLS_MOD)?;
        }
        if gd_offset_reloc {
            tables.push_rela_dyn(
                place + 8,
                DynamicRelocationKind::DtpOff,
                required_dynamic_index(symbols.entry(symbol))?,
                0,
            )?;
        } else {
            tables.set_got_word(offset + 8, layout.tls.dtp_offset(address))?;
        }
    }

    if kinds.contains(GotKinds::TLS_IE) {
        let offset = symbols.entry_mut(symbol).got.initialize()?;
        let place = layout.got_entry_address(offset);
        if ie_reloc {
            let (index, addend) = match dynamic_index {
                Some(index) => (index, 0),
                None => (0, layout.tls.dtp_offset(address) as i64),
            };
            tables.push_rela_dyn(place, DynamicRelocationKind::TpOff, index, addend)?;
        } else {
            tables.set_got_word(offset, layout.tls.tp_offset(address))?;
        }
    }

    if kinds.contains(GotKinds::NORMAL) {
        let offset = symbols.entry_mut(symbol).got.initialize()?;
        let place = layout.got_entry_address(offset);
        match normal_reloc {
            Some(DynamicRelocationKind::GotEntry) => {
                tables.push_rela_dyn(
                    place,
                    DynamicRelocationKind::GotEntry,
                    required_dynamic_index(symbols.entry(symbol))?,
                    0,
                )?;
            }
            Some(DynamicRelocationKind::Relative) => {
                tables.push_rela_dyn(place, DynamicRelocationKind::Relative, 0, address as i64)?;
                tables.set_got_word(offset, address)?;
            }
            _ => {
                tables.set_got_word(offset, address)?;
            }
        }
    }

    Ok(())
}

fn write_plt_header(tables: &mut OutputTables, layout: &Layout) {
    let header = &mut tables.plt[..PLT_HEADER_SIZE as usize];
    header.copy_from_slice(PLT_HEADER_TEMPLATE);
    // The header loads .got.plt[2], where the runtime installs its resolver.
    let resolver_slot = layout.got_plt.address + 16;
    write_adrp(&mut header[4..8], resolver_slot, layout.plt.address + 4);
    write_ldr_lo12(&mut header[8..12], resolver_slot);
    write_add_lo12(&mut header[12..16], resolver_slot);
}

fn write_tlsdesc_trampoline(
    tables: &mut OutputTables,
    layout: &Layout,
    plt_offset: u64,
) -> Result {
    let Some(got_offset) = layout.tlsdesc_got_offset else {
        fail!(
            LinkFailure::InternalInconsistency,
            "TLS descriptor trampoline allocated without its resolver GOT word"
        );
    };
    let resolver_slot = layout.got_entry_address(got_offset);
    let entry = &mut tables.plt
        [plt_offset as usize..(plt_offset + PLT_TLSDESC_TEMPLATE.len() as u64) as usize];
    entry.copy_from_slice(PLT_TLSDESC_TEMPLATE);
    let place = layout.plt_entry_address(plt_offset);
    write_adrp(&mut entry[4..8], resolver_slot, place + 4);
    write_adrp(&mut entry[8..12], layout.got.address, place + 8);
    write_ldr_lo12(&mut entry[12..16], resolver_slot);
    write_add_lo12(&mut entry[16..20], layout.got.address);
    Ok(())
}
