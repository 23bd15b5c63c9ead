//! Sizes and instruction templates for the synthesised table sections, and the RELA record
//! writer. Entry sizes are fixed by the AArch64 ELF ABI.

use linker_utils::aarch64::DEFAULT_AARCH64_PAGE_IGNORED_MASK;
use linker_utils::aarch64::DEFAULT_AARCH64_PAGE_MASK;
use linker_utils::bits::extract_bits;
use linker_utils::elf::AArch64Instruction;
use object::LittleEndian;
use object::elf::Rela64;

pub(crate) const GOT_ENTRY_SIZE: u64 = 0x8;
pub(crate) const PLT_ENTRY_SIZE: u64 = 0x10;
pub(crate) const PLT_HEADER_SIZE: u64 = 0x20;
pub(crate) const PLT_TLSDESC_ENTRY_SIZE: u64 = 0x20;
pub(crate) const RELA_ENTRY_SIZE: u64 = 0x18;

/// `.got.plt` starts with three words reserved for the dynamic linker.
pub(crate) const GOT_PLT_RESERVED_ENTRIES: u64 = 3;

/// The module number for TLS variables in the current executable.
pub(crate) const CURRENT_EXE_TLS_MOD: u64 = 1;

pub(crate) const PLT_HEADER_TEMPLATE: &[u8] = &[
    0xf0, 0x7b, 0xbf, 0xa9, // stp x16, x30, [sp, #-16]!
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(&(.got.plt[2]))
    0x11, 0x02, 0x40, 0xf9, // ldr x17, [x16, offset(&(.got.plt[2]))]
    0x10, 0x02, 0x00, 0x91, // add x16, x16, offset(&(.got.plt[2]))
    0x20, 0x02, 0x1f, 0xd6, // br x17
    0x1f, 0x20, 0x03, 0xd5, // nop
    0x1f, 0x20, 0x03, 0xd5, // nop
    0x1f, 0x20, 0x03, 0xd5, // nop
];

pub(crate) const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(&(.got.plt[n]))
    0x11, 0x02, 0x40, 0xf9, // ldr x17, [x16, offset(&(.got.plt[n]))]
    0x20, 0x02, 0x1f, 0xd6, // br x17
    0x1f, 0x20, 0x03, 0xd5, // nop
];

/// Lazy TLS-descriptor resolution trampoline.
pub(crate) const PLT_TLSDESC_TEMPLATE: &[u8] = &[
    0xe0, 0x07, 0xbf, 0xa9, // stp x0, x1, [sp, #-16]!
    0x02, 0x00, 0x00, 0x90, // adrp x2, page(&tlsdesc_resolver_slot)
    0x03, 0x00, 0x00, 0x90, // adrp x3, page(&.got)
    0x42, 0x00, 0x40, 0xf9, // ldr x2, [x2, offset(&tlsdesc_resolver_slot)]
    0x63, 0x00, 0x00, 0x91, // add x3, x3, offset(&.got)
    0x40, 0x00, 0x1f, 0xd6, // br x2
    0x1f, 0x20, 0x03, 0xd5, // nop
    0x1f, 0x20, 0x03, 0xd5, // nop
];

const _ASSERTS: () = {
    assert!(PLT_HEADER_TEMPLATE.len() as u64 == PLT_HEADER_SIZE);
    assert!(PLT_ENTRY_TEMPLATE.len() as u64 == PLT_ENTRY_SIZE);
    assert!(PLT_TLSDESC_TEMPLATE.len() as u64 == PLT_TLSDESC_ENTRY_SIZE);
    assert!(RELA_ENTRY_SIZE as usize == size_of::<Rela64<LittleEndian>>());
};

/// Inserts the page distance from `place` to `target` into an adrp's immediate field.
pub(crate) fn write_adrp(word: &mut [u8], target: u64, place: u64) {
    let page_delta = (target & DEFAULT_AARCH64_PAGE_IGNORED_MASK)
        .wrapping_sub(place & DEFAULT_AARCH64_PAGE_IGNORED_MASK);
    AArch64Instruction::Adr.write_to_value(
        extract_bits(page_delta, 12..33),
        (page_delta as i64).is_negative(),
        word,
    );
}

/// Inserts `target`'s page offset, scaled for an 8-byte load, into an `ldr Xt, [Xn, #imm]`.
pub(crate) fn write_ldr_lo12(word: &mut [u8], target: u64) {
    AArch64Instruction::LdrRegister.write_to_value(
        (target & DEFAULT_AARCH64_PAGE_MASK) / GOT_ENTRY_SIZE,
        false,
        word,
    );
}

/// Inserts `target`'s page offset into an `add Xd, Xn, #imm`.
pub(crate) fn write_add_lo12(word: &mut [u8], target: u64) {
    AArch64Instruction::Add.write_to_value(target & DEFAULT_AARCH64_PAGE_MASK, false, word);
}

/// Writes one PLT entry that jumps through the `.got.plt` slot at `got_entry_address`.
pub(crate) fn write_plt_entry(plt_entry: &mut [u8], got_entry_address: u64, plt_address: u64) {
    plt_entry.copy_from_slice(PLT_ENTRY_TEMPLATE);
    write_adrp(&mut plt_entry[0..4], got_entry_address, plt_address);
    write_ldr_lo12(&mut plt_entry[4..8], got_entry_address);
}

/// Masks applied to the inputs of a relocation's value expression. Page-relative relocations
/// truncate both sides to their 4 KiB page before subtracting.
pub(crate) struct PageMaskValue {
    pub(crate) symbol_plus_addend: u64,
    pub(crate) got_entry: u64,
    pub(crate) place: u64,
}

impl Default for PageMaskValue {
    fn default() -> Self {
        Self {
            symbol_plus_addend: u64::MAX,
            got_entry: u64::MAX,
            place: u64::MAX,
        }
    }
}

#[must_use]
pub(crate) fn get_page_mask(mask: Option<linker_utils::elf::PageMask>) -> PageMaskValue {
    let Some(mask) = mask else {
        return PageMaskValue::default();
    };

    match mask {
        linker_utils::elf::PageMask::SymbolPlusAddendAndPosition => PageMaskValue {
            symbol_plus_addend: DEFAULT_AARCH64_PAGE_IGNORED_MASK,
            place: DEFAULT_AARCH64_PAGE_IGNORED_MASK,
            ..Default::default()
        },
        linker_utils::elf::PageMask::GotEntryAndPosition => PageMaskValue {
            got_entry: DEFAULT_AARCH64_PAGE_IGNORED_MASK,
            place: DEFAULT_AARCH64_PAGE_IGNORED_MASK,
            ..Default::default()
        },
    }
}
