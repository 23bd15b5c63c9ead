use crate::bits::extract_bits;
use crate::bits::or_from_slice;
use crate::bits::u32_from_slice;
use crate::elf::AArch64Instruction;
use crate::elf::AllowedRange;
use crate::elf::PageMask;
use crate::elf::RelocationKind;
use crate::elf::RelocationKindInfo;
use crate::elf::RelocationSize;
use crate::relaxation::RelocationModifier;

pub const DEFAULT_AARCH64_PAGE_SIZE: u64 = 0x1000;
pub const DEFAULT_AARCH64_PAGE_MASK: u64 = DEFAULT_AARCH64_PAGE_SIZE - 1;
pub const DEFAULT_AARCH64_PAGE_IGNORED_MASK: u64 = !DEFAULT_AARCH64_PAGE_MASK;

/// Reach of a B/BL instruction's signed 26-bit word-scaled immediate.
pub const MAX_FWD_BRANCH_OFFSET: i64 = ((1 << 25) - 1) << 2;
pub const MAX_BWD_BRANCH_OFFSET: i64 = -(1 << 27);

/// Reach of an ADRP instruction's signed 21-bit page-scaled immediate.
pub const MAX_ADRP_IMM: i64 = (1 << 20) - 1;
pub const MIN_ADRP_IMM: i64 = -(1 << 20);

/// Size of the thread control block that sits between the thread pointer and the first module's
/// TLS block.
pub const TCB_SIZE: u64 = 16;

pub const INSN_NOP: u32 = 0xd503201f;

#[must_use]
pub fn branch_in_range(place: u64, destination: u64) -> bool {
    let offset = destination.wrapping_sub(place) as i64;
    (MAX_BWD_BRANCH_OFFSET..=MAX_FWD_BRANCH_OFFSET).contains(&offset)
}

#[must_use]
pub fn valid_for_adrp(place: u64, destination: u64) -> bool {
    let page_offset = (destination & DEFAULT_AARCH64_PAGE_IGNORED_MASK)
        .wrapping_sub(place & DEFAULT_AARCH64_PAGE_IGNORED_MASK) as i64
        >> 12;
    (MIN_ADRP_IMM..=MAX_ADRP_IMM).contains(&page_offset)
}

// The table of the relocations is documented here:
// https://github.com/ARM-software/abi-aa/blob/main/aaelf64/aaelf64.rst.
//
// Only the small code model (plus TLSDESC) is supported. Tiny and large model relocations are
// rejected, as are the dynamic relocation types, which are never valid in relocatable inputs.
#[must_use]
pub const fn relocation_type_from_raw(r_type: u32) -> Option<RelocationKindInfo> {
    let (kind, size, mask, range, alignment) = match r_type {
        object::elf::R_AARCH64_NONE => (
            RelocationKind::None,
            RelocationSize::ByteSize(0),
            None,
            AllowedRange::no_check(),
            1,
        ),
        // Data relocations.
        object::elf::R_AARCH64_ABS64 => (
            RelocationKind::Absolute,
            RelocationSize::ByteSize(8),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_ABS32 => (
            RelocationKind::Absolute,
            RelocationSize::ByteSize(4),
            None,
            AllowedRange::new(-(2i64.pow(31)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_ABS16 => (
            RelocationKind::Absolute,
            RelocationSize::ByteSize(2),
            None,
            AllowedRange::new(-(2i64.pow(15)), 2i64.pow(16)),
            1,
        ),
        object::elf::R_AARCH64_PREL64 => (
            RelocationKind::Relative,
            RelocationSize::ByteSize(8),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_PREL32 => (
            RelocationKind::Relative,
            RelocationSize::ByteSize(4),
            None,
            AllowedRange::new(-(2i64.pow(31)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_PREL16 => (
            RelocationKind::Relative,
            RelocationSize::ByteSize(2),
            None,
            AllowedRange::new(-(2i64.pow(15)), 2i64.pow(16)),
            1,
        ),
        // MOVW absolute groups.
        object::elf::R_AARCH64_MOVW_UABS_G0 => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movkz),
            None,
            AllowedRange::new(0, 2i64.pow(16)),
            1,
        ),
        object::elf::R_AARCH64_MOVW_UABS_G0_NC => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_MOVW_UABS_G1 => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movkz),
            None,
            AllowedRange::new(0, 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_MOVW_UABS_G1_NC => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_MOVW_UABS_G2 => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(32, 48, AArch64Instruction::Movkz),
            None,
            AllowedRange::new(0, 2i64.pow(48)),
            1,
        ),
        object::elf::R_AARCH64_MOVW_UABS_G2_NC => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(32, 48, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_MOVW_UABS_G3 => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(48, 64, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_MOVW_SABS_G0 => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(16)), 2i64.pow(16)),
            1,
        ),
        object::elf::R_AARCH64_MOVW_SABS_G1 => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_MOVW_SABS_G2 => (
            RelocationKind::Absolute,
            RelocationSize::bit_mask_aarch64(32, 48, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(48)), 2i64.pow(48)),
            1,
        ),
        // PC-relative addresses and branches.
        object::elf::R_AARCH64_LD_PREL_LO19 => (
            RelocationKind::Relative,
            RelocationSize::bit_mask_aarch64(2, 21, AArch64Instruction::Ldr),
            None,
            AllowedRange::new(-(2i64.pow(20)), 2i64.pow(20)),
            4,
        ),
        object::elf::R_AARCH64_ADR_PREL_LO21 => (
            RelocationKind::Relative,
            RelocationSize::bit_mask_aarch64(0, 21, AArch64Instruction::Adr),
            None,
            AllowedRange::new(-(2i64.pow(20)), 2i64.pow(20)),
            1,
        ),
        object::elf::R_AARCH64_ADR_PREL_PG_HI21 => (
            RelocationKind::Relative,
            RelocationSize::bit_mask_aarch64(12, 33, AArch64Instruction::Adr),
            Some(PageMask::SymbolPlusAddendAndPosition),
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_ADR_PREL_PG_HI21_NC => (
            RelocationKind::Relative,
            RelocationSize::bit_mask_aarch64(12, 33, AArch64Instruction::Adr),
            Some(PageMask::SymbolPlusAddendAndPosition),
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_ADD_ABS_LO12_NC => (
            RelocationKind::AbsoluteAArch64,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_LDST8_ABS_LO12_NC => (
            RelocationKind::AbsoluteAArch64,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_LDST16_ABS_LO12_NC => (
            RelocationKind::AbsoluteAArch64,
            RelocationSize::bit_mask_aarch64(1, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_LDST32_ABS_LO12_NC => (
            RelocationKind::AbsoluteAArch64,
            RelocationSize::bit_mask_aarch64(2, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_LDST64_ABS_LO12_NC => (
            RelocationKind::AbsoluteAArch64,
            RelocationSize::bit_mask_aarch64(3, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_LDST128_ABS_LO12_NC => (
            RelocationKind::AbsoluteAArch64,
            RelocationSize::bit_mask_aarch64(4, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TSTBR14 => (
            RelocationKind::Relative,
            RelocationSize::bit_mask_aarch64(2, 16, AArch64Instruction::TstBr),
            None,
            AllowedRange::new(-(2i64.pow(15)), 2i64.pow(15)),
            4,
        ),
        object::elf::R_AARCH64_CONDBR19 => (
            RelocationKind::Relative,
            RelocationSize::bit_mask_aarch64(2, 21, AArch64Instruction::Bcond),
            None,
            AllowedRange::new(-(2i64.pow(20)), 2i64.pow(20)),
            4,
        ),
        object::elf::R_AARCH64_JUMP26 | object::elf::R_AARCH64_CALL26 => (
            RelocationKind::PltRelative,
            RelocationSize::bit_mask_aarch64(2, 28, AArch64Instruction::JumpCall),
            None,
            AllowedRange::new(-(2i64.pow(27)), 2i64.pow(27)),
            4,
        ),
        // GOT-relative relocations.
        object::elf::R_AARCH64_ADR_GOT_PAGE => (
            RelocationKind::GotRelative,
            RelocationSize::bit_mask_aarch64(12, 33, AArch64Instruction::Adr),
            Some(PageMask::GotEntryAndPosition),
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_LD64_GOT_LO12_NC => (
            RelocationKind::Got,
            RelocationSize::bit_mask_aarch64(3, 12, AArch64Instruction::LdrRegister),
            None,
            AllowedRange::no_check(),
            8,
        ),
        object::elf::R_AARCH64_GOT_LD_PREL19 => (
            RelocationKind::GotRelative,
            RelocationSize::bit_mask_aarch64(2, 21, AArch64Instruction::Ldr),
            None,
            AllowedRange::new(-(2i64.pow(20)), 2i64.pow(20)),
            4,
        ),
        // TLS general dynamic.
        object::elf::R_AARCH64_TLSGD_ADR_PAGE21 => (
            RelocationKind::TlsGd,
            RelocationSize::bit_mask_aarch64(12, 33, AArch64Instruction::Adr),
            Some(PageMask::GotEntryAndPosition),
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_TLSGD_ADD_LO12_NC => (
            RelocationKind::TlsGdGot,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::no_check(),
            1,
        ),
        // TLS local dynamic.
        object::elf::R_AARCH64_TLSLD_ADR_PAGE21 => (
            RelocationKind::TlsLd,
            RelocationSize::bit_mask_aarch64(12, 33, AArch64Instruction::Adr),
            Some(PageMask::GotEntryAndPosition),
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_ADD_LO12_NC => (
            RelocationKind::TlsLdGot,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_MOVW_DTPREL_G2 => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(32, 48, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(48)), 2i64.pow(48)),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_MOVW_DTPREL_G1 => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_MOVW_DTPREL_G1_NC => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_MOVW_DTPREL_G0 => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(16)), 2i64.pow(16)),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_MOVW_DTPREL_G0_NC => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_ADD_DTPREL_HI12 => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(12, 24, AArch64Instruction::Add),
            None,
            AllowedRange::new(0, 2i64.pow(24)),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_ADD_DTPREL_LO12 => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::new(0, 2i64.pow(12)),
            1,
        ),
        object::elf::R_AARCH64_TLSLD_ADD_DTPREL_LO12_NC => (
            RelocationKind::DtpOff,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::no_check(),
            1,
        ),
        // TLS initial exec.
        object::elf::R_AARCH64_TLSIE_MOVW_GOTTPREL_G1 => (
            RelocationKind::GotTpOffGot,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_TLSIE_MOVW_GOTTPREL_G0_NC => (
            RelocationKind::GotTpOffGot,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => (
            RelocationKind::GotTpOff,
            RelocationSize::bit_mask_aarch64(12, 33, AArch64Instruction::Adr),
            Some(PageMask::GotEntryAndPosition),
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => (
            RelocationKind::GotTpOffGot,
            RelocationSize::bit_mask_aarch64(3, 12, AArch64Instruction::LdrRegister),
            None,
            AllowedRange::no_check(),
            8,
        ),
        object::elf::R_AARCH64_TLSIE_LD_GOTTPREL_PREL19 => (
            RelocationKind::GotTpOff,
            RelocationSize::bit_mask_aarch64(2, 21, AArch64Instruction::Ldr),
            None,
            AllowedRange::new(-(2i64.pow(20)), 2i64.pow(20)),
            4,
        ),
        // TLS local exec.
        object::elf::R_AARCH64_TLSLE_MOVW_TPREL_G2 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(32, 48, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(48)), 2i64.pow(48)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_MOVW_TPREL_G1 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_MOVW_TPREL_G1_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(16, 32, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_MOVW_TPREL_G0 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movnz),
            None,
            AllowedRange::new(-(2i64.pow(16)), 2i64.pow(16)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_MOVW_TPREL_G0_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(0, 16, AArch64Instruction::Movkz),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_ADD_TPREL_HI12 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(12, 24, AArch64Instruction::Add),
            None,
            AllowedRange::new(0, 2i64.pow(24)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_ADD_TPREL_LO12 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::new(0, 2i64.pow(12)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST8_TPREL_LO12 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::new(0, 2i64.pow(12)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST8_TPREL_LO12_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST16_TPREL_LO12 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(1, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::new(0, 2i64.pow(13)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST16_TPREL_LO12_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(1, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST32_TPREL_LO12 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(2, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::new(0, 2i64.pow(14)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST32_TPREL_LO12_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(2, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST64_TPREL_LO12 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(3, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::new(0, 2i64.pow(15)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST64_TPREL_LO12_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(3, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST128_TPREL_LO12 => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(4, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::new(0, 2i64.pow(16)),
            1,
        ),
        object::elf::R_AARCH64_TLSLE_LDST128_TPREL_LO12_NC => (
            RelocationKind::TpOff,
            RelocationSize::bit_mask_aarch64(4, 12, AArch64Instruction::LdSt),
            None,
            AllowedRange::no_check(),
            1,
        ),
        // TLS descriptor.
        object::elf::R_AARCH64_TLSDESC_ADR_PAGE21 => (
            RelocationKind::TlsDesc,
            RelocationSize::bit_mask_aarch64(12, 33, AArch64Instruction::Adr),
            Some(PageMask::GotEntryAndPosition),
            AllowedRange::new(-(2i64.pow(32)), 2i64.pow(32)),
            1,
        ),
        object::elf::R_AARCH64_TLSDESC_LD64_LO12 => (
            RelocationKind::TlsDescGot,
            RelocationSize::bit_mask_aarch64(3, 12, AArch64Instruction::LdrRegister),
            None,
            AllowedRange::no_check(),
            8,
        ),
        object::elf::R_AARCH64_TLSDESC_ADD_LO12 => (
            RelocationKind::TlsDescGot,
            RelocationSize::bit_mask_aarch64(0, 12, AArch64Instruction::Add),
            None,
            AllowedRange::no_check(),
            1,
        ),
        object::elf::R_AARCH64_TLSDESC_CALL => (
            RelocationKind::TlsDescCall,
            RelocationSize::ByteSize(0),
            None,
            AllowedRange::no_check(),
            1,
        ),
        _ => return None,
    };

    Some(RelocationKindInfo {
        kind,
        size,
        mask,
        range,
        alignment,
    })
}

impl AArch64Instruction {
    // Encode the extracted relocation value into the instruction's immediate field. Instruction
    // field layouts are defined in the Arm ARM, C4 (A64 instruction set encoding).
    pub fn write_to_value(self, extracted_value: u64, negative: bool, dest: &mut [u8]) {
        let mask = match self {
            AArch64Instruction::Adr => {
                let immlo = extracted_value & 0x3;
                let immhi = (extracted_value >> 2) & 0x7ffff;
                ((immlo as u32) << 29) | ((immhi as u32) << 5)
            }
            AArch64Instruction::Movkz => ((extracted_value & 0xffff) as u32) << 5,
            AArch64Instruction::Movnz => {
                // MOVZ and MOVN differ in bit 30. A negative value is materialised by inverting
                // the group bits and flipping the instruction to MOVN.
                let mut insn = u32_from_slice(dest);
                let imm = if negative {
                    insn &= !(1 << 30);
                    !extracted_value & 0xffff
                } else {
                    insn |= 1 << 30;
                    extracted_value & 0xffff
                };
                insn |= (imm as u32) << 5;
                dest[..4].copy_from_slice(&insn.to_le_bytes());
                return;
            }
            AArch64Instruction::Ldr | AArch64Instruction::Bcond => {
                ((extracted_value & 0x7ffff) as u32) << 5
            }
            AArch64Instruction::LdrRegister
            | AArch64Instruction::Add
            | AArch64Instruction::LdSt => ((extracted_value & 0xfff) as u32) << 10,
            AArch64Instruction::TstBr => ((extracted_value & 0x3fff) as u32) << 5,
            AArch64Instruction::JumpCall => (extracted_value & 0x3ffffff) as u32,
        };
        or_from_slice(dest, &mask.to_le_bytes());
    }

    /// The inverse of `write_to_value`. Returns `(extracted_value, negative)`. Supplied `bytes`
    /// must be at least 4 bytes, otherwise we panic.
    #[must_use]
    pub fn read_value(self, bytes: &[u8]) -> (u64, bool) {
        let insn = u64::from(u32_from_slice(bytes));
        match self {
            AArch64Instruction::Adr => {
                let immlo = extract_bits(insn, 29..31);
                let immhi = extract_bits(insn, 5..24);
                ((immhi << 2) | immlo, false)
            }
            AArch64Instruction::Movkz => (extract_bits(insn, 5..21), false),
            AArch64Instruction::Movnz => {
                let imm = extract_bits(insn, 5..21);
                if insn & (1 << 30) == 0 {
                    (!imm & 0xffff, true)
                } else {
                    (imm, false)
                }
            }
            AArch64Instruction::Ldr | AArch64Instruction::Bcond => (extract_bits(insn, 5..24), false),
            AArch64Instruction::LdrRegister
            | AArch64Instruction::Add
            | AArch64Instruction::LdSt => (extract_bits(insn, 10..22), false),
            AArch64Instruction::TstBr => (extract_bits(insn, 5..19), false),
            AArch64Instruction::JumpCall => (extract_bits(insn, 0..26), false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaxationKind {
    /// Leave the instruction alone. Used when we only want to change the kind of relocation used.
    NoOp,

    /// Replace the instruction with a nop.
    ReplaceWithNop,

    /// Replace with `movz x0, #0, lsl #16`, ready to receive a G1 TPREL group.
    MovzX0Lsl16,

    /// Replace with `movk x0, #0`, ready to receive a G0_NC TPREL group.
    MovkX0,

    /// Replace with `ldr x0, [x0]`, ready to receive a GOTTPREL LO12 offset.
    LdrX0,

    /// Keep the instruction, forcing its destination register to x0.
    RewriteDestToX0,

    /// Rewrite the general-dynamic `add`/`bl`/`nop` call sequence to the local-exec form:
    /// `movk x0`, `mrs x1, tpidr_el0`, `add x0, x1, x0`.
    TlsGdToLe,

    /// Rewrite the general-dynamic `add`/`bl`/`nop` call sequence to the initial-exec form:
    /// `ldr x0, [x0]`, `mrs x1, tpidr_el0`, `add x0, x1, x0`.
    TlsGdToIe,

    /// Replace the local-dynamic page address with `mrs x0, tpidr_el0`.
    TlsLdToLeMrs,

    /// Rewrite the local-dynamic `add`/`bl` pair to `add x0, x0, #TCB_SIZE` and a nop.
    TlsLdToLeAddTcb,
}

const INSN_MOVZ_X0_LSL16: u32 = 0xd2a00000;
const INSN_MOVK_X0: u32 = 0xf2800000;
const INSN_LDR_X0_X0: u32 = 0xf9400000;
const INSN_MRS_X0_TPIDR_EL0: u32 = 0xd53bd040;
const INSN_MRS_X1_TPIDR_EL0: u32 = 0xd53bd041;
const INSN_ADD_X0_X1_X0: u32 = 0x8b000020;
const INSN_ADD_X0_X0_TCB: u32 = 0x91004000;

fn put_insn(section_bytes: &mut [u8], offset: usize, insn: u32) {
    section_bytes[offset..offset + 4].copy_from_slice(&insn.to_le_bytes());
}

impl RelaxationKind {
    pub fn apply(self, section_bytes: &mut [u8], offset_in_section: &mut u64, _addend: &mut i64) {
        let offset = *offset_in_section as usize;
        match self {
            RelaxationKind::NoOp => {}
            RelaxationKind::ReplaceWithNop => put_insn(section_bytes, offset, INSN_NOP),
            RelaxationKind::MovzX0Lsl16 => put_insn(section_bytes, offset, INSN_MOVZ_X0_LSL16),
            RelaxationKind::MovkX0 => put_insn(section_bytes, offset, INSN_MOVK_X0),
            RelaxationKind::LdrX0 => put_insn(section_bytes, offset, INSN_LDR_X0_X0),
            RelaxationKind::RewriteDestToX0 => {
                let insn = u32_from_slice(&section_bytes[offset..]) & 0xffff_ffe0;
                put_insn(section_bytes, offset, insn);
            }
            RelaxationKind::TlsGdToLe => {
                put_insn(section_bytes, offset, INSN_MOVK_X0);
                put_insn(section_bytes, offset + 4, INSN_MRS_X1_TPIDR_EL0);
                put_insn(section_bytes, offset + 8, INSN_ADD_X0_X1_X0);
            }
            RelaxationKind::TlsGdToIe => {
                put_insn(section_bytes, offset, INSN_LDR_X0_X0);
                put_insn(section_bytes, offset + 4, INSN_MRS_X1_TPIDR_EL0);
                put_insn(section_bytes, offset + 8, INSN_ADD_X0_X1_X0);
            }
            RelaxationKind::TlsLdToLeMrs => put_insn(section_bytes, offset, INSN_MRS_X0_TPIDR_EL0),
            RelaxationKind::TlsLdToLeAddTcb => {
                put_insn(section_bytes, offset, INSN_ADD_X0_X0_TCB);
                put_insn(section_bytes, offset + 4, INSN_NOP);
            }
        }
    }

    /// Returns how the relocation immediately following the relaxed one should be treated. The
    /// multi-instruction rewrites replace the `__tls_get_addr` call, so the `R_AARCH64_CALL26`
    /// that referenced it must not be applied.
    #[must_use]
    pub fn next_modifier(self) -> RelocationModifier {
        match self {
            RelaxationKind::TlsGdToLe
            | RelaxationKind::TlsGdToIe
            | RelaxationKind::TlsLdToLeAddTcb => RelocationModifier::SkipNextRelocation,
            _ => RelocationModifier::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::aarch64_rel_type_from_string;
    use crate::elf::aarch64_rel_type_to_string;
    use crate::elf::write_relocation_to_buffer;

    /// All relocation types present in the descriptor table.
    fn supported_types() -> Vec<u32> {
        (0..0x600)
            .filter(|t| relocation_type_from_raw(*t).is_some())
            .collect()
    }

    #[test]
    fn lookup_and_name_round_trip() {
        let types = supported_types();
        assert!(types.len() > 50);
        for r_type in types {
            let name = aarch64_rel_type_to_string(r_type);
            assert!(
                !name.starts_with("Unknown"),
                "type 0x{r_type:x} has no name"
            );
            assert_eq!(aarch64_rel_type_from_string(&name), Some(r_type));
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(relocation_type_from_raw(0x40).is_none());
        // Dynamic relocation types never appear in relocatable inputs.
        assert!(relocation_type_from_raw(object::elf::R_AARCH64_GLOB_DAT).is_none());
        // Tiny code model is unsupported.
        assert!(relocation_type_from_raw(object::elf::R_AARCH64_TLSGD_ADR_PREL21).is_none());
    }

    #[test]
    fn field_encode_decode_round_trip() {
        let cases: &[(AArch64Instruction, u32, u64)] = &[
            // (instruction, template word, field bit width)
            (AArch64Instruction::Adr, 0x90000000, 21),
            (AArch64Instruction::Movkz, 0xf2800000, 16),
            (AArch64Instruction::Ldr, 0x58000000, 19),
            (AArch64Instruction::LdrRegister, 0xf9400000, 12),
            (AArch64Instruction::Add, 0x91000000, 12),
            (AArch64Instruction::LdSt, 0xf9000000, 12),
            (AArch64Instruction::TstBr, 0x36000000, 14),
            (AArch64Instruction::Bcond, 0x54000000, 19),
            (AArch64Instruction::JumpCall, 0x94000000, 26),
        ];
        for &(insn, template, bits) in cases {
            for value in [0, 1, (1 << bits) - 1, (1 << bits) >> 1] {
                let mut word = template.to_le_bytes();
                insn.write_to_value(value, false, &mut word);
                let (read_back, negative) = insn.read_value(&word);
                assert!(!negative);
                assert_eq!(read_back, value, "{insn:?} value 0x{value:x}");
            }
        }
    }

    #[test]
    fn movnz_negative_round_trip() {
        // A negative value flips MOVZ to MOVN with the group bits inverted.
        let mut word = 0xd2800000_u32.to_le_bytes(); // movz x0, #0
        AArch64Instruction::Movnz.write_to_value(0xfff0, true, &mut word);
        let insn = u32::from_le_bytes(word);
        assert_eq!(insn & (1 << 30), 0, "expected MOVN");
        let (value, negative) = AArch64Instruction::Movnz.read_value(&word);
        assert!(negative);
        assert_eq!(value, 0xfff0);

        let mut word = 0x92800000_u32.to_le_bytes(); // movn x0, #0
        AArch64Instruction::Movnz.write_to_value(0x1234, false, &mut word);
        let insn = u32::from_le_bytes(word);
        assert_ne!(insn & (1 << 30), 0, "expected MOVZ");
        let (value, negative) = AArch64Instruction::Movnz.read_value(&word);
        assert!(!negative);
        assert_eq!(value, 0x1234);
    }

    #[test]
    fn descriptor_value_round_trip() {
        // Writing a value through a descriptor's geometry then reading the field back yields the
        // originally extracted bits, for values that pass the overflow check.
        for (r_type, value, template) in [
            (object::elf::R_AARCH64_CALL26, 0x0123_4560_i64, 0x94000000_u32),
            (object::elf::R_AARCH64_CALL26, -4, 0x94000000),
            (object::elf::R_AARCH64_CONDBR19, 0x4000, 0x54000000),
            (object::elf::R_AARCH64_ADD_ABS_LO12_NC, 0xabc, 0x91000000),
            (object::elf::R_AARCH64_MOVW_UABS_G1, 0x1234_0000, 0xf2800000),
        ] {
            let info = relocation_type_from_raw(r_type).unwrap();
            let mut buffer = template.to_le_bytes();
            write_relocation_to_buffer(&info, value as u64, &mut buffer).unwrap();
            let crate::elf::RelocationSize::BitMasking(mask) = info.size else {
                panic!("expected bit-masked relocation");
            };
            let (read_back, _negative) = mask.instruction.read_value(&buffer);
            let expected = extract_bits(value as u64, mask.range.start..mask.range.end);
            assert_eq!(read_back, expected, "{}", aarch64_rel_type_to_string(r_type));
        }
    }

    #[test]
    fn overflow_check_rejects_out_of_range() {
        let info = relocation_type_from_raw(object::elf::R_AARCH64_CONDBR19).unwrap();
        assert!(info.verify(1 << 20).is_err());
        assert!(info.verify((1 << 20) - 4).is_ok());
        // Unaligned branch targets are also rejected.
        assert!(info.verify(2).is_err());
    }

    #[test]
    fn branch_range_helpers() {
        assert!(branch_in_range(0x1000, 0x1000 + MAX_FWD_BRANCH_OFFSET as u64));
        assert!(!branch_in_range(
            0x1000,
            0x1000 + MAX_FWD_BRANCH_OFFSET as u64 + 4
        ));
        assert!(branch_in_range(0x0900_0000, 0x0100_0000));
        assert!(valid_for_adrp(0x1000, 0xffff_f000));
        assert!(!valid_for_adrp(0x1000, 0x2_0000_0000));
    }

    #[test]
    fn relaxation_patterns() {
        let mut bytes = [0u8; 12];
        let mut offset = 0;
        let mut addend = 0;
        RelaxationKind::TlsGdToLe.apply(&mut bytes, &mut offset, &mut addend);
        assert_eq!(u32_from_slice(&bytes[0..]), INSN_MOVK_X0);
        assert_eq!(u32_from_slice(&bytes[4..]), INSN_MRS_X1_TPIDR_EL0);
        assert_eq!(u32_from_slice(&bytes[8..]), INSN_ADD_X0_X1_X0);
        assert_eq!(
            RelaxationKind::TlsGdToLe.next_modifier(),
            RelocationModifier::SkipNextRelocation
        );

        let mut bytes = 0xf9400042_u32.to_le_bytes(); // ldr x2, [x2]
        let mut offset = 0;
        RelaxationKind::RewriteDestToX0.apply(&mut bytes, &mut offset, &mut addend);
        assert_eq!(u32::from_le_bytes(bytes), 0xf9400040);
    }
}
