use crate::bits::BitRange;
use crate::bits::extract_bits;
use anyhow::Result;
use std::borrow::Cow;
use std::fmt;

macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

macro_rules! const_value_by_name {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(stringify!($const) => Some(object::elf::$const),)*
            _ => None
        }
    };
}

macro_rules! for_each_aarch64_relocation_name {
    ($macro:ident, $needle:expr) => {
        $macro![
            $needle,
            R_AARCH64_NONE,
            R_AARCH64_ABS64,
            R_AARCH64_ABS32,
            R_AARCH64_ABS16,
            R_AARCH64_PREL64,
            R_AARCH64_PREL32,
            R_AARCH64_PREL16,
            R_AARCH64_MOVW_UABS_G0,
            R_AARCH64_MOVW_UABS_G0_NC,
            R_AARCH64_MOVW_UABS_G1,
            R_AARCH64_MOVW_UABS_G1_NC,
            R_AARCH64_MOVW_UABS_G2,
            R_AARCH64_MOVW_UABS_G2_NC,
            R_AARCH64_MOVW_UABS_G3,
            R_AARCH64_MOVW_SABS_G0,
            R_AARCH64_MOVW_SABS_G1,
            R_AARCH64_MOVW_SABS_G2,
            R_AARCH64_LD_PREL_LO19,
            R_AARCH64_ADR_PREL_LO21,
            R_AARCH64_ADR_PREL_PG_HI21,
            R_AARCH64_ADR_PREL_PG_HI21_NC,
            R_AARCH64_ADD_ABS_LO12_NC,
            R_AARCH64_LDST8_ABS_LO12_NC,
            R_AARCH64_LDST16_ABS_LO12_NC,
            R_AARCH64_LDST32_ABS_LO12_NC,
            R_AARCH64_LDST64_ABS_LO12_NC,
            R_AARCH64_LDST128_ABS_LO12_NC,
            R_AARCH64_TSTBR14,
            R_AARCH64_CONDBR19,
            R_AARCH64_JUMP26,
            R_AARCH64_CALL26,
            R_AARCH64_ADR_GOT_PAGE,
            R_AARCH64_LD64_GOT_LO12_NC,
            R_AARCH64_GOT_LD_PREL19,
            R_AARCH64_TLSGD_ADR_PAGE21,
            R_AARCH64_TLSGD_ADD_LO12_NC,
            R_AARCH64_TLSLD_ADR_PAGE21,
            R_AARCH64_TLSLD_ADD_LO12_NC,
            R_AARCH64_TLSLD_MOVW_DTPREL_G2,
            R_AARCH64_TLSLD_MOVW_DTPREL_G1,
            R_AARCH64_TLSLD_MOVW_DTPREL_G1_NC,
            R_AARCH64_TLSLD_MOVW_DTPREL_G0,
            R_AARCH64_TLSLD_MOVW_DTPREL_G0_NC,
            R_AARCH64_TLSLD_ADD_DTPREL_HI12,
            R_AARCH64_TLSLD_ADD_DTPREL_LO12,
            R_AARCH64_TLSLD_ADD_DTPREL_LO12_NC,
            R_AARCH64_TLSIE_MOVW_GOTTPREL_G1,
            R_AARCH64_TLSIE_MOVW_GOTTPREL_G0_NC,
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21,
            R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC,
            R_AARCH64_TLSIE_LD_GOTTPREL_PREL19,
            R_AARCH64_TLSLE_MOVW_TPREL_G2,
            R_AARCH64_TLSLE_MOVW_TPREL_G1,
            R_AARCH64_TLSLE_MOVW_TPREL_G1_NC,
            R_AARCH64_TLSLE_MOVW_TPREL_G0,
            R_AARCH64_TLSLE_MOVW_TPREL_G0_NC,
            R_AARCH64_TLSLE_ADD_TPREL_HI12,
            R_AARCH64_TLSLE_ADD_TPREL_LO12,
            R_AARCH64_TLSLE_ADD_TPREL_LO12_NC,
            R_AARCH64_TLSLE_LDST8_TPREL_LO12,
            R_AARCH64_TLSLE_LDST8_TPREL_LO12_NC,
            R_AARCH64_TLSLE_LDST16_TPREL_LO12,
            R_AARCH64_TLSLE_LDST16_TPREL_LO12_NC,
            R_AARCH64_TLSLE_LDST32_TPREL_LO12,
            R_AARCH64_TLSLE_LDST32_TPREL_LO12_NC,
            R_AARCH64_TLSLE_LDST64_TPREL_LO12,
            R_AARCH64_TLSLE_LDST64_TPREL_LO12_NC,
            R_AARCH64_TLSLE_LDST128_TPREL_LO12,
            R_AARCH64_TLSLE_LDST128_TPREL_LO12_NC,
            R_AARCH64_TLSDESC_ADR_PAGE21,
            R_AARCH64_TLSDESC_LD64_LO12,
            R_AARCH64_TLSDESC_ADD_LO12,
            R_AARCH64_TLSDESC_CALL,
            R_AARCH64_COPY,
            R_AARCH64_GLOB_DAT,
            R_AARCH64_JUMP_SLOT,
            R_AARCH64_RELATIVE,
            R_AARCH64_TLS_DTPMOD,
            R_AARCH64_TLS_DTPREL,
            R_AARCH64_TLS_TPREL,
            R_AARCH64_TLSDESC,
            R_AARCH64_IRELATIVE
        ]
    };
}

#[must_use]
pub fn aarch64_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if let Some(name) = for_each_aarch64_relocation_name!(const_name_by_value, r_type) {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown aarch64 relocation type 0x{r_type:x}"))
    }
}

/// The inverse of `aarch64_rel_type_to_string`. Intended for diagnostics and tests, so a linear
/// name match is fine.
#[must_use]
pub fn aarch64_rel_type_from_string(name: &str) -> Option<u32> {
    for_each_aarch64_relocation_name!(const_value_by_name, name)
}

/// Section flag bit values.
pub mod shf {
    use super::SectionFlags;

    pub const WRITE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_WRITE);
    pub const ALLOC: SectionFlags = SectionFlags::from_u32(object::elf::SHF_ALLOC);
    pub const EXECINSTR: SectionFlags = SectionFlags::from_u32(object::elf::SHF_EXECINSTR);
    pub const TLS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_TLS);
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SectionFlags(u32);

impl SectionFlags {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    #[must_use]
    pub const fn from_u32(raw: u32) -> SectionFlags {
        SectionFlags(raw)
    }

    /// Returns self with the specified flags set.
    #[must_use]
    pub const fn with(self, flags: SectionFlags) -> SectionFlags {
        SectionFlags(self.0 | flags.0)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0 as u64
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (flag, ch) in [
            (shf::WRITE, "W"),
            (shf::ALLOC, "A"),
            (shf::EXECINSTR, "X"),
            (shf::TLS, "T"),
        ] {
            if self.contains(flag) {
                f.write_str(ch)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

impl std::ops::BitOrAssign for SectionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// For additional information on ELF relocation types, see "ELF-64 Object File Format" -
/// <https://uclibc.org/docs/elf-64-gen.pdf>. For information on the TLS related relocations, see
/// "ELF Handling For Thread-Local Storage" - <https://www.uclibc.org/docs/tls.pdf>.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelocationKind {
    /// The absolute address of a symbol or section.
    Absolute,

    /// The absolute address of a symbol or section. We are going to extract only the offset
    /// within a page, so dynamic relocation creation must be skipped.
    AbsoluteAArch64,

    /// The address of the symbol, relative to the place of the relocation.
    Relative,

    /// The address of the symbol's GOT entry.
    Got,

    /// The address of the symbol's GOT entry, relative to the place of the relocation.
    GotRelative,

    /// The address of the symbol's PLT entry, relative to the place of relocation.
    PltRelative,

    /// The address of a TLSGD structure, relative to the place of the relocation. A TLSGD
    /// (thread-local storage general dynamic) structure is a pair of values containing a module ID
    /// and the offset within that module's TLS storage.
    TlsGd,

    /// The address of the symbol's TLSGD GOT entry.
    TlsGdGot,

    /// The address of the TLS module ID entry for the object that we're writing, relative to the
    /// place of the relocation. This is used when a TLS variable is defined and used within the
    /// same object.
    TlsLd,

    /// The address of the TLS module ID entry for the object that we're writing.
    TlsLdGot,

    /// The offset of a thread-local within the TLS storage of the module that defines it.
    DtpOff,

    /// The address of a GOT entry containing the offset of a TLS variable within the executable's
    /// TLS storage, relative to the place of the relocation.
    GotTpOff,

    /// The address of a GOT entry containing the offset of a TLS variable within the executable's
    /// TLS storage.
    GotTpOffGot,

    /// The offset of a TLS variable within the executable's TLS storage.
    TpOff,

    /// The address of a TLS descriptor structure, relative to the place of the relocation.
    TlsDesc,

    /// The address of a TLS descriptor structure.
    TlsDescGot,

    /// Call to the TLS descriptor trampoline. Used only as a placeholder for a linker relaxation
    /// opportunity.
    TlsDescCall,

    /// No relocation needs to be applied. Produced when we eliminate a relocation due to an
    /// optimisation.
    None,
}

impl RelocationKind {
    #[must_use]
    pub fn is_tls(self) -> bool {
        matches!(
            self,
            Self::DtpOff
                | Self::GotTpOff
                | Self::GotTpOffGot
                | Self::TlsDesc
                | Self::TlsDescCall
                | Self::TlsDescGot
                | Self::TlsGd
                | Self::TlsGdGot
                | Self::TlsLd
                | Self::TlsLdGot
                | Self::TpOff
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DynamicRelocationKind {
    Copy,
    Irelative,
    DtpMod,
    DtpOff,
    TlsDesc,
    TpOff,
    Relative,
    Absolute,
    GotEntry,
    JumpSlot,
}

impl DynamicRelocationKind {
    #[must_use]
    pub fn from_aarch64_r_type(r_type: u32) -> Option<Self> {
        let kind = match r_type {
            object::elf::R_AARCH64_COPY => DynamicRelocationKind::Copy,
            object::elf::R_AARCH64_IRELATIVE => DynamicRelocationKind::Irelative,
            object::elf::R_AARCH64_TLS_DTPMOD => DynamicRelocationKind::DtpMod,
            object::elf::R_AARCH64_TLS_DTPREL => DynamicRelocationKind::DtpOff,
            object::elf::R_AARCH64_TLS_TPREL => DynamicRelocationKind::TpOff,
            object::elf::R_AARCH64_RELATIVE => DynamicRelocationKind::Relative,
            object::elf::R_AARCH64_ABS64 => DynamicRelocationKind::Absolute,
            object::elf::R_AARCH64_GLOB_DAT => DynamicRelocationKind::GotEntry,
            object::elf::R_AARCH64_TLSDESC => DynamicRelocationKind::TlsDesc,
            object::elf::R_AARCH64_JUMP_SLOT => DynamicRelocationKind::JumpSlot,
            _ => return None,
        };

        Some(kind)
    }

    #[must_use]
    pub fn aarch64_r_type(self) -> u32 {
        match self {
            DynamicRelocationKind::Copy => object::elf::R_AARCH64_COPY,
            DynamicRelocationKind::Irelative => object::elf::R_AARCH64_IRELATIVE,
            DynamicRelocationKind::DtpMod => object::elf::R_AARCH64_TLS_DTPMOD,
            DynamicRelocationKind::DtpOff => object::elf::R_AARCH64_TLS_DTPREL,
            DynamicRelocationKind::TpOff => object::elf::R_AARCH64_TLS_TPREL,
            DynamicRelocationKind::Relative => object::elf::R_AARCH64_RELATIVE,
            DynamicRelocationKind::Absolute => object::elf::R_AARCH64_ABS64,
            DynamicRelocationKind::GotEntry => object::elf::R_AARCH64_GLOB_DAT,
            DynamicRelocationKind::TlsDesc => object::elf::R_AARCH64_TLSDESC,
            DynamicRelocationKind::JumpSlot => object::elf::R_AARCH64_JUMP_SLOT,
        }
    }
}

/// The instruction class a bit-masked relocation writes into. The encoder knows where the
/// immediate field of each class lives within the 32-bit word.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum AArch64Instruction {
    Adr,
    Movkz,
    Movnz,
    Ldr,
    LdrRegister,
    Add,
    LdSt,
    TstBr,
    Bcond,
    JumpCall,
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum RelocationSize {
    ByteSize(usize),
    BitMasking(BitMask),
}

impl fmt::Display for RelocationSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ByteSize(bytes) => f.write_fmt(format_args!("{bytes}B")),
            Self::BitMasking(mask) => {
                f.write_fmt(format_args!("{}..{}", mask.range.start, mask.range.end))
            }
        }
    }
}

impl RelocationSize {
    pub(crate) const fn bit_mask_aarch64(
        bit_start: u32,
        bit_end: u32,
        instruction: AArch64Instruction,
    ) -> RelocationSize {
        Self::BitMasking(BitMask::new(instruction, bit_start, bit_end))
    }
}

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub struct BitMask {
    pub instruction: AArch64Instruction,
    pub range: BitRange,
}

impl BitMask {
    #[must_use]
    pub const fn new(instruction: AArch64Instruction, bit_start: u32, bit_end: u32) -> Self {
        Self {
            instruction,
            range: BitRange::new(bit_start, bit_end),
        }
    }
}

/// Which of the values feeding a relocation get truncated to their 4 KiB page before the
/// subtraction is performed. Page-relative relocations (ADRP forms) measure distances between
/// pages, not bytes.
#[derive(Debug, Clone, Copy)]
pub enum PageMask {
    SymbolPlusAddendAndPosition,
    GotEntryAndPosition,
}

/// Allowed range (half-open) of a computed relocation value. This encodes the field's overflow
/// policy: a signed or unsigned range is a hard check, while `no_check` is the silently
/// truncating policy used for `_NC` ("no check") fields.
#[derive(Clone, Debug, Copy)]
pub struct AllowedRange {
    pub min: i64,
    pub max: i64,
}

impl AllowedRange {
    #[must_use]
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    #[must_use]
    pub const fn no_check() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    #[must_use]
    pub const fn is_no_check(self) -> bool {
        self.min == i64::MIN && self.max == i64::MAX
    }
}

#[derive(Clone, Debug, Copy)]
pub struct RelocationKindInfo {
    pub kind: RelocationKind,
    pub size: RelocationSize,
    pub mask: Option<PageMask>,
    pub range: AllowedRange,
    pub alignment: usize,
}

impl RelocationKindInfo {
    #[inline(always)]
    pub fn verify(&self, value: i64) -> Result<()> {
        anyhow::ensure!(
            (value as usize) & (self.alignment - 1) == 0,
            "Relocation {value} not aligned to {} bytes",
            self.alignment
        );
        anyhow::ensure!(
            self.range.min <= value && value < self.range.max,
            format!(
                "Relocation {value} outside of bounds [{}, {})",
                self.range.min, self.range.max
            )
        );
        Ok(())
    }
}

#[inline(always)]
pub fn write_relocation_to_buffer(
    rel_info: &RelocationKindInfo,
    value: u64,
    output: &mut [u8],
) -> Result<()> {
    rel_info.verify(value as i64)?;

    match rel_info.size {
        RelocationSize::ByteSize(byte_size) => {
            anyhow::ensure!(
                byte_size <= output.len(),
                "Relocation outside of bounds of section"
            );
            let value_bytes = value.to_le_bytes();
            output[..byte_size].copy_from_slice(&value_bytes[..byte_size]);
        }
        RelocationSize::BitMasking(BitMask { range, instruction }) => {
            let extracted_value = extract_bits(value, range.start..range.end);
            let negative = (value as i64).is_negative();
            instruction.write_to_value(extracted_value, negative, output);
        }
    }

    Ok(())
}
