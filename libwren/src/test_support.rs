//! Shared builders for unit tests.

use crate::input::InputSection;
use linker_utils::elf::SectionFlags;

pub(crate) fn exec_section(name: &str, data: Vec<u8>) -> InputSection {
    InputSection::new(
        name,
        data,
        SectionFlags::from_u32(object::elf::SHF_ALLOC | object::elf::SHF_EXECINSTR),
    )
}

pub(crate) fn data_section(name: &str, data: Vec<u8>) -> InputSection {
    InputSection::new(name, data, SectionFlags::from_u32(object::elf::SHF_ALLOC))
}

pub(crate) fn tls_section(name: &str, data: Vec<u8>) -> InputSection {
    InputSection::new(
        name,
        data,
        SectionFlags::from_u32(
            object::elf::SHF_ALLOC | object::elf::SHF_WRITE | object::elf::SHF_TLS,
        ),
    )
}

pub(crate) fn nops(count: usize) -> Vec<u8> {
    std::iter::repeat_n(linker_utils::aarch64::INSN_NOP.to_le_bytes(), count)
        .flatten()
        .collect()
}

pub(crate) fn read_insn(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap())
}
