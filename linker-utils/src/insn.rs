//! Typed decoding of the handful of A64 instruction classes the backend needs to recognise:
//! load/stores and multiply-accumulates for the Cortex-A53 erratum scans, and page-address
//! computations for erratum veneer rewriting. Everything else decodes as [`Instruction::Other`].

use crate::bits::extract_bits;
use crate::bits::sign_extend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    LoadStore(LoadStore),
    MultiplyAccumulate(MultiplyAccumulate),
    PageAddress(PageAddress),
    Other(u32),
}

/// A load or store, scalar or SIMD, single or pair. `rt2` equals `rt` for single-register forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadStore {
    pub rt: u32,
    pub rt2: u32,
    pub rn: u32,
    pub pair: bool,
    pub load: bool,
    pub simd: bool,
    /// Base plus scaled unsigned 12-bit immediate addressing (the form erratum 843419 triggers
    /// on).
    pub unsigned_imm: bool,
}

/// A 64-bit multiply-accumulate (MADD/MSUB/SMADDL/SMSUBL/UMADDL/UMSUBL family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplyAccumulate {
    pub op31: u32,
    pub ra: u32,
    pub rn: u32,
    pub rm: u32,
}

/// An ADRP computing the 4 KiB page of a pc-relative address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAddress {
    pub rd: u32,
    /// Byte displacement of the target page from the page of the instruction.
    pub offset: i64,
}

const ZR: u32 = 31;

fn bit(insn: u32, n: u32) -> u32 {
    (insn >> n) & 1
}

fn rt(insn: u32) -> u32 {
    insn & 0x1f
}

fn rt2(insn: u32) -> u32 {
    (insn >> 10) & 0x1f
}

fn rn(insn: u32) -> u32 {
    (insn >> 5) & 0x1f
}

impl MultiplyAccumulate {
    /// Whether this form can trigger erratum 835769. MUL is encoded as a multiply-accumulate
    /// with `ra == zr` and is excluded.
    #[must_use]
    pub fn accumulates(&self) -> bool {
        matches!(self.op31, 0 | 1 | 5) && self.ra != ZR
    }
}

#[must_use]
pub fn decode(insn: u32) -> Instruction {
    if let Some(load_store) = decode_load_store(insn) {
        return Instruction::LoadStore(load_store);
    }
    if insn & 0xff00_0000 == 0x9b00_0000 {
        return Instruction::MultiplyAccumulate(MultiplyAccumulate {
            op31: (insn >> 21) & 0x7,
            ra: (insn >> 10) & 0x1f,
            rn: rn(insn),
            rm: (insn >> 16) & 0x1f,
        });
    }
    if is_adrp(insn) {
        return Instruction::PageAddress(PageAddress {
            rd: insn & 0x1f,
            offset: decode_adrp_offset(insn),
        });
    }
    Instruction::Other(insn)
}

#[must_use]
pub fn is_adrp(insn: u32) -> bool {
    insn & 0x9f00_0000 == 0x9000_0000
}

/// Byte displacement encoded by an ADRP, sign extended. The immediate counts pages.
#[must_use]
pub fn decode_adrp_offset(insn: u32) -> i64 {
    let immlo = extract_bits(u64::from(insn), 29..31);
    let immhi = extract_bits(u64::from(insn), 5..24);
    sign_extend(((immhi << 2) | immlo) << 12, 32) as i64
}

/// Encodes `adr rd, .+offset`. Used when an erratum-843419 ADRP can be rewritten to the cheaper
/// single-instruction form.
#[must_use]
pub fn encode_adr(rd: u32, offset: i64) -> u32 {
    let imm = offset as u64;
    let immlo = (imm & 0x3) as u32;
    let immhi = ((imm >> 2) & 0x7ffff) as u32;
    0x1000_0000 | (immlo << 29) | (immhi << 5) | (rd & 0x1f)
}

/// Classifies `insn` if it is a load/store. Follows the C4 encoding groups of the Arm ARM; the
/// groups below mirror the original hardware erratum characterisation, so the exact set of
/// matched forms matters.
#[must_use]
pub fn decode_load_store(insn: u32) -> Option<LoadStore> {
    // Bail out quickly if the word is outside the load/store encoding space.
    if insn & 0x0a00_0000 != 0x0800_0000 {
        return None;
    }

    let simd = bit(insn, 26) == 1;
    let unsigned_imm = insn & 0x3b00_0000 == 0x3900_0000;
    let base = rn(insn);

    // Exclusive forms.
    if insn & 0x3f00_0000 == 0x0800_0000 {
        let pair = bit(insn, 21) == 1;
        return Some(LoadStore {
            rt: rt(insn),
            rt2: if pair { rt2(insn) } else { rt(insn) },
            rn: base,
            pair,
            load: bit(insn, 22) == 1,
            simd,
            unsigned_imm: false,
        });
    }

    // Register pairs: no-allocate, post-indexed, offset and pre-indexed.
    if matches!(
        insn & 0x3b80_0000,
        0x2800_0000 | 0x2880_0000 | 0x2900_0000 | 0x2980_0000
    ) {
        return Some(LoadStore {
            rt: rt(insn),
            rt2: rt2(insn),
            rn: base,
            pair: true,
            load: bit(insn, 22) == 1,
            simd,
            unsigned_imm: false,
        });
    }

    // Scalar forms: pc-relative literal, unscaled/post/unprivileged/pre immediate, register
    // offset and scaled unsigned immediate. The encoding space also covers prefetch ops, which
    // classify as stores here and are treated conservatively by the erratum scan.
    let pc_relative = insn & 0x3b00_0000 == 0x1800_0000;
    if pc_relative
        || matches!(
            insn & 0x3b20_0c00,
            0x3800_0000 | 0x3800_0400 | 0x3800_0800 | 0x3800_0c00 | 0x3820_0800
        )
        || unsigned_imm
    {
        let load = if pc_relative {
            true
        } else {
            let opc = extract_bits(u64::from(insn), 22..24) as u32;
            let opc_v = opc | (u32::from(simd) << 2);
            matches!(opc_v, 1 | 2 | 3 | 5 | 7)
        };
        return Some(LoadStore {
            rt: rt(insn),
            rt2: rt(insn),
            rn: base,
            pair: false,
            load,
            simd,
            unsigned_imm,
        });
    }

    // SIMD multiple structures.
    if insn & 0xbfbf_0000 == 0x0c00_0000 || insn & 0xbfa0_0000 == 0x0c80_0000 {
        let first = rt(insn);
        let last = match (insn >> 12) & 0xf {
            0 | 2 => first + 3,
            4 | 6 => first + 2,
            7 => first,
            8 | 10 => first + 1,
            _ => return None,
        };
        return Some(LoadStore {
            rt: first,
            rt2: last,
            rn: base,
            pair: false,
            load: bit(insn, 22) == 1,
            simd: true,
            unsigned_imm: false,
        });
    }

    // SIMD single structures.
    if insn & 0xbf9f_0000 == 0x0d00_0000 || insn & 0xbf80_0000 == 0x0d80_0000 {
        let first = rt(insn);
        let r = (insn >> 21) & 1;
        let last = match (insn >> 13) & 0x7 {
            0 | 2 | 4 => first + r,
            1 | 3 | 5 => first + if r == 0 { 2 } else { 3 },
            6 => first + r,
            7 => first + if r == 0 { 2 } else { 3 },
            _ => return None,
        };
        return Some(LoadStore {
            rt: first,
            rt2: last,
            rn: base,
            pair: false,
            load: bit(insn, 22) == 1,
            simd: true,
            unsigned_imm: false,
        });
    }

    None
}

/// Erratum 835769: a load/store immediately followed by a 64-bit multiply-accumulate with no
/// register dependency between them can produce a wrong result on early Cortex-A53 revisions.
/// SIMD memory ops are independent of the multiply by definition; a true read-after-write
/// dependency from a load makes the pair safe.
#[must_use]
pub fn is_erratum_835769_sequence(insn_1: u32, insn_2: u32) -> bool {
    let Instruction::MultiplyAccumulate(mla) = decode(insn_2) else {
        return false;
    };
    if !mla.accumulates() {
        return false;
    }
    let Some(mem) = decode_load_store(insn_1) else {
        return false;
    };

    if mem.simd {
        return true;
    }

    if mem.load
        && (mem.rt == mla.rn
            || mem.rt == mla.rm
            || mem.rt == mla.ra
            || (mem.pair && (mem.rt2 == mla.rn || mem.rt2 == mla.rm || mem.rt2 == mla.ra)))
    {
        return false;
    }

    // Conservatively treat every other combination, including writebacks, as vulnerable.
    true
}

/// Erratum 843419 sequence body: after an ADRP (`insn_1`), a load/store that is not a load pair
/// (`insn_2`), then a base-plus-unsigned-immediate load/store (`insn_3`) whose base register is
/// the ADRP destination.
#[must_use]
pub fn is_erratum_843419_sequence(insn_1: u32, insn_2: u32, insn_3: u32) -> bool {
    if !is_adrp(insn_1) {
        return false;
    }
    let Some(mem) = decode_load_store(insn_2) else {
        return false;
    };
    if mem.pair && mem.load {
        return false;
    }
    match decode_load_store(insn_3) {
        Some(last) => last.unsigned_imm && last.rn == insn_1 & 0x1f,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_scalar_loads_and_stores() {
        // ldr x1, [x2, #8]
        let ls = decode_load_store(0xf9400441).unwrap();
        assert!(ls.load && !ls.pair && !ls.simd && ls.unsigned_imm);
        assert_eq!((ls.rt, ls.rn), (1, 2));

        // str w3, [x4]
        let ls = decode_load_store(0xb9000083).unwrap();
        assert!(!ls.load && ls.unsigned_imm);
        assert_eq!((ls.rt, ls.rn), (3, 4));

        // ldp x0, x1, [sp, #16]
        let ls = decode_load_store(0xa94107e0).unwrap();
        assert!(ls.load && ls.pair);
        assert_eq!((ls.rt, ls.rt2, ls.rn), (0, 1, 31));

        // add x0, x1, x2 is not a load/store
        assert!(decode_load_store(0x8b020020).is_none());
    }

    #[test]
    fn decode_multiply_accumulate() {
        // madd x0, x1, x2, x3
        let Instruction::MultiplyAccumulate(mla) = decode(0x9b020c20) else {
            panic!("expected multiply-accumulate");
        };
        assert_eq!((mla.rn, mla.rm, mla.ra), (1, 2, 3));
        assert!(mla.accumulates());

        // mul x0, x1, x2 encodes as madd with ra = zr and must not count
        let Instruction::MultiplyAccumulate(mul) = decode(0x9b027c20) else {
            panic!("expected multiply-accumulate encoding");
        };
        assert!(!mul.accumulates());
    }

    #[test]
    fn decode_page_address() {
        // adrp x0, .+0x4000 (immhi = 1, immlo = 0)
        let Instruction::PageAddress(adrp) = decode(0x90000020) else {
            panic!("expected adrp");
        };
        assert_eq!(adrp.rd, 0);
        assert_eq!(adrp.offset, 0x4000);

        // adrp x1, .-0x1000 (all immediate bits set)
        let insn = 0x90000000 | (3 << 29) | (0x7ffff << 5) | 1;
        let Instruction::PageAddress(adrp) = decode(insn) else {
            panic!("expected adrp");
        };
        assert_eq!(adrp.rd, 1);
        assert_eq!(adrp.offset, -0x1000);
    }

    #[test]
    fn adr_encoding() {
        let insn = encode_adr(5, 0x1234);
        assert_eq!(insn & 0x9f000000, 0x10000000);
        assert_eq!(insn & 0x1f, 5);
        // Decoding the ADR immediate back: immlo | immhi
        let immlo = (insn >> 29) & 0x3;
        let immhi = (insn >> 5) & 0x7ffff;
        assert_eq!(((immhi << 2) | immlo) as i64, 0x1234);
    }

    #[test]
    fn erratum_835769_pairs() {
        let madd_x0_x1_x2_x3 = 0x9b020c20;
        // Store followed by madd: vulnerable.
        assert!(is_erratum_835769_sequence(0xb9000083, madd_x0_x1_x2_x3));
        // Load into x1 (an input of the madd): true dependency, safe.
        assert!(!is_erratum_835769_sequence(0xf9400441, madd_x0_x1_x2_x3));
        // Load into an unrelated register: vulnerable.
        let ldr_x9 = 0xf9400449;
        assert!(is_erratum_835769_sequence(ldr_x9, madd_x0_x1_x2_x3));
        // mul (ra == zr) never triggers.
        assert!(!is_erratum_835769_sequence(ldr_x9, 0x9b027c20));
        // Two loads: no multiply, no erratum.
        assert!(!is_erratum_835769_sequence(ldr_x9, ldr_x9));
    }

    #[test]
    fn erratum_843419_sequences() {
        let adrp_x0 = 0x90000000;
        let str_w3_x4 = 0xb9000083;
        let ldr_x1_x0 = 0xf9400001; // ldr x1, [x0] - base is the adrp destination
        let ldr_x1_x2 = 0xf9400041; // ldr x1, [x2] - unrelated base
        assert!(is_erratum_843419_sequence(adrp_x0, str_w3_x4, ldr_x1_x0));
        assert!(!is_erratum_843419_sequence(adrp_x0, str_w3_x4, ldr_x1_x2));
        // Load pair in the middle makes the sequence safe.
        let ldp = 0xa94107e0;
        assert!(!is_erratum_843419_sequence(adrp_x0, ldp, ldr_x1_x0));
        // Store pair in the middle is still vulnerable.
        let stp = 0xa90107e0;
        assert!(is_erratum_843419_sequence(adrp_x0, stp, ldr_x1_x0));
        // First instruction must be an adrp.
        assert!(!is_erratum_843419_sequence(str_w3_x4, str_w3_x4, ldr_x1_x0));
    }
}
