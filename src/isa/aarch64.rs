//! AArch64 branch patching and a minimal set of branch encoders.
//!
//! All AArch64 branches encode a signed word offset relative to the address of
//! the branch instruction itself. The field position and width depend on the
//! instruction class:
//!
//! | instruction       | field           | range  |
//! |-------------------|-----------------|--------|
//! | `B`, `BL`         | imm26, bits 0.. | 128MB  |
//! | `B.cond`          | imm19, bits 5.. | 1MB    |
//! | `CBZ`, `CBNZ`     | imm19, bits 5.. | 1MB    |
//! | `TBZ`, `TBNZ`     | imm14, bits 5.. | 32KB   |

use crate::assembler::Assembler;
use crate::buffer::{CodeBuffer, DataWidth};
use crate::isa::{TargetIsa, fits_signed, pc_rel};
use crate::label::Label;
use crate::{CodeOffset, trace};
use bitflags::bitflags;
use target_lexicon::Endianness;

bitflags! {
    /// Optional AArch64 extensions beyond ARMv8.0-A.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Aarch64Features: u32 {
        /// Large System Extensions (atomics).
        const LSE = 1 << 0;
        /// Pointer authentication.
        const PAUTH = 1 << 1;
        /// Half-precision floating point.
        const FP16 = 1 << 2;
        /// Branch target identification.
        const BTI = 1 << 3;
        /// SHA3 instructions.
        const SHA3 = 1 << 4;
        /// Dot product instructions.
        const DOTPROD = 1 << 5;
        /// Scalable vector extension.
        const SVE = 1 << 6;
    }
}

impl Aarch64Features {
    /// The features supported by the host CPU. Empty when not running on
    /// AArch64.
    pub fn host() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            let mut features = Aarch64Features::empty();
            macro_rules! detect {
                ($($name:tt => $flag:ident,)*) => {
                    $(
                        if std::arch::is_aarch64_feature_detected!($name) {
                            features.insert(Aarch64Features::$flag);
                        }
                    )*
                };
            }
            detect! {
                "lse" => LSE,
                "paca" => PAUTH,
                "fp16" => FP16,
                "bti" => BTI,
                "sha3" => SHA3,
                "dotprod" => DOTPROD,
                "sve" => SVE,
            }
            features
        }
        #[cfg(not(target_arch = "aarch64"))]
        {
            Aarch64Features::empty()
        }
    }
}

/// Condition codes for `B.cond`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    /// Equal.
    Eq = 0,
    /// Not equal.
    Ne = 1,
    /// Unsigned greater than or equal to.
    Hs = 2,
    /// Unsigned less than.
    Lo = 3,
    /// Minus, negative.
    Mi = 4,
    /// Positive or zero.
    Pl = 5,
    /// Signed overflow.
    Vs = 6,
    /// No signed overflow.
    Vc = 7,
    /// Unsigned greater than.
    Hi = 8,
    /// Unsigned less than or equal to.
    Ls = 9,
    /// Signed greater or equal to.
    Ge = 10,
    /// Signed less than.
    Lt = 11,
    /// Signed greater than.
    Gt = 12,
    /// Signed less than or equal.
    Le = 13,
    /// Always executed.
    Al = 14,
}

impl Cond {
    /// The condition field of `B.cond`.
    pub fn bits(self) -> u32 {
        self as u32
    }
}

/// Position of the offset field in a branch instruction word.
#[derive(Clone, Copy, Debug)]
struct BranchField {
    shift: u32,
    bits: u32,
}

impl BranchField {
    fn mask(self) -> u32 {
        ((1u32 << self.bits) - 1) << self.shift
    }

    /// The encoded byte offset.
    fn get(self, insn: u32) -> i64 {
        let raw = (insn & self.mask()) >> self.shift;
        let unused = 32 - self.bits;
        i64::from(((raw << unused) as i32) >> unused) * 4
    }

    fn set(self, insn: u32, disp: i64, branch: CodeOffset) -> u32 {
        assert!(
            disp & 3 == 0,
            "branch at {branch}: displacement {disp} is not a multiple of 4"
        );
        let words = disp >> 2;
        assert!(
            fits_signed(words, self.bits),
            "branch at {branch}: displacement {disp} does not fit in {} bits",
            self.bits
        );
        (insn & !self.mask()) | (((words as u32) << self.shift) & self.mask())
    }
}

fn decode(insn: u32, branch: CodeOffset) -> BranchField {
    if insn & 0x7c00_0000 == 0x1400_0000 {
        // B, BL
        BranchField { shift: 0, bits: 26 }
    } else if insn & 0xff00_0010 == 0x5400_0000 {
        // B.cond
        BranchField { shift: 5, bits: 19 }
    } else if insn & 0x7e00_0000 == 0x3400_0000 {
        // CBZ, CBNZ
        BranchField { shift: 5, bits: 19 }
    } else if insn & 0x7e00_0000 == 0x3600_0000 {
        // TBZ, TBNZ
        BranchField { shift: 5, bits: 14 }
    } else {
        panic!("no relative branch at {branch}: {insn:#010x}");
    }
}

/// The AArch64 target, little endian.
#[derive(Clone, Copy, Debug)]
pub struct Aarch64 {
    baseline: Aarch64Features,
}

impl Aarch64 {
    /// An AArch64 target assuming `baseline` is always available.
    pub fn new(baseline: Aarch64Features) -> Self {
        Aarch64 { baseline }
    }

    /// An AArch64 target for the CPU we are running on.
    pub fn host() -> Self {
        Aarch64::new(Aarch64Features::host())
    }
}

impl TargetIsa for Aarch64 {
    type Features = Aarch64Features;

    fn name(&self) -> &'static str {
        "aarch64"
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn nop(&self) -> &'static [u8] {
        // 0xd503201f
        &[0x1f, 0x20, 0x03, 0xd5]
    }

    fn baseline_features(&self) -> Aarch64Features {
        self.baseline
    }

    fn patch_jump_target(&self, buf: &mut CodeBuffer, branch: CodeOffset, target: CodeOffset) {
        let insn = buf.read_u32(branch);
        let field = decode(insn, branch);
        let disp = pc_rel(branch, target);
        trace!("aarch64: branch at {} -> {} (disp {})", branch, target, disp);
        buf.emit_at(DataWidth::B4, field.set(insn, disp, branch).into(), branch);
    }

    fn patch_relative_jump_target(&self, buf: &mut CodeBuffer, branch: CodeOffset, delta: i64) {
        let insn = buf.read_u32(branch);
        let field = decode(insn, branch);
        let disp = field.get(insn) + delta;
        trace!("aarch64: branch at {} moved by {} (disp {})", branch, delta, disp);
        buf.emit_at(DataWidth::B4, field.set(insn, disp, branch).into(), branch);
    }
}

impl Assembler<Aarch64> {
    fn branch(&mut self, insn: u32, label: Label) {
        let start = self.cur_offset();
        self.put4(insn);
        self.use_label(start, label);
    }

    /// `b label`.
    pub fn b(&mut self, label: Label) {
        self.branch(0x1400_0000, label);
    }

    /// `bl label`.
    pub fn bl(&mut self, label: Label) {
        self.branch(0x9400_0000, label);
    }

    /// `b.cond label`.
    pub fn b_cond(&mut self, cond: Cond, label: Label) {
        self.branch(0x5400_0000 | cond.bits(), label);
    }

    /// `cbz xN, label`.
    pub fn cbz(&mut self, rt: u8, label: Label) {
        debug_assert!(rt < 32);
        self.branch(0xb400_0000 | u32::from(rt), label);
    }

    /// `cbnz xN, label`.
    pub fn cbnz(&mut self, rt: u8, label: Label) {
        debug_assert!(rt < 32);
        self.branch(0xb500_0000 | u32::from(rt), label);
    }

    /// `tbz xN, #bit, label`.
    pub fn tbz(&mut self, rt: u8, bit: u8, label: Label) {
        self.branch(0x3600_0000 | test_bit_operands(rt, bit), label);
    }

    /// `tbnz xN, #bit, label`.
    pub fn tbnz(&mut self, rt: u8, bit: u8, label: Label) {
        self.branch(0x3700_0000 | test_bit_operands(rt, bit), label);
    }

    /// `nop`.
    pub fn nop(&mut self) {
        self.put4(0xd503_201f);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.put4(0xd65f_03c0);
    }

    /// `brk #imm`.
    pub fn brk(&mut self, imm: u16) {
        self.put4(0xd420_0000 | (u32::from(imm) << 5));
    }
}

fn test_bit_operands(rt: u8, bit: u8) -> u32 {
    debug_assert!(rt < 32 && bit < 64);
    let bit = u32::from(bit);
    ((bit >> 5) << 31) | ((bit & 0x1f) << 19) | u32::from(rt)
}
