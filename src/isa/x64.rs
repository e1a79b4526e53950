//! X86-64 branch patching and a minimal set of branch encoders.

use crate::assembler::Assembler;
use crate::buffer::{CodeBuffer, DataWidth};
use crate::isa::{TargetIsa, fits_signed, pc_rel};
use crate::label::Label;
use crate::{CodeOffset, trace};
use bitflags::bitflags;
use target_lexicon::Endianness;

bitflags! {
    /// Optional x86-64 extensions beyond the SSE2 baseline.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct X64Features: u32 {
        /// SSE3.
        const SSE3 = 1 << 0;
        /// Supplemental SSE3.
        const SSSE3 = 1 << 1;
        /// SSE4.1.
        const SSE41 = 1 << 2;
        /// SSE4.2.
        const SSE42 = 1 << 3;
        /// POPCNT.
        const POPCNT = 1 << 4;
        /// AVX.
        const AVX = 1 << 5;
        /// AVX2.
        const AVX2 = 1 << 6;
        /// BMI1.
        const BMI1 = 1 << 7;
        /// BMI2.
        const BMI2 = 1 << 8;
        /// LZCNT.
        const LZCNT = 1 << 9;
        /// Fused multiply-add.
        const FMA = 1 << 10;
        /// AVX-512 foundation.
        const AVX512F = 1 << 11;
        /// AVX-512 vector length extensions.
        const AVX512VL = 1 << 12;
        /// AVX-512 doubleword and quadword instructions.
        const AVX512DQ = 1 << 13;
        /// AVX-512 byte and word instructions.
        const AVX512BW = 1 << 14;
    }
}

impl X64Features {
    /// The features supported by the host CPU. Empty when not running on
    /// x86-64.
    pub fn host() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            let mut features = X64Features::empty();
            macro_rules! detect {
                ($($name:tt => $flag:ident,)*) => {
                    $(
                        if std::is_x86_feature_detected!($name) {
                            features.insert(X64Features::$flag);
                        }
                    )*
                };
            }
            detect! {
                "sse3" => SSE3,
                "ssse3" => SSSE3,
                "sse4.1" => SSE41,
                "sse4.2" => SSE42,
                "popcnt" => POPCNT,
                "avx" => AVX,
                "avx2" => AVX2,
                "bmi1" => BMI1,
                "bmi2" => BMI2,
                "lzcnt" => LZCNT,
                "fma" => FMA,
                "avx512f" => AVX512F,
                "avx512vl" => AVX512VL,
                "avx512dq" => AVX512DQ,
                "avx512bw" => AVX512BW,
            }
            features
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            X64Features::empty()
        }
    }
}

/// Condition codes, in the order of their encoding in `Jcc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cond {
    /// overflow
    O = 0,
    /// no overflow
    NO = 1,
    /// < unsigned
    B = 2,
    /// >= unsigned
    AE = 3,
    /// zero
    E = 4,
    /// not-zero
    NE = 5,
    /// <= unsigned
    BE = 6,
    /// > unsigned
    A = 7,
    /// negative
    S = 8,
    /// not-negative
    NS = 9,
    /// parity
    P = 10,
    /// not parity
    NP = 11,
    /// < signed
    L = 12,
    /// >= signed
    GE = 13,
    /// <= signed
    LE = 14,
    /// > signed
    G = 15,
}

impl Cond {
    /// The condition that holds exactly when `self` does not.
    pub fn invert(self) -> Cond {
        match self {
            Cond::O => Cond::NO,
            Cond::NO => Cond::O,
            Cond::B => Cond::AE,
            Cond::AE => Cond::B,
            Cond::E => Cond::NE,
            Cond::NE => Cond::E,
            Cond::BE => Cond::A,
            Cond::A => Cond::BE,
            Cond::S => Cond::NS,
            Cond::NS => Cond::S,
            Cond::P => Cond::NP,
            Cond::NP => Cond::P,
            Cond::L => Cond::GE,
            Cond::GE => Cond::L,
            Cond::LE => Cond::G,
            Cond::G => Cond::LE,
        }
    }

    /// The low nibble of the `Jcc`/`SETcc`/`CMOVcc` opcodes.
    pub fn encoding(self) -> u8 {
        self as u8
    }
}

/// Where the displacement of a relative branch lives.
struct RelBranch {
    /// Offset of the displacement field.
    field: CodeOffset,
    width: DataWidth,
    /// Offset just past the instruction; displacements are relative to it.
    end: CodeOffset,
}

impl RelBranch {
    fn bits(&self) -> u32 {
        self.width.bytes() * 8
    }

    fn read(&self, buf: &CodeBuffer) -> i64 {
        match self.width {
            DataWidth::B1 => i64::from(buf.read_u8(self.field) as i8),
            DataWidth::B4 => i64::from(buf.read_u32(self.field) as i32),
            _ => unreachable!(),
        }
    }

    fn write(&self, buf: &mut CodeBuffer, disp: i64, branch: CodeOffset) {
        assert!(
            fits_signed(disp, self.bits()),
            "branch at {branch}: displacement {disp} does not fit in {} bits",
            self.bits()
        );
        buf.emit_at(self.width, disp as u64, self.field);
    }
}

/// Decode the relative branch starting at `branch`.
fn decode(buf: &CodeBuffer, branch: CodeOffset) -> RelBranch {
    let rel8 = RelBranch {
        field: branch + 1,
        width: DataWidth::B1,
        end: branch + 2,
    };
    match buf.read_u8(branch) {
        // call rel32, jmp rel32
        0xe8 | 0xe9 => RelBranch {
            field: branch + 1,
            width: DataWidth::B4,
            end: branch + 5,
        },
        // jmp rel8
        0xeb => rel8,
        // jcc rel8
        0x70..=0x7f => rel8,
        0x0f => match buf.read_u8(branch + 1) {
            // jcc rel32
            0x80..=0x8f => RelBranch {
                field: branch + 2,
                width: DataWidth::B4,
                end: branch + 6,
            },
            op => panic!("no relative branch at {branch}: 0f {op:02x}"),
        },
        op => panic!("no relative branch at {branch}: {op:02x}"),
    }
}

/// The x86-64 target.
#[derive(Clone, Copy, Debug)]
pub struct X64 {
    baseline: X64Features,
}

impl X64 {
    /// An x86-64 target assuming `baseline` is always available.
    pub fn new(baseline: X64Features) -> Self {
        X64 { baseline }
    }

    /// An x86-64 target for the CPU we are running on.
    pub fn host() -> Self {
        X64::new(X64Features::host())
    }
}

impl TargetIsa for X64 {
    type Features = X64Features;

    fn name(&self) -> &'static str {
        "x64"
    }

    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    fn nop(&self) -> &'static [u8] {
        &[0x90]
    }

    fn baseline_features(&self) -> X64Features {
        self.baseline
    }

    fn patch_jump_target(&self, buf: &mut CodeBuffer, branch: CodeOffset, target: CodeOffset) {
        let rel = decode(buf, branch);
        let disp = pc_rel(rel.end, target);
        trace!("x64: branch at {} -> {} (disp {})", branch, target, disp);
        rel.write(buf, disp, branch);
    }

    fn patch_relative_jump_target(&self, buf: &mut CodeBuffer, branch: CodeOffset, delta: i64) {
        let rel = decode(buf, branch);
        let disp = rel.read(buf) + delta;
        trace!("x64: branch at {} moved by {} (disp {})", branch, delta, disp);
        rel.write(buf, disp, branch);
    }
}

impl Assembler<X64> {
    /// `jmp rel32` to `label`.
    pub fn jmp(&mut self, label: Label) {
        let start = self.cur_offset();
        self.put1(0xe9);
        self.put4(0);
        self.use_label(start, label);
    }

    /// `jmp rel8` to `label`, which must be within 127 bytes.
    pub fn jmp_short(&mut self, label: Label) {
        let start = self.cur_offset();
        self.put1(0xeb);
        self.put1(0);
        self.use_label(start, label);
    }

    /// `jcc rel32` to `label`.
    pub fn jcc(&mut self, cond: Cond, label: Label) {
        let start = self.cur_offset();
        self.put1(0x0f);
        self.put1(0x80 | cond.encoding());
        self.put4(0);
        self.use_label(start, label);
    }

    /// `jcc rel8` to `label`, which must be within 127 bytes.
    pub fn jcc_short(&mut self, cond: Cond, label: Label) {
        let start = self.cur_offset();
        self.put1(0x70 | cond.encoding());
        self.put1(0);
        self.use_label(start, label);
    }

    /// `call rel32` to `label`.
    pub fn call(&mut self, label: Label) {
        let start = self.cur_offset();
        self.put1(0xe8);
        self.put4(0);
        self.use_label(start, label);
    }

    /// One-byte `nop`.
    pub fn nop(&mut self) {
        self.put1(0x90);
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.put1(0xc3);
    }

    /// `ud2`.
    pub fn ud2(&mut self) {
        self.put1(0x0f);
        self.put1(0x0b);
    }
}
