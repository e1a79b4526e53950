//! Instruction set architectures.
//!
//! The emission layer never decides which opcodes to emit; it only needs a
//! handful of architecture-specific services from the encoder driving it,
//! bundled in the [`TargetIsa`] trait:
//!
//! - the no-op used for alignment padding and unique-PC separation,
//! - rewriting a branch so it refers to a now-known target,
//! - adjusting a branch's encoded displacement by a delta, used when a copy
//!   of a branch moves but its target does not,
//! - the feature set type scoped by [`crate::FeatureScope`].
//!
//! Branch sites are identified by the offset of the first byte of the branch
//! instruction. Implementations decode the instruction found there to learn
//! where its displacement field lives and how wide it is.

use crate::CodeOffset;
use crate::buffer::CodeBuffer;
use core::fmt::Debug;
use target_lexicon::{Architecture, Endianness, Triple};

pub mod aarch64;
pub mod x64;

/// An error looking up an ISA by triple.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LookupError {
    /// Support for this target is not implemented.
    #[error("Support for this target has not been implemented yet")]
    Unsupported,
}

/// Architecture-specific services used during code emission.
pub trait TargetIsa {
    /// Feature set type scoped while emitting.
    type Features: bitflags::Flags + Copy + Debug;

    /// Short name of the ISA, e.g. `"x64"`.
    fn name(&self) -> &'static str;

    /// Byte order of emitted values.
    fn endianness(&self) -> Endianness;

    /// The canonical no-op instruction.
    fn nop(&self) -> &'static [u8];

    /// Features that are always available to the compiled code.
    fn baseline_features(&self) -> Self::Features;

    /// Rewrite the branch instruction at `branch` so that it refers to
    /// `target`.
    fn patch_jump_target(&self, buf: &mut CodeBuffer, branch: CodeOffset, target: CodeOffset);

    /// Add `delta` to the displacement encoded in the branch instruction at
    /// `branch`. The result must fit the instruction's displacement field.
    fn patch_relative_jump_target(&self, buf: &mut CodeBuffer, branch: CodeOffset, delta: i64);
}

/// The ISA families this crate can emit code for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsaFamily {
    /// x86-64.
    X64,
    /// AArch64, little endian.
    Aarch64,
}

/// Find the ISA family for `triple`.
pub fn lookup(triple: &Triple) -> Result<IsaFamily, LookupError> {
    match (triple.architecture, triple.endianness()) {
        (Architecture::X86_64, _) => Ok(IsaFamily::X64),
        (Architecture::Aarch64(_), Ok(Endianness::Little)) => Ok(IsaFamily::Aarch64),
        _ => Err(LookupError::Unsupported),
    }
}

/// Signed distance from `from` to `to`.
pub(crate) fn pc_rel(from: CodeOffset, to: CodeOffset) -> i64 {
    i64::from(to) - i64::from(from)
}

/// Check that `value` fits a signed field of `bits` bits.
pub(crate) fn fits_signed(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    value >= min && value <= max
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    #[test]
    fn lookup_by_triple() {
        let triple = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(lookup(&triple), Ok(IsaFamily::X64));
        let triple = Triple::from_str("aarch64-apple-darwin").unwrap();
        assert_eq!(lookup(&triple), Ok(IsaFamily::Aarch64));
        let triple = Triple::from_str("riscv64gc-unknown-linux-gnu").unwrap();
        assert_eq!(lookup(&triple), Err(LookupError::Unsupported));
    }

    #[test]
    fn signed_ranges() {
        assert!(fits_signed(127, 8));
        assert!(fits_signed(-128, 8));
        assert!(!fits_signed(128, 8));
        assert!(!fits_signed(-129, 8));
        assert!(fits_signed(-(1 << 25), 26));
    }
}
