//! Result and error types representing the outcome of emitting a function's code.

use crate::CodeOffset;
use crate::label::Label;
use core::fmt;
use smallvec::SmallVec;
use thiserror::Error;

/// A code emission error.
///
/// Encoder bugs (binding a label twice, emitting after close, ...) are not
/// represented here: they panic. These errors are the ones a caller can
/// handle by abandoning the compilation unit.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodegenError {
    /// Some labels still had pending patches when the buffer was closed.
    ///
    /// This almost always means a missing block terminator or a branch to a
    /// block that was never emitted.
    #[error("unresolved labels at close: {0}")]
    UnresolvedLabels(UnresolvedLabels),

    /// The code size for the function is too large.
    ///
    /// Code offsets are 32 bits wide; a buffer that grows past that limit
    /// cannot be addressed.
    #[error("Code for function is too large")]
    CodeTooLarge,
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error type.
pub type CodegenResult<T> = Result<T, CodegenError>;

/// A label that was never bound, along with the branch sites waiting on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnresolvedLabel {
    /// The label.
    pub label: Label,
    /// Offsets of the branch instructions that reference the label.
    pub patch_offsets: SmallVec<[CodeOffset; 4]>,
}

/// The full set of labels left unresolved at close, in creation order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnresolvedLabels(pub Vec<UnresolvedLabel>);

impl UnresolvedLabels {
    /// Number of unresolved labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if every label was resolved.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the unresolved labels.
    pub fn iter(&self) -> impl Iterator<Item = &UnresolvedLabel> {
        self.0.iter()
    }
}

impl fmt::Display for UnresolvedLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, unresolved) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} referenced at", unresolved.label)?;
            for (j, offset) in unresolved.patch_offsets.iter().enumerate() {
                let sep = if j == 0 { " " } else { ", " };
                write!(f, "{sep}{offset:#x}")?;
            }
        }
        Ok(())
    }
}
