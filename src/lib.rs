//! Code emission layer for JIT compiler backends.
//!
//! The crate provides the pieces an instruction encoder writes into while it
//! turns a scheduled, register-allocated instruction stream into machine code:
//!
//! - [`CodeBuffer`]: a growable byte store with a monotonic write cursor and
//!   random-access overwrite of bytes that were already written.
//!
//! - [`Label`]s: symbolic code addresses. A label is either unbound, in which
//!   case it holds a queue of branch sites waiting to be patched, or bound to a
//!   fixed offset. Binding a label rewrites every queued branch through the
//!   target ISA. A per-compilation registry of labels with pending patches is
//!   checked when the buffer is closed, so that a branch that never received a
//!   target is reported instead of silently left as garbage.
//!
//! - [`FeatureScope`]: nested "this region may use these extra ISA features"
//!   scoping.
//!
//! - [`SnippetRecorder`]: captures a contiguous run of emitted code together
//!   with the label uses and metadata records created while emitting it, and
//!   stamps verbatim copies of it at later positions. Branches that stay inside
//!   the copied run are left alone, branches that leave it are re-targeted, and
//!   branches to labels that are still unbound get a fresh pending patch.
//!
//! All of these are owned by an [`Assembler`], one per compilation. There is
//! no shared mutable state between assemblers, so separate compilations can
//! run on separate threads without locking.
#![deny(missing_docs)]
// Display feature requirements in the documentation when building on docs.rs
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use crate::assembler::Assembler;
pub use crate::buffer::{CodeBuffer, DataWidth};
pub use crate::features::FeatureScope;
pub use crate::label::{Label, LabelState, Labels, PendingLabels};
pub use crate::metadata::{CodeMetadata, MetadataLog, MetadataRecord, TrapCode, Watermark};
pub use crate::result::{CodegenError, CodegenResult, UnresolvedLabel, UnresolvedLabels};
pub use crate::snippet::SnippetRecorder;

pub use cranelift_entity as entity;
pub use target_lexicon::Endianness;

pub mod assembler;
pub mod buffer;
pub mod features;
pub mod isa;
pub mod label;
pub mod metadata;
pub mod settings;
pub mod snippet;

mod result;

/// Offset in bytes from the beginning of the code buffer.
pub type CodeOffset = u32;

/// Even when trace logging is disabled, the trace macro has a significant performance cost so we
/// disable it by default.
#[macro_export]
macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(any(feature = "trace-log", debug_assertions)) {
            ::log::trace!($($tt)*);
        }
    };
}
