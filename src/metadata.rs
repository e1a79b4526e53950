//! Auxiliary per-offset metadata produced alongside the code.
//!
//! Debug and exception information is owned by the compilation result, not by
//! the code buffer. Snippet replay only needs two things from it, captured by
//! [`MetadataLog`]: a watermark into its append-only log, and the ability to
//! duplicate every record added between two watermarks at a shifted offset.
//!
//! [`CodeMetadata`] is the stock implementation, recording the same kinds of
//! per-offset facts a machine-code buffer usually carries: traps, source
//! locations, call sites and exception handlers.

use crate::{CodeOffset, trace};
use core::fmt;
use core::ops::Range;

#[cfg(feature = "enable-serde")]
use serde_derive::{Deserialize, Serialize};

/// An opaque position in an append-only metadata log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Watermark(u32);

impl Watermark {
    /// Create a watermark at log position `index`.
    pub fn new(index: usize) -> Self {
        Watermark(u32::try_from(index).expect("metadata log too long"))
    }

    /// The log position this watermark stands for.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The narrow view of a metadata owner needed to replay snippets.
pub trait MetadataLog {
    /// The current end of the log.
    fn watermark(&self) -> Watermark;

    /// Append a copy of every record added between `begin` and `end`, with
    /// its code offsets moved forward by `shift`.
    fn duplicate_range(&mut self, begin: Watermark, end: Watermark, shift: CodeOffset);
}

/// A trap code describing the reason for a trap at a given offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum TrapCode {
    /// A null reference was dereferenced.
    NullReference,
    /// A heap access was out of bounds.
    HeapOutOfBounds,
    /// An integer arithmetic operation overflowed.
    IntegerOverflow,
    /// An integer division by zero.
    IntegerDivisionByZero,
    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached,
    /// A user-defined trap code.
    User(u16),
}

impl fmt::Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapCode::NullReference => write!(f, "null_reference"),
            TrapCode::HeapOutOfBounds => write!(f, "heap_oob"),
            TrapCode::IntegerOverflow => write!(f, "int_ovf"),
            TrapCode::IntegerDivisionByZero => write!(f, "int_divz"),
            TrapCode::UnreachableCodeReached => write!(f, "unreachable"),
            TrapCode::User(code) => write!(f, "user{code}"),
        }
    }
}

/// One entry of the metadata log.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub enum MetadataRecord {
    /// The instruction at `offset` may trap with `code`.
    Trap {
        /// Offset of the trapping instruction.
        offset: CodeOffset,
        /// Why it traps.
        code: TrapCode,
    },
    /// Code in `start..end` was generated for source location `loc`.
    SourceLoc {
        /// Start of the covered range.
        start: CodeOffset,
        /// End of the covered range, exclusive.
        end: CodeOffset,
        /// Opaque source location.
        loc: u32,
    },
    /// A call returns to `ret_addr`.
    CallSite {
        /// Offset of the instruction following the call.
        ret_addr: CodeOffset,
    },
    /// An exception raised by the instruction ending at `pc_offset` is
    /// dispatched to the landing pad at `handler_offset`.
    ExceptionHandler {
        /// Return address of the potentially-throwing instruction.
        pc_offset: CodeOffset,
        /// Offset of the landing pad.
        handler_offset: CodeOffset,
    },
}

impl MetadataRecord {
    /// This record moved forward by `shift` bytes of code.
    ///
    /// Landing pads are emitted out of line, away from the instruction they
    /// serve, so an exception handler keeps its `handler_offset`.
    pub fn shifted(&self, shift: CodeOffset) -> MetadataRecord {
        match *self {
            MetadataRecord::Trap { offset, code } => MetadataRecord::Trap {
                offset: offset + shift,
                code,
            },
            MetadataRecord::SourceLoc { start, end, loc } => MetadataRecord::SourceLoc {
                start: start + shift,
                end: end + shift,
                loc,
            },
            MetadataRecord::CallSite { ret_addr } => MetadataRecord::CallSite {
                ret_addr: ret_addr + shift,
            },
            MetadataRecord::ExceptionHandler {
                pc_offset,
                handler_offset,
            } => MetadataRecord::ExceptionHandler {
                pc_offset: pc_offset + shift,
                handler_offset,
            },
        }
    }
}

/// Append-only log of metadata records for one compiled function.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "enable-serde", derive(Serialize, Deserialize))]
pub struct CodeMetadata {
    records: Vec<MetadataRecord>,
}

impl CodeMetadata {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn push(&mut self, record: MetadataRecord) {
        self.records.push(record);
    }

    /// Record a trap at `offset`.
    pub fn add_trap(&mut self, offset: CodeOffset, code: TrapCode) {
        self.push(MetadataRecord::Trap { offset, code });
    }

    /// Record that `range` was generated for source location `loc`.
    pub fn add_srcloc(&mut self, range: Range<CodeOffset>, loc: u32) {
        debug_assert!(range.start <= range.end);
        self.push(MetadataRecord::SourceLoc {
            start: range.start,
            end: range.end,
            loc,
        });
    }

    /// Record a call returning to `ret_addr`.
    pub fn add_call_site(&mut self, ret_addr: CodeOffset) {
        self.push(MetadataRecord::CallSite { ret_addr });
    }

    /// Record an exception handler for the call returning to `pc_offset`.
    pub fn add_exception_handler(&mut self, pc_offset: CodeOffset, handler_offset: CodeOffset) {
        self.push(MetadataRecord::ExceptionHandler {
            pc_offset,
            handler_offset,
        });
    }

    /// Every record, in insertion order.
    pub fn records(&self) -> &[MetadataRecord] {
        &self.records
    }

    /// Records added between two watermarks.
    pub fn records_between(&self, begin: Watermark, end: Watermark) -> &[MetadataRecord] {
        &self.records[begin.index()..end.index()]
    }

    /// Trap records as `(offset, code)` pairs.
    pub fn traps(&self) -> impl Iterator<Item = (CodeOffset, TrapCode)> + '_ {
        self.records.iter().filter_map(|r| match *r {
            MetadataRecord::Trap { offset, code } => Some((offset, code)),
            _ => None,
        })
    }

    /// Source-location records as `(range, loc)` pairs.
    pub fn srclocs(&self) -> impl Iterator<Item = (Range<CodeOffset>, u32)> + '_ {
        self.records.iter().filter_map(|r| match *r {
            MetadataRecord::SourceLoc { start, end, loc } => Some((start..end, loc)),
            _ => None,
        })
    }

    /// Return addresses of call sites.
    pub fn call_sites(&self) -> impl Iterator<Item = CodeOffset> + '_ {
        self.records.iter().filter_map(|r| match *r {
            MetadataRecord::CallSite { ret_addr } => Some(ret_addr),
            _ => None,
        })
    }

    /// Exception handlers as `(pc_offset, handler_offset)` pairs.
    pub fn exception_handlers(&self) -> impl Iterator<Item = (CodeOffset, CodeOffset)> + '_ {
        self.records.iter().filter_map(|r| match *r {
            MetadataRecord::ExceptionHandler {
                pc_offset,
                handler_offset,
            } => Some((pc_offset, handler_offset)),
            _ => None,
        })
    }

    /// Drop every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl MetadataLog for CodeMetadata {
    fn watermark(&self) -> Watermark {
        Watermark::new(self.records.len())
    }

    fn duplicate_range(&mut self, begin: Watermark, end: Watermark, shift: CodeOffset) {
        assert!(
            begin <= end && end.index() <= self.records.len(),
            "bad metadata range {begin:?}..{end:?}"
        );
        trace!(
            "CodeMetadata: duplicating {} records shifted by {}",
            end.index() - begin.index(),
            shift
        );
        for i in begin.index()..end.index() {
            let copy = self.records[i].shifted(shift);
            self.records.push(copy);
        }
    }
}
