//! Recording and replaying snippets of emitted code.
//!
//! An encoder that needs to stamp the same instruction pattern at many sites
//! (say, an out-of-line slow path or an inline cache stub) can emit it once,
//! bracketed by [`SnippetRecorder::start`] and [`SnippetRecorder::stop`], and
//! then call [`SnippetRecorder::replay`] for every further occurrence. Replay
//! copies the recorded bytes verbatim and then fixes up what a verbatim copy
//! gets wrong:
//!
//! - A branch whose target lies inside the recorded range moves together with
//!   its target, so its relative displacement is already correct. Those are
//!   dropped from the recorder at `stop`.
//! - A branch to a bound label outside the range moved by `shift` bytes while
//!   its target did not: its displacement is decreased by `shift`.
//! - A branch to a label that is still unbound gets a fresh pending patch on
//!   that label, resolved by the ordinary binding mechanism.
//!
//! Metadata records (traps, source locations, ...) created while recording are
//! duplicated through [`MetadataLog::duplicate_range`].
//!
//! The recorded range is half-open: a label bound exactly at the end of the
//! recording is outside it.

use crate::assembler::Assembler;
use crate::buffer::CodeBuffer;
use crate::isa::TargetIsa;
use crate::label::{Label, Labels};
use crate::metadata::{MetadataLog, Watermark};
use crate::{CodeOffset, trace};
use core::ops::Range;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SnippetState {
    NotStarted,
    Recording {
        code_start: CodeOffset,
        begin: Watermark,
    },
    Stopped {
        code_start: CodeOffset,
        code_end: CodeOffset,
        begin: Watermark,
        end: Watermark,
    },
}

/// A recorded run of code that can be re-emitted elsewhere.
#[derive(Clone, Debug)]
pub struct SnippetRecorder {
    state: SnippetState,
    /// Label uses inside the snippet, by offset of the branch instruction.
    patches: BTreeMap<CodeOffset, Label>,
}

impl Default for SnippetRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnippetRecorder {
    /// A recorder that has not started yet.
    pub fn new() -> Self {
        SnippetRecorder {
            state: SnippetState::NotStarted,
            patches: BTreeMap::new(),
        }
    }

    /// Is the recorder between `start` and `stop`?
    pub fn is_recording(&self) -> bool {
        matches!(self.state, SnippetState::Recording { .. })
    }

    /// Has the recorder been stopped, so that it can be replayed?
    pub fn is_stopped(&self) -> bool {
        matches!(self.state, SnippetState::Stopped { .. })
    }

    /// The recorded code range, once stopped.
    pub fn code_range(&self) -> Option<Range<CodeOffset>> {
        match self.state {
            SnippetState::Stopped {
                code_start,
                code_end,
                ..
            } => Some(code_start..code_end),
            _ => None,
        }
    }

    /// Label uses that replay has to fix up, by branch offset.
    pub fn patches(&self) -> impl Iterator<Item = (CodeOffset, Label)> + '_ {
        self.patches.iter().map(|(&offset, &label)| (offset, label))
    }

    /// Is a label use recorded for the branch at `branch`?
    pub fn has_patch(&self, branch: CodeOffset) -> bool {
        self.patches.contains_key(&branch)
    }

    /// Begin recording at the current end of `buf`.
    pub fn start(&mut self, buf: &CodeBuffer, meta: &impl MetadataLog) {
        assert!(!buf.is_closed(), "cannot emit after close");
        match self.state {
            SnippetState::NotStarted => {}
            SnippetState::Recording { .. } => panic!("nested snippet recording"),
            SnippetState::Stopped { .. } => panic!("snippet recorder already used"),
        }
        let code_start = buf.cur_offset();
        trace!("SnippetRecorder: start at {}", code_start);
        self.state = SnippetState::Recording {
            code_start,
            begin: meta.watermark(),
        };
    }

    /// Note that the branch instruction at `branch` refers to `label`.
    pub fn add_patch(&mut self, branch: CodeOffset, label: Label) {
        assert!(self.is_recording(), "snippet patch added while not recording");
        trace!("SnippetRecorder: branch at {} to {}", branch, label);
        self.patches.insert(branch, label);
    }

    /// Move the recorded branch at `branch` by `delta` bytes.
    pub fn update_patch(&mut self, branch: CodeOffset, delta: i64) {
        assert!(self.is_recording(), "snippet patch updated while not recording");
        let label = self
            .patches
            .remove(&branch)
            .unwrap_or_else(|| panic!("no snippet patch recorded at {branch}"));
        let moved = CodeOffset::try_from(i64::from(branch) + delta)
            .unwrap_or_else(|_| panic!("snippet patch at {branch} moved out of the buffer"));
        self.patches.insert(moved, label);
    }

    /// End the recording at the current end of `buf`.
    ///
    /// Branches whose label is already bound inside the recorded range are
    /// self-contained and are forgotten.
    pub fn stop(&mut self, buf: &CodeBuffer, labels: &Labels, meta: &impl MetadataLog) {
        let SnippetState::Recording { code_start, begin } = self.state else {
            panic!("snippet stopped while not recording");
        };
        let code_end = buf.cur_offset();
        let range = code_start..code_end;
        self.patches.retain(|_, label| match labels.offset(*label) {
            Some(target) => !range.contains(&target),
            None => true,
        });
        trace!(
            "SnippetRecorder: stop at {}, {} branches need fixups on replay",
            code_end,
            self.patches.len()
        );
        self.state = SnippetState::Stopped {
            code_start,
            code_end,
            begin,
            end: meta.watermark(),
        };
    }

    /// Emit a copy of the recorded snippet at the current offset of `asm`.
    pub fn replay<I: TargetIsa>(&self, asm: &mut Assembler<I>, meta: &mut impl MetadataLog) {
        let SnippetState::Stopped {
            code_start,
            code_end,
            begin,
            end,
        } = self.state
        else {
            panic!("snippet replayed before it was stopped");
        };
        assert!(!asm.buffer.is_closed(), "cannot emit after close");

        for offset in code_start..code_end {
            let byte = asm.buffer.read_u8(offset);
            asm.buffer.put1(byte);
        }
        let shift = asm.cur_offset() - code_end;
        trace!(
            "SnippetRecorder: replaying {}..{} at {} (shift {})",
            code_start,
            code_end,
            code_start + shift,
            shift
        );

        for (&branch, &label) in &self.patches {
            let new_branch = branch + shift;
            match asm.labels.offset(label) {
                Some(target) if (code_start..code_end).contains(&target) => {
                    // Bound inside after `stop`: the copy is self-contained.
                    trace!("SnippetRecorder: {} now inside the snippet", label);
                }
                Some(_) => {
                    asm.isa
                        .patch_relative_jump_target(&mut asm.buffer, new_branch, -i64::from(shift));
                    asm.mirror_label_use(new_branch, label);
                }
                None => asm.use_label(new_branch, label),
            }
        }

        meta.duplicate_range(begin, end, shift);
    }
}
