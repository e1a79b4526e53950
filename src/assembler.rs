//! The per-compilation emission context.
//!
//! An [`Assembler`] owns everything one compilation unit emits into: the
//! [`CodeBuffer`], the [`Labels`] arena with its pending-label registry, the
//! [`FeatureScope`] stack and the snippet currently being recorded, if any.
//! It is driven by a single thread from the first byte to
//! [`Assembler::close`]; independent compilations use independent assemblers.

use crate::buffer::{CodeBuffer, DataWidth};
use crate::features::FeatureScope;
use crate::isa::TargetIsa;
use crate::label::{Label, Labels};
use crate::metadata::MetadataLog;
use crate::result::CodegenResult;
use crate::settings::Flags;
use crate::snippet::SnippetRecorder;
use crate::{CodeOffset, trace};

/// Emission context for one compilation unit.
pub struct Assembler<I: TargetIsa> {
    pub(crate) isa: I,
    flags: Flags,
    pub(crate) buffer: CodeBuffer,
    pub(crate) labels: Labels,
    features: FeatureScope<I::Features>,
    /// The snippet being recorded; at most one at a time.
    snippet: Option<SnippetRecorder>,
    /// Last offset claimed as a distinct program point.
    last_unique_pc: Option<CodeOffset>,
}

impl<I: TargetIsa> Assembler<I> {
    /// Create an assembler emitting code for `isa`.
    pub fn new(isa: I, flags: &Flags) -> Self {
        let buffer = CodeBuffer::with_capacity(
            isa.endianness(),
            isa.nop(),
            flags.initial_capacity() as usize,
        );
        let features = FeatureScope::new(isa.baseline_features());
        Assembler {
            isa,
            flags: flags.clone(),
            buffer,
            labels: Labels::new(),
            features,
            snippet: None,
            last_unique_pc: None,
        }
    }

    /// The target ISA.
    pub fn isa(&self) -> &I {
        &self.isa
    }

    /// The settings this assembler was created with.
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// The underlying code buffer.
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    /// The label arena.
    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Current offset from start of buffer.
    pub fn cur_offset(&self) -> CodeOffset {
        self.buffer.cur_offset()
    }

    /// Append the low `width` bytes of `value`.
    pub fn emit(&mut self, width: DataWidth, value: u64) {
        self.buffer.emit(width, value);
    }

    /// Overwrite already-emitted bytes at `offset`.
    pub fn emit_at(&mut self, width: DataWidth, value: u64, offset: CodeOffset) {
        self.buffer.emit_at(width, value, offset);
    }

    /// Add a byte.
    pub fn put1(&mut self, value: u8) {
        self.buffer.put1(value);
    }

    /// Add 2 bytes.
    pub fn put2(&mut self, value: u16) {
        self.buffer.put2(value);
    }

    /// Add 4 bytes.
    pub fn put4(&mut self, value: u32) {
        self.buffer.put4(value);
    }

    /// Add 8 bytes.
    pub fn put8(&mut self, value: u64) {
        self.buffer.put8(value);
    }

    /// Add a slice of bytes.
    pub fn put_data(&mut self, data: &[u8]) {
        self.buffer.put_data(data);
    }

    /// Pad with no-ops up to a multiple of `modulus`.
    pub fn align(&mut self, modulus: CodeOffset) {
        self.buffer.align_to(modulus);
    }

    /// Make sure the current offset is not shared with the previous program
    /// point claimed through this method, emitting a no-op if it would be.
    ///
    /// Debug info and exception tables key their records by code offset; two
    /// logically distinct points at one address would be ambiguous.
    pub fn ensure_unique_pc(&mut self) {
        let here = self.cur_offset();
        if self.flags.unique_pc() && self.last_unique_pc == Some(here) {
            trace!("Assembler: separating program points at {} with a nop", here);
            self.buffer.put_data(self.isa.nop());
        }
        self.last_unique_pc = Some(self.cur_offset());
    }

    /// Allocate a new, unbound label.
    pub fn get_label(&mut self) -> Label {
        self.labels.create()
    }

    /// Has `label` been bound?
    pub fn is_bound(&self, label: Label) -> bool {
        self.labels.is_bound(label)
    }

    /// The offset `label` is bound to, if any.
    pub fn label_offset(&self, label: Label) -> Option<CodeOffset> {
        self.labels.offset(label)
    }

    /// Bind `label` to the current offset. A label can only be bound once.
    pub fn bind_label(&mut self, label: Label) {
        let offset = self.cur_offset();
        self.bind_label_at(label, offset);
    }

    /// Bind `label` to an already-emitted `offset`, patching every branch
    /// waiting for it.
    pub fn bind_label_at(&mut self, label: Label, offset: CodeOffset) {
        assert!(
            offset <= self.cur_offset(),
            "{label} bound at {offset}, past write cursor {}",
            self.cur_offset()
        );
        let Self {
            isa,
            buffer,
            labels,
            ..
        } = self;
        labels.bind(label, offset, |branch, target| {
            isa.patch_jump_target(buffer, branch, target)
        });
    }

    /// Record that the branch instruction starting at `branch` refers to
    /// `label`. The instruction must already be emitted; if the label is
    /// bound it is patched immediately.
    ///
    /// While a snippet is being recorded the use is mirrored into it.
    pub fn use_label(&mut self, branch: CodeOffset, label: Label) {
        let Self {
            isa,
            buffer,
            labels,
            ..
        } = self;
        labels.add_patch_at(label, branch, |branch, target| {
            isa.patch_jump_target(buffer, branch, target)
        });
        self.mirror_label_use(branch, label);
    }

    /// The branch to `label` recorded at `branch` actually starts `delta`
    /// bytes further. Both the label's queue and the recording snippet, if it
    /// saw the branch, are updated.
    pub fn update_label_use(&mut self, label: Label, branch: CodeOffset, delta: i64) {
        let Self {
            isa,
            buffer,
            labels,
            ..
        } = self;
        labels.update_patch(label, branch, delta, |branch, target| {
            isa.patch_jump_target(buffer, branch, target)
        });
        if let Some(snippet) = self.snippet.as_mut() {
            if snippet.has_patch(branch) {
                snippet.update_patch(branch, delta);
            }
        }
    }

    pub(crate) fn mirror_label_use(&mut self, branch: CodeOffset, label: Label) {
        if let Some(snippet) = self.snippet.as_mut() {
            snippet.add_patch(branch, label);
        }
    }

    /// Open a feature scope making `features` available.
    pub fn push_features(&mut self, features: I::Features) {
        self.features.push(features);
    }

    /// Close the innermost feature scope.
    pub fn pop_features(&mut self) {
        self.features.pop();
    }

    /// Are all of `features` usable at this point?
    pub fn has_feature(&self, features: I::Features) -> bool {
        self.features.is_active(features)
    }

    /// The feature scope stack.
    pub fn features(&self) -> &FeatureScope<I::Features> {
        &self.features
    }

    /// Is a snippet being recorded?
    pub fn is_recording_snippet(&self) -> bool {
        self.snippet.is_some()
    }

    /// Start recording a snippet at the current offset.
    pub fn start_snippet(&mut self, meta: &impl MetadataLog) {
        assert!(self.snippet.is_none(), "nested snippet recording");
        let mut snippet = SnippetRecorder::new();
        snippet.start(&self.buffer, meta);
        self.snippet = Some(snippet);
    }

    /// Stop recording and hand the snippet back for replay.
    pub fn stop_snippet(&mut self, meta: &impl MetadataLog) -> SnippetRecorder {
        let mut snippet = self.snippet.take().expect("no snippet is being recorded");
        snippet.stop(&self.buffer, &self.labels, meta);
        snippet
    }

    /// Emit a copy of `snippet` at the current offset.
    pub fn replay_snippet(&mut self, snippet: &SnippetRecorder, meta: &mut impl MetadataLog) {
        snippet.replay(self, meta);
    }

    /// Finish emission: check that every label use was resolved, then pad to
    /// `alignment` and freeze the buffer.
    ///
    /// On failure the buffer is left open and the compilation unit should be
    /// abandoned.
    pub fn close(&mut self, trim: bool, alignment: CodeOffset) -> CodegenResult<Vec<u8>> {
        assert!(!self.buffer.is_closed(), "cannot emit after close");
        assert!(self.snippet.is_none(), "snippet still recording at close");
        if let Err(err) = self.labels.check_resolved() {
            log::debug!("Assembler: {err}");
            return Err(err);
        }
        self.buffer.close(trim, alignment)
    }

    /// [`Assembler::close`] with the configured trim and alignment.
    pub fn finish(&mut self) -> CodegenResult<Vec<u8>> {
        let trim = self.flags.trim_output();
        let alignment = self.flags.code_alignment();
        self.close(trim, alignment)
    }

    /// Size of the code as of [`Assembler::close`].
    pub fn final_code_size(&self) -> CodeOffset {
        self.buffer.final_code_size()
    }

    /// Drop all state so the assembler can serve an unrelated compilation.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.labels.clear();
        self.features.reset();
        self.snippet = None;
        self.last_unique_pc = None;
    }
}
