//! Labels: symbolic code addresses with deferred patching.
//!
//! A [`Label`] is an index into the [`Labels`] arena. Emission sites hold the
//! index, never a reference, so any number of branches can name the same label
//! before it is bound. The arena record is either unbound, holding the offsets
//! of the branches waiting for it, or bound to a fixed offset. Binding is a
//! one-way, at-most-once transition.
//!
//! The rewrite of a branch once its target is known is architecture-specific,
//! so the operations that may trigger it take a callback receiving
//! `(branch_offset, target_offset)`.

use crate::result::{CodegenError, CodegenResult, UnresolvedLabel, UnresolvedLabels};
use crate::{CodeOffset, trace};
use cranelift_entity::{PrimaryMap, entity_impl};
use smallvec::SmallVec;

/// A label refers to some offset in a code buffer. It may not be resolved at
/// the point at which it is used by emitted code; the branch sites are
/// recorded and patched once the label's location is known.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// Binding state of a label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelState {
    /// Not bound yet; branch sites queue up.
    Unbound,
    /// Bound to the given offset. Terminal.
    Bound(CodeOffset),
}

/// Per-label record in the arena.
#[derive(Clone, Debug)]
pub struct LabelData {
    state: LabelState,
    /// Offsets of branch instructions waiting for this label to be bound.
    patches: SmallVec<[CodeOffset; 4]>,
    /// Already entered in the pending-label registry.
    registered: bool,
}

impl LabelData {
    fn new() -> Self {
        LabelData {
            state: LabelState::Unbound,
            patches: SmallVec::new(),
            registered: false,
        }
    }

    /// The binding state.
    pub fn state(&self) -> LabelState {
        self.state
    }

    /// Branch sites still waiting for this label.
    pub fn pending_patches(&self) -> &[CodeOffset] {
        &self.patches
    }
}

/// Registry of every label that ever had a patch queued, scanned at close to
/// find the ones that never got bound.
#[derive(Clone, Debug, Default)]
pub struct PendingLabels {
    labels: Vec<Label>,
}

impl PendingLabels {
    fn register(&mut self, label: Label, data: &mut LabelData) {
        if !data.registered {
            data.registered = true;
            self.labels.push(label);
        }
    }

    /// Labels entered in the registry, in registration order.
    pub fn iter(&self) -> impl Iterator<Item = Label> + '_ {
        self.labels.iter().copied()
    }

    fn clear(&mut self) {
        self.labels.clear();
    }
}

/// Arena of labels for one compilation unit.
#[derive(Clone, Debug, Default)]
pub struct Labels {
    data: PrimaryMap<Label, LabelData>,
    pending: PendingLabels,
}

impl Labels {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unbound label.
    pub fn create(&mut self) -> Label {
        let label = self.data.push(LabelData::new());
        trace!("Labels: new label -> {}", label);
        label
    }

    /// Number of labels allocated so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if no label was allocated.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The arena record for `label`.
    pub fn get(&self, label: Label) -> &LabelData {
        &self.data[label]
    }

    /// Has `label` been bound?
    pub fn is_bound(&self, label: Label) -> bool {
        matches!(self.data[label].state, LabelState::Bound(_))
    }

    /// The offset `label` is bound to, if any.
    pub fn offset(&self, label: Label) -> Option<CodeOffset> {
        match self.data[label].state {
            LabelState::Bound(offset) => Some(offset),
            LabelState::Unbound => None,
        }
    }

    /// The pending-label registry.
    pub fn pending(&self) -> &PendingLabels {
        &self.pending
    }

    /// Record that the branch at `branch` refers to `label`.
    ///
    /// If the label is already bound the reference is written right away by
    /// calling `patch(branch, target)`; otherwise the branch is queued until
    /// [`Labels::bind`].
    pub fn add_patch_at(
        &mut self,
        label: Label,
        branch: CodeOffset,
        patch: impl FnOnce(CodeOffset, CodeOffset),
    ) {
        let data = &mut self.data[label];
        match data.state {
            LabelState::Bound(target) => {
                trace!("Labels: {} bound at {}, patching {} now", label, target, branch);
                patch(branch, target);
            }
            LabelState::Unbound => {
                trace!("Labels: queue patch at {} for {}", branch, label);
                data.patches.push(branch);
                self.pending.register(label, data);
            }
        }
    }

    /// Bind `label` to `offset` and rewrite every queued branch through
    /// `patch(branch, offset)`, emptying the queue.
    ///
    /// Binding a label twice is an encoder bug and panics.
    pub fn bind(
        &mut self,
        label: Label,
        offset: CodeOffset,
        mut patch: impl FnMut(CodeOffset, CodeOffset),
    ) {
        let data = &mut self.data[label];
        if let LabelState::Bound(prev) = data.state {
            panic!("{label} bound twice (at {prev} and {offset})");
        }
        trace!("Labels: bind {} at offset {}", label, offset);
        data.state = LabelState::Bound(offset);
        for branch in data.patches.drain(..) {
            patch(branch, offset);
        }
    }

    /// The branch recorded at `branch` for `label` actually starts `delta`
    /// bytes further.
    ///
    /// A queued patch is moved. If the label is already bound, the reference
    /// is written at the new position through `patch(moved, target)`.
    /// Moving a branch that was never recorded is an encoder bug and panics.
    pub fn update_patch(
        &mut self,
        label: Label,
        branch: CodeOffset,
        delta: i64,
        patch: impl FnOnce(CodeOffset, CodeOffset),
    ) {
        let moved = CodeOffset::try_from(i64::from(branch) + delta)
            .unwrap_or_else(|_| panic!("patch at {branch} for {label} moved out of the buffer"));
        let data = &mut self.data[label];
        match data.state {
            LabelState::Bound(target) => {
                trace!("Labels: {} bound at {}, patching moved {} now", label, target, moved);
                patch(moved, target);
            }
            LabelState::Unbound => {
                let slot = data
                    .patches
                    .iter_mut()
                    .find(|p| **p == branch)
                    .unwrap_or_else(|| panic!("no patch at {branch} queued for {label}"));
                trace!("Labels: move patch for {} from {} to {}", label, branch, moved);
                *slot = moved;
            }
        }
    }

    /// Check that no label is left with pending patches.
    pub fn check_resolved(&self) -> CodegenResult<()> {
        let unresolved: Vec<_> = self
            .pending
            .iter()
            .filter(|&label| !self.data[label].patches.is_empty())
            .map(|label| UnresolvedLabel {
                label,
                patch_offsets: self.data[label].patches.clone(),
            })
            .collect();
        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(CodegenError::UnresolvedLabels(UnresolvedLabels(unresolved)))
        }
    }

    /// Forget every label, for reuse across compilations.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pending.clear();
    }
}
