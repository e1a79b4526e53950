//! Nested scopes of available ISA features.
//!
//! An encoder may emit a region of code that is allowed to use instructions
//! beyond the baseline the compilation targets, for instance an AVX2 fast path
//! guarded by a runtime check. [`FeatureScope::push`] opens such a region and
//! [`FeatureScope::pop`] closes it.
//!
//! Each stack frame remembers only the features its push *newly* activated.
//! Popping deactivates exactly those, so overlapping nested requests restore
//! the outer state correctly: after pushing `{A, B}` and then `{B, C}`, the
//! inner frame only owns `C`, and popping it leaves `B` active for the outer
//! region.

use crate::trace;
use bitflags::Flags;
use core::fmt::Debug;
use smallvec::SmallVec;

/// A stack of feature sets, on top of an always-active baseline.
#[derive(Clone, Debug)]
pub struct FeatureScope<F: Flags + Copy + Debug> {
    /// Features usable at this point of emission.
    active: F,
    /// Per pushed scope, the features that scope added to `active`.
    added: SmallVec<[F; 4]>,
}

impl<F: Flags + Copy + Debug> FeatureScope<F> {
    /// Create a scope stack with `baseline` active and no pushed scope.
    pub fn new(baseline: F) -> Self {
        FeatureScope {
            active: baseline,
            added: SmallVec::new(),
        }
    }

    /// Every feature currently active.
    pub fn active(&self) -> F {
        self.active
    }

    /// Is every feature of `features` currently active, in any scope?
    pub fn is_active(&self, features: F) -> bool {
        self.active.contains(features)
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.added.len()
    }

    /// Open a scope in which `requested` is available.
    pub fn push(&mut self, requested: F) {
        let added = requested.difference(self.active);
        trace!(
            "FeatureScope: push {:?} (newly active {:?}) at depth {}",
            requested,
            added,
            self.added.len()
        );
        self.active.insert(requested);
        self.added.push(added);
    }

    /// Close the innermost scope, deactivating what its push added.
    ///
    /// Popping with no open scope is an encoder bug and panics.
    pub fn pop(&mut self) {
        let added = self.added.pop().expect("feature scope stack is empty");
        trace!("FeatureScope: pop, deactivating {:?}", added);
        self.active.remove(added);
    }

    /// Was `features` activated by the innermost scope itself, rather than
    /// inherited from an enclosing one?
    pub fn is_active_in_innermost_scope(&self, features: F) -> bool {
        match self.added.last() {
            Some(top) => !features.is_empty() && top.contains(features),
            None => false,
        }
    }

    /// Close every scope, returning to the baseline.
    pub fn reset(&mut self) {
        while !self.added.is_empty() {
            self.pop();
        }
    }
}
