use gc_arena::{Collect, DynamicRootSet, Mutation};

use crate::{
    stash::{Fetchable, Stashable},
    Table,
};

/// Per-instance storage the host can reach without a reference from script code.
///
/// Holds the root set backing every stashed handle, and the registry table: a plain table shared
/// by native libraries.
#[derive(Copy, Clone, Collect)]
#[collect(no_drop)]
pub struct Registry<'gc> {
    roots: DynamicRootSet<'gc>,
    table: Table<'gc>,
}

impl<'gc> Registry<'gc> {
    pub fn new(mc: &Mutation<'gc>) -> Self {
        Self {
            roots: DynamicRootSet::new(mc),
            table: Table::new(mc),
        }
    }

    pub fn roots(&self) -> DynamicRootSet<'gc> {
        self.roots
    }

    pub fn table(&self) -> Table<'gc> {
        self.table
    }

    /// Create a `'static` handle to a GC value, keeping it alive until the handle is dropped.
    ///
    /// Handles are meant to be held outside of the GC heap. A handle stored inside a value it
    /// (transitively) keeps alive forms a cycle that is never collected.
    pub fn stash<S: Stashable<'gc>>(&self, mc: &Mutation<'gc>, s: S) -> S::Stashed {
        s.stash(mc, self.roots)
    }

    /// Get back the value behind a handle created with [`Registry::stash`].
    ///
    /// # Panics
    ///
    /// If the handle was stashed in the registry of a different instance.
    pub fn fetch<F: Fetchable>(&self, f: &F) -> F::Fetched<'gc> {
        f.fetch(self.roots)
    }
}
