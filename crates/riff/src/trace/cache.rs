//! Per-thread trace cache.
//!
//! Compiled traces are keyed by `(prototype identity, start PC)`. The cache
//! also owns per-exit hit counters and the side traces attached to hot
//! exits. No invalidation is required: prototypes are immutable and live
//! traces are never patched.

use std::rc::Rc;

use ahash::AHashMap;

use crate::trace::{codegen::MachineTrace, ir::Trace};

/// Key of a root trace: prototype identity plus start PC.
pub type TraceKey = (usize, usize);

/// A trace ready to run: the scheduled, register-assigned IR plus optional
/// machine code from the lowering backend.
#[derive(Debug)]
pub struct CompiledTrace {
    pub trace: Trace,
    /// Machine code for the trace body, when the lowering supported it.
    pub code: Option<MachineTrace>,
}

/// Thread-owned table of compiled traces.
#[derive(Debug, Default)]
pub struct TraceCache {
    roots: AHashMap<TraceKey, Rc<CompiledTrace>>,
    /// Side traces attached to (root key, exit index).
    sides: AHashMap<(TraceKey, usize), Rc<CompiledTrace>>,
    /// Per-exit hit counters for side-trace candidacy.
    exit_hits: AHashMap<(TraceKey, usize), u32>,
}

impl TraceCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn root(&self, key: TraceKey) -> Option<Rc<CompiledTrace>> {
        self.roots.get(&key).cloned()
    }

    pub fn install_root(&mut self, key: TraceKey, compiled: CompiledTrace) {
        self.roots.insert(key, Rc::new(compiled));
    }

    #[must_use]
    pub fn side(&self, root: TraceKey, exit: usize) -> Option<Rc<CompiledTrace>> {
        self.sides.get(&(root, exit)).cloned()
    }

    pub fn install_side(&mut self, root: TraceKey, exit: usize, compiled: CompiledTrace) {
        self.sides.insert((root, exit), Rc::new(compiled));
    }

    /// Bumps an exit counter and reports the new total.
    pub fn bump_exit(&mut self, root: TraceKey, exit: usize) -> u32 {
        let count = self.exit_hits.entry((root, exit)).or_insert(0);
        *count += 1;
        *count
    }

    /// Number of compiled root traces (tests and diagnostics).
    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// All compiled root traces, for inspection by tests and trace dumps.
    pub fn roots(&self) -> impl Iterator<Item = (&TraceKey, &Rc<CompiledTrace>)> {
        self.roots.iter()
    }

    #[must_use]
    pub fn side_count(&self) -> usize {
        self.sides.len()
    }
}
