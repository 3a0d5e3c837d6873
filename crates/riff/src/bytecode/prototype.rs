//! Compiled units.
//!
//! A [`Prototype`] is the immutable output of the external compiler: a
//! constant pool, nested prototypes (closure bodies, promise thunks, default
//! expressions), a compiled-call table with pre-matched argument lists, and
//! the instruction stream. Prototypes are shared behind `Rc` and never
//! mutated after emission.

use std::rc::Rc;

use crate::{
    bytecode::op::Instruction,
    intern::StringId,
    value::Value,
};

/// One argument in a compiled call, in source order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallArg {
    /// Already-evaluated value in a caller register (used by `Ncall` and
    /// `Internal` argument lists).
    Register(u32),
    /// Lazy argument: index into the caller prototype's nested prototypes of
    /// the thunk to wrap in a promise.
    Promise(usize),
    /// Explicitly missing (`f(, 2)`).
    Missing,
    /// Expand the caller's dots at this position.
    Dots,
}

/// A pre-matched argument list for one call site.
///
/// The compiler resolves argument expressions to registers or promise
/// thunks; names and the dots position are kept for callee-side matching.
#[derive(Debug, Clone, Default)]
pub struct CompiledCall {
    pub args: Vec<CallArg>,
    /// Parallel to `args`; `None` for positional arguments.
    pub names: Vec<Option<StringId>>,
    /// Position of `...` in `args`, if present.
    pub dots_pos: Option<usize>,
}

/// A formal parameter of a prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: StringId,
    /// Nested-prototype index of the default expression thunk, if any.
    pub default: Option<usize>,
}

/// A compiled unit. Immutable once emitted.
#[derive(Debug, Default)]
pub struct Prototype {
    /// For diagnostics and trace dumps.
    pub name: Option<StringId>,
    pub constants: Vec<Value>,
    pub prototypes: Vec<Rc<Prototype>>,
    pub calls: Vec<CompiledCall>,
    pub code: Vec<Instruction>,
    /// Register-file size of a frame running this prototype.
    pub nregs: usize,
    pub params: Vec<Param>,
    /// Position of `...` among the formals, if present.
    pub dots_param: Option<usize>,
}

impl Prototype {
    /// Stable identity for hot-count and trace-cache keys. Prototypes are
    /// immutable and kept alive by the caches that key on them.
    #[must_use]
    pub fn identity(self: &Rc<Self>) -> usize {
        Rc::as_ptr(self) as usize
    }
}
