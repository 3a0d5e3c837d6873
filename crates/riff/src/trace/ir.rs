//! Typed, SSA-style trace intermediate representation.
//!
//! A trace is a linear vector of [`IrNode`]s. Operand references strictly
//! precede their users, except phi nodes in the loop body referring back to
//! header values from the previous iteration. Constants sit at the prefix of
//! an optimized trace.
//!
//! Guards are Nil-typed nodes with an Empty output shape; each carries an
//! exit index into the trace's [`ExitRecord`] table describing how to
//! reconstruct interpreter state when the guard fails. Stores are Nil-typed;
//! loads are not.

use std::fmt;

use strum::{Display, IntoStaticStr};

use crate::{
    intern::StringId,
    value::{EnvId, Ty, Value},
};

/// Reference to an earlier IR node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrRef(pub u32);

/// Absent operand slot.
pub const NONE: IrRef = IrRef(u32::MAX);

impl IrRef {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub fn is_none(self) -> bool {
        self == NONE
    }
}

impl fmt::Display for IrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "----")
        } else {
            write!(f, "{:04}", self.0)
        }
    }
}

/// The symbolic-plus-observed length of a value within a trace.
///
/// `len` is an IR reference producing the run-time length; `concrete` is the
/// length observed while recording, used for decisions. Two shapes are equal
/// iff their `len` references are equal.
#[derive(Debug, Clone, Copy, Eq)]
pub struct Shape {
    pub len: IrRef,
    pub concrete: i64,
}

/// The shape of guards and stores: no value.
pub const EMPTY_SHAPE: Shape = Shape {
    len: NONE,
    concrete: 0,
};

impl Shape {
    #[must_use]
    pub fn new(len: IrRef, concrete: i64) -> Self {
        Self { len, concrete }
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len.is_none()
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "[-]")
        } else {
            write!(f, "[{}~{}]", self.len, self.concrete)
        }
    }
}

/// A trace-local name for a storage slot: either an interpreter register
/// (negative offset from the interpreter base) or a named binding in an
/// environment produced by an earlier IR node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Variable {
    Register(u32),
    Binding { env: IrRef, name: StringId },
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register(r) => write!(f, "r{r}"),
            Self::Binding { env, name } => write!(f, "env{}:{}", env, name.index()),
        }
    }
}

/// IR opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum IrOp {
    Nop,
    /// Constant-pool entry; `imm` indexes the trace's constant table.
    Const,
    /// Interpreter-register load from the entry snapshot; tagged with a
    /// `Variable::Register`.
    Sload,
    /// Environment load: `a` is the environment node, tag names the binding.
    Load,
    /// An environment value known at record time; `imm` holds the arena id.
    Env,
    /// Lexical parent of environment `a`.
    Lenv,
    /// Deferred write of `a` to the tagged variable.
    Store,

    // guards (Nil type, Empty shape, exit record attached)
    /// Fails when condition `a` is false.
    Gtrue,
    /// Fails when condition `a` is true.
    Gfalse,
    /// Fails when `length(a) != imm`.
    Glen,
    /// Fails unless `0 < length(a) <= length(b)` (shape-merge recycling
    /// precondition).
    Grange,
    /// Fails when `name` (tag) has become bound in environment `a`;
    /// speculation for lexical-chain walks.
    Gunbound,
    /// Fails when the class attribute of `a` is no longer `imm`.
    Gclass,

    /// Element-type conversion of `a` to the node type.
    Cast,
    /// Recycle `a` to the output shape.
    Rep,
    /// Integer sequence `1, 1+step, …` of the output shape; `imm` is step.
    Seqv,
    /// `a[b]` with a 0-based integer index vector.
    Gather,
    /// Copy of `a` with `c` written at 0-based positions `b`.
    Scatter,
    /// Run-time length of `a` as an integer scalar.
    Length,

    // unary
    Neg,
    Not,
    IsNa,
    IsFinite,
    Log,
    Exp,
    Sqrt,
    Abs,
    Floor,
    Ceiling,

    // binary
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,

    /// `ifelse(a, b, c)` elementwise blend.
    Blend,

    // folds (vector in, scalar out, accumulator persists across tiles)
    Sum,
    Prod,
    Min,
    Max,
    Any,
    All,

    /// Marks the end of the loop header; the loop body follows.
    Loop,
    /// Loop-carried value: `a` is the header definition, `b` the body
    /// definition feeding the next iteration.
    Phi,
    /// Side-trace terminal: transfer to the root trace; `imm` is the exit
    /// index carrying the reenter record.
    Exit,
}

impl IrOp {
    #[must_use]
    pub fn is_guard(self) -> bool {
        matches!(
            self,
            Self::Gtrue | Self::Gfalse | Self::Glen | Self::Grange | Self::Gunbound | Self::Gclass
        )
    }

    /// Loads in the scheduling sense: nodes that read interpreter state and
    /// therefore end a fusion group.
    #[must_use]
    pub fn is_memory_read(self) -> bool {
        matches!(self, Self::Sload | Self::Load | Self::Env | Self::Lenv)
    }

    #[must_use]
    pub fn is_fold(self) -> bool {
        matches!(self, Self::Sum | Self::Prod | Self::Min | Self::Max | Self::Any | Self::All)
    }

    /// Nodes the executor handles outside the tile loops: loads, guards,
    /// stores, constants, lengths, and control markers. These never fuse.
    #[must_use]
    pub fn is_administrative(self) -> bool {
        self.is_guard()
            || self.is_memory_read()
            || matches!(
                self,
                Self::Store | Self::Const | Self::Length | Self::Phi | Self::Loop | Self::Exit | Self::Nop | Self::Scatter
            )
    }
}

/// Where and how the interpreter resumes after a guard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reenter {
    pub pc: usize,
    /// Whether the PC returns into a frame that was live at trace entry
    /// (false would mean an inlined frame that must be rebuilt first).
    pub in_scope: bool,
}

/// A live interpreter frame at a guard, as IR references.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub env: IrRef,
    pub return_pc: usize,
}

/// Snapshot captured at a guard: everything needed to hand a coherent state
/// back to the interpreter.
#[derive(Debug, Clone)]
pub struct ExitRecord {
    pub index: usize,
    /// Live stores to materialize, in store order: the IR value that must be
    /// written back to each Variable.
    pub stores: Vec<(Variable, IrRef)>,
    /// Environments live at the guard.
    pub live_envs: Vec<IrRef>,
    /// Frames to restore (beyond the entry frame, which is always live).
    pub frames: Vec<FrameSnapshot>,
    pub reenter: Reenter,
    /// Hits observed at run time; drives side-trace candidacy.
    pub hits: u32,
}

/// One IR node. `a`, `b`, `c` are operand references; `imm` is the small
/// immediate payload (constant index, step, expected length, exit index,
/// class id) whose meaning is per-opcode.
#[derive(Debug, Clone)]
pub struct IrNode {
    pub op: IrOp,
    pub a: IrRef,
    pub b: IrRef,
    pub c: IrRef,
    pub imm: i64,
    pub ty: Ty,
    pub in_shape: Shape,
    pub out_shape: Shape,
    /// Variable tag for `sload`/`load`/`store`/`gunbound`.
    pub var: Option<Variable>,
    /// Exit-record index for guards; `u32::MAX` otherwise.
    pub exit: u32,
    /// Assigned tile register; `u8::MAX` until register assignment.
    pub reg: u8,
    /// True when this node starts a new fusion group.
    pub boundary: bool,
}

pub const NO_EXIT: u32 = u32::MAX;
pub const NO_REG: u8 = u8::MAX;

impl IrNode {
    #[must_use]
    pub fn new(op: IrOp, a: IrRef, b: IrRef, c: IrRef, ty: Ty, in_shape: Shape, out_shape: Shape) -> Self {
        Self {
            op,
            a,
            b,
            c,
            imm: 0,
            ty,
            in_shape,
            out_shape,
            var: None,
            exit: NO_EXIT,
            reg: NO_REG,
            boundary: false,
        }
    }

    #[must_use]
    pub fn with_imm(mut self, imm: i64) -> Self {
        self.imm = imm;
        self
    }

    #[must_use]
    pub fn with_var(mut self, var: Variable) -> Self {
        self.var = Some(var);
        self
    }

    /// The CSE key: per the replay rules, two nodes with equal
    /// `(op, a, b, c, imm, type, in, out)` compute the same value.
    /// Variable-tagged nodes and guards are handled by the forwarding maps
    /// before this key is consulted.
    #[must_use]
    pub fn cse_key(&self) -> (IrOp, IrRef, IrRef, IrRef, i64, Ty, IrRef, IrRef) {
        (self.op, self.a, self.b, self.c, self.imm, self.ty, self.in_shape.len, self.out_shape.len)
    }
}

impl fmt::Display for IrNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:8} {} {} {} imm={:<6} {:9} in{} out{}",
            self.op.to_string(),
            self.a,
            self.b,
            self.c,
            self.imm,
            self.ty.to_string(),
            self.in_shape,
            self.out_shape,
        )?;
        if let Some(var) = &self.var {
            write!(f, " var={var}")?;
        }
        if self.exit != NO_EXIT {
            write!(f, " exit={}", self.exit)?;
        }
        if self.reg != NO_REG {
            write!(f, " reg={}", self.reg)?;
        }
        if self.boundary {
            write!(f, " |")?;
        }
        Ok(())
    }
}

/// What kind of trace this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// A loop trace rooted at a hot back-edge target.
    Loop,
    /// A straight-line trace from a hot vector operation.
    Linear,
    /// A trace attached to a side exit of a root trace.
    Side { root_pc: usize, exit: usize },
}

/// A complete trace: nodes, the constant table referenced by `Const` nodes,
/// and the exit records referenced by guards.
#[derive(Debug)]
pub struct Trace {
    pub kind: TraceKind,
    pub start_pc: usize,
    /// The environment the recording entered from. The executor refuses to
    /// run the trace from any other environment (the arena may have recycled
    /// the id for an unrelated frame).
    pub entry_env: crate::value::EnvId,
    pub nodes: Vec<IrNode>,
    pub consts: Vec<Value>,
    pub exits: Vec<ExitRecord>,
    /// Node index of the `Loop` marker, if this is a loop trace: everything
    /// before it is the header (run once), everything after is the body.
    pub loop_marker: Option<usize>,
}

impl Trace {
    /// Renders the trace for `-v` dumps.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        let _ = writeln!(out, "trace @pc {} ({:?}): {} nodes, {} exits", self.start_pc, self.kind, self.nodes.len(), self.exits.len());
        for (i, node) in self.nodes.iter().enumerate() {
            let _ = writeln!(out, "  {i:04}  {node}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_compare_by_trace_length_reference() {
        let a = Shape::new(IrRef(3), 100);
        let b = Shape::new(IrRef(3), 50);
        let c = Shape::new(IrRef(4), 100);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(EMPTY_SHAPE.is_empty());
    }

    #[test]
    fn guard_classification() {
        assert!(IrOp::Gtrue.is_guard());
        assert!(IrOp::Glen.is_guard());
        assert!(!IrOp::Add.is_guard());
        assert!(IrOp::Sload.is_memory_read());
    }
}
