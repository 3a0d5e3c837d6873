//! x86-64 lowering of scheduled traces.
//!
//! The machine backend covers the scalar-integer subset of the IR: constant
//! and load inputs, NA-checked `add`/`sub`/`mul`, comparisons fused into
//! their guards, gathers from integer vectors, phis, and exits. Anything
//! outside that subset leaves the trace to the tile interpreter, whose
//! behavior is the contract: given the same input state, emitted code must
//! produce the same post-state.
//!
//! Calling convention of the emitted function: `fn(*mut i64) -> i64`. The
//! single argument is a state array the runtime fills before the call
//! (scalar input values, vector data pointers, vector lengths); the return
//! value is the index of the taken exit, whose live stores the code wrote
//! back into dedicated state slots.

use ahash::AHashMap;

use crate::{
    asm::{Assembler, Cond, ExecBuffer, Label, Reg},
    interp::Thread,
    intern::StringId,
    trace::ir::{IrOp, IrRef, Trace, Variable},
    tracer::JitTracer,
    value::{EnvId, NA_INTEGER, Ty, Value},
};

/// Registers handed to IR values, in assignment order. `rdi` holds the
/// state pointer and `r15` the integer NA sentinel.
const POOL: [Reg; 12] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
];

const NA_REG: Reg = Reg::R15;
const STATE: Reg = Reg::Rdi;

/// One step of the runtime's entry-resolution plan, executed in order
/// before the code runs.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    /// An environment known at record time.
    Env { node: IrRef, id: u32 },
    /// The lexical parent of an already-resolved environment.
    Lenv { node: IrRef, parent_of: IrRef },
    /// Speculation check: the name must still be unbound in the
    /// environment; entering the code would be wrong otherwise.
    Unbound { env: IrRef, name: StringId },
    /// A scalar integer input value.
    Scalar { var: Variable, slot: usize },
    /// The data pointer of an integer vector (a gather base).
    VecPtr { var: Variable, node: IrRef, slot: usize },
    /// The length of a previously resolved vector.
    Length { of: IrRef, slot: usize },
}

/// A lowered trace: executable code plus the state-array contract.
#[derive(Debug)]
pub struct MachineTrace {
    code: ExecBuffer,
    code_len: usize,
    state_len: usize,
    entries: Vec<Entry>,
    /// Per exit index: which state slot each live store's value was written
    /// to.
    exit_writes: Vec<Vec<(Variable, usize)>>,
}

impl MachineTrace {
    #[must_use]
    pub fn len(&self) -> usize {
        self.code_len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.code_len == 0
    }
}

/// Attempts to lower a trace. `None` means some node falls outside the
/// supported subset (or the host is not x86-64) and the tile interpreter
/// runs it instead.
#[must_use]
pub(crate) fn lower(trace: &Trace) -> Option<MachineTrace> {
    if !cfg!(target_arch = "x86_64") {
        return None;
    }
    Lowering::new(trace)?.emit()
}

struct Lowering<'a> {
    trace: &'a Trace,
    regs: AHashMap<IrRef, Reg>,
    next_reg: usize,
    entries: Vec<Entry>,
    state_len: usize,
    /// Comparison nodes fused into guards (no register of their own).
    fused: AHashMap<IrRef, (IrOp, IrRef, IrRef)>,
    /// Dominating upper-bound guard exit per gather node.
    gather_exit: AHashMap<IrRef, usize>,
}

impl<'a> Lowering<'a> {
    /// Classifies every node, deciding registers and the state layout.
    /// `None` rejects the trace.
    fn new(trace: &'a Trace) -> Option<Self> {
        let mut this = Self {
            trace,
            regs: AHashMap::new(),
            next_reg: 0,
            entries: Vec::new(),
            state_len: 0,
            fused: AHashMap::new(),
            gather_exit: AHashMap::new(),
        };
        let marker = trace.loop_marker.unwrap_or(trace.nodes.len());

        // uses of each node, to detect compare nodes consumed only by guards
        let mut guard_only: AHashMap<IrRef, bool> = AHashMap::new();
        for node in &trace.nodes {
            for operand in [node.a, node.b, node.c] {
                if operand.is_none() {
                    continue;
                }
                let entry = guard_only.entry(operand).or_insert(true);
                *entry &= node.op.is_guard();
            }
        }
        for exit in &trace.exits {
            for (_, value) in &exit.stores {
                guard_only.insert(*value, false);
            }
        }

        for (i, node) in trace.nodes.iter().enumerate() {
            let r = IrRef(i as u32);
            match node.op {
                IrOp::Nop | IrOp::Store | IrOp::Loop | IrOp::Exit | IrOp::Phi => {}
                IrOp::Const => {
                    let value = &trace.consts[usize::try_from(node.imm).ok()?];
                    if !matches!(value, Value::Integer(v) if v.len() == 1) {
                        return None;
                    }
                    this.alloc_reg(r)?;
                }
                IrOp::Env => {
                    if i >= marker {
                        return None;
                    }
                    this.entries.push(Entry::Env {
                        node: r,
                        id: u32::try_from(node.imm).ok()?,
                    });
                }
                IrOp::Lenv => {
                    if i >= marker {
                        return None;
                    }
                    this.entries.push(Entry::Lenv { node: r, parent_of: node.a });
                }
                IrOp::Gunbound => {
                    if i >= marker {
                        return None;
                    }
                    let Some(Variable::Binding { env, name }) = node.var else {
                        return None;
                    };
                    this.entries.push(Entry::Unbound { env, name });
                }
                IrOp::Sload | IrOp::Load => {
                    if i >= marker || node.ty != Ty::Integer {
                        return None;
                    }
                    let var = node.var?;
                    let slot = this.slot();
                    if node.out_shape.concrete == 1 {
                        this.entries.push(Entry::Scalar { var, slot });
                    } else {
                        this.entries.push(Entry::VecPtr { var, node: r, slot });
                    }
                    this.alloc_reg(r)?;
                }
                IrOp::Length => {
                    // only lengths of lowered vector loads
                    if !matches!(this.trace.nodes[node.a.index()].op, IrOp::Sload | IrOp::Load) {
                        return None;
                    }
                    let slot = this.slot();
                    this.entries.push(Entry::Length { of: node.a, slot });
                    this.alloc_reg(r)?;
                }
                IrOp::Add | IrOp::Sub | IrOp::Mul => {
                    if node.ty != Ty::Integer {
                        return None;
                    }
                    this.alloc_reg(r)?;
                }
                IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge | IrOp::Eq | IrOp::Neq => {
                    // comparisons must fold into the guards that consume them
                    if !guard_only.get(&r).copied().unwrap_or(false) {
                        return None;
                    }
                    if self_ty(trace, node.a) != Ty::Integer || self_ty(trace, node.b) != Ty::Integer {
                        return None;
                    }
                    this.fused.insert(r, (node.op, node.a, node.b));
                }
                IrOp::Gtrue | IrOp::Gfalse => {
                    if !this.fused.contains_key(&node.a) {
                        return None;
                    }
                }
                IrOp::Gather => {
                    if node.ty != Ty::Integer || node.out_shape.concrete != 1 {
                        return None;
                    }
                    // require a dominating upper-bound guard on this index
                    let exit = this.dominating_bound(i, node.a, node.b)?;
                    this.gather_exit.insert(r, exit);
                    this.alloc_reg(r)?;
                }
                _ => return None,
            }
        }

        // every exit store must be a scalar integer register value
        for exit in &trace.exits {
            for (_, value) in &exit.stores {
                if !this.regs.contains_key(value) || this.trace.nodes[value.index()].out_shape.concrete != 1 {
                    return None;
                }
            }
        }
        Some(this)
    }

    fn slot(&mut self) -> usize {
        let s = self.state_len;
        self.state_len += 1;
        s
    }

    fn alloc_reg(&mut self, r: IrRef) -> Option<Reg> {
        let reg = *POOL.get(self.next_reg)?;
        self.next_reg += 1;
        self.regs.insert(r, reg);
        Some(reg)
    }

    /// Finds an earlier `Gtrue(Lt(idx, Length(base)))` guard covering a
    /// gather, returning its exit index.
    fn dominating_bound(&self, at: usize, base: IrRef, idx: IrRef) -> Option<usize> {
        for node in self.trace.nodes[..at].iter() {
            if node.op != IrOp::Gtrue {
                continue;
            }
            let Some(&(cmp_op, cmp_a, cmp_b)) = self.fused.get(&node.a) else {
                continue;
            };
            if cmp_op == IrOp::Lt
                && cmp_a == idx
                && self.trace.nodes[cmp_b.index()].op == IrOp::Length
                && self.trace.nodes[cmp_b.index()].a == base
            {
                return Some(node.exit as usize);
            }
        }
        None
    }

    fn reg(&self, r: IrRef) -> Reg {
        self.regs[&r]
    }

    #[expect(clippy::too_many_lines, reason = "straight-line emission per opcode")]
    fn emit(mut self) -> Option<MachineTrace> {
        let trace = self.trace;
        let mut asm = Assembler::new();
        let mut exit_stubs: AHashMap<usize, Label> = AHashMap::new();
        let mut stub_of = |asm: &mut Assembler, exit: usize| *exit_stubs.entry(exit).or_insert_with(|| asm.label());

        // prologue: callee-saved registers, the NA sentinel, inputs,
        // constants
        asm.push(Reg::Rbx);
        asm.push(Reg::R12);
        asm.push(Reg::R13);
        asm.push(Reg::R14);
        asm.push(Reg::R15);
        asm.mov_imm64(NA_REG, NA_INTEGER);
        for (i, node) in trace.nodes.iter().enumerate() {
            let r = IrRef(i as u32);
            match node.op {
                IrOp::Sload | IrOp::Load | IrOp::Length => {
                    // value or pointer sits in the state slot recorded in
                    // the entry plan
                    let slot = self.entry_slot(r)?;
                    asm.mov_rm(self.reg(r), STATE, i32::try_from(slot * 8).ok()?);
                }
                IrOp::Const => {
                    let Value::Integer(v) = &trace.consts[usize::try_from(node.imm).ok()?] else {
                        return None;
                    };
                    asm.mov_imm64(self.reg(r), v[0]);
                }
                _ => {}
            }
        }

        // body emission
        let mut loop_label: Option<Label> = None;
        let phis: Vec<(IrRef, IrRef)> = trace
            .nodes
            .iter()
            .filter(|n| n.op == IrOp::Phi)
            .map(|n| (n.a, n.b))
            .collect();
        for (i, node) in trace.nodes.iter().enumerate() {
            let r = IrRef(i as u32);
            match node.op {
                IrOp::Loop => {
                    let label = asm.label();
                    asm.bind(label);
                    loop_label = Some(label);
                }
                IrOp::Add | IrOp::Sub | IrOp::Mul => {
                    let (ra, rb, rd) = (self.reg(node.a), self.reg(node.b), self.reg(r));
                    let na = asm.label();
                    let done = asm.label();
                    asm.cmp_rr(ra, NA_REG);
                    asm.jcc(Cond::E, na);
                    asm.cmp_rr(rb, NA_REG);
                    asm.jcc(Cond::E, na);
                    asm.mov_rr(rd, ra);
                    match node.op {
                        IrOp::Add => asm.add_rr(rd, rb),
                        IrOp::Sub => asm.sub_rr(rd, rb),
                        _ => asm.imul_rr(rd, rb),
                    }
                    asm.jcc(Cond::No, done);
                    asm.bind(na);
                    asm.mov_rr(rd, NA_REG);
                    asm.bind(done);
                }
                IrOp::Gtrue | IrOp::Gfalse => {
                    let (cmp_op, a, b) = *self.fused.get(&node.a)?;
                    let stub = stub_of(&mut asm, node.exit as usize);
                    let (ra, rb) = (self.reg(a), self.reg(b));
                    // NA in either operand leaves the trace
                    asm.cmp_rr(ra, NA_REG);
                    asm.jcc(Cond::E, stub);
                    asm.cmp_rr(rb, NA_REG);
                    asm.jcc(Cond::E, stub);
                    asm.cmp_rr(ra, rb);
                    let cond = compare_cond(cmp_op);
                    let jump_when = if node.op == IrOp::Gtrue { cond.negate() } else { cond };
                    asm.jcc(jump_when, stub);
                }
                IrOp::Gather => {
                    let exit = *self.gather_exit.get(&r)?;
                    let stub = stub_of(&mut asm, exit);
                    let (rp, ri, rd) = (self.reg(node.a), self.reg(node.b), self.reg(r));
                    // lower bound; the dominating guard covered the upper
                    asm.test_rr(ri, ri);
                    asm.jcc(Cond::S, stub);
                    asm.mov_r_index8(rd, rp, ri, 0);
                }
                _ => {}
            }
        }

        // back-edge: parallel phi copies through the stack, then loop
        if let Some(label) = loop_label {
            for (_, b) in &phis {
                asm.push(self.reg(*b));
            }
            for (a, _) in phis.iter().rev() {
                asm.pop(self.reg(*a));
            }
            asm.jmp(label);
        } else {
            // linear trace: fall through to its trailing exit
            let exit_node = trace.nodes.iter().rev().find(|n| n.op == IrOp::Exit)?;
            let stub = stub_of(&mut asm, usize::try_from(exit_node.imm).ok()?);
            asm.jmp(stub);
        }

        // exit stubs: write live stores into state, return the exit index
        let mut exit_writes: Vec<Vec<(Variable, usize)>> = trace.exits.iter().map(|_| Vec::new()).collect();
        for (exit, label) in exit_stubs {
            asm.bind(label);
            let mut writes = Vec::new();
            for (var, value) in &trace.exits[exit].stores {
                let slot = self.slot();
                asm.mov_mr(STATE, i32::try_from(slot * 8).ok()?, self.reg(*value));
                writes.push((*var, slot));
            }
            exit_writes[exit] = writes;
            asm.mov_eax_imm32(u32::try_from(exit).ok()?);
            asm.pop(Reg::R15);
            asm.pop(Reg::R14);
            asm.pop(Reg::R13);
            asm.pop(Reg::R12);
            asm.pop(Reg::Rbx);
            asm.ret();
        }

        let bytes = asm.finish().ok()?;
        let code_len = bytes.len();
        let code = ExecBuffer::new(&bytes)?;
        Some(MachineTrace {
            code,
            code_len,
            state_len: self.state_len,
            entries: self.entries,
            exit_writes,
        })
    }

    /// The state slot assigned to a load-class node in the entry plan.
    fn entry_slot(&self, r: IrRef) -> Option<usize> {
        self.entries.iter().find_map(|e| match e {
            Entry::Scalar { slot, .. } | Entry::VecPtr { slot, .. } if self.entry_node(e) == Some(r) => Some(*slot),
            Entry::Length { of: _, slot } if self.length_node(e) == Some(r) => Some(*slot),
            _ => None,
        })
    }

    fn entry_node(&self, entry: &Entry) -> Option<IrRef> {
        match entry {
            Entry::VecPtr { node, .. } => Some(*node),
            Entry::Scalar { var, .. } => {
                // the load node tagged with this variable
                self.trace.nodes.iter().enumerate().find_map(|(i, n)| {
                    if matches!(n.op, IrOp::Sload | IrOp::Load) && n.var == Some(*var) {
                        Some(IrRef(i as u32))
                    } else {
                        None
                    }
                })
            }
            _ => None,
        }
    }

    fn length_node(&self, entry: &Entry) -> Option<IrRef> {
        let Entry::Length { of, .. } = entry else { return None };
        self.trace.nodes.iter().enumerate().find_map(|(i, n)| {
            if n.op == IrOp::Length && n.a == *of {
                Some(IrRef(i as u32))
            } else {
                None
            }
        })
    }
}

fn self_ty(trace: &Trace, r: IrRef) -> Ty {
    if r.is_none() { Ty::Nil } else { trace.nodes[r.index()].ty }
}

fn compare_cond(op: IrOp) -> Cond {
    match op {
        IrOp::Lt => Cond::L,
        IrOp::Le => Cond::Le,
        IrOp::Gt => Cond::G,
        IrOp::Ge => Cond::Ge,
        IrOp::Eq => Cond::E,
        _ => Cond::Ne,
    }
}

/// Runs a lowered trace: resolves the entry plan, calls the code, and
/// writes the taken exit's stores back. `None` falls back to the tile
/// interpreter (entry checks failed); `Some(exit)` means the exit was taken
/// and its state fully materialized.
pub(crate) fn run<Tr: JitTracer>(thread: &mut Thread<Tr>, machine: &MachineTrace) -> Option<usize> {
    let mut state = vec![0i64; machine.state_len];
    let mut env_map: AHashMap<IrRef, EnvId> = AHashMap::new();
    // values whose data pointers the code dereferences stay alive here
    let mut held: Vec<Value> = Vec::new();
    let mut vec_lens: AHashMap<IrRef, usize> = AHashMap::new();

    for entry in &machine.entries {
        match entry {
            Entry::Env { node, id } => {
                env_map.insert(*node, EnvId(*id));
            }
            Entry::Lenv { node, parent_of } => {
                let parent = thread.envs.get(*env_map.get(parent_of)?).lexical()?;
                env_map.insert(*node, parent);
            }
            Entry::Unbound { env, name } => {
                if thread.envs.get(*env_map.get(env)?).is_bound(*name) {
                    return None;
                }
            }
            Entry::Scalar { var, slot } => {
                let value = resolve_var(thread, &env_map, var)?;
                match value {
                    Value::Integer(v) if v.len() == 1 => state[*slot] = v[0],
                    _ => return None,
                }
            }
            Entry::VecPtr { var, node, slot } => {
                let value = resolve_var(thread, &env_map, var)?;
                let Value::Integer(v) = &value else { return None };
                state[*slot] = v.as_ptr() as i64;
                vec_lens.insert(*node, v.len());
                held.push(value);
            }
            Entry::Length { of, slot } => {
                let n = *vec_lens.get(of)?;
                state[*slot] = i64::try_from(n).ok()?;
            }
        }
    }

    // SAFETY: the lowering emitted a complete function that reads only the
    // state array and the vector data pointers resolved above, which `held`
    // keeps alive for the duration of the call.
    let exit = unsafe { machine.code.call(state.as_mut_ptr()) };
    let exit = usize::try_from(exit).ok()?;

    for (var, slot) in machine.exit_writes.get(exit)? {
        let value = Value::int(state[*slot]);
        match var {
            Variable::Register(r) => {
                let abs = thread.slot(*r);
                thread.registers[abs] = value;
            }
            Variable::Binding { env, name } => {
                let env_id = *env_map.get(env)?;
                thread.envs.get_mut(env_id).assign(*name, value);
            }
        }
    }
    drop(held);
    Some(exit)
}

fn resolve_var<Tr: JitTracer>(
    thread: &Thread<Tr>,
    env_map: &AHashMap<IrRef, EnvId>,
    var: &Variable,
) -> Option<Value> {
    match var {
        Variable::Register(r) => Some(thread.registers[thread.slot(*r)].clone()),
        Variable::Binding { env, name } => {
            let value = thread.envs.get(*env_map.get(env)?).get(*name);
            if matches!(value, Value::Promise(_) | Value::Default(_) | Value::Nil) {
                None
            } else {
                Some(value)
            }
        }
    }
}
