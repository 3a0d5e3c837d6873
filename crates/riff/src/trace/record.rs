//! The trace recorder.
//!
//! While a [`Recorder`] is active the interpreter runs in shadow mode: every
//! dispatched instruction is first presented to [`Recorder::step`], which
//! emits raw IR mirroring what the instruction is about to do, speculating
//! on the types and lengths it observes. Slot state is tracked in a cache
//! keyed by [`Variable`], so moves and assignments emit no arithmetic.
//!
//! Speculation rules:
//! * lengths at or below the specialization threshold are pinned by a
//!   `Glen` guard and treated as constants; longer lengths are tracked
//!   symbolically through a `Length` node;
//! * conditional branches emit `Gtrue`/`Gfalse` with a reenter at the
//!   not-taken PC;
//! * environment lookups that walk the lexical chain emit one `Lenv` step
//!   and one `Gunbound` guard per environment walked.
//!
//! Termination: a loop trace completes when the back-edge target is
//! re-reached; linear and side traces complete at the first non-recordable
//! opcode (with a final exit reentering the interpreter there); anything
//! unexpected aborts, discarding the buffer.

use std::rc::Rc;

use ahash::AHashMap;

use crate::{
    bytecode::{Instruction, Opcode, Operand, Prototype, decode},
    interp::{Thread, arith},
    intern::StringId,
    trace::{
        cache::CompiledTrace,
        ir::{EMPTY_SHAPE, IrNode, IrOp, IrRef, NONE, Reenter, Shape, TraceKind, Variable},
        opt, regalloc, schedule,
    },
    tracer::JitTracer,
    value::{EnvId, Ty, Value},
};

/// What the dispatch loop should do after a recording step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Keep recording; execute the instruction normally.
    Continue,
    /// The trace is complete; compile it (the instruction still executes
    /// normally this time).
    Complete,
    /// Recording failed; the buffer is discarded and interpretation
    /// continues.
    Abort,
}

/// The raw output of recording, input to the optimizer.
#[derive(Debug)]
pub(crate) struct RawTrace {
    pub kind: TraceKind,
    pub start_pc: usize,
    pub entry_env: EnvId,
    pub nodes: Vec<IrNode>,
    pub consts: Vec<Value>,
    pub reenters: Vec<Reenter>,
    /// Reenter of the trailing exit for linear and side traces.
    pub end_reenter: Option<Reenter>,
}

pub struct Recorder {
    kind: TraceKind,
    start_pc: usize,
    pub(crate) proto_id: usize,
    entry_env: EnvId,
    specialize_len_max: usize,
    max_nodes: usize,

    nodes: Vec<IrNode>,
    consts: Vec<Value>,
    reenters: Vec<Reenter>,
    end_reenter: Option<Reenter>,

    /// Slot cache: the IR value currently representing each live slot.
    slots: AHashMap<Variable, IrRef>,
    /// Name-keyed view of the slot cache (the current environment is fixed
    /// within a trace, so a name resolves to one Variable).
    names: AHashMap<StringId, IrRef>,
    /// Environment value nodes.
    env_nodes: AHashMap<EnvId, IrRef>,
    /// Scalar-constant dedup.
    const_scalars: AHashMap<(Ty, u64), IrRef>,
    steps: usize,
}

/// Starts recording a root trace at `start_pc`.
pub(crate) fn start<Tr: JitTracer>(thread: &mut Thread<Tr>, proto: &Rc<Prototype>, start_pc: usize, kind: TraceKind) {
    thread.tracer.on_trace_start(start_pc, kind);
    thread.recorder = Some(Recorder::new(thread, proto, start_pc, kind));
}

/// Starts recording a side trace at the reenter PC of a hot exit.
pub(crate) fn start_side<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    proto: &Rc<Prototype>,
    reenter_pc: usize,
    root_pc: usize,
    exit: usize,
) {
    let kind = TraceKind::Side { root_pc, exit };
    thread.tracer.on_trace_start(reenter_pc, kind);
    thread.recorder = Some(Recorder::new(thread, proto, reenter_pc, kind));
}

/// Optimizes, schedules, register-assigns, optionally lowers, and installs
/// a completed recording.
pub(crate) fn finish<Tr: JitTracer>(thread: &mut Thread<Tr>, rec: Recorder) {
    let proto_id = rec.proto_id;
    let raw = rec.into_raw();
    let kind = raw.kind;
    let mut trace = opt::optimize(raw);
    schedule::mark(&mut trace);
    regalloc::assign(&mut trace);
    let code = if thread.machine_backend() {
        crate::trace::codegen::lower(&trace)
    } else {
        None
    };
    if let Some(block) = &code {
        thread.tracer.on_code_emitted(trace.start_pc, block.len());
    }
    thread.tracer.on_trace_compiled(&trace);
    let start_pc = trace.start_pc;
    let compiled = CompiledTrace { trace, code };
    match kind {
        TraceKind::Side { root_pc, exit } => thread.cache.install_side((proto_id, root_pc), exit, compiled),
        _ => thread.cache.install_root((proto_id, start_pc), compiled),
    }
}

impl Recorder {
    fn new<Tr: JitTracer>(thread: &Thread<Tr>, proto: &Rc<Prototype>, start_pc: usize, kind: TraceKind) -> Self {
        Self {
            kind,
            start_pc,
            proto_id: proto.identity(),
            entry_env: thread.current_env(),
            specialize_len_max: thread.config().specialize_len_max,
            max_nodes: thread.config().max_trace_nodes,
            nodes: Vec::with_capacity(64),
            consts: Vec::new(),
            reenters: Vec::new(),
            end_reenter: None,
            slots: AHashMap::new(),
            names: AHashMap::new(),
            env_nodes: AHashMap::new(),
            const_scalars: AHashMap::new(),
            steps: 0,
        }
    }

    fn into_raw(self) -> RawTrace {
        RawTrace {
            kind: self.kind,
            start_pc: self.start_pc,
            entry_env: self.entry_env,
            nodes: self.nodes,
            consts: self.consts,
            reenters: self.reenters,
            end_reenter: self.end_reenter,
        }
    }

    /// Records one instruction. Called before the instruction executes.
    pub(crate) fn step<Tr: JitTracer>(
        &mut self,
        thread: &Thread<Tr>,
        proto: &Rc<Prototype>,
        pc: usize,
        inst: &Instruction,
    ) -> RecordOutcome {
        // a frame change (promise force, call) moves dispatch into another
        // prototype; the trace cannot follow
        if proto.identity() != self.proto_id {
            return RecordOutcome::Abort;
        }
        if self.steps > 0 {
            match self.kind {
                TraceKind::Loop if pc == self.start_pc => return RecordOutcome::Complete,
                TraceKind::Side { root_pc, .. } if pc == root_pc => {
                    self.end_reenter = Some(Reenter { pc: root_pc, in_scope: true });
                    return RecordOutcome::Complete;
                }
                TraceKind::Linear if pc == self.start_pc => {
                    // came back around; end the straight line at its start
                    self.end_reenter = Some(Reenter { pc, in_scope: true });
                    return RecordOutcome::Complete;
                }
                _ => {}
            }
        }
        if self.nodes.len() >= self.max_nodes {
            return self.end_or_abort(pc);
        }
        if !inst.op.recordable() {
            return self.end_or_abort(pc);
        }

        let outcome = self.record_inst(thread, pc, inst);
        self.steps += 1;
        match outcome {
            Some(()) => RecordOutcome::Continue,
            None => RecordOutcome::Abort,
        }
    }

    /// Linear and side traces end gracefully at a boundary once they carry
    /// any computation; loop traces abort.
    fn end_or_abort(&mut self, pc: usize) -> RecordOutcome {
        let has_payload = self.nodes.iter().any(|n| !n.op.is_memory_read() && n.op != IrOp::Const);
        if self.kind != TraceKind::Loop && has_payload {
            self.end_reenter = Some(Reenter { pc, in_scope: true });
            RecordOutcome::Complete
        } else {
            RecordOutcome::Abort
        }
    }

    // ---- emission helpers ----

    fn push(&mut self, node: IrNode) -> IrRef {
        let r = IrRef(u32::try_from(self.nodes.len()).expect("trace too long"));
        self.nodes.push(node);
        r
    }

    /// The canonical length-1 constant; its shape references itself.
    fn one(&mut self) -> IrRef {
        self.const_int(1)
    }

    fn const_int(&mut self, v: i64) -> IrRef {
        if let Some(&r) = self.const_scalars.get(&(Ty::Integer, v as u64)) {
            return r;
        }
        // the shared const(1) node provides every scalar's length and
        // references itself
        let one = if v == 1 { None } else { Some(self.one()) };
        let cidx = self.consts.len();
        self.consts.push(Value::int(v));
        let here = IrRef(u32::try_from(self.nodes.len()).expect("trace too long"));
        let shape = Shape::new(one.unwrap_or(here), 1);
        let node = IrNode::new(IrOp::Const, NONE, NONE, NONE, Ty::Integer, shape, shape)
            .with_imm(i64::try_from(cidx).expect("const index overflow"));
        let r = self.push(node);
        self.const_scalars.insert((Ty::Integer, v as u64), r);
        r
    }

    fn const_value(&mut self, value: &Value, ty: Ty) -> Option<IrRef> {
        // scalar fast path with dedup
        if value.len() == 1 {
            match (ty, value) {
                (Ty::Integer, Value::Integer(v)) => return Some(self.const_int(v[0])),
                (Ty::Double, Value::Double(v)) => {
                    let bits = v[0].to_bits();
                    if let Some(&r) = self.const_scalars.get(&(Ty::Double, bits)) {
                        return Some(r);
                    }
                    let cidx = self.consts.len();
                    self.consts.push(value.clone());
                    let one = self.one();
                    let shape = Shape::new(one, 1);
                    let node = IrNode::new(IrOp::Const, NONE, NONE, NONE, Ty::Double, shape, shape)
                        .with_imm(i64::try_from(cidx).ok()?);
                    let r = self.push(node);
                    self.const_scalars.insert((Ty::Double, bits), r);
                    return Some(r);
                }
                (Ty::Logical, Value::Logical(v)) => {
                    let bits = u64::from(v[0]);
                    if let Some(&r) = self.const_scalars.get(&(Ty::Logical, bits)) {
                        return Some(r);
                    }
                    let cidx = self.consts.len();
                    self.consts.push(value.clone());
                    let one = self.one();
                    let shape = Shape::new(one, 1);
                    let node = IrNode::new(IrOp::Const, NONE, NONE, NONE, Ty::Logical, shape, shape)
                        .with_imm(i64::try_from(cidx).ok()?);
                    let r = self.push(node);
                    self.const_scalars.insert((Ty::Logical, bits), r);
                    return Some(r);
                }
                _ => {}
            }
        }
        // vector constant: specialize its length
        let n = i64::try_from(value.len()).ok()?;
        let cidx = self.consts.len();
        self.consts.push(value.clone());
        let len_ref = self.const_int(n);
        let shape = Shape::new(len_ref, n);
        let node =
            IrNode::new(IrOp::Const, NONE, NONE, NONE, ty, shape, shape).with_imm(i64::try_from(cidx).ok()?);
        Some(self.push(node))
    }

    fn guard(&mut self, op: IrOp, a: IrRef, b: IrRef, imm: i64, reenter_pc: usize) -> IrRef {
        let exit = u32::try_from(self.reenters.len()).expect("too many guards");
        self.reenters.push(Reenter {
            pc: reenter_pc,
            in_scope: true,
        });
        let mut node = IrNode::new(op, a, b, NONE, Ty::Nil, EMPTY_SHAPE, EMPTY_SHAPE).with_imm(imm);
        node.exit = exit;
        self.push(node)
    }

    fn env_node(&mut self, env: EnvId) -> IrRef {
        if let Some(&r) = self.env_nodes.get(&env) {
            return r;
        }
        let node = IrNode::new(IrOp::Env, NONE, NONE, NONE, Ty::Environment, EMPTY_SHAPE, EMPTY_SHAPE)
            .with_imm(i64::from(env.0));
        let r = self.push(node);
        self.env_nodes.insert(env, r);
        r
    }

    /// Emits a load-style node and pins or symbolizes its length. The load's
    /// shape references its own length node, which follows it in the buffer;
    /// the optimizer resolves these forward shape references after replay.
    fn loaded(&mut self, op: IrOp, a: IrRef, var: Variable, value: &Value, pc: usize) -> Option<IrRef> {
        let ty = value.ty();
        if !ty.is_numeric_like() {
            return None;
        }
        let len = i64::try_from(value.len()).ok()?;
        let r = self.push(IrNode::new(op, a, NONE, NONE, ty, EMPTY_SHAPE, EMPTY_SHAPE).with_var(var));
        let shape = if len <= i64::try_from(self.specialize_len_max).unwrap_or(i64::MAX) {
            let len_ref = self.const_int(len);
            // scalars are revalidated when the executor resolves the load;
            // other specialized lengths need the run-time guard
            if len != 1 {
                self.guard(IrOp::Glen, r, NONE, len, pc);
            }
            Shape::new(len_ref, len)
        } else {
            let one = self.one();
            let scalar = Shape::new(one, 1);
            let len_ref = self.push(IrNode::new(IrOp::Length, r, NONE, NONE, Ty::Integer, scalar, scalar));
            Shape::new(len_ref, len)
        };
        self.nodes[r.index()].in_shape = shape;
        self.nodes[r.index()].out_shape = shape;
        Some(r)
    }

    /// Resolves a storage operand to an IR value, emitting loads and guards
    /// on first touch. Returns the IR ref and the observed run-time value.
    fn read_operand<Tr: JitTracer>(
        &mut self,
        thread: &Thread<Tr>,
        operand: i32,
        pc: usize,
    ) -> Option<(IrRef, Value)> {
        match decode(operand) {
            Operand::Register(r) => {
                let value = thread.registers[thread.slot(r)].clone();
                if value.is_object() || matches!(value, Value::Promise(_) | Value::Default(_) | Value::Nil) {
                    return None;
                }
                let var = Variable::Register(r);
                if let Some(&cached) = self.slots.get(&var) {
                    return Some((cached, value));
                }
                let node = self.loaded(IrOp::Sload, NONE, var, &value, pc)?;
                self.slots.insert(var, node);
                Some((node, value))
            }
            Operand::Name(name) => {
                if let Some(&cached) = self.names.get(&name) {
                    let value = thread.envs.get_recursive(thread.current_env(), name).1;
                    return Some((cached, value));
                }
                // walk the lexical chain, speculating that every walked
                // environment still lacks the binding
                let mut env = thread.current_env();
                loop {
                    let e = thread.envs.get(env);
                    if e.is_bound(name) {
                        break;
                    }
                    let env_ref = self.env_node(env);
                    let mut node = IrNode::new(
                        IrOp::Gunbound,
                        env_ref,
                        NONE,
                        NONE,
                        Ty::Nil,
                        EMPTY_SHAPE,
                        EMPTY_SHAPE,
                    )
                    .with_var(Variable::Binding { env: env_ref, name });
                    let exit = u32::try_from(self.reenters.len()).expect("too many guards");
                    self.reenters.push(Reenter { pc, in_scope: true });
                    node.exit = exit;
                    self.push(node);
                    let parent = e.lexical()?;
                    let parent_ref = self.push(IrNode::new(
                        IrOp::Lenv,
                        env_ref,
                        NONE,
                        NONE,
                        Ty::Environment,
                        EMPTY_SHAPE,
                        EMPTY_SHAPE,
                    ));
                    self.env_nodes.insert(parent, parent_ref);
                    env = parent;
                }
                let value = thread.envs.get(env).get(name);
                if value.is_object() || matches!(value, Value::Promise(_) | Value::Default(_) | Value::Nil) {
                    return None;
                }
                let env_ref = self.env_node(env);
                let var = Variable::Binding { env: env_ref, name };
                if let Some(&cached) = self.slots.get(&var) {
                    self.names.insert(name, cached);
                    return Some((cached, value));
                }
                let node = self.loaded(IrOp::Load, env_ref, var, &value, pc)?;
                self.slots.insert(var, node);
                self.names.insert(name, node);
                Some((node, value))
            }
        }
    }

    /// Updates the slot cache and emits the raw store for a write.
    fn write_operand<Tr: JitTracer>(&mut self, thread: &Thread<Tr>, operand: i32, value_ref: IrRef) {
        let var = match decode(operand) {
            Operand::Register(r) => Variable::Register(r),
            Operand::Name(name) => {
                let env_ref = self.env_node(thread.current_env());
                self.names.insert(name, value_ref);
                Variable::Binding { env: env_ref, name }
            }
        };
        self.slots.insert(var, value_ref);
        let node = IrNode::new(IrOp::Store, value_ref, NONE, NONE, Ty::Nil, EMPTY_SHAPE, EMPTY_SHAPE).with_var(var);
        self.push(node);
    }

    /// `MergeShapes`: unifies the shapes of two operands at an instruction.
    fn merge_shapes(&mut self, a: Shape, b: Shape, pc: usize) -> Shape {
        if a.concrete == 0 {
            return a;
        }
        if b.concrete == 0 {
            return b;
        }
        if a.len == b.len {
            if a.concrete == b.concrete {
                return a;
            }
            // same symbolic length, differing observations: adopt the
            // smaller and rewrite nodes that recorded the larger
            let small = a.concrete.min(b.concrete);
            let large = a.concrete.max(b.concrete);
            for node in &mut self.nodes {
                if node.in_shape.len == a.len && node.in_shape.concrete == large {
                    node.in_shape.concrete = small;
                }
                if node.out_shape.len == a.len && node.out_shape.concrete == large {
                    node.out_shape.concrete = small;
                }
            }
            return Shape::new(a.len, small);
        }
        // different trace lengths: guard that the shorter divides into the
        // longer's range, then take the longer
        let (short, long) = if a.concrete <= b.concrete { (a, b) } else { (b, a) };
        self.guard(IrOp::Grange, short.len, long.len, 0, pc);
        long
    }

    fn cast(&mut self, value: IrRef, to: Ty) -> IrRef {
        let from = self.nodes[value.index()].ty;
        if from == to {
            return value;
        }
        let shape = self.nodes[value.index()].out_shape;
        self.push(IrNode::new(IrOp::Cast, value, NONE, NONE, to, shape, shape))
    }

    /// Recycles `value` to `shape` when its own shape is shorter.
    fn recycle(&mut self, value: IrRef, shape: Shape) -> IrRef {
        let own = self.nodes[value.index()].out_shape;
        if own == shape {
            return value;
        }
        let ty = self.nodes[value.index()].ty;
        self.push(IrNode::new(IrOp::Rep, value, NONE, NONE, ty, own, shape))
    }

    // ---- per-opcode emission ----

    #[expect(clippy::too_many_lines, reason = "one arm per recordable opcode")]
    fn record_inst<Tr: JitTracer>(&mut self, thread: &Thread<Tr>, pc: usize, inst: &Instruction) -> Option<()> {
        match inst.op {
            Opcode::Jmp => Some(()),
            Opcode::Constant => {
                // the interpreter will load proto.constants[a]; mirror it
                let frame = thread.frames.last()?;
                let value = frame.proto.constants.get(inst.a as usize)?.clone();
                let ty = value.ty();
                if !ty.is_numeric_like() {
                    return None;
                }
                let r = self.const_value(&value, ty)?;
                self.write_operand(thread, inst.c, r);
                Some(())
            }
            Opcode::Mov | Opcode::FastMov => {
                let (r, _) = self.read_operand(thread, inst.a, pc)?;
                self.write_operand(thread, inst.c, r);
                Some(())
            }
            Opcode::Assign => {
                let (r, _) = self.read_operand(thread, inst.a, pc)?;
                self.write_operand(thread, inst.b, r);
                Some(())
            }
            Opcode::Jc => {
                let (cond, value) = self.read_operand(thread, inst.a, pc)?;
                if value.len() != 1 || value.ty() != Ty::Logical {
                    return None;
                }
                let taken = value.as_condition().ok()?;
                let (guard_op, not_taken) = if taken {
                    (IrOp::Gtrue, inst.c)
                } else {
                    (IrOp::Gfalse, inst.b)
                };
                self.guard(guard_op, cond, NONE, 0, jump_target(pc, not_taken));
                Some(())
            }
            Opcode::ForEnd => {
                // add-1 on the counter, a bound guard, and the next element
                let counter_reg = match decode(inst.b) {
                    Operand::Register(r) => r + 1,
                    Operand::Name(_) => return None,
                };
                let (seq, _seq_val) = self.read_operand(thread, inst.b, pc)?;
                let counter_operand = crate::bytecode::reg(counter_reg);
                let (counter, _) = self.read_operand(thread, counter_operand, pc)?;
                let one = self.one();
                let scalar = self.nodes[one.index()].out_shape;
                let next = self.push(IrNode::new(IrOp::Add, counter, one, NONE, Ty::Integer, scalar, scalar));
                let len_ref = self.nodes[seq.index()].out_shape.len;
                let cond = self.push(IrNode::new(IrOp::Lt, next, len_ref, NONE, Ty::Logical, scalar, scalar));
                self.guard(IrOp::Gtrue, cond, NONE, 0, pc + 1);
                self.write_operand(thread, counter_operand, next);
                let elem = self.push(IrNode::new(
                    IrOp::Gather,
                    seq,
                    next,
                    NONE,
                    self.nodes[seq.index()].ty,
                    scalar,
                    scalar,
                ));
                self.write_operand(thread, inst.a, elem);
                Some(())
            }
            op if op.is_binary_arith() => {
                let (ar, av) = self.read_operand(thread, inst.a, pc)?;
                let (br, bv) = self.read_operand(thread, inst.b, pc)?;
                let result_ty = arith::binary_result_ty(op, av.ty(), bv.ty()).ok()?;
                let kernel_ty = arith::binary_operand_ty(op, av.ty(), bv.ty());
                if !kernel_ty.is_numeric_like() || !result_ty.is_numeric_like() {
                    return None;
                }
                let a_shape = self.nodes[ar.index()].out_shape;
                let b_shape = self.nodes[br.index()].out_shape;
                let shape = self.merge_shapes(a_shape, b_shape, pc);
                let ac = self.cast(ar, kernel_ty);
                let bc = self.cast(br, kernel_ty);
                let af = self.recycle(ac, shape);
                let bf = self.recycle(bc, shape);
                let node = self.push(IrNode::new(ir_binary_op(op), af, bf, NONE, result_ty, shape, shape));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            op if op.is_unary_arith() => {
                let (ar, av) = self.read_operand(thread, inst.a, pc)?;
                let (kernel_ty, result_ty) = unary_typing(op, av.ty())?;
                let shape = self.nodes[ar.index()].out_shape;
                let ac = self.cast(ar, kernel_ty);
                let node = self.push(IrNode::new(ir_unary_op(op), ac, NONE, NONE, result_ty, shape, shape));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            op if op.is_fold() => {
                let (ar, av) = self.read_operand(thread, inst.a, pc)?;
                let (kernel_ty, result_ty) = fold_typing(op, av.ty())?;
                let in_shape = self.nodes[ar.index()].out_shape;
                let one = self.one();
                let scalar = Shape::new(one, 1);
                let ac = self.cast(ar, kernel_ty);
                let node = self.push(IrNode::new(ir_fold_op(op), ac, NONE, NONE, result_ty, in_shape, scalar));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            Opcode::IfElse => {
                let (cr, cv) = self.read_operand(thread, inst.a, pc)?;
                let (yr, yv) = self.read_operand(thread, inst.b, pc)?;
                let (nr, nv) = self.read_operand(thread, inst.c, pc)?;
                let ty = yv.ty().unify(nv.ty());
                if !ty.is_numeric_like() || cv.ty() != Ty::Logical {
                    return None;
                }
                let c_shape = self.nodes[cr.index()].out_shape;
                let y_shape = self.nodes[yr.index()].out_shape;
                let n_shape = self.nodes[nr.index()].out_shape;
                let shape = self.merge_shapes(c_shape, y_shape, pc);
                let shape = self.merge_shapes(shape, n_shape, pc);
                let yc = self.cast(yr, ty);
                let nc = self.cast(nr, ty);
                let yf = self.recycle(yc, shape);
                let nf = self.recycle(nc, shape);
                let cf = self.recycle(cr, shape);
                let node = self.push(IrNode::new(IrOp::Blend, cf, yf, nf, ty, shape, shape));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            Opcode::Subset => {
                let (xr, xv) = self.read_operand(thread, inst.a, pc)?;
                let (ir, iv) = self.read_operand(thread, inst.b, pc)?;
                if xv.is_object() || iv.ty() != Ty::Integer {
                    return None;
                }
                // the language is 1-indexed; gather takes 0-based indices
                let one = self.one();
                let i_shape = self.nodes[ir.index()].out_shape;
                let idx0 = self.push(IrNode::new(IrOp::Sub, ir, one, NONE, Ty::Integer, i_shape, i_shape));
                let node = self.push(IrNode::new(
                    IrOp::Gather,
                    xr,
                    idx0,
                    NONE,
                    self.nodes[xr.index()].ty,
                    i_shape,
                    i_shape,
                ));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            Opcode::IAssign => {
                let (vr, vv) = self.read_operand(thread, inst.a, pc)?;
                let (ir, iv) = self.read_operand(thread, inst.b, pc)?;
                let (xr, xv) = self.read_operand(thread, inst.c, pc)?;
                if xv.is_object() || iv.len() != 1 || iv.ty() != Ty::Integer || vv.len() != 1 {
                    return None;
                }
                if vv.ty() > xv.ty() {
                    // promotion path stays in the interpreter
                    return None;
                }
                let one = self.one();
                let scalar = self.nodes[one.index()].out_shape;
                // bounds guards: 1 <= i <= length(x)
                let len_ref = self.nodes[xr.index()].out_shape.len;
                let lo = self.push(IrNode::new(IrOp::Ge, ir, one, NONE, Ty::Logical, scalar, scalar));
                self.guard(IrOp::Gtrue, lo, NONE, 0, pc);
                let hi = self.push(IrNode::new(IrOp::Le, ir, len_ref, NONE, Ty::Logical, scalar, scalar));
                self.guard(IrOp::Gtrue, hi, NONE, 0, pc);
                let idx0 = self.push(IrNode::new(IrOp::Sub, ir, one, NONE, Ty::Integer, scalar, scalar));
                let vc = self.cast(vr, xv.ty());
                let x_shape = self.nodes[xr.index()].out_shape;
                let node = self.push(IrNode::new(
                    IrOp::Scatter,
                    xr,
                    idx0,
                    vc,
                    xv.ty(),
                    x_shape,
                    x_shape,
                ));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            Opcode::Seq => {
                let (lr, lv) = self.read_operand(thread, inst.a, pc)?;
                let (sr, sv) = self.read_operand(thread, inst.b, pc)?;
                let n = lv.as_integer_scalar()?;
                let step = sv.as_integer_scalar().unwrap_or(1);
                // specialize by observed length and step
                let one = self.one();
                let scalar = self.nodes[one.index()].out_shape;
                let n_const = self.const_int(n);
                let eq_len = self.push(IrNode::new(IrOp::Eq, lr, n_const, NONE, Ty::Logical, scalar, scalar));
                self.guard(IrOp::Gtrue, eq_len, NONE, 0, pc);
                let step_const = self.const_int(step);
                let eq_step = self.push(IrNode::new(IrOp::Eq, sr, step_const, NONE, Ty::Logical, scalar, scalar));
                self.guard(IrOp::Gtrue, eq_step, NONE, 0, pc);
                let shape = Shape::new(n_const, n);
                let node = self
                    .push(IrNode::new(IrOp::Seqv, NONE, NONE, NONE, Ty::Integer, shape, shape).with_imm(step));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            Opcode::Rep => {
                let (xr, xv) = self.read_operand(thread, inst.a, pc)?;
                let (tr, tv) = self.read_operand(thread, inst.b, pc)?;
                let times = tv.as_integer_scalar()?;
                if times < 0 {
                    return None;
                }
                let one = self.one();
                let scalar = self.nodes[one.index()].out_shape;
                let t_const = self.const_int(times);
                let eq = self.push(IrNode::new(IrOp::Eq, tr, t_const, NONE, Ty::Logical, scalar, scalar));
                self.guard(IrOp::Gtrue, eq, NONE, 0, pc);
                let x_shape = self.nodes[xr.index()].out_shape;
                let out_concrete = x_shape.concrete * times;
                let out_len = self.push(IrNode::new(
                    IrOp::Mul,
                    x_shape.len,
                    t_const,
                    NONE,
                    Ty::Integer,
                    scalar,
                    scalar,
                ));
                let out_shape = Shape::new(out_len, out_concrete);
                let node = self.push(IrNode::new(
                    IrOp::Rep,
                    xr,
                    NONE,
                    NONE,
                    self.nodes[xr.index()].ty,
                    x_shape,
                    out_shape,
                ));
                self.write_operand(thread, inst.c, node);
                Some(())
            }
            Opcode::Length => {
                let (xr, _) = self.read_operand(thread, inst.a, pc)?;
                let len_ref = self.nodes[xr.index()].out_shape.len;
                self.write_operand(thread, inst.c, len_ref);
                Some(())
            }
            // everything else (attribute machinery, nested loops, colon,
            // strict extraction) bails out
            _ => None,
        }
    }
}

fn jump_target(pc: usize, delta: i32) -> usize {
    usize::try_from(pc as i64 + 1 + i64::from(delta)).expect("jump to negative PC")
}

fn ir_binary_op(op: Opcode) -> IrOp {
    match op {
        Opcode::Add => IrOp::Add,
        Opcode::Sub => IrOp::Sub,
        Opcode::Mul => IrOp::Mul,
        Opcode::Div => IrOp::Div,
        Opcode::Mod => IrOp::Mod,
        Opcode::Pow => IrOp::Pow,
        Opcode::Eq => IrOp::Eq,
        Opcode::Neq => IrOp::Neq,
        Opcode::Lt => IrOp::Lt,
        Opcode::Le => IrOp::Le,
        Opcode::Gt => IrOp::Gt,
        Opcode::Ge => IrOp::Ge,
        Opcode::And => IrOp::And,
        Opcode::Or => IrOp::Or,
        other => unreachable!("{other} is not binary"),
    }
}

fn ir_unary_op(op: Opcode) -> IrOp {
    match op {
        Opcode::Neg => IrOp::Neg,
        Opcode::Not => IrOp::Not,
        Opcode::IsNa => IrOp::IsNa,
        Opcode::IsFinite => IrOp::IsFinite,
        Opcode::Log => IrOp::Log,
        Opcode::Exp => IrOp::Exp,
        Opcode::Sqrt => IrOp::Sqrt,
        Opcode::Abs => IrOp::Abs,
        Opcode::Floor => IrOp::Floor,
        Opcode::Ceiling => IrOp::Ceiling,
        other => unreachable!("{other} is not unary"),
    }
}

fn ir_fold_op(op: Opcode) -> IrOp {
    match op {
        Opcode::Sum => IrOp::Sum,
        Opcode::Prod => IrOp::Prod,
        Opcode::Min => IrOp::Min,
        Opcode::Max => IrOp::Max,
        Opcode::Any => IrOp::Any,
        Opcode::All => IrOp::All,
        other => unreachable!("{other} is not a fold"),
    }
}

/// Kernel and result types for unary operations.
fn unary_typing(op: Opcode, operand: Ty) -> Option<(Ty, Ty)> {
    if !operand.is_numeric_like() {
        return None;
    }
    Some(match op {
        Opcode::Neg => {
            let t = if operand == Ty::Double { Ty::Double } else { Ty::Integer };
            (t, t)
        }
        Opcode::Not => (Ty::Logical, Ty::Logical),
        Opcode::IsNa | Opcode::IsFinite => (operand, Ty::Logical),
        Opcode::Log | Opcode::Exp | Opcode::Sqrt | Opcode::Floor | Opcode::Ceiling => (Ty::Double, Ty::Double),
        Opcode::Abs => {
            let t = if operand == Ty::Double { Ty::Double } else { Ty::Integer };
            (t, t)
        }
        _ => return None,
    })
}

/// Kernel and result types for folds.
fn fold_typing(op: Opcode, operand: Ty) -> Option<(Ty, Ty)> {
    if !operand.is_numeric_like() {
        return None;
    }
    Some(match op {
        Opcode::Sum => {
            if operand == Ty::Double {
                (Ty::Double, Ty::Double)
            } else {
                (Ty::Integer, Ty::Integer)
            }
        }
        Opcode::Prod => (Ty::Double, Ty::Double),
        Opcode::Max | Opcode::Min => {
            if operand == Ty::Double {
                (Ty::Double, Ty::Double)
            } else {
                (Ty::Integer, Ty::Integer)
            }
        }
        Opcode::Any | Opcode::All => (Ty::Logical, Ty::Logical),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bytecode::ProtoBuilder, config::JitConfig, interp::Thread};

    fn fresh_recorder() -> Recorder {
        let thread = Thread::new(JitConfig::default());
        let proto = ProtoBuilder::new().build();
        Recorder::new(&thread, &proto, 0, TraceKind::Linear)
    }

    #[test]
    fn shape_merge_is_commutative_up_to_guard_placement() {
        // two distinct trace lengths: the merge guards the shorter and
        // adopts the longer, regardless of operand order
        let mut fwd = fresh_recorder();
        let short_len = fwd.const_int(5);
        let long_len = fwd.const_int(9);
        let merged = fwd.merge_shapes(Shape::new(short_len, 5), Shape::new(long_len, 9), 0);
        assert_eq!(merged.len, long_len);
        assert_eq!(merged.concrete, 9);

        let mut rev = fresh_recorder();
        let short_len = rev.const_int(5);
        let long_len = rev.const_int(9);
        let merged = rev.merge_shapes(Shape::new(long_len, 9), Shape::new(short_len, 5), 0);
        assert_eq!(merged.len, long_len);
        assert_eq!(merged.concrete, 9);

        // both orders emitted the same range guard
        let grange = |r: &Recorder| {
            r.nodes
                .iter()
                .find(|n| n.op == IrOp::Grange)
                .map(|n| (n.a, n.b))
                .expect("merge emits a range guard")
        };
        assert_eq!(grange(&fwd), grange(&rev));
    }

    #[test]
    fn merging_equal_shapes_emits_no_guard() {
        let mut rec = fresh_recorder();
        let len = rec.const_int(4);
        let before = rec.nodes.len();
        let merged = rec.merge_shapes(Shape::new(len, 4), Shape::new(len, 4), 0);
        assert_eq!(merged.len, len);
        assert_eq!(rec.nodes.len(), before, "equal shapes merge without guards");
    }

    #[test]
    fn zero_length_operand_dominates_the_merge() {
        let mut rec = fresh_recorder();
        let zero = rec.const_int(0);
        let long = rec.const_int(9);
        let merged = rec.merge_shapes(Shape::new(zero, 0), Shape::new(long, 9), 0);
        assert_eq!(merged.concrete, 0, "empty operands produce empty results");
    }
}
