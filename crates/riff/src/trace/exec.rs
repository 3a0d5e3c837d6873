//! Trace execution.
//!
//! Two interchangeable backends implement one contract: take a scheduled
//! trace plus the live interpreter state, run to completion or to a guard
//! failure, and hand back a coherent state. The tile interpreter below is
//! the reference backend; machine code (when the lowering supported the
//! trace) runs first and falls back to tiles when its entry checks fail.
//!
//! The executor never mutates interpreter state mid-flight: stores are sunk
//! onto exits, so the only writes back into registers and environments
//! happen in [`Runner::materialize`] after a guard fires. A failed entry
//! check (type drift, recycled environment, promise where a value was
//! recorded) is a *bail*: the caller simply interprets instead.
//!
//! Loop traces execute the header once, then iterate the body; at each
//! back-edge every `phi`'s updated value is copied into its initial slot,
//! so body nodes reading header references always see the current
//! iteration's state.

use std::rc::Rc;

use crate::{
    error::RunResult,
    interp::Thread,
    trace::{
        cache::{CompiledTrace, TraceKey},
        ir::{ExitRecord, IrNode, IrOp, IrRef, NO_REG, Trace, TraceKind, Variable},
    },
    tracer::JitTracer,
    value::{EnvId, NA_INTEGER, NA_LOGICAL, Ty, Value, double_is_na, integer_to_double, logical_to_double,
        logical_to_integer, na_real},
};

/// Lanes per tile.
pub const TILE: usize = 16;

/// Where the interpreter resumes, plus a side-trace candidate if the taken
/// exit just became hot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExitOutcome {
    pub pc: usize,
    /// `(exit index, reenter pc)` of a newly hot exit.
    pub hot_exit: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    Exit(usize),
    Bail,
}

/// Per-node value storage during execution.
#[derive(Debug, Clone, Default)]
enum Slot {
    #[default]
    None,
    Null,
    Lgl(u8),
    Int(i64),
    Dbl(f64),
    VLgl(Rc<Vec<u8>>),
    VInt(Rc<Vec<i64>>),
    VDbl(Rc<Vec<f64>>),
    Env(EnvId),
}

impl Slot {
    fn len(&self) -> usize {
        match self {
            Self::None | Self::Null => 0,
            Self::VLgl(v) => v.len(),
            Self::VInt(v) => v.len(),
            Self::VDbl(v) => v.len(),
            _ => 1,
        }
    }

    fn as_int_scalar(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::VInt(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

/// Runs a compiled trace (and any side traces its exits chain into).
/// `Ok(None)` is a bail before any state was touched: the caller should
/// fall back to interpretation.
pub(crate) fn run_trace<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    key: TraceKey,
    compiled: &Rc<CompiledTrace>,
) -> RunResult<Option<ExitOutcome>> {
    let mut current = compiled.clone();
    let mut is_root = true;
    let mut hot: Option<(usize, usize)> = None;
    loop {
        if thread.current_env() != current.trace.entry_env {
            return Ok(if is_root {
                None
            } else {
                Some(ExitOutcome {
                    pc: current.trace.start_pc,
                    hot_exit: hot,
                })
            });
        }

        // machine code first (it materializes its own exits); its entry
        // checks fall back to the tile interpreter
        let machine_exit = current
            .code
            .as_ref()
            .and_then(|code| crate::trace::codegen::run(thread, code));
        let step = match machine_exit {
            Some(exit) => Step::Exit(exit),
            None => {
                let mut runner = Runner::new(thread, &current.trace);
                let step = runner.run();
                if let Step::Exit(idx) = step {
                    runner.materialize(idx);
                }
                step
            }
        };

        match step {
            Step::Done => unreachable!("traces end in a guard or exit"),
            Step::Bail => {
                return Ok(if is_root {
                    None
                } else {
                    Some(ExitOutcome {
                        pc: current.trace.start_pc,
                        hot_exit: hot,
                    })
                });
            }
            Step::Exit(idx) => {
                let reenter_pc = current.trace.exits[idx].reenter.pc;
                thread.tracer.on_side_exit(current.trace.start_pc, idx, reenter_pc);
                if is_root && !matches!(current.trace.kind, TraceKind::Side { .. }) {
                    let hits = thread.cache.bump_exit(key, idx);
                    if hits > thread.config.exit_hot_threshold {
                        hot = Some((idx, reenter_pc));
                    }
                    if let Some(side) = thread.cache.side(key, idx) {
                        current = side;
                        is_root = false;
                        continue;
                    }
                }
                return Ok(Some(ExitOutcome {
                    pc: reenter_pc,
                    hot_exit: hot,
                }));
            }
        }
    }
}

/// Fold accumulator state, persisted across tiles.
#[derive(Debug, Clone, Copy)]
struct FoldAcc {
    i: i64,
    d: f64,
    l: u8,
    na: bool,
    count: usize,
}

/// Copied operand lanes for one tile step. Copying decouples reads from the
/// register file before the result lanes are written, so in-place register
/// reuse is safe.
#[derive(Debug, Clone, Copy)]
enum Lanes {
    I([i64; TILE]),
    D([f64; TILE]),
    L([u8; TILE]),
}

/// One register: a tile of each element width.
#[derive(Debug, Clone, Copy)]
struct TileReg {
    i: [i64; TILE],
    d: [f64; TILE],
    l: [u8; TILE],
}

impl Default for TileReg {
    fn default() -> Self {
        Self {
            i: [0; TILE],
            d: [0.0; TILE],
            l: [0; TILE],
        }
    }
}

struct Runner<'a, Tr: JitTracer> {
    thread: &'a mut Thread<Tr>,
    trace: &'a Trace,
    vals: Vec<Slot>,
    /// Nodes whose value is consumed outside their fusion group.
    escapes: Vec<bool>,
    regs: Vec<TileReg>,
    phis: Vec<(IrRef, IrRef)>,
}

impl<'a, Tr: JitTracer> Runner<'a, Tr> {
    fn new(thread: &'a mut Thread<Tr>, trace: &'a Trace) -> Self {
        let escapes = compute_escapes(trace);
        let phis = trace
            .nodes
            .iter()
            .filter(|n| n.op == IrOp::Phi)
            .map(|n| (n.a, n.b))
            .collect();
        Self {
            thread,
            trace,
            vals: vec![Slot::None; trace.nodes.len()],
            escapes,
            regs: vec![TileReg::default(); usize::from(crate::trace::regalloc::NUM_REGS)],
            phis,
        }
    }

    fn run(&mut self) -> Step {
        let end = self.trace.nodes.len();
        match self.trace.loop_marker {
            None => {
                let step = self.exec_range(0, end);
                match step {
                    Step::Done => Step::Bail,
                    other => other,
                }
            }
            Some(marker) => {
                match self.exec_range(0, marker) {
                    Step::Done => {}
                    other => return other,
                }
                loop {
                    match self.exec_range(marker + 1, end) {
                        Step::Done => self.apply_phis(),
                        other => return other,
                    }
                }
            }
        }
    }

    fn exec_range(&mut self, from: usize, to: usize) -> Step {
        let mut i = from;
        while i < to {
            let node = &self.trace.nodes[i];
            if node.op.is_administrative() {
                match self.exec_direct(i) {
                    Step::Done => i += 1,
                    other => return other,
                }
            } else {
                let mut j = i + 1;
                while j < to
                    && !self.trace.nodes[j].boundary
                    && !self.trace.nodes[j].op.is_administrative()
                {
                    j += 1;
                }
                match self.exec_group(i, j) {
                    Step::Done => i = j,
                    other => return other,
                }
            }
        }
        Step::Done
    }

    /// At the back-edge, each phi's updated value becomes its initial
    /// slot's value for the next iteration. The copies are parallel: all
    /// updated values are read before any initial slot is written.
    fn apply_phis(&mut self) {
        let snapshot: Vec<Slot> = self.phis.iter().map(|(_, b)| self.vals[b.index()].clone()).collect();
        for ((a, _), value) in self.phis.clone().into_iter().zip(snapshot) {
            self.vals[a.index()] = value;
        }
    }

    // ---- administrative nodes ----

    fn exec_direct(&mut self, i: usize) -> Step {
        let node = &self.trace.nodes[i];
        let result = match node.op {
            IrOp::Nop | IrOp::Store | IrOp::Loop | IrOp::Phi => Slot::None,
            IrOp::Const => value_to_slot(&self.trace.consts[node.imm as usize]),
            IrOp::Env => Slot::Env(EnvId(node.imm as u32)),
            IrOp::Lenv => {
                let Slot::Env(env) = self.vals[node.a.index()] else {
                    return Step::Bail;
                };
                match self.thread.envs.get(env).lexical() {
                    Some(parent) => Slot::Env(parent),
                    None => return Step::Bail,
                }
            }
            IrOp::Sload => {
                let Variable::Register(r) = node.var.expect("sload without variable") else {
                    return Step::Bail;
                };
                let value = self.thread.registers[self.thread.slot(r)].clone();
                // scalar-shaped loads carry no length guard; recheck here
                if node.out_shape.concrete == 1 && value.len() != 1 {
                    return Step::Bail;
                }
                match typed_slot(&value, node.ty) {
                    Some(slot) => slot,
                    None => return Step::Bail,
                }
            }
            IrOp::Load => {
                let Some(Variable::Binding { env, name }) = node.var else {
                    return Step::Bail;
                };
                let Slot::Env(env_id) = self.vals[env.index()] else {
                    return Step::Bail;
                };
                let value = self.thread.envs.get(env_id).get(name);
                if node.out_shape.concrete == 1 && value.len() != 1 {
                    return Step::Bail;
                }
                match typed_slot(&value, node.ty) {
                    Some(slot) => slot,
                    None => return Step::Bail,
                }
            }
            IrOp::Length => {
                let n = self.vals[node.a.index()].len();
                Slot::Int(i64::try_from(n).expect("length overflow"))
            }
            IrOp::Scatter => {
                // copy-on-write single-element store; bounds were guarded
                let idx = match self.vals[node.b.index()].as_int_scalar() {
                    Some(i) => i,
                    None => return Step::Bail,
                };
                match self.scatter(node, usize::try_from(idx).unwrap_or(usize::MAX)) {
                    Some(slot) => slot,
                    None => return Step::Bail,
                }
            }
            IrOp::Exit => return Step::Exit(node.imm as usize),

            // guards
            IrOp::Glen => {
                let n = self.vals[node.a.index()].len();
                if i64::try_from(n).unwrap_or(-1) == node.imm {
                    Slot::None
                } else {
                    return Step::Exit(node.exit as usize);
                }
            }
            IrOp::Grange => {
                let short = self.vals[node.a.index()].as_int_scalar();
                let long = self.vals[node.b.index()].as_int_scalar();
                match (short, long) {
                    (Some(s), Some(l)) if s > 0 && s <= l => Slot::None,
                    _ => return Step::Exit(node.exit as usize),
                }
            }
            IrOp::Gtrue | IrOp::Gfalse => {
                let pass = match &self.vals[node.a.index()] {
                    Slot::Lgl(b) if *b != NA_LOGICAL => {
                        let truth = *b == 1;
                        if node.op == IrOp::Gtrue { truth } else { !truth }
                    }
                    // NA conditions leave the trace; the interpreter raises
                    _ => false,
                };
                if pass {
                    Slot::None
                } else {
                    return Step::Exit(node.exit as usize);
                }
            }
            IrOp::Gunbound => {
                let Some(Variable::Binding { env, name }) = node.var else {
                    return Step::Bail;
                };
                let Slot::Env(env_id) = self.vals[env.index()] else {
                    return Step::Bail;
                };
                if self.thread.envs.get(env_id).is_bound(name) {
                    return Step::Exit(node.exit as usize);
                }
                Slot::None
            }
            IrOp::Gclass => return Step::Bail,
            other => unreachable!("{other} is not administrative"),
        };
        self.vals[i] = result;
        Step::Done
    }

    fn scatter(&self, node: &IrNode, at: usize) -> Option<Slot> {
        match (&self.vals[node.a.index()], &self.vals[node.c.index()]) {
            (Slot::VInt(base), value) => {
                let mut out = (**base).clone();
                *out.get_mut(at)? = value.as_int_scalar()?;
                Some(Slot::VInt(Rc::new(out)))
            }
            (Slot::VDbl(base), value) => {
                let mut out = (**base).clone();
                let v = match value {
                    Slot::Dbl(d) => *d,
                    Slot::Int(i) => integer_to_double(*i),
                    _ => return None,
                };
                *out.get_mut(at)? = v;
                Some(Slot::VDbl(Rc::new(out)))
            }
            (Slot::VLgl(base), Slot::Lgl(v)) => {
                let mut out = (**base).clone();
                *out.get_mut(at)? = *v;
                Some(Slot::VLgl(Rc::new(out)))
            }
            _ => None,
        }
    }

    // ---- fusion groups ----

    fn group_len(&self, start: usize) -> Option<usize> {
        let node = &self.trace.nodes[start];
        let shape = if node.op.is_fold() { node.in_shape } else { node.out_shape };
        if shape.len.is_none() {
            return Some(1);
        }
        let n = self.vals[shape.len.index()].as_int_scalar()?;
        usize::try_from(n).ok()
    }

    fn exec_group(&mut self, start: usize, end: usize) -> Step {
        let Some(total) = self.group_len(start) else {
            return Step::Bail;
        };
        for i in start..end {
            if self.trace.nodes[i].reg == NO_REG {
                return Step::Bail;
            }
        }

        // output buffers for escaping nodes, fold accumulators
        let mut buffers: Vec<Option<VecBuf>> = vec![None; end - start];
        let mut folds: Vec<Option<FoldAcc>> = vec![None; end - start];
        for (k, i) in (start..end).enumerate() {
            let node = &self.trace.nodes[i];
            if node.op.is_fold() {
                folds[k] = Some(fold_identity(node.op, node.ty));
            } else if self.escapes[i] && total != 1 {
                buffers[k] = Some(VecBuf::new(node.ty, total));
            }
        }

        let mut base = 0;
        while base < total {
            let lanes = TILE.min(total - base);
            for (k, i) in (start..end).enumerate() {
                let node = self.trace.nodes[i].clone();
                if let Some(acc) = folds[k].as_mut() {
                    let op_lanes = match self.operand_lanes(node.a, start, end, base, lanes) {
                        Some(l) => l,
                        None => return Step::Bail,
                    };
                    accumulate(node.op, acc, &op_lanes, lanes);
                    continue;
                }
                if self.compute_lanes(&node, start, end, base, lanes).is_none() {
                    return Step::Bail;
                }
                if let Some(buf) = buffers[k].as_mut() {
                    buf.append(&self.regs[usize::from(node.reg)], lanes);
                }
            }
            base += lanes;
        }

        // land results in slots
        for (k, i) in (start..end).enumerate() {
            let node = &self.trace.nodes[i];
            if let Some(acc) = folds[k].take() {
                self.vals[i] = fold_result(node.op, node.ty, acc);
            } else if let Some(buf) = buffers[k].take() {
                self.vals[i] = buf.into_slot();
            } else if self.escapes[i] {
                // scalar (or zero-length) escape straight from lane 0
                self.vals[i] = if total == 0 {
                    empty_slot(node.ty)
                } else {
                    lane_slot(&self.regs[usize::from(node.reg)], node.ty)
                };
            }
        }
        Step::Done
    }

    /// Copies one operand's lanes for the current tile.
    fn operand_lanes(&self, operand: IrRef, start: usize, end: usize, base: usize, lanes: usize) -> Option<Lanes> {
        if operand.is_none() {
            return None;
        }
        let oi = operand.index();
        let ty = self.trace.nodes[oi].ty;
        if oi >= start && oi < end && !self.trace.nodes[oi].op.is_administrative() {
            // group-local: read the operand's tile register
            let reg = &self.regs[usize::from(self.trace.nodes[oi].reg)];
            return Some(match ty {
                Ty::Logical => Lanes::L(reg.l),
                Ty::Integer => Lanes::I(reg.i),
                _ => Lanes::D(reg.d),
            });
        }
        // cross-group: broadcast a scalar or window the buffer
        Some(match &self.vals[oi] {
            Slot::Lgl(b) => Lanes::L([*b; TILE]),
            Slot::Int(x) => Lanes::I([*x; TILE]),
            Slot::Dbl(x) => Lanes::D([*x; TILE]),
            Slot::VLgl(v) => {
                let mut out = [0u8; TILE];
                window(&mut out, v, base, lanes)?;
                Lanes::L(out)
            }
            Slot::VInt(v) => {
                let mut out = [0i64; TILE];
                window(&mut out, v, base, lanes)?;
                Lanes::I(out)
            }
            Slot::VDbl(v) => {
                let mut out = [0f64; TILE];
                window(&mut out, v, base, lanes)?;
                Lanes::D(out)
            }
            _ => return None,
        })
    }

    #[expect(clippy::too_many_lines, reason = "one kernel per op and element type")]
    fn compute_lanes(&mut self, node: &IrNode, start: usize, end: usize, base: usize, lanes: usize) -> Option<()> {
        use crate::interp::arith::{dcmp, dmod, iadd, icmp, imod, imul, isub, land, lor};
        let reg = usize::from(node.reg);
        match node.op {
            IrOp::Seqv => {
                let step = node.imm;
                for l in 0..lanes {
                    self.regs[reg].i[l] = 1 + (base + l) as i64 * step;
                }
                Some(())
            }
            IrOp::Rep => {
                // cycle the operand vector across the output
                match &self.vals[node.a.index()] {
                    Slot::VInt(v) => {
                        for l in 0..lanes {
                            self.regs[reg].i[l] = v[(base + l) % v.len()];
                        }
                    }
                    Slot::VDbl(v) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = v[(base + l) % v.len()];
                        }
                    }
                    Slot::VLgl(v) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = v[(base + l) % v.len()];
                        }
                    }
                    Slot::Int(x) => self.regs[reg].i[..lanes].fill(*x),
                    Slot::Dbl(x) => self.regs[reg].d[..lanes].fill(*x),
                    Slot::Lgl(x) => self.regs[reg].l[..lanes].fill(*x),
                    _ => return None,
                }
                Some(())
            }
            IrOp::Gather => {
                // base vector indexed by 0-based lanes; out of range is NA
                let idx = self.operand_lanes(node.b, start, end, base, lanes)?;
                let Lanes::I(idx) = idx else { return None };
                match &self.vals[node.a.index()] {
                    Slot::VInt(v) => {
                        for l in 0..lanes {
                            self.regs[reg].i[l] =
                                usize::try_from(idx[l]).ok().and_then(|i| v.get(i).copied()).unwrap_or(NA_INTEGER);
                        }
                    }
                    Slot::VDbl(v) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] =
                                usize::try_from(idx[l]).ok().and_then(|i| v.get(i).copied()).unwrap_or_else(na_real);
                        }
                    }
                    Slot::VLgl(v) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] =
                                usize::try_from(idx[l]).ok().and_then(|i| v.get(i).copied()).unwrap_or(NA_LOGICAL);
                        }
                    }
                    // a scalar base behaves as a one-element vector
                    Slot::Int(x) => {
                        for l in 0..lanes {
                            self.regs[reg].i[l] = if idx[l] == 0 { *x } else { NA_INTEGER };
                        }
                    }
                    Slot::Dbl(x) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = if idx[l] == 0 { *x } else { na_real() };
                        }
                    }
                    _ => return None,
                }
                Some(())
            }
            IrOp::Cast => {
                let src = self.operand_lanes(node.a, start, end, base, lanes)?;
                match (src, node.ty) {
                    (Lanes::L(v), Ty::Integer) => {
                        for l in 0..lanes {
                            self.regs[reg].i[l] = logical_to_integer(v[l]);
                        }
                    }
                    (Lanes::L(v), Ty::Double) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = logical_to_double(v[l]);
                        }
                    }
                    (Lanes::I(v), Ty::Double) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = integer_to_double(v[l]);
                        }
                    }
                    (Lanes::I(v), Ty::Integer) => self.regs[reg].i[..lanes].copy_from_slice(&v[..lanes]),
                    (Lanes::D(v), Ty::Double) => self.regs[reg].d[..lanes].copy_from_slice(&v[..lanes]),
                    _ => return None,
                }
                Some(())
            }
            IrOp::Blend => {
                let mask = self.operand_lanes(node.a, start, end, base, lanes)?;
                let yes = self.operand_lanes(node.b, start, end, base, lanes)?;
                let no = self.operand_lanes(node.c, start, end, base, lanes)?;
                let Lanes::L(mask) = mask else { return None };
                match (yes, no, node.ty) {
                    (Lanes::I(y), Lanes::I(n), Ty::Integer) => {
                        for l in 0..lanes {
                            self.regs[reg].i[l] = match mask[l] {
                                1 => y[l],
                                0 => n[l],
                                _ => NA_INTEGER,
                            };
                        }
                    }
                    (Lanes::D(y), Lanes::D(n), Ty::Double) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = match mask[l] {
                                1 => y[l],
                                0 => n[l],
                                _ => na_real(),
                            };
                        }
                    }
                    (Lanes::L(y), Lanes::L(n), Ty::Logical) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = match mask[l] {
                                1 => y[l],
                                0 => n[l],
                                _ => NA_LOGICAL,
                            };
                        }
                    }
                    _ => return None,
                }
                Some(())
            }
            op if matches!(
                op,
                IrOp::Neg
                    | IrOp::Not
                    | IrOp::IsNa
                    | IrOp::IsFinite
                    | IrOp::Log
                    | IrOp::Exp
                    | IrOp::Sqrt
                    | IrOp::Abs
                    | IrOp::Floor
                    | IrOp::Ceiling
            ) =>
            {
                let src = self.operand_lanes(node.a, start, end, base, lanes)?;
                match (op, src) {
                    (IrOp::Neg, Lanes::I(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].i[l] = if v[l] == NA_INTEGER { NA_INTEGER } else { -v[l] };
                        }
                    }
                    (IrOp::Neg, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = -v[l];
                        }
                    }
                    (IrOp::Not, Lanes::L(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = if v[l] == NA_LOGICAL { NA_LOGICAL } else { 1 - v[l] };
                        }
                    }
                    (IrOp::IsNa, Lanes::I(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = u8::from(v[l] == NA_INTEGER);
                        }
                    }
                    (IrOp::IsNa, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = u8::from(double_is_na(v[l]));
                        }
                    }
                    (IrOp::IsNa, Lanes::L(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = u8::from(v[l] == NA_LOGICAL);
                        }
                    }
                    (IrOp::IsFinite, Lanes::I(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = u8::from(v[l] != NA_INTEGER);
                        }
                    }
                    (IrOp::IsFinite, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].l[l] = u8::from(v[l].is_finite());
                        }
                    }
                    (IrOp::Log, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = v[l].ln();
                        }
                    }
                    (IrOp::Exp, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = v[l].exp();
                        }
                    }
                    (IrOp::Sqrt, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = v[l].sqrt();
                        }
                    }
                    (IrOp::Abs, Lanes::I(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].i[l] = if v[l] == NA_INTEGER { NA_INTEGER } else { v[l].abs() };
                        }
                    }
                    (IrOp::Abs, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = v[l].abs();
                        }
                    }
                    (IrOp::Floor, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = v[l].floor();
                        }
                    }
                    (IrOp::Ceiling, Lanes::D(v)) => {
                        for l in 0..lanes {
                            self.regs[reg].d[l] = v[l].ceil();
                        }
                    }
                    _ => return None,
                }
                Some(())
            }
            // binary elementwise
            op => {
                let a = self.operand_lanes(node.a, start, end, base, lanes)?;
                let b = self.operand_lanes(node.b, start, end, base, lanes)?;
                match (a, b) {
                    (Lanes::I(x), Lanes::I(y)) => {
                        for l in 0..lanes {
                            match op {
                                IrOp::Add => self.regs[reg].i[l] = iadd(x[l], y[l]),
                                IrOp::Sub => self.regs[reg].i[l] = isub(x[l], y[l]),
                                IrOp::Mul => self.regs[reg].i[l] = imul(x[l], y[l]),
                                IrOp::Mod => self.regs[reg].i[l] = imod(x[l], y[l]),
                                IrOp::Eq => self.regs[reg].l[l] = icmp(x[l], y[l], std::cmp::Ordering::is_eq),
                                IrOp::Neq => self.regs[reg].l[l] = icmp(x[l], y[l], std::cmp::Ordering::is_ne),
                                IrOp::Lt => self.regs[reg].l[l] = icmp(x[l], y[l], std::cmp::Ordering::is_lt),
                                IrOp::Le => self.regs[reg].l[l] = icmp(x[l], y[l], std::cmp::Ordering::is_le),
                                IrOp::Gt => self.regs[reg].l[l] = icmp(x[l], y[l], std::cmp::Ordering::is_gt),
                                IrOp::Ge => self.regs[reg].l[l] = icmp(x[l], y[l], std::cmp::Ordering::is_ge),
                                _ => return None,
                            }
                        }
                        Some(())
                    }
                    (Lanes::D(x), Lanes::D(y)) => {
                        for l in 0..lanes {
                            match op {
                                IrOp::Add => self.regs[reg].d[l] = x[l] + y[l],
                                IrOp::Sub => self.regs[reg].d[l] = x[l] - y[l],
                                IrOp::Mul => self.regs[reg].d[l] = x[l] * y[l],
                                IrOp::Div => self.regs[reg].d[l] = x[l] / y[l],
                                IrOp::Mod => self.regs[reg].d[l] = dmod(x[l], y[l]),
                                IrOp::Pow => self.regs[reg].d[l] = x[l].powf(y[l]),
                                IrOp::Eq => self.regs[reg].l[l] = dcmp(x[l], y[l], std::cmp::Ordering::is_eq),
                                IrOp::Neq => self.regs[reg].l[l] = dcmp(x[l], y[l], std::cmp::Ordering::is_ne),
                                IrOp::Lt => self.regs[reg].l[l] = dcmp(x[l], y[l], std::cmp::Ordering::is_lt),
                                IrOp::Le => self.regs[reg].l[l] = dcmp(x[l], y[l], std::cmp::Ordering::is_le),
                                IrOp::Gt => self.regs[reg].l[l] = dcmp(x[l], y[l], std::cmp::Ordering::is_gt),
                                IrOp::Ge => self.regs[reg].l[l] = dcmp(x[l], y[l], std::cmp::Ordering::is_ge),
                                _ => return None,
                            }
                        }
                        Some(())
                    }
                    (Lanes::L(x), Lanes::L(y)) => {
                        for l in 0..lanes {
                            match op {
                                IrOp::And => self.regs[reg].l[l] = land(x[l], y[l]),
                                IrOp::Or => self.regs[reg].l[l] = lor(x[l], y[l]),
                                _ => return None,
                            }
                        }
                        Some(())
                    }
                    _ => None,
                }
            }
        }
    }

    /// Writes the live stores of a taken exit back into interpreter state.
    fn materialize(&mut self, exit: usize) {
        let trace: &'a Trace = self.trace;
        let record: &ExitRecord = &trace.exits[exit];
        for (var, value_ref) in &record.stores {
            let value = slot_to_value(&self.vals[value_ref.index()]);
            match var {
                Variable::Register(r) => {
                    let abs = self.thread.slot(*r);
                    self.thread.registers[abs] = value;
                }
                Variable::Binding { env, name } => {
                    if let Slot::Env(env_id) = self.vals[env.index()] {
                        self.thread.envs.get_mut(env_id).assign(*name, value);
                    }
                }
            }
        }
    }
}

// ---- buffers and conversions ----

#[derive(Debug, Clone)]
enum VecBuf {
    I(Vec<i64>),
    D(Vec<f64>),
    L(Vec<u8>),
}

impl VecBuf {
    fn new(ty: Ty, capacity: usize) -> Self {
        match ty {
            Ty::Logical => Self::L(Vec::with_capacity(capacity)),
            Ty::Integer => Self::I(Vec::with_capacity(capacity)),
            _ => Self::D(Vec::with_capacity(capacity)),
        }
    }

    fn append(&mut self, reg: &TileReg, lanes: usize) {
        match self {
            Self::I(v) => v.extend_from_slice(&reg.i[..lanes]),
            Self::D(v) => v.extend_from_slice(&reg.d[..lanes]),
            Self::L(v) => v.extend_from_slice(&reg.l[..lanes]),
        }
    }

    fn into_slot(self) -> Slot {
        match self {
            Self::I(v) => Slot::VInt(Rc::new(v)),
            Self::D(v) => Slot::VDbl(Rc::new(v)),
            Self::L(v) => Slot::VLgl(Rc::new(v)),
        }
    }
}

fn window<T: Copy>(out: &mut [T], v: &[T], base: usize, lanes: usize) -> Option<()> {
    if base + lanes > v.len() {
        return None;
    }
    out[..lanes].copy_from_slice(&v[base..base + lanes]);
    Some(())
}

fn lane_slot(reg: &TileReg, ty: Ty) -> Slot {
    match ty {
        Ty::Logical => Slot::Lgl(reg.l[0]),
        Ty::Integer => Slot::Int(reg.i[0]),
        _ => Slot::Dbl(reg.d[0]),
    }
}

fn empty_slot(ty: Ty) -> Slot {
    match ty {
        Ty::Logical => Slot::VLgl(Rc::new(vec![])),
        Ty::Integer => Slot::VInt(Rc::new(vec![])),
        _ => Slot::VDbl(Rc::new(vec![])),
    }
}

/// Converts an observed value into a slot, checking it still has the
/// recorded element type. A mismatch (including an attribute wrapper
/// appearing where a plain vector was recorded) means the speculation no
/// longer holds and the trace must bail.
fn typed_slot(value: &Value, ty: Ty) -> Option<Slot> {
    if value.is_object() || value.ty() != ty {
        return None;
    }
    Some(value_to_slot(value))
}

fn value_to_slot(value: &Value) -> Slot {
    match value {
        Value::Null => Slot::Null,
        Value::Logical(v) if v.len() == 1 => Slot::Lgl(v[0]),
        Value::Integer(v) if v.len() == 1 => Slot::Int(v[0]),
        Value::Double(v) if v.len() == 1 => Slot::Dbl(v[0]),
        Value::Logical(v) => Slot::VLgl(v.clone()),
        Value::Integer(v) => Slot::VInt(v.clone()),
        Value::Double(v) => Slot::VDbl(v.clone()),
        Value::Environment(e) => Slot::Env(*e),
        _ => Slot::None,
    }
}

fn slot_to_value(slot: &Slot) -> Value {
    match slot {
        Slot::None | Slot::Null => Value::Null,
        Slot::Lgl(b) => Value::Logical(Rc::new(vec![*b])),
        Slot::Int(i) => Value::int(*i),
        Slot::Dbl(d) => Value::dbl(*d),
        Slot::VLgl(v) => Value::Logical(v.clone()),
        Slot::VInt(v) => Value::Integer(v.clone()),
        Slot::VDbl(v) => Value::Double(v.clone()),
        Slot::Env(e) => Value::Environment(*e),
    }
}

// ---- folds ----

fn fold_identity(op: IrOp, ty: Ty) -> FoldAcc {
    let mut acc = FoldAcc {
        i: 0,
        d: 0.0,
        l: 0,
        na: false,
        count: 0,
    };
    match op {
        IrOp::Sum => {}
        IrOp::Prod => acc.d = 1.0,
        IrOp::Max => {
            acc.d = f64::NEG_INFINITY;
            acc.i = i64::MIN + 1;
        }
        IrOp::Min => {
            acc.d = f64::INFINITY;
            acc.i = i64::MAX;
        }
        IrOp::Any => acc.l = 0,
        IrOp::All => acc.l = 1,
        _ => {}
    }
    let _ = ty;
    acc
}

fn accumulate(op: IrOp, acc: &mut FoldAcc, lanes: &Lanes, n: usize) {
    use crate::interp::arith::{land, lor};
    acc.count += n;
    match (op, lanes) {
        (IrOp::Sum, Lanes::I(v)) => {
            for &x in &v[..n] {
                if x == NA_INTEGER {
                    acc.na = true;
                } else {
                    match acc.i.checked_add(x) {
                        Some(next) => acc.i = next,
                        None => acc.na = true,
                    }
                }
            }
        }
        (IrOp::Sum, Lanes::D(v)) => {
            for &x in &v[..n] {
                acc.d += x;
            }
        }
        (IrOp::Prod, Lanes::D(v)) => {
            for &x in &v[..n] {
                acc.d *= x;
            }
        }
        (IrOp::Max, Lanes::I(v)) | (IrOp::Min, Lanes::I(v)) => {
            for &x in &v[..n] {
                if x == NA_INTEGER {
                    acc.na = true;
                } else if op == IrOp::Max {
                    acc.i = acc.i.max(x);
                } else {
                    acc.i = acc.i.min(x);
                }
            }
        }
        (IrOp::Max, Lanes::D(v)) | (IrOp::Min, Lanes::D(v)) => {
            for &x in &v[..n] {
                if double_is_na(x) {
                    acc.na = true;
                } else if op == IrOp::Max {
                    acc.d = acc.d.max(x);
                } else {
                    acc.d = acc.d.min(x);
                }
            }
        }
        (IrOp::Any, Lanes::L(v)) => {
            for &x in &v[..n] {
                acc.l = lor(acc.l, x);
            }
        }
        (IrOp::All, Lanes::L(v)) => {
            for &x in &v[..n] {
                acc.l = land(acc.l, x);
            }
        }
        _ => acc.na = true,
    }
}

fn fold_result(op: IrOp, ty: Ty, acc: FoldAcc) -> Slot {
    match (op, ty) {
        (IrOp::Sum, Ty::Integer) => Slot::Int(if acc.na { NA_INTEGER } else { acc.i }),
        (IrOp::Sum | IrOp::Prod, _) => Slot::Dbl(if acc.na { na_real() } else { acc.d }),
        (IrOp::Max | IrOp::Min, Ty::Integer) => {
            if acc.na {
                Slot::Int(NA_INTEGER)
            } else if acc.count == 0 {
                // empty reductions promote through doubles
                Slot::Dbl(if op == IrOp::Max { f64::NEG_INFINITY } else { f64::INFINITY })
            } else {
                Slot::Int(acc.i)
            }
        }
        (IrOp::Max | IrOp::Min, _) => Slot::Dbl(if acc.na { na_real() } else { acc.d }),
        (IrOp::Any | IrOp::All, _) => Slot::Lgl(acc.l),
        _ => Slot::None,
    }
}

/// A node escapes its fusion group when anything outside the group reads
/// it: another group's node, a shape length, an exit record, or a phi.
fn compute_escapes(trace: &Trace) -> Vec<bool> {
    let n = trace.nodes.len();
    // group id per node
    let mut group = vec![0usize; n];
    let mut current = 0;
    for (i, node) in trace.nodes.iter().enumerate() {
        if node.boundary || node.op.is_administrative() {
            current += 1;
        }
        group[i] = current;
    }
    let mut escapes = vec![false; n];
    let mut mark_use = |user: usize, used: IrRef, group: &[usize], escapes: &mut Vec<bool>| {
        if !used.is_none() && group[used.index()] != group[user] {
            escapes[used.index()] = true;
        }
    };
    for (i, node) in trace.nodes.iter().enumerate() {
        mark_use(i, node.a, &group, &mut escapes);
        mark_use(i, node.b, &group, &mut escapes);
        mark_use(i, node.c, &group, &mut escapes);
        if !node.in_shape.len.is_none() {
            escapes[node.in_shape.len.index()] = true;
        }
        if !node.out_shape.len.is_none() {
            escapes[node.out_shape.len.index()] = true;
        }
    }
    for exit in &trace.exits {
        for (var, value) in &exit.stores {
            escapes[value.index()] = true;
            if let Variable::Binding { env, .. } = var {
                escapes[env.index()] = true;
            }
        }
        for env in &exit.live_envs {
            escapes[env.index()] = true;
        }
    }
    escapes
}
