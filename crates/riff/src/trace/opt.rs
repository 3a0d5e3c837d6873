//! The trace optimizer: replay with loop peeling.
//!
//! The raw trace is scanned twice into a fresh buffer. Each scan applies, in
//! a single traversal: common-subexpression elimination over the node key
//! `(op, a, b, c, imm, type, in, out)`, constant pre-hoisting, load/store
//! forwarding through per-Variable maps, and dead-store elimination (a
//! second store to a Variable before any guard kills the first; across a
//! guard the older store is sunk — the fast path omits it and the guard's
//! exit record carries the value instead).
//!
//! The first scan becomes the loop header, the second the body. Variables
//! whose value differs between the two scans get a `phi(initial, updated)`
//! node; at the back-edge the executor copies each phi's updated value into
//! its initial slot, so body nodes referencing header values always see the
//! current iteration's state.
//!
//! Guards encountered on the second scan capture an [`ExitRecord`] from the
//! live-variable and live-store maps at that point. Side and linear traces
//! replay once and end in an `exit` node whose reenter returns control to
//! the interpreter (for side traces, at the root trace's header PC).

use ahash::AHashMap;

use crate::{
    trace::{
        ir::{
            EMPTY_SHAPE, ExitRecord, IrNode, IrOp, IrRef, NO_EXIT, NONE, Reenter, Shape, Trace, TraceKind, Variable,
        },
        record::RawTrace,
    },
    value::Ty,
};

type Key = (IrOp, IrRef, IrRef, IrRef, i64, Ty, IrRef, IrRef);

/// Runs the two-pass (or single-pass, for non-loop traces) replay.
#[must_use]
pub(crate) fn optimize(raw: RawTrace) -> Trace {
    let mut replay = Replay::new(&raw);

    // constant pre-hoist: emit every constant up front so body occurrences
    // CSE against the prefix
    for (i, node) in raw.nodes.iter().enumerate() {
        if node.op == IrOp::Const {
            replay.replay_node(node, IrRef(i as u32));
        }
    }

    // pass 1: the header (constants CSE against the hoisted prefix and
    // populate this pass's reference map)
    for (i, node) in raw.nodes.iter().enumerate() {
        replay.replay_node(node, IrRef(i as u32));
    }

    let loop_marker = if raw.kind == TraceKind::Loop {
        let header_values = replay.loads.clone();
        let marker = replay.out.len();
        replay.out.push(IrNode::new(IrOp::Loop, NONE, NONE, NONE, Ty::Nil, EMPTY_SHAPE, EMPTY_SHAPE));
        replay.begin_body();

        // pass 2: the body
        for (i, node) in raw.nodes.iter().enumerate() {
            replay.replay_node(node, IrRef(i as u32));
        }
        replay.fixup_shapes(marker);

        // phi insertion for loop-carried values
        let mut vars: Vec<Variable> = header_values.keys().copied().collect();
        vars.sort_unstable();
        for var in vars {
            let initial = header_values[&var];
            let updated = replay.loads.get(&var).copied().unwrap_or(initial);
            if initial != updated {
                let ty = replay.out[updated.index()].ty;
                let shape = replay.out[updated.index()].out_shape;
                replay.out.push(IrNode::new(IrOp::Phi, initial, updated, NONE, ty, shape, shape));
            }
        }
        Some(marker)
    } else {
        let marker = replay.out.len();
        replay.fixup_shapes(marker);
        // trailing exit returning control to the interpreter
        let reenter = raw.end_reenter.unwrap_or(Reenter {
            pc: raw.start_pc,
            in_scope: true,
        });
        let exit_index = replay.capture_exit(reenter);
        let node = IrNode::new(IrOp::Exit, NONE, NONE, NONE, Ty::Nil, EMPTY_SHAPE, EMPTY_SHAPE)
            .with_imm(i64::try_from(exit_index).expect("exit index overflow"));
        replay.out.push(node);
        None
    };

    let (nodes, exits, loop_marker) = compact(replay.out, replay.exits, loop_marker);
    Trace {
        kind: raw.kind,
        start_pc: raw.start_pc,
        entry_env: raw.entry_env,
        nodes,
        consts: raw.consts,
        exits,
        loop_marker,
    }
}

/// Re-runs the replay over an already-optimized non-loop trace. Used by
/// tests to check that optimization is a fixed point. (A loop trace has
/// already been peeled; feeding it back through the peeling replay is not
/// meaningful.)
#[must_use]
pub fn reoptimize(trace: &Trace) -> Trace {
    assert!(trace.loop_marker.is_none(), "reoptimize applies to non-loop traces");
    // guard `exit` fields already index the exit table in emission order,
    // which is exactly the raw-trace reenter convention
    let reenters: Vec<Reenter> = trace.exits.iter().map(|e| e.reenter).collect();
    let end_reenter = trace
        .nodes
        .iter()
        .rev()
        .find(|n| n.op == IrOp::Exit)
        .map(|n| trace.exits[usize::try_from(n.imm).expect("bad exit imm")].reenter);
    let raw = RawTrace {
        kind: trace.kind,
        start_pc: trace.start_pc,
        entry_env: trace.entry_env,
        nodes: trace.nodes.clone(),
        consts: trace.consts.clone(),
        reenters,
        end_reenter,
    };
    optimize(raw)
}

struct Replay {
    out: Vec<IrNode>,
    cse: AHashMap<Key, IrRef>,
    /// raw ref → out ref for the current pass.
    map: Vec<IrRef>,
    /// Shape-fixup maps: pass 1 and pass 2 views of raw refs.
    map_header: Vec<IrRef>,
    /// Forwarding: the IR value currently representing each Variable.
    loads: AHashMap<Variable, IrRef>,
    /// Pending (sunk) stores per Variable; materialized by exit records.
    stores: AHashMap<Variable, IrRef>,
    /// Out-buffer index of the newest store per Variable since the last
    /// guard, for dead-store elimination.
    store_nodes: AHashMap<Variable, usize>,
    /// Environment nodes live in this trace.
    live_envs: Vec<IrRef>,
    exits: Vec<ExitRecord>,
    reenters: Vec<Reenter>,
    in_body: bool,
}

impl Replay {
    fn new(raw: &RawTrace) -> Self {
        Self {
            out: Vec::with_capacity(raw.nodes.len()),
            cse: AHashMap::new(),
            map: vec![NONE; raw.nodes.len()],
            map_header: vec![NONE; raw.nodes.len()],
            loads: AHashMap::new(),
            stores: AHashMap::new(),
            store_nodes: AHashMap::new(),
            live_envs: Vec::new(),
            exits: Vec::new(),
            reenters: raw.reenters.clone(),
            in_body: false,
        }
    }

    fn begin_body(&mut self) {
        self.map_header = self.map.clone();
        self.map = vec![NONE; self.map.len()];
        // the back-edge is a barrier: header stores cannot be killed by
        // body stores
        self.store_nodes.clear();
        self.in_body = true;
    }

    fn emit(&mut self, node: IrNode) -> IrRef {
        let r = IrRef(u32::try_from(self.out.len()).expect("trace too long"));
        self.out.push(node);
        r
    }

    fn emit_cse(&mut self, node: IrNode) -> IrRef {
        let key = node.cse_key();
        if let Some(&r) = self.cse.get(&key) {
            return r;
        }
        let r = self.emit(node);
        self.cse.insert(key, r);
        r
    }

    fn remap(&self, r: IrRef) -> IrRef {
        if r.is_none() { NONE } else { self.map[r.index()] }
    }

    fn remap_var(&self, var: Variable) -> Variable {
        match var {
            Variable::Register(r) => Variable::Register(r),
            Variable::Binding { env, name } => Variable::Binding {
                env: self.remap(env),
                name,
            },
        }
    }

    /// Snapshot of the live state for a guard or the trailing exit.
    fn capture_exit(&mut self, reenter: Reenter) -> usize {
        let mut stores: Vec<(Variable, IrRef)> = self
            .stores
            .iter()
            .filter(|(var, _)| match var {
                Variable::Register(_) => true,
                Variable::Binding { env, .. } => self.live_envs.contains(env),
            })
            .map(|(&var, &value)| (var, value))
            .collect();
        stores.sort_unstable_by_key(|(var, _)| *var);
        let index = self.exits.len();
        self.exits.push(ExitRecord {
            index,
            stores,
            live_envs: self.live_envs.clone(),
            frames: Vec::new(),
            reenter,
            hits: 0,
        });
        index
    }

    /// True when a length guard is statically satisfied and may be dropped:
    /// the operand is a non-load node whose shape pins the expected length
    /// to a constant (derived shapes inherit already-guarded lengths), or a
    /// scalar load (revalidated by the executor when it resolves the load).
    /// Speculative non-scalar load lengths keep their guard.
    fn glen_is_static(&self, a: IrRef, expected: i64) -> bool {
        if a.is_none() {
            return false;
        }
        let node = &self.out[a.index()];
        let shape = node.out_shape;
        if shape.is_empty() || shape.concrete != expected {
            return false;
        }
        // the shape's length reference is still a raw-trace index here
        let len_out = self.remap(shape.len);
        if len_out.is_none() || self.out[len_out.index()].op != IrOp::Const {
            return false;
        }
        match node.op {
            IrOp::Sload | IrOp::Load => expected == 1,
            _ => true,
        }
    }

    fn replay_node(&mut self, raw_node: &IrNode, raw_ref: IrRef) {
        let a = self.remap(raw_node.a);
        let b = self.remap(raw_node.b);
        let c = self.remap(raw_node.c);
        let out_ref = match raw_node.op {
            IrOp::Nop => return,
            IrOp::Const | IrOp::Env => {
                let r = self.emit_cse(raw_node.clone());
                if raw_node.op == IrOp::Env && !self.live_envs.contains(&r) {
                    self.live_envs.push(r);
                }
                r
            }
            IrOp::Lenv => {
                let mut node = raw_node.clone();
                node.a = a;
                let r = self.emit_cse(node);
                if !self.live_envs.contains(&r) {
                    self.live_envs.push(r);
                }
                r
            }
            IrOp::Sload | IrOp::Load => {
                let var = self.remap_var(raw_node.var.expect("load without a variable"));
                if let Some(&known) = self.loads.get(&var) {
                    known
                } else {
                    let mut node = raw_node.clone();
                    node.a = a;
                    node.var = Some(var);
                    let r = self.emit(node);
                    self.loads.insert(var, r);
                    r
                }
            }
            IrOp::Store => {
                let var = self.remap_var(raw_node.var.expect("store without a variable"));
                // a newer store to the same variable with no intervening
                // guard makes the older one dead
                if let Some(&prev) = self.store_nodes.get(&var) {
                    self.out[prev].op = IrOp::Nop;
                }
                let mut node = raw_node.clone();
                node.a = a;
                node.var = Some(var);
                let r = self.emit(node);
                self.store_nodes.insert(var, r.index());
                self.stores.insert(var, a);
                self.loads.insert(var, a);
                r
            }
            op if op.is_guard() => {
                // drop statically satisfied length guards
                if op == IrOp::Glen && self.glen_is_static(a, raw_node.imm) {
                    return;
                }
                // a constant-true condition cannot fail
                if op == IrOp::Gtrue && !a.is_none() {
                    let cond = &self.out[a.index()];
                    if cond.op == IrOp::Eq && cond.a == cond.b {
                        return;
                    }
                }
                let mut node = raw_node.clone();
                node.a = a;
                node.b = b;
                node.c = c;
                node.var = raw_node.var.map(|v| self.remap_var(v));
                let key = node.cse_key();
                if self.cse.contains_key(&key) {
                    // an identical earlier guard dominates this one
                    return;
                }
                let reenter = self.reenters[raw_node.exit as usize];
                let exit = self.capture_exit(reenter);
                node.exit = u32::try_from(exit).expect("exit overflow");
                let r = self.emit(node);
                self.cse.insert(key, r);
                // stores can no longer be killed across this guard; they
                // are sunk onto its exit instead
                self.store_nodes.clear();
                r
            }
            IrOp::Phi => {
                // appears only when re-running an already-optimized trace
                let mut node = raw_node.clone();
                node.a = a;
                node.b = b;
                self.emit(node)
            }
            IrOp::Loop | IrOp::Exit => {
                // markers are rebuilt by the driver
                return;
            }
            _ => {
                let mut node = raw_node.clone();
                node.a = a;
                node.b = b;
                node.c = c;
                self.emit_cse(node)
            }
        };
        self.map[raw_ref.index()] = out_ref;
        if self.map_header.len() > raw_ref.index() && !self.in_body {
            self.map_header[raw_ref.index()] = out_ref;
        }
    }

    /// Shape trace-length references point at raw nodes; resolve them to
    /// out-buffer references using the map of the pass that emitted each
    /// node.
    fn fixup_shapes(&mut self, header_end: usize) {
        let fix = |shape: &mut Shape, map: &[IrRef], fallback: &[IrRef]| {
            if !shape.len.is_none() {
                let idx = shape.len.index();
                if idx < map.len() {
                    let mapped = map[idx];
                    shape.len = if mapped.is_none() {
                        if idx < fallback.len() { fallback[idx] } else { NONE }
                    } else {
                        mapped
                    };
                }
            }
        };
        let (map_header, map_body) = (&self.map_header, &self.map);
        for (i, node) in self.out.iter_mut().enumerate() {
            // shapes already resolved to out refs are left alone by passing
            // the identity range check below
            let already_fixed = node.out_shape.len.is_none() && node.in_shape.len.is_none();
            if already_fixed {
                continue;
            }
            if self.in_body && i >= header_end {
                fix(&mut node.in_shape, map_body, map_header);
                fix(&mut node.out_shape, map_body, map_header);
            } else {
                fix(&mut node.in_shape, map_header, map_body);
                fix(&mut node.out_shape, map_header, map_body);
            }
        }
    }
}

/// Removes `Nop` nodes (dead stores) and renumbers every reference.
fn compact(
    nodes: Vec<IrNode>,
    mut exits: Vec<ExitRecord>,
    loop_marker: Option<usize>,
) -> (Vec<IrNode>, Vec<ExitRecord>, Option<usize>) {
    let mut remap: Vec<IrRef> = Vec::with_capacity(nodes.len());
    let mut kept: Vec<IrNode> = Vec::with_capacity(nodes.len());
    let mut new_marker = loop_marker;
    for (i, node) in nodes.into_iter().enumerate() {
        if node.op == IrOp::Nop {
            remap.push(NONE);
            if let Some(marker) = loop_marker
                && i < marker
            {
                new_marker = Some(new_marker.expect("marker disappeared") - 1);
            }
            continue;
        }
        remap.push(IrRef(u32::try_from(kept.len()).expect("trace too long")));
        kept.push(node);
    }
    let follow = |r: IrRef| if r.is_none() { NONE } else { remap[r.index()] };
    for node in &mut kept {
        node.a = follow(node.a);
        node.b = follow(node.b);
        node.c = follow(node.c);
        node.in_shape.len = follow(node.in_shape.len);
        node.out_shape.len = follow(node.out_shape.len);
        if let Some(Variable::Binding { env, .. }) = &mut node.var {
            *env = follow(*env);
        }
        debug_assert!(node.exit == NO_EXIT || (node.exit as usize) < exits.len());
    }
    for exit in &mut exits {
        for (var, value) in &mut exit.stores {
            *value = follow(*value);
            if let Variable::Binding { env, .. } = var {
                *env = follow(*env);
            }
        }
        for env in &mut exit.live_envs {
            *env = follow(*env);
        }
    }
    (kept, exits, new_marker)
}
