//! Trace pipeline behavior: interpreter/JIT equivalence, trace shape,
//! guard exits, side traces, and the optimizer fixed point.

mod common;

use std::rc::Rc;

use pretty_assertions::assert_eq;
use riff::{
    CountingTracer, JitConfig, Thread, Value,
    bytecode::Prototype,
    structurally_equal,
    trace::{
        ir::{IrNode, IrOp, Trace},
        opt,
    },
};

/// Runs a program twice, interpreter-only and JIT-assisted, and checks the
/// results are bit-identical.
fn assert_jit_matches_interp(build: impl Fn(&mut Thread<CountingTracer>) -> Rc<Prototype>) -> Value {
    let mut plain = Thread::with_tracer(JitConfig::disabled(), CountingTracer::default());
    let proto = build(&mut plain);
    let global = plain.global_env();
    let expected = plain.eval(proto, global).unwrap();

    let mut jitted = Thread::with_tracer(JitConfig::eager(), CountingTracer::default());
    let proto = build(&mut jitted);
    let global = jitted.global_env();
    let got = jitted.eval(proto, global).unwrap();

    assert!(
        structurally_equal(&expected, &got),
        "interpreter produced {expected:?}, JIT produced {got:?}"
    );
    got
}

#[test]
fn loop_sum_matches_interpreter() {
    let result = assert_jit_matches_interp(|t| common::sum_loop(t, 10_000));
    assert!(structurally_equal(&result, &Value::int(50_005_000)));
}

#[test]
fn loop_sum_compiles_one_compact_trace() {
    let mut thread = Thread::with_tracer(JitConfig::eager(), CountingTracer::default());
    let proto = common::sum_loop(&mut thread, 10_000);
    let global = thread.global_env();
    let result = thread.eval(proto, global).unwrap();
    assert!(structurally_equal(&result, &Value::int(50_005_000)));

    assert_eq!(thread.trace_cache().root_count(), 1, "exactly one loop trace");
    let (_, compiled) = thread.trace_cache().roots().next().unwrap();
    let trace = &compiled.trace;
    assert!(trace.nodes.len() < 30, "expected a compact trace, got:\n{}", trace.dump());

    // a single gtrue guard on the counter bound in the loop body
    let marker = trace.loop_marker.expect("a loop trace");
    let body_gtrue = trace.nodes[marker..].iter().filter(|n| n.op == IrOp::Gtrue).count();
    assert_eq!(body_gtrue, 1, "trace:\n{}", trace.dump());

    // the trace completed at least one full loop in compiled form
    assert!(thread.tracer().traces_compiled >= 1);
    assert!(thread.tracer().side_exits >= 1, "the final iteration exits through the guard");
}

#[test]
fn vector_add_trace_specializes_short_operand() {
    let mut thread = Thread::with_tracer(JitConfig::default(), CountingTracer::default());
    let proto = common::vector_add();
    let global = thread.global_env();
    let first = thread.eval(proto.clone(), global).unwrap();
    // the second run enters the compiled trace
    let second = thread.eval(proto, global).unwrap();
    assert!(structurally_equal(&first, &second), "trace and interpreter disagree");

    assert!(thread.trace_cache().root_count() >= 1);
    let (_, compiled) = thread.trace_cache().roots().next().unwrap();
    let trace = &compiled.trace;
    // a shape guard witnesses len(y) = 2, and the recycling runs through a
    // rep node at the long operand's length
    assert!(
        trace.nodes.iter().any(|n| n.op == IrOp::Glen && n.imm == 2),
        "missing the length-2 shape guard:\n{}",
        trace.dump()
    );
    assert!(trace.nodes.iter().any(|n| n.op == IrOp::Rep), "missing recycling:\n{}", trace.dump());
    assert!(trace.nodes.iter().any(|n| n.op == IrOp::Grange), "missing the merge guard:\n{}", trace.dump());
}

#[test]
fn guarded_subscript_loop_matches_interpreter() {
    let result = assert_jit_matches_interp(common::guard_loop);
    assert!(structurally_equal(&result, &Value::int(5000)));
}

#[test]
fn alternating_branch_compiles_side_trace() {
    let mut thread = Thread::with_tracer(JitConfig::eager(), CountingTracer::default());
    let proto = common::branchy_loop(&mut thread, 200);
    let global = thread.global_env();
    let result = thread.eval(proto, global).unwrap();
    assert!(structurally_equal(&result, &Value::int(300)));

    assert!(thread.trace_cache().root_count() >= 1);
    assert!(
        thread.trace_cache().side_count() >= 1,
        "the not-recorded branch direction should have become a side trace"
    );
    assert!(thread.tracer().side_exits > 2);
}

#[test]
fn branch_result_matches_interpreter() {
    let result = assert_jit_matches_interp(|t| common::branchy_loop(t, 200));
    assert!(structurally_equal(&result, &Value::int(300)));
}

#[test]
fn recorder_aborts_on_use_method() {
    // a hot loop around a generic call: recording starts at the back edge
    // but cannot cross the dispatch, so the trace aborts and the program
    // still interprets correctly
    let mut thread = Thread::with_tracer(JitConfig::eager(), CountingTracer::default());
    let proto = common::dispatch_loop(&mut thread);
    let global = thread.global_env();
    let result = thread.eval(proto, global).unwrap();
    match result {
        Value::Character(v) => assert_eq!(thread.interns().get(v[0]), "F"),
        other => panic!("expected \"F\", got {other:?}"),
    }
    assert!(thread.tracer().traces_started >= 1);
    assert!(thread.tracer().traces_aborted >= 1, "the dispatch call must abort recording");
    assert_eq!(thread.trace_cache().root_count(), 0);
}

/// Semantic projection of a node for fixed-point comparison (register and
/// fusion marks are assigned after optimization, so they are excluded).
fn projection(node: &IrNode) -> impl PartialEq + std::fmt::Debug {
    (
        node.op,
        node.a,
        node.b,
        node.c,
        node.imm,
        node.ty,
        node.in_shape.len,
        node.out_shape.len,
        node.var,
        node.exit,
    )
}

fn assert_same_ir(a: &Trace, b: &Trace) {
    assert_eq!(a.nodes.len(), b.nodes.len(), "left:\n{}\nright:\n{}", a.dump(), b.dump());
    for (x, y) in a.nodes.iter().zip(b.nodes.iter()) {
        assert_eq!(projection(x), projection(y));
    }
    assert_eq!(a.exits.len(), b.exits.len());
    for (x, y) in a.exits.iter().zip(b.exits.iter()) {
        assert_eq!(x.stores, y.stores);
        assert_eq!(x.reenter, y.reenter);
    }
}

#[test]
fn optimizer_is_a_fixed_point() {
    let mut thread = Thread::with_tracer(JitConfig::default(), CountingTracer::default());
    let proto = common::vector_add();
    let global = thread.global_env();
    let _ = thread.eval(proto, global).unwrap();
    let (_, compiled) = thread.trace_cache().roots().next().expect("a linear trace was compiled");

    let once = opt::reoptimize(&compiled.trace);
    assert_same_ir(&compiled.trace, &once);
    let twice = opt::reoptimize(&once);
    assert_same_ir(&once, &twice);
}

#[test]
fn optimized_ir_has_no_duplicate_nodes() {
    let mut thread = Thread::with_tracer(JitConfig::eager(), CountingTracer::default());
    let proto = common::sum_loop(&mut thread, 10_000);
    let global = thread.global_env();
    let _ = thread.eval(proto, global).unwrap();
    let (_, compiled) = thread.trace_cache().roots().next().unwrap();

    // CSE invariant: no two value-producing nodes share a key
    let mut seen = std::collections::HashSet::new();
    for node in &compiled.trace.nodes {
        if matches!(node.op, IrOp::Store | IrOp::Phi | IrOp::Loop | IrOp::Exit) || node.op.is_memory_read() {
            continue;
        }
        assert!(seen.insert(node.cse_key()), "duplicate node {node}");
    }

    // every guard carries a populated exit record with valid references
    for node in &compiled.trace.nodes {
        if node.op.is_guard() {
            let exit = &compiled.trace.exits[node.exit as usize];
            for (_, value) in &exit.stores {
                assert!(value.index() < compiled.trace.nodes.len());
            }
        }
    }
}

#[cfg(target_arch = "x86_64")]
#[test]
fn machine_backend_matches_tile_interpreter() {
    let mut tile = Thread::with_tracer(JitConfig::eager(), CountingTracer::default());
    let proto = common::sum_loop(&mut tile, 10_000);
    let global = tile.global_env();
    let tile_result = tile.eval(proto, global).unwrap();

    let mut config = JitConfig::eager();
    config.backend = riff::Backend::MachineCode;
    let mut machine = Thread::with_tracer(config, CountingTracer::default());
    let proto = common::sum_loop(&mut machine, 10_000);
    let global = machine.global_env();
    let machine_result = machine.eval(proto, global).unwrap();

    assert!(structurally_equal(&tile_result, &machine_result));
    assert!(structurally_equal(&machine_result, &Value::int(50_005_000)));
    let lowered = machine.trace_cache().roots().any(|(_, c)| c.code.is_some());
    assert!(lowered, "the loop-sum trace is within the lowering subset");
    assert!(machine.tracer().code_emitted >= 1);
}

#[test]
fn eval_is_reentrant_after_trace_compilation() {
    // run the same hot program three times on one thread; the later runs
    // enter the cached trace immediately
    let mut thread = Thread::with_tracer(JitConfig::eager(), CountingTracer::default());
    let proto = common::sum_loop(&mut thread, 2_000);
    let global = thread.global_env();
    let first = thread.eval(proto.clone(), global).unwrap();
    let second = thread.eval(proto.clone(), global).unwrap();
    let third = thread.eval(proto, global).unwrap();
    assert!(structurally_equal(&first, &second));
    assert!(structurally_equal(&second, &third));
    assert_eq!(thread.trace_cache().root_count(), 1, "the trace is reused, not recompiled");
}
