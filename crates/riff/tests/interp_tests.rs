//! Interpreter semantics: the end-to-end scenarios with the JIT disabled.

mod common;

use std::rc::Rc;

use pretty_assertions::assert_eq;
use riff::{
    ErrorKind, JitConfig, Thread, Value,
    bytecode::{CallArg, CompiledCall, Opcode, ProtoBuilder, name, reg},
    structurally_equal,
};

fn run_disabled(build: impl FnOnce(&mut Thread) -> Rc<riff::bytecode::Prototype>) -> Result<Value, riff::RunError> {
    let mut thread = Thread::new(JitConfig::disabled());
    let proto = build(&mut thread);
    let global = thread.global_env();
    thread.eval(proto, global)
}

#[test]
fn simple_loop_sum() {
    let result = run_disabled(|t| common::sum_loop(t, 10_000)).unwrap();
    assert!(structurally_equal(&result, &Value::int(50_005_000)));
}

#[test]
fn vector_add_recycles_shorter_operand() {
    let result = run_disabled(|_| common::vector_add()).unwrap();
    match &result {
        Value::Integer(v) => {
            assert_eq!(v.len(), 1000);
            assert_eq!(v[0], 11);
            assert_eq!(v[1], 22);
            assert_eq!(v[2], 13);
            assert_eq!(v[3], 24);
            assert_eq!(v[990], 1001);
            assert_eq!(v[991], 1012);
        }
        other => panic!("expected an integer vector, got {other:?}"),
    }
}

#[test]
fn use_method_dispatches_on_class() {
    let mut thread = Thread::new(JitConfig::disabled());
    let proto = common::dispatch_program(&mut thread);
    let global = thread.global_env();
    let result = thread.eval(proto, global).unwrap();
    match result {
        Value::Character(v) => {
            assert_eq!(v.len(), 1);
            assert_eq!(thread.interns().get(v[0]), "F");
        }
        other => panic!("expected \"F\", got {other:?}"),
    }
}

#[test]
fn subscript_update_then_reduce() {
    let result = run_disabled(|t| common::guard_loop(t)).unwrap();
    // sum(1:100) - 50, since y[50] was zeroed
    assert!(structurally_equal(&result, &Value::int(5000)));
}

#[test]
fn lexical_capture_shares_one_environment() {
    let result = run_disabled(|t| common::counter_closure(t)).unwrap();
    assert!(structurally_equal(&result, &Value::int(3)));
}

#[test]
fn promise_forces_on_read_only() {
    // f <- function(x) { y <- 1; x }: reading x forces the stop thunk
    let err = run_disabled(|t| common::promise_program(t, true)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::User);
    assert_eq!(err.message(), "no");

    // f <- function(x) 42: the promise is never forced
    let result = run_disabled(|t| common::promise_program(t, false)).unwrap();
    assert!(structurally_equal(&result, &Value::int(42)));
}

#[test]
fn missing_binding_raises_not_found() {
    let err = run_disabled(|t| {
        let absent = t.interns_mut().intern("absent");
        let mut b = ProtoBuilder::new();
        b.emit(Opcode::Ret, name(absent), 0, 0);
        b.build()
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn zero_length_arithmetic_yields_zero_length_result() {
    let result = run_disabled(|_| {
        let mut b = ProtoBuilder::new();
        let k_empty = b.constant(Value::Integer(Rc::new(vec![])));
        let k_pair = b.constant(Value::Integer(Rc::new(vec![1, 2])));
        let r1 = b.alloc_reg();
        let r2 = b.alloc_reg();
        let r3 = b.alloc_reg();
        b.emit(Opcode::Constant, k_empty, 0, reg(r1));
        b.emit(Opcode::Constant, k_pair, 0, reg(r2));
        b.emit(Opcode::Add, reg(r1), reg(r2), reg(r3));
        b.emit(Opcode::Ret, reg(r3), 0, 0);
        b.build()
    })
    .unwrap();
    match result {
        Value::Integer(v) => assert!(v.is_empty()),
        other => panic!("expected integer(0), got {other:?}"),
    }
}

#[test]
fn na_propagates_through_arithmetic_and_comparison() {
    let result = run_disabled(|_| {
        let mut b = ProtoBuilder::new();
        let k_v = b.constant(Value::Integer(Rc::new(vec![1, riff::NA_INTEGER, 3])));
        let k_one = b.constant(Value::int(1));
        let r1 = b.alloc_reg();
        let r2 = b.alloc_reg();
        let r3 = b.alloc_reg();
        b.emit(Opcode::Constant, k_v, 0, reg(r1));
        b.emit(Opcode::Constant, k_one, 0, reg(r2));
        b.emit(Opcode::Add, reg(r1), reg(r2), reg(r3));
        b.emit(Opcode::Ret, reg(r3), 0, 0);
        b.build()
    })
    .unwrap();
    match result {
        Value::Integer(v) => {
            assert_eq!(v[0], 2);
            assert_eq!(v[1], riff::NA_INTEGER);
            assert_eq!(v[2], 4);
        }
        other => panic!("expected an integer vector, got {other:?}"),
    }

    let cmp = run_disabled(|_| {
        let mut b = ProtoBuilder::new();
        let k_v = b.constant(Value::Integer(Rc::new(vec![1, riff::NA_INTEGER])));
        let k_one = b.constant(Value::int(1));
        let r1 = b.alloc_reg();
        let r2 = b.alloc_reg();
        let r3 = b.alloc_reg();
        b.emit(Opcode::Constant, k_v, 0, reg(r1));
        b.emit(Opcode::Constant, k_one, 0, reg(r2));
        b.emit(Opcode::Gt, reg(r1), reg(r2), reg(r3));
        b.emit(Opcode::Ret, reg(r3), 0, 0);
        b.build()
    })
    .unwrap();
    match cmp {
        Value::Logical(v) => {
            assert_eq!(v[0], 0);
            assert_eq!(v[1], riff::NA_LOGICAL);
        }
        other => panic!("expected a logical vector, got {other:?}"),
    }
}

#[test]
fn fold_base_cases() {
    // sum() of nothing is 0, prod() is 1, any() false, all() true,
    // max()/min() are the infinities
    let fold = |builtin: riff::Builtin, input: Value| {
        run_disabled(move |_| {
            let mut b = ProtoBuilder::new();
            let k_empty = b.constant(input.clone());
            let r1 = b.alloc_reg();
            b.emit(Opcode::Constant, k_empty, 0, reg(r1));
            let entry = b.call_entry(CompiledCall {
                args: vec![CallArg::Register(r1)],
                names: vec![None],
                dots_pos: None,
            });
            b.emit(Opcode::Internal, builtin as i32, entry, reg(0));
            b.emit(Opcode::Ret, reg(0), 0, 0);
            b.build()
        })
        .unwrap()
    };
    assert!(structurally_equal(&fold(riff::Builtin::Sum, Value::Null), &Value::int(0)));
    assert!(structurally_equal(&fold(riff::Builtin::Prod, Value::Null), &Value::dbl(1.0)));
    assert!(structurally_equal(&fold(riff::Builtin::Any, Value::Null), &Value::lgl(false)));
    assert!(structurally_equal(&fold(riff::Builtin::All, Value::Null), &Value::lgl(true)));
    assert!(structurally_equal(&fold(riff::Builtin::Max, Value::Null), &Value::dbl(f64::NEG_INFINITY)));
    assert!(structurally_equal(&fold(riff::Builtin::Min, Value::Null), &Value::dbl(f64::INFINITY)));

    // empty reductions agree across element types: integer input promotes
    // through doubles exactly as double input does
    let empty_int = Value::Integer(Rc::new(vec![]));
    let empty_dbl = Value::Double(Rc::new(vec![]));
    assert!(structurally_equal(&fold(riff::Builtin::Max, empty_int.clone()), &Value::dbl(f64::NEG_INFINITY)));
    assert!(structurally_equal(&fold(riff::Builtin::Min, empty_int), &Value::dbl(f64::INFINITY)));
    assert!(structurally_equal(&fold(riff::Builtin::Max, empty_dbl.clone()), &Value::dbl(f64::NEG_INFINITY)));
    assert!(structurally_equal(&fold(riff::Builtin::Min, empty_dbl), &Value::dbl(f64::INFINITY)));
}

#[test]
fn strict_extraction_is_stricter_than_subset() {
    // x[200] is NA, x[[200]] is an error
    let soft = run_disabled(|_| {
        let mut b = ProtoBuilder::new();
        let k_v = b.constant(Value::Integer(Rc::new(vec![1, 2, 3])));
        let k_i = b.constant(Value::int(200));
        let r1 = b.alloc_reg();
        let r2 = b.alloc_reg();
        let r3 = b.alloc_reg();
        b.emit(Opcode::Constant, k_v, 0, reg(r1));
        b.emit(Opcode::Constant, k_i, 0, reg(r2));
        b.emit(Opcode::Subset, reg(r1), reg(r2), reg(r3));
        b.emit(Opcode::Ret, reg(r3), 0, 0);
        b.build()
    })
    .unwrap();
    assert!(structurally_equal(&soft, &Value::int(riff::NA_INTEGER)));

    let strict = run_disabled(|_| {
        let mut b = ProtoBuilder::new();
        let k_v = b.constant(Value::Integer(Rc::new(vec![1, 2, 3])));
        let k_i = b.constant(Value::int(200));
        let r1 = b.alloc_reg();
        let r2 = b.alloc_reg();
        let r3 = b.alloc_reg();
        b.emit(Opcode::Constant, k_v, 0, reg(r1));
        b.emit(Opcode::Constant, k_i, 0, reg(r2));
        b.emit(Opcode::Subset2, reg(r1), reg(r2), reg(r3));
        b.emit(Opcode::Ret, reg(r3), 0, 0);
        b.build()
    });
    assert_eq!(strict.unwrap_err().kind(), ErrorKind::Subscript);
}

#[test]
fn branch_sum_without_jit() {
    let mut thread = Thread::new(JitConfig::disabled());
    let proto = common::branchy_loop(&mut thread, 200);
    let global = thread.global_env();
    let result = thread.eval(proto, global).unwrap();
    // 100 even iterations add 1, 100 odd iterations add 2
    assert!(structurally_equal(&result, &Value::int(300)));
}

#[test]
fn positional_fast_call() {
    // f <- function(a, b) a - b; f(10, 4) through the positional-only path
    let result = run_disabled(|t| {
        let a_id = t.interns_mut().intern("a");
        let b_id = t.interns_mut().intern("b");

        let mut cb = ProtoBuilder::new();
        cb.param(a_id, None);
        cb.param(b_id, None);
        let r1 = cb.alloc_reg();
        cb.emit(Opcode::Sub, name(a_id), name(b_id), reg(r1));
        cb.emit(Opcode::Ret, reg(r1), 0, 0);
        let callee = cb.build();

        let mut b = ProtoBuilder::new();
        let p = b.prototype(callee);
        let k10 = b.constant(Value::int(10));
        let k4 = b.constant(Value::int(4));
        let r_fn = b.alloc_reg();
        let r1 = b.alloc_reg();
        let r2 = b.alloc_reg();
        let r_out = b.alloc_reg();
        b.emit(Opcode::Function, p, 0, reg(r_fn));
        b.emit(Opcode::Constant, k10, 0, reg(r1));
        b.emit(Opcode::Constant, k4, 0, reg(r2));
        let entry = b.call_entry(CompiledCall {
            args: vec![CallArg::Register(r1), CallArg::Register(r2)],
            names: vec![None, None],
            dots_pos: None,
        });
        b.emit(Opcode::Ncall, reg(r_fn), entry, reg(r_out));
        b.emit(Opcode::Ret, reg(r_out), 0, 0);
        b.build()
    })
    .unwrap();
    assert!(structurally_equal(&result, &Value::int(6)));
}

#[test]
fn dots_forward_through_a_wrapper() {
    // h <- function(a, b) a - b; g <- function(...) h(...); g(10, 4)
    let result = run_disabled(|t| {
        let a_id = t.interns_mut().intern("a");
        let b_id = t.interns_mut().intern("b");
        let h_id = t.interns_mut().intern("h");

        let mut hb = ProtoBuilder::new();
        hb.param(a_id, None);
        hb.param(b_id, None);
        let r1 = hb.alloc_reg();
        hb.emit(Opcode::Sub, name(a_id), name(b_id), reg(r1));
        hb.emit(Opcode::Ret, reg(r1), 0, 0);
        let h = hb.build();

        let mut gb = ProtoBuilder::new();
        gb.dots_param();
        let r_out = gb.alloc_reg();
        let forward = gb.call_entry(CompiledCall {
            args: vec![CallArg::Dots],
            names: vec![None],
            dots_pos: Some(0),
        });
        gb.emit(Opcode::Call, name(h_id), forward, reg(r_out));
        gb.emit(Opcode::Ret, reg(r_out), 0, 0);
        let g = gb.build();

        let mut b = ProtoBuilder::new();
        let p_h = b.prototype(h);
        let p_g = b.prototype(g);
        let k10 = b.constant(Value::int(10));
        let k4 = b.constant(Value::int(4));
        let r_fn = b.alloc_reg();
        let r1 = b.alloc_reg();
        let r2 = b.alloc_reg();
        let r_out = b.alloc_reg();
        b.emit(Opcode::Function, p_h, 0, reg(r_fn));
        b.emit(Opcode::Assign, reg(r_fn), name(h_id), 0);
        b.emit(Opcode::Function, p_g, 0, reg(r_fn));
        b.emit(Opcode::Constant, k10, 0, reg(r1));
        b.emit(Opcode::Constant, k4, 0, reg(r2));
        let entry = b.call_entry(CompiledCall {
            args: vec![CallArg::Register(r1), CallArg::Register(r2)],
            names: vec![None, None],
            dots_pos: None,
        });
        b.emit(Opcode::Call, reg(r_fn), entry, reg(r_out));
        b.emit(Opcode::Ret, reg(r_out), 0, 0);
        b.build()
    })
    .unwrap();
    assert!(structurally_equal(&result, &Value::int(6)));
}
