//! Hand-assembled programs shared by the integration tests.
//!
//! The surface compiler lives outside this crate, so tests build prototypes
//! directly through `ProtoBuilder`, the same emission surface the compiler
//! drives. Each builder documents the program it encodes.

#![allow(dead_code, reason = "not every program is used by every test binary")]

use std::rc::Rc;

use riff::{
    JitTracer, Thread, Value,
    bytecode::{CallArg, CompiledCall, Opcode, ProtoBuilder, Prototype, name, reg},
};

/// `s <- 0; for (i in 1:n) s <- s + i; s`
pub fn sum_loop<Tr: JitTracer>(thread: &mut Thread<Tr>, n: i64) -> Rc<Prototype> {
    let s = thread.interns_mut().intern("s");
    let i = thread.interns_mut().intern("i");
    let mut b = ProtoBuilder::new();
    let zero = b.constant(Value::int(0));
    let one = b.constant(Value::int(1));
    let bound = b.constant(Value::int(n));
    let r_seq = b.alloc_regs(2);
    let r_from = b.alloc_reg();
    let r_to = b.alloc_reg();

    b.emit(Opcode::Constant, zero, 0, name(s));
    b.emit(Opcode::Constant, one, 0, reg(r_from));
    b.emit(Opcode::Constant, bound, 0, reg(r_to));
    b.emit(Opcode::Colon, reg(r_from), reg(r_to), reg(r_seq));
    let exit = b.emit_for_begin(name(i), reg(r_seq));
    let body = b.here();
    b.emit(Opcode::Add, name(s), name(i), name(s));
    let back = b.offset_to(body);
    b.emit(Opcode::ForEnd, name(i), reg(r_seq), back);
    b.patch_jump(exit);
    b.emit(Opcode::Ret, name(s), 0, 0);
    b.build()
}

/// `x <- 1:1000; y <- c(10L, 20L); x + y`
pub fn vector_add() -> Rc<Prototype> {
    let mut b = ProtoBuilder::new();
    let k_from = b.constant(Value::int(1));
    let k_to = b.constant(Value::int(1000));
    let k_y = b.constant(Value::Integer(Rc::new(vec![10, 20])));
    let r_from = b.alloc_reg();
    let r_to = b.alloc_reg();
    let r_x = b.alloc_reg();
    let r_y = b.alloc_reg();
    let r_z = b.alloc_reg();

    b.emit(Opcode::Constant, k_from, 0, reg(r_from));
    b.emit(Opcode::Constant, k_to, 0, reg(r_to));
    b.emit(Opcode::Colon, reg(r_from), reg(r_to), reg(r_x));
    b.emit(Opcode::Constant, k_y, 0, reg(r_y));
    b.emit(Opcode::Add, reg(r_x), reg(r_y), reg(r_z));
    b.emit(Opcode::Ret, reg(r_z), 0, 0);
    b.build()
}

/// `x <- 1; class(x) <- "foo"; print.foo <- function(x) "F"; print(x)`
///
/// `print` is the generic (`function(x) UseMethod("print")`); the class
/// attribute rides on a constant object since attribute construction is the
/// compiler's business.
pub fn dispatch_program<Tr: JitTracer>(thread: &mut Thread<Tr>) -> Rc<Prototype> {
    let x = thread.interns_mut().intern("x");
    let print = thread.interns_mut().intern("print");
    let print_foo = thread.interns_mut().intern("print.foo");
    let foo = thread.interns_mut().intern("foo");
    let f_text = thread.interns_mut().intern("F");

    // function(x) "F"
    let mut mb = ProtoBuilder::new();
    mb.param(x, None);
    let k_f = mb.constant(Value::chr(f_text));
    let r1 = mb.alloc_reg();
    mb.emit(Opcode::Constant, k_f, 0, reg(r1));
    mb.emit(Opcode::Ret, reg(r1), 0, 0);
    let method = mb.build();

    // function(x) UseMethod("print")
    let mut gb = ProtoBuilder::new();
    gb.param(x, None);
    gb.emit(Opcode::UseMethod, name(print), name(x), reg(0));
    gb.emit(Opcode::Ret, reg(0), 0, 0);
    let generic = gb.build();

    let mut b = ProtoBuilder::new();
    let p_generic = b.prototype(generic);
    let p_method = b.prototype(method);
    let object = Value::int(1).with_attr(riff::CLASS_ATTR, Value::chr(foo));
    let k_obj = b.constant(object);
    let r_fn = b.alloc_reg();
    let r_arg = b.alloc_reg();
    let r_out = b.alloc_reg();

    b.emit(Opcode::Function, p_generic, 0, reg(r_fn));
    b.emit(Opcode::Assign, reg(r_fn), name(print), 0);
    b.emit(Opcode::Function, p_method, 0, reg(r_fn));
    b.emit(Opcode::Assign, reg(r_fn), name(print_foo), 0);
    b.emit(Opcode::Constant, k_obj, 0, name(x));
    b.emit(Opcode::FastMov, name(x), 0, reg(r_arg));
    let entry = b.call_entry(CompiledCall {
        args: vec![CallArg::Register(r_arg)],
        names: vec![None],
        dots_pos: None,
    });
    b.emit(Opcode::Call, name(print), entry, reg(r_out));
    b.emit(Opcode::Ret, reg(r_out), 0, 0);
    b.build()
}

/// `x <- 1:100; y <- x; y[50] <- 0L; s <- 0;
///  for (i in seq_along(y)) s <- s + y[i]; s`
///
/// `x` still holds the untouched 1:100, so iterating it is exactly
/// `seq_along(y)`.
pub fn guard_loop<Tr: JitTracer>(thread: &mut Thread<Tr>) -> Rc<Prototype> {
    let x = thread.interns_mut().intern("x");
    let y = thread.interns_mut().intern("y");
    let s = thread.interns_mut().intern("s");
    let i = thread.interns_mut().intern("i");
    let mut b = ProtoBuilder::new();
    let k_one = b.constant(Value::int(1));
    let k_hundred = b.constant(Value::int(100));
    let k_zero = b.constant(Value::int(0));
    let k_fifty = b.constant(Value::int(50));
    let r_seq = b.alloc_regs(2);
    let r_from = b.alloc_reg();
    let r_to = b.alloc_reg();
    let r_val = b.alloc_reg();
    let r_idx = b.alloc_reg();
    let r_y = b.alloc_reg();
    let r_elem = b.alloc_reg();

    b.emit(Opcode::Constant, k_one, 0, reg(r_from));
    b.emit(Opcode::Constant, k_hundred, 0, reg(r_to));
    b.emit(Opcode::Colon, reg(r_from), reg(r_to), name(x));
    b.emit(Opcode::Mov, name(x), 0, name(y));
    // y[50] <- 0L
    b.emit(Opcode::Constant, k_zero, 0, reg(r_val));
    b.emit(Opcode::Constant, k_fifty, 0, reg(r_idx));
    b.emit(Opcode::FastMov, name(y), 0, reg(r_y));
    b.emit(Opcode::IAssign, reg(r_val), reg(r_idx), reg(r_y));
    b.emit(Opcode::Mov, reg(r_y), 0, name(y));
    b.emit(Opcode::Constant, k_zero, 0, name(s));
    // for (i in seq_along(y))
    b.emit(Opcode::FastMov, name(x), 0, reg(r_seq));
    let exit = b.emit_for_begin(name(i), reg(r_seq));
    let body = b.here();
    b.emit(Opcode::Subset, name(y), name(i), reg(r_elem));
    b.emit(Opcode::Add, name(s), reg(r_elem), name(s));
    let back = b.offset_to(body);
    b.emit(Opcode::ForEnd, name(i), reg(r_seq), back);
    b.patch_jump(exit);
    b.emit(Opcode::Ret, name(s), 0, 0);
    b.build()
}

/// `f <- function() { n <- 0; function() { n <<- n + 1; n } };
///  g <- f(); g(); g(); g()`
pub fn counter_closure<Tr: JitTracer>(thread: &mut Thread<Tr>) -> Rc<Prototype> {
    let n = thread.interns_mut().intern("n");
    let f = thread.interns_mut().intern("f");
    let g = thread.interns_mut().intern("g");

    // function() { n <<- n + 1; n }
    let mut ib = ProtoBuilder::new();
    let k_one = ib.constant(Value::int(1));
    let r1 = ib.alloc_reg();
    let r2 = ib.alloc_reg();
    ib.emit(Opcode::Constant, k_one, 0, reg(r1));
    ib.emit(Opcode::Add, name(n), reg(r1), reg(r2));
    ib.emit(Opcode::Assign2, reg(r2), name(n), 0);
    ib.emit(Opcode::Ret, name(n), 0, 0);
    let inner = ib.build();

    // function() { n <- 0; <closure> }
    let mut ob = ProtoBuilder::new();
    let k_zero = ob.constant(Value::int(0));
    let p_inner = ob.prototype(inner);
    let r1 = ob.alloc_reg();
    ob.emit(Opcode::Constant, k_zero, 0, name(n));
    ob.emit(Opcode::Function, p_inner, 0, reg(r1));
    ob.emit(Opcode::Ret, reg(r1), 0, 0);
    let outer = ob.build();

    let mut b = ProtoBuilder::new();
    let p_outer = b.prototype(outer);
    let empty = b.call_entry(CompiledCall::default());
    let empty2 = b.call_entry(CompiledCall::default());
    let empty3 = b.call_entry(CompiledCall::default());
    let empty4 = b.call_entry(CompiledCall::default());
    let r_fn = b.alloc_reg();
    let r_out = b.alloc_reg();
    b.emit(Opcode::Function, p_outer, 0, reg(r_fn));
    b.emit(Opcode::Assign, reg(r_fn), name(f), 0);
    b.emit(Opcode::Call, name(f), empty, reg(r_out));
    b.emit(Opcode::Assign, reg(r_out), name(g), 0);
    b.emit(Opcode::Call, name(g), empty2, reg(r_out));
    b.emit(Opcode::Call, name(g), empty3, reg(r_out));
    b.emit(Opcode::Call, name(g), empty4, reg(r_out));
    b.emit(Opcode::Ret, reg(r_out), 0, 0);
    b.build()
}

/// `f <- function(x) { y <- 1; x }; f(stop("no"))` when `used`, else
/// `f <- function(x) 42; f(stop("no"))`.
///
/// The argument is a promise wrapping a `stop` thunk; only the body that
/// reads `x` forces it.
pub fn promise_program<Tr: JitTracer>(thread: &mut Thread<Tr>, used: bool) -> Rc<Prototype> {
    let x = thread.interns_mut().intern("x");
    let y = thread.interns_mut().intern("y");
    let f = thread.interns_mut().intern("f");
    let no = thread.interns_mut().intern("no");

    let callee = if used {
        let mut cb = ProtoBuilder::new();
        cb.param(x, None);
        let k_one = cb.constant(Value::int(1));
        cb.emit(Opcode::Constant, k_one, 0, name(y));
        cb.emit(Opcode::Ret, name(x), 0, 0);
        cb.build()
    } else {
        let mut cb = ProtoBuilder::new();
        cb.param(x, None);
        let k = cb.constant(Value::int(42));
        let r1 = cb.alloc_reg();
        cb.emit(Opcode::Constant, k, 0, reg(r1));
        cb.emit(Opcode::Ret, reg(r1), 0, 0);
        cb.build()
    };

    let mut b = ProtoBuilder::new();
    // thunk: stop("no")
    let thunk = {
        let mut tb = ProtoBuilder::new();
        let k_msg = tb.constant(Value::chr(no));
        let r1 = tb.alloc_reg();
        tb.emit(Opcode::Constant, k_msg, 0, reg(r1));
        let stop_args = tb.call_entry(CompiledCall {
            args: vec![CallArg::Register(r1)],
            names: vec![None],
            dots_pos: None,
        });
        tb.emit(Opcode::Internal, riff::Builtin::Stop as i32, stop_args, reg(0));
        tb.emit(Opcode::Ret, reg(0), 0, 0);
        tb.build()
    };
    let p_callee = b.prototype(callee);
    let p_thunk = b.prototype(thunk);
    let entry = b.call_entry(CompiledCall {
        args: vec![CallArg::Promise(p_thunk as usize)],
        names: vec![None],
        dots_pos: None,
    });
    let r_fn = b.alloc_reg();
    let r_out = b.alloc_reg();
    b.emit(Opcode::Function, p_callee, 0, reg(r_fn));
    b.emit(Opcode::Assign, reg(r_fn), name(f), 0);
    b.emit(Opcode::Call, name(f), entry, reg(r_out));
    b.emit(Opcode::Ret, reg(r_out), 0, 0);
    b.build()
}

/// `for (k in 1:10) r <- print(x); r` with the same generic/method/object
/// setup as [`dispatch_program`]. The hot loop makes the recorder attempt a
/// trace that must abort at the call into the generic.
pub fn dispatch_loop<Tr: JitTracer>(thread: &mut Thread<Tr>) -> Rc<Prototype> {
    let x = thread.interns_mut().intern("x");
    let print = thread.interns_mut().intern("print");
    let print_foo = thread.interns_mut().intern("print.foo");
    let foo = thread.interns_mut().intern("foo");
    let f_text = thread.interns_mut().intern("F");
    let k_var = thread.interns_mut().intern("k");

    let mut mb = ProtoBuilder::new();
    mb.param(x, None);
    let k_f = mb.constant(Value::chr(f_text));
    let r1 = mb.alloc_reg();
    mb.emit(Opcode::Constant, k_f, 0, reg(r1));
    mb.emit(Opcode::Ret, reg(r1), 0, 0);
    let method = mb.build();

    let mut gb = ProtoBuilder::new();
    gb.param(x, None);
    gb.emit(Opcode::UseMethod, name(print), name(x), reg(0));
    gb.emit(Opcode::Ret, reg(0), 0, 0);
    let generic = gb.build();

    let mut b = ProtoBuilder::new();
    let p_generic = b.prototype(generic);
    let p_method = b.prototype(method);
    let object = Value::int(1).with_attr(riff::CLASS_ATTR, Value::chr(foo));
    let k_obj = b.constant(object);
    let k_one = b.constant(Value::int(1));
    let k_ten = b.constant(Value::int(10));
    let r_seq = b.alloc_regs(2);
    let r_from = b.alloc_reg();
    let r_to = b.alloc_reg();
    let r_fn = b.alloc_reg();
    let r_arg = b.alloc_reg();
    let r_out = b.alloc_reg();

    b.emit(Opcode::Function, p_generic, 0, reg(r_fn));
    b.emit(Opcode::Assign, reg(r_fn), name(print), 0);
    b.emit(Opcode::Function, p_method, 0, reg(r_fn));
    b.emit(Opcode::Assign, reg(r_fn), name(print_foo), 0);
    b.emit(Opcode::Constant, k_obj, 0, name(x));
    b.emit(Opcode::Constant, k_one, 0, reg(r_from));
    b.emit(Opcode::Constant, k_ten, 0, reg(r_to));
    b.emit(Opcode::Colon, reg(r_from), reg(r_to), reg(r_seq));
    let exit = b.emit_for_begin(name(k_var), reg(r_seq));
    let body = b.here();
    b.emit(Opcode::FastMov, name(x), 0, reg(r_arg));
    let entry = b.call_entry(CompiledCall {
        args: vec![CallArg::Register(r_arg)],
        names: vec![None],
        dots_pos: None,
    });
    b.emit(Opcode::Call, name(print), entry, reg(r_out));
    let back = b.offset_to(body);
    b.emit(Opcode::ForEnd, name(k_var), reg(r_seq), back);
    b.patch_jump(exit);
    b.emit(Opcode::Ret, reg(r_out), 0, 0);
    b.build()
}

/// `s <- 0; for (i in 1:n) { if (i %% 2 == 0) s <- s + 1 else s <- s + 2 }; s`
///
/// The alternating branch makes whichever direction the recorder saw fail
/// every other iteration, exercising side exits and side traces.
pub fn branchy_loop<Tr: JitTracer>(thread: &mut Thread<Tr>, n: i64) -> Rc<Prototype> {
    let s = thread.interns_mut().intern("s");
    let i = thread.interns_mut().intern("i");
    let mut b = ProtoBuilder::new();
    let k_zero = b.constant(Value::int(0));
    let k_one = b.constant(Value::int(1));
    let k_two = b.constant(Value::int(2));
    let k_n = b.constant(Value::int(n));
    let r_seq = b.alloc_regs(2);
    let r_from = b.alloc_reg();
    let r_to = b.alloc_reg();
    let r_two = b.alloc_reg();
    let r_zero = b.alloc_reg();
    let r_mod = b.alloc_reg();
    let r_cond = b.alloc_reg();
    let r_add = b.alloc_reg();

    b.emit(Opcode::Constant, k_zero, 0, name(s));
    b.emit(Opcode::Constant, k_one, 0, reg(r_from));
    b.emit(Opcode::Constant, k_n, 0, reg(r_to));
    b.emit(Opcode::Colon, reg(r_from), reg(r_to), reg(r_seq));
    let exit = b.emit_for_begin(name(i), reg(r_seq));
    let body = b.here();
    b.emit(Opcode::Constant, k_two, 0, reg(r_two));
    b.emit(Opcode::Mod, name(i), reg(r_two), reg(r_mod));
    b.emit(Opcode::Constant, k_zero, 0, reg(r_zero));
    b.emit(Opcode::Eq, reg(r_mod), reg(r_zero), reg(r_cond));
    let to_else = b.emit_branch_false(reg(r_cond));
    b.emit(Opcode::Constant, k_one, 0, reg(r_add));
    b.emit(Opcode::Add, name(s), reg(r_add), name(s));
    let to_end = b.emit_jump();
    b.patch_jump(to_else);
    b.emit(Opcode::Constant, k_two, 0, reg(r_add));
    b.emit(Opcode::Add, name(s), reg(r_add), name(s));
    b.patch_jump(to_end);
    let back = b.offset_to(body);
    b.emit(Opcode::ForEnd, name(i), reg(r_seq), back);
    b.patch_jump(exit);
    b.emit(Opcode::Ret, name(s), 0, 0);
    b.build()
}
