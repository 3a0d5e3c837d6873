//! riff — a tracing-JIT runtime for a dynamically typed, vector-oriented
//! array language.
//!
//! The execution pipeline is the crate's core: a register-based bytecode
//! interpreter ([`interp`]) with lazy promise arguments and lexical
//! environments, a trace recorder that speculatively records hot
//! straight-line paths into a typed IR, an optimizer (replay with CSE,
//! load/store forwarding, dead-store elimination, store sinking, phi
//! insertion), a fusion scheduler and tile register assigner, and two
//! interchangeable trace executors: a tile-wise IR interpreter and an
//! x86-64 machine-code backend over the in-crate assembler ([`asm`]).
//!
//! The surface parser and the AST-to-bytecode compiler live outside this
//! crate; they produce [`bytecode::Prototype`]s (via
//! [`bytecode::ProtoBuilder`]) that [`interp::Thread::eval`] runs.
#![expect(clippy::cast_possible_truncation, reason = "IR references and operands are range-checked at creation")]
#![expect(clippy::cast_sign_loss, reason = "operand sign encodes register-versus-name")]
#![expect(clippy::cast_possible_wrap, reason = "bit-pattern casts between index domains are intentional")]

pub mod asm;
pub mod bytecode;
pub mod interp;
pub mod trace;

mod config;
mod deparse;
mod env;
mod error;
mod intern;
mod tracer;
mod value;

pub use crate::{
    config::{Backend, JitConfig},
    deparse::{combine_values, deparse, read_literal},
    env::{DotArg, EnvArena, Environment},
    error::{ErrorKind, RunError, RunResult},
    intern::{CLASS_ATTR, DIM_ATTR, EMPTY_STRING, Interns, NA_STRING, NAMES_ATTR, StringId},
    interp::{Builtin, Thread, eval_standalone},
    tracer::{CountingTracer, JitTracer, NoopTracer, StderrTracer},
    value::{
        Closure, EnvId, NA_INTEGER, NA_LOGICAL, NA_REAL_BITS, ObjectData, PromiseData, Ty, Value, double_is_na,
        is_na_real, na_real, structurally_equal,
    },
};
