//! The builtin call table behind the `Internal` opcode.
//!
//! Builtins receive already-fetched argument values (the interpreter forces
//! promise arguments through its normal thunk-frame machinery before the
//! builtin runs) and produce one result value. Argument counts are checked
//! by convention; excess or missing arguments raise an arity error.

use strum::{Display, FromRepr, IntoStaticStr};

use crate::{
    bytecode::Opcode,
    deparse,
    error::{ErrorKind, RunError, RunResult},
    interp::{Thread, arith},
    tracer::JitTracer,
    value::{Ty, Value},
};

/// Builtins reachable through `Internal`; the instruction's `a` operand is
/// this enum's discriminant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Builtin {
    Length,
    Sum,
    Prod,
    Max,
    Min,
    Any,
    All,
    /// `c(...)`
    Combine,
    IsNa,
    Stop,
    Deparse,
    Rm,
    Rep,
}

impl Builtin {
    pub(crate) fn from_index(index: i32) -> RunResult<Self> {
        u8::try_from(index)
            .ok()
            .and_then(Self::from_repr)
            .ok_or_else(|| RunError::internal(format!("unknown builtin index {index}")))
    }

    /// Runs the builtin. The result is written into the destination register
    /// (conventionally register 0) by the `Internal` dispatch arm.
    pub(crate) fn call<Tr: JitTracer>(self, thread: &mut Thread<Tr>, args: &[Value]) -> RunResult<Value> {
        match self {
            Self::Length => {
                check_arity(self, args, 1)?;
                Ok(Value::int(i64::try_from(args[0].len()).expect("length overflow")))
            }
            Self::Sum => fold_builtin(thread, self, Opcode::Sum, args),
            Self::Prod => fold_builtin(thread, self, Opcode::Prod, args),
            Self::Max => fold_builtin(thread, self, Opcode::Max, args),
            Self::Min => fold_builtin(thread, self, Opcode::Min, args),
            Self::Any => fold_builtin(thread, self, Opcode::Any, args),
            Self::All => fold_builtin(thread, self, Opcode::All, args),
            Self::Combine => deparse::combine_values(args, &mut thread.interns),
            Self::IsNa => {
                check_arity(self, args, 1)?;
                arith::unary(thread, Opcode::IsNa, &args[0])
            }
            Self::Stop => {
                check_arity(self, args, 1)?;
                let message = match args[0].strip() {
                    Value::Character(v) => v.first().map_or(String::new(), |&id| thread.interns.get(id).to_owned()),
                    other => thread.deparse(&other),
                };
                Err(RunError::new(ErrorKind::User, message))
            }
            Self::Deparse => {
                check_arity(self, args, 1)?;
                let text = thread.deparse(&args[0]);
                let id = thread.interns.intern(&text);
                Ok(Value::chr(id))
            }
            Self::Rm => {
                // accepts character vectors naming bindings; the compiler
                // lowers bare symbols to their names, anything else errors
                let env = thread.current_env();
                for arg in args {
                    match arg.strip() {
                        Value::Character(names) => {
                            for &name in names.iter() {
                                thread.envs.get_mut(env).rm(name);
                            }
                        }
                        other => {
                            return Err(RunError::new(
                                ErrorKind::Invalid,
                                format!("rm: cannot remove value of type {}", other.ty()),
                            ));
                        }
                    }
                }
                Ok(Value::Null)
            }
            Self::Rep => {
                if args.is_empty() || args.len() > 3 {
                    return Err(RunError::arity("rep", 2, args.len()));
                }
                let x = &args[0];
                let times = args.get(1).cloned().unwrap_or_else(|| Value::int(1));
                let each = args
                    .get(2)
                    .and_then(Value::as_integer_scalar)
                    .unwrap_or(1);
                let expanded = if each > 1 {
                    let base = x.strip();
                    let parts: Vec<Value> = (0..base.len())
                        .flat_map(|i| std::iter::repeat_n(base.element(i), each as usize))
                        .collect();
                    if base.ty() == Ty::List {
                        Value::list(parts)
                    } else {
                        deparse::combine_values(&parts, &mut thread.interns)?
                    }
                } else {
                    x.clone()
                };
                arith::rep(&expanded, &times)
            }
        }
    }
}

fn check_arity(builtin: Builtin, args: &[Value], expected: usize) -> RunResult<()> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(RunError::arity(builtin.into(), expected, args.len()))
    }
}

fn fold_builtin<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    builtin: Builtin,
    op: Opcode,
    args: &[Value],
) -> RunResult<Value> {
    let _ = builtin;
    match args {
        [one] => arith::fold(thread, op, one),
        [] => arith::fold(thread, op, &Value::Null),
        many => {
            let combined = deparse::combine_values(many, &mut thread.interns)?;
            arith::fold(thread, op, &combined)
        }
    }
}
