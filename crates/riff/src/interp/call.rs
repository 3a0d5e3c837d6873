//! Call-site argument matching and frame creation.
//!
//! A `Call` matches the pre-compiled argument list against the callee's
//! formals: named arguments bind by exact name, unnamed arguments fill the
//! remaining formals positionally (formals after `...` bind by name only),
//! and leftovers flow into the callee's dots. Lazy arguments become promises
//! capturing the caller's environment; unmatched formals with defaults
//! become Default promises evaluating in the callee's environment.
//!
//! The callee environment's lexical parent is the function's captured
//! environment; its dynamic parent is the caller's environment.

use std::rc::Rc;

use crate::{
    bytecode::{CallArg, CompiledCall, Prototype},
    env::DotArg,
    error::{ErrorKind, RunError, RunResult},
    interp::{Dest, Thread},
    intern::{EMPTY_STRING, StringId},
    tracer::JitTracer,
    value::{Closure, EnvId, PromiseData, Value},
};

/// An argument before matching: a value (possibly already a promise from the
/// caller's dots) or a thunk index to wrap.
enum Src {
    Val(Value),
    Thunk(usize),
}

/// Full call with name matching and dots expansion.
pub(crate) fn invoke<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    caller_proto: &Rc<Prototype>,
    closure: &Rc<Closure>,
    entry: &CompiledCall,
    dest: Dest,
    return_pc: usize,
) -> RunResult<()> {
    let caller_env = thread.current_env();
    let mut stream: Vec<(Option<StringId>, Src)> = Vec::with_capacity(entry.args.len());
    for (k, arg) in entry.args.iter().enumerate() {
        let name = entry.names.get(k).copied().flatten();
        match arg {
            CallArg::Register(r) => {
                let abs = thread.slot(*r);
                stream.push((name, Src::Val(thread.registers[abs].clone())));
            }
            CallArg::Promise(t) => stream.push((name, Src::Thunk(*t))),
            CallArg::Missing => stream.push((name, Src::Val(Value::Nil))),
            CallArg::Dots => {
                for dot in thread.envs.get(caller_env).dots().to_vec() {
                    stream.push((dot.name, Src::Val(dot.value)));
                }
            }
        }
    }
    bind_and_push(thread, caller_proto, closure, stream, dest, return_pc)
}

/// Positional-only fast call: no name matching, no dots expansion.
pub(crate) fn invoke_positional<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    closure: &Rc<Closure>,
    entry: &CompiledCall,
    dest: Dest,
    return_pc: usize,
) -> RunResult<()> {
    let mut stream: Vec<(Option<StringId>, Src)> = Vec::with_capacity(entry.args.len());
    for arg in &entry.args {
        match arg {
            CallArg::Register(r) => {
                let abs = thread.slot(*r);
                stream.push((None, Src::Val(thread.registers[abs].clone())));
            }
            other => {
                return Err(RunError::internal(format!("ncall argument must be a register, got {other:?}")));
            }
        }
    }
    // thunks never appear, so the caller prototype is irrelevant here
    let no_thunks = Rc::new(Prototype::default());
    bind_and_push(thread, &no_thunks, closure, stream, dest, return_pc)
}

/// Invokes a closure on already-evaluated values, bound positionally. Used
/// by S3 dispatch and by builtins that call back into user code.
pub(crate) fn invoke_values<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    closure: &Rc<Closure>,
    values: Vec<Value>,
    dest: Dest,
    return_pc: usize,
) -> RunResult<()> {
    let stream = values.into_iter().map(|v| (None, Src::Val(v))).collect();
    let no_thunks = Rc::new(Prototype::default());
    bind_and_push(thread, &no_thunks, closure, stream, dest, return_pc)
}

fn bind_and_push<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    caller_proto: &Rc<Prototype>,
    closure: &Rc<Closure>,
    stream: Vec<(Option<StringId>, Src)>,
    dest: Dest,
    return_pc: usize,
) -> RunResult<()> {
    let caller_env = thread.current_env();
    let callee_env = thread.envs.alloc(Some(closure.env), Some(caller_env));
    let params = &closure.proto.params;
    let dots_pos = closure.proto.dots_param;

    let mut bound: Vec<Option<Value>> = (0..params.len()).map(|_| None).collect();
    let mut used = vec![false; stream.len()];

    // pass 1: exact name matches
    for (si, (name, src)) in stream.iter().enumerate() {
        if let Some(nm) = name
            && let Some(pi) = params.iter().position(|p| p.name == *nm)
        {
            if bound[pi].is_some() {
                return Err(RunError::new(
                    ErrorKind::Arity,
                    format!("formal argument '{}' matched by multiple arguments", thread.interns.get(*nm)),
                ));
            }
            bound[pi] = Some(materialize(caller_proto, src, caller_env, callee_env, params[pi].name));
            used[si] = true;
        }
    }

    // pass 2: positional fill, stopping at the dots position
    let positional_limit = dots_pos.unwrap_or(params.len());
    let mut pi = 0;
    for (si, (name, src)) in stream.iter().enumerate() {
        if used[si] || name.is_some() {
            continue;
        }
        while pi < positional_limit && bound[pi].is_some() {
            pi += 1;
        }
        if pi >= positional_limit {
            break;
        }
        bound[pi] = Some(materialize(caller_proto, src, caller_env, callee_env, params[pi].name));
        used[si] = true;
        pi += 1;
    }

    // pass 3: leftovers flow into dots
    let mut dots: Vec<DotArg> = Vec::new();
    for (si, (name, src)) in stream.iter().enumerate() {
        if used[si] {
            continue;
        }
        if dots_pos.is_none() {
            return Err(RunError::new(ErrorKind::Arity, "unused argument in call"));
        }
        dots.push(DotArg {
            name: *name,
            value: materialize(caller_proto, src, caller_env, callee_env, EMPTY_STRING),
        });
    }

    // bind formals: matched value, Default promise, or left unbound so
    // `missing()` and "object not found" behave
    for (pi, param) in params.iter().enumerate() {
        match bound[pi].take() {
            Some(Value::Nil) | None => {
                if let Some(default_idx) = param.default {
                    let promise = PromiseData {
                        proto: closure.proto.prototypes[default_idx].clone(),
                        env: callee_env,
                        slot: (callee_env, param.name),
                    };
                    thread.envs.get_mut(callee_env).assign(param.name, Value::Default(Rc::new(promise)));
                }
            }
            Some(value) => thread.envs.get_mut(callee_env).assign(param.name, value),
        }
    }
    thread.envs.get_mut(callee_env).set_dots(dots);

    thread.push_frame(closure.proto.clone(), callee_env, dest, return_pc, true);
    Ok(())
}

fn materialize(
    caller_proto: &Rc<Prototype>,
    src: &Src,
    caller_env: EnvId,
    callee_env: EnvId,
    slot_name: StringId,
) -> Value {
    match src {
        Src::Val(v) => v.clone(),
        Src::Thunk(t) => Value::Promise(Rc::new(PromiseData {
            proto: caller_proto.prototypes[*t].clone(),
            env: caller_env,
            slot: (callee_env, slot_name),
        })),
    }
}

/// `UseMethod`: mangles `generic.class`, falls back to `generic.default`,
/// and invokes the method on the object. The method's result lands in the
/// generic's frame via `dest`; the generic returns it with a following
/// `Ret`.
pub(crate) fn dispatch_method<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    generic: StringId,
    object: &Value,
    dest: Dest,
    return_pc: usize,
) -> RunResult<()> {
    let generic_name = thread.interns.get(generic).to_owned();
    let method = object
        .class()
        .and_then(|class| super::subset::lookup_method(thread, &generic_name, class))
        .or_else(|| {
            let id = thread.interns.lookup(&format!("{generic_name}.default"))?;
            let env = thread.current_env();
            match thread.envs.get_recursive(env, id).1 {
                Value::Function(f) => Some(f),
                _ => None,
            }
        });
    match method {
        Some(closure) => invoke_values(thread, &closure, vec![object.clone()], dest, return_pc),
        None => Err(RunError::type_error(format!(
            "no applicable method for '{generic_name}' applied to an object of class \"{}\"",
            object.class().map_or_else(|| object.ty().to_string(), |c| thread.interns.get(c).to_owned()),
        ))),
    }
}
