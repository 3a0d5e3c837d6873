//! Indexing: `[`, `[[`, `$`, and the assignment forms.
//!
//! Length-1 integer/double/logical indices take the scalar fast path; vector
//! indices (positive, negative-exclusion, logical mask, character-by-names)
//! go through the generic path. `[[` is stricter than `[`: out-of-bounds is
//! an error rather than NA. Object bases with a class attribute dispatch to
//! an S3 method (`[.class`) when one is bound.

use std::rc::Rc;

use crate::{
    error::{RunError, RunResult},
    interp::{Dest, Thread, call},
    intern::{NAMES_ATTR, StringId},
    tracer::JitTracer,
    value::{NA_INTEGER, NA_LOGICAL, Ty, Value},
};

/// `[` with S3 dispatch. When the base carries a class with a bound
/// `[.class` method, a call frame is pushed and `Ok(Some(0))` is returned
/// (the new frame's entry PC); otherwise the subset result is written to
/// `dest_operand` directly and `Ok(None)` falls through to the next
/// instruction.
pub(crate) fn dispatch_or_subset<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    vector: &Value,
    index: &Value,
    dest_operand: i32,
    pc: usize,
) -> RunResult<Option<usize>> {
    if let Some(class) = vector.class()
        && let Some(method) = lookup_method(thread, "[", class)
    {
        let dest = Dest::Register(thread.slot_of_operand(dest_operand));
        call::invoke_values(thread, &method, vec![vector.clone(), index.clone()], dest, pc + 1)?;
        return Ok(Some(0));
    }
    let result = subset(thread, vector, index)?;
    thread.write(dest_operand, result);
    Ok(None)
}

/// Finds `generic.class` in the current environment chain.
pub(crate) fn lookup_method<Tr: JitTracer>(
    thread: &Thread<Tr>,
    generic: &str,
    class: StringId,
) -> Option<Rc<crate::value::Closure>> {
    let mangled = format!("{generic}.{}", thread.interns.get(class));
    let id = thread.interns.lookup(&mangled)?;
    let env = thread.frames.last().map_or(thread.global, |f| f.env);
    match thread.envs.get_recursive(env, id).1 {
        Value::Function(f) => Some(f),
        _ => None,
    }
}

/// Generic `[`.
pub(crate) fn subset<Tr: JitTracer>(thread: &Thread<Tr>, x: &Value, index: &Value) -> RunResult<Value> {
    let base = x.strip();
    let index = index.strip();

    // scalar fast path: length-1 numeric index
    if index.len() == 1
        && let Value::Integer(_) | Value::Double(_) = &index
    {
        match index.as_integer_scalar() {
            Some(i) if i >= 1 => return Ok(base.element((i - 1) as usize)),
            Some(_) | None => {}
        }
    }

    match &index {
        Value::Integer(_) | Value::Double(_) => {
            let idx = integer_indices(&index)?;
            let negatives = idx.iter().any(|&i| i < 0 && i != NA_INTEGER);
            let positives = idx.iter().any(|&i| i > 0);
            if negatives && positives {
                return Err(RunError::type_error("cannot mix positive and negative subscripts"));
            }
            if negatives {
                let excluded: Vec<usize> = idx
                    .iter()
                    .filter(|&&i| i != NA_INTEGER)
                    .map(|&i| (-i - 1) as usize)
                    .collect();
                let keep: Vec<Value> = (0..base.len())
                    .filter(|i| !excluded.contains(i))
                    .map(|i| base.element(i))
                    .collect();
                return gathered(thread, &base, keep);
            }
            // positive gather: 0 is dropped, OOB and NA produce NA
            let picked: Vec<Value> = idx
                .iter()
                .filter(|&&i| i != 0)
                .map(|&i| {
                    if i == NA_INTEGER {
                        Value::empty_of(base.ty(), 1)
                    } else {
                        base.element((i - 1) as usize)
                    }
                })
                .collect();
            gathered(thread, &base, picked)
        }
        Value::Logical(mask) => {
            if mask.is_empty() {
                return Ok(Value::empty_of(base.ty(), 0));
            }
            // mask recycles over the vector
            let n = base.len().max(mask.len());
            let picked: Vec<Value> = (0..n)
                .filter_map(|i| match mask[i % mask.len()] {
                    1 => Some(base.element(i)),
                    NA_LOGICAL => Some(Value::empty_of(base.ty(), 1)),
                    _ => None,
                })
                .collect();
            gathered(thread, &base, picked)
        }
        Value::Character(wanted) => {
            let names = names_of(&base, x);
            let picked: Vec<Value> = wanted
                .iter()
                .map(|w| match names.iter().position(|n| n == w) {
                    Some(i) => base.element(i),
                    None => Value::empty_of(base.ty(), 1),
                })
                .collect();
            gathered(thread, &base, picked)
        }
        other => Err(RunError::type_error(format!("invalid subscript type {}", other.ty()))),
    }
}

/// Rebuilds a vector of the base's element type from picked elements.
fn gathered<Tr: JitTracer>(thread: &Thread<Tr>, base: &Value, picked: Vec<Value>) -> RunResult<Value> {
    if picked.is_empty() {
        return Ok(Value::empty_of(base.ty(), 0));
    }
    if base.ty() == Ty::List {
        return Ok(Value::list(picked));
    }
    let _ = thread;
    // elements share the base's type, so no interning can occur
    let mut scratch = crate::intern::Interns::new();
    let combined = crate::deparse::combine_values(&picked, &mut scratch)?;
    debug_assert!(scratch.is_empty(), "same-type combine must not intern");
    Ok(combined)
}

/// `[[`: strict single-element extraction.
pub(crate) fn subset2<Tr: JitTracer>(thread: &Thread<Tr>, x: &Value, index: &Value) -> RunResult<Value> {
    let base = x.strip();
    if let Value::Character(wanted) = &index.strip()
        && wanted.len() == 1
    {
        let names = names_of(&base, x);
        return match names.iter().position(|n| *n == wanted[0]) {
            Some(i) => Ok(base.element(i)),
            None => Err(RunError::not_found(thread.interns.get(wanted[0]))),
        };
    }
    let i = index
        .as_integer_scalar()
        .ok_or_else(|| RunError::type_error("invalid subscript for [["))?;
    if i < 1 || (i as usize) > base.len() {
        return Err(RunError::out_of_bounds(i, base.len()));
    }
    Ok(base.element((i - 1) as usize))
}

/// `$`: named element of a list, or a binding of an environment.
pub(crate) fn dollar<Tr: JitTracer>(thread: &Thread<Tr>, x: &Value, name: StringId) -> RunResult<Value> {
    match x.strip() {
        Value::Environment(env) => Ok(thread.envs.get(env).get(name)),
        base @ Value::List(_) => {
            let names = names_of(&base, x);
            match names.iter().position(|n| *n == name) {
                Some(i) => Ok(base.element(i)),
                None => Ok(Value::Null),
            }
        }
        other => Err(RunError::type_error(format!("$ operator is invalid for type {}", other.ty()))),
    }
}

/// `x[i] <- v`. Returns the updated vector; in place when `x` is uniquely
/// owned and no promotion is needed, a copy otherwise.
pub(crate) fn assign_subset<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    x: Value,
    index: &Value,
    value: &Value,
) -> RunResult<Value> {
    let attrs = attributes_of(&x);
    let base = x.strip();
    let index = index.strip();

    // scalar fast path: in-place single-element store without promotion
    if index.len() == 1
        && matches!(index, Value::Integer(_) | Value::Double(_))
        && let Some(i) = index.as_integer_scalar()
        && i >= 1
        && (i as usize) <= base.len()
        && value.len() == 1
        && value.strip().ty() <= base.ty()
        && base.ty() != Ty::List
    {
        let updated = scalar_store(thread, base, (i - 1) as usize, value)?;
        return Ok(reattach(updated, attrs));
    }

    let positions: Vec<usize> = match &index {
        Value::Integer(_) | Value::Double(_) => {
            let idx = integer_indices(&index)?;
            let mut out = Vec::with_capacity(idx.len());
            for &i in &idx {
                if i == NA_INTEGER || i == 0 {
                    continue;
                }
                if i < 0 {
                    return Err(RunError::type_error("negative subscripts in assignment are not supported"));
                }
                out.push((i - 1) as usize);
            }
            out
        }
        Value::Logical(mask) if !mask.is_empty() => {
            let n = base.len().max(mask.len());
            (0..n).filter(|&i| mask[i % mask.len()] == 1).collect()
        }
        Value::Logical(_) => Vec::new(),
        other => return Err(RunError::type_error(format!("invalid subscript type {} in assignment", other.ty()))),
    };

    let needed = positions.iter().copied().max().map_or(base.len(), |m| (m + 1).max(base.len()));
    let ty = base.ty().unify(value.strip().ty());
    let mut elements: Vec<Value> = (0..base.len()).map(|i| base.element(i)).collect();
    elements.resize(needed, Value::empty_of(ty, 1));
    let value = value.strip();
    for (k, &pos) in positions.iter().enumerate() {
        if value.is_empty() {
            return Err(RunError::type_error("replacement has length zero"));
        }
        elements[pos] = value.element(k % value.len());
    }
    let rebuilt = if ty == Ty::List {
        Value::list(elements)
    } else {
        crate::deparse::combine_values(&elements, &mut thread.interns)?
    };
    Ok(reattach(rebuilt, attrs))
}

/// Writes one already-type-compatible element in place.
fn scalar_store<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    mut base: Value,
    at: usize,
    value: &Value,
) -> RunResult<Value> {
    match &mut base {
        Value::Integer(v) => {
            let elem = value.as_integer_scalar().unwrap_or(NA_INTEGER);
            Rc::make_mut(v)[at] = elem;
        }
        Value::Double(v) => {
            let elem = value.as_double_scalar().unwrap_or_else(crate::value::na_real);
            Rc::make_mut(v)[at] = elem;
        }
        Value::Logical(v) => {
            let elem = match value.strip() {
                Value::Logical(b) => b.first().copied().unwrap_or(NA_LOGICAL),
                _ => return Err(RunError::internal("scalar store type drift")),
            };
            Rc::make_mut(v)[at] = elem;
        }
        Value::Character(v) => {
            let elem = match value.coerce(Ty::Character, &mut thread.interns)? {
                Value::Character(c) => c.first().copied().unwrap_or(crate::intern::NA_STRING),
                _ => return Err(RunError::internal("scalar store type drift")),
            };
            Rc::make_mut(v)[at] = elem;
        }
        Value::Complex(v) => {
            let elem = match value.coerce(Ty::Complex, &mut thread.interns)? {
                Value::Complex(c) => c.first().copied().unwrap_or(num_complex::Complex64::new(
                    crate::value::na_real(),
                    0.0,
                )),
                _ => return Err(RunError::internal("scalar store type drift")),
            };
            Rc::make_mut(v)[at] = elem;
        }
        other => return Err(RunError::type_error(format!("cannot assign into type {}", other.ty()))),
    }
    Ok(base)
}

/// `x[[i]] <- v`: single-element replacement; appending at `length + 1` is
/// allowed, anything further out of bounds is an error.
pub(crate) fn assign_element<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    x: Value,
    index: &Value,
    value: &Value,
) -> RunResult<Value> {
    let attrs = attributes_of(&x);
    let base = x.strip();
    let i = index
        .as_integer_scalar()
        .ok_or_else(|| RunError::type_error("invalid subscript for [[<-"))?;
    if i < 1 || (i as usize) > base.len() + 1 {
        return Err(RunError::out_of_bounds(i, base.len()));
    }
    let at = (i - 1) as usize;
    if let Value::List(items) = &base {
        let mut items = (**items).clone();
        if at == items.len() {
            items.push(value.clone());
        } else {
            items[at] = value.clone();
        }
        return Ok(reattach(Value::List(Rc::new(items)), attrs));
    }
    if at < base.len() && value.len() == 1 && value.strip().ty() <= base.ty() {
        let updated = scalar_store(thread, base, at, value)?;
        return Ok(reattach(updated, attrs));
    }
    let ty = base.ty().unify(value.strip().ty());
    let mut elements: Vec<Value> = (0..base.len()).map(|k| base.element(k)).collect();
    if at == elements.len() {
        elements.push(value.strip().element(0));
    } else {
        elements[at] = value.strip().element(0);
    }
    let _ = ty;
    let rebuilt = crate::deparse::combine_values(&elements, &mut thread.interns)?;
    Ok(reattach(rebuilt, attrs))
}

// ---- helpers ----

fn integer_indices(index: &Value) -> RunResult<Vec<i64>> {
    match index.strip() {
        Value::Integer(v) => Ok((*v).clone()),
        Value::Double(v) => Ok(v
            .iter()
            .map(|&x| if crate::value::double_is_na(x) { NA_INTEGER } else { x as i64 })
            .collect()),
        other => Err(RunError::type_error(format!("invalid subscript type {}", other.ty()))),
    }
}

/// The names attribute of the original (possibly wrapped) value.
fn names_of(_base: &Value, original: &Value) -> Vec<StringId> {
    match original.attr(NAMES_ATTR) {
        Value::Character(v) => (*v).clone(),
        _ => Vec::new(),
    }
}

fn attributes_of(x: &Value) -> Option<Vec<(StringId, Value)>> {
    match x {
        Value::Object(o) => Some(o.attributes.clone()),
        _ => None,
    }
}

/// Restores attributes onto an updated base.
fn reattach(base: Value, attrs: Option<Vec<(StringId, Value)>>) -> Value {
    match attrs {
        Some(attrs) => {
            let mut v = base;
            for (name, value) in attrs {
                v = v.with_attr(name, value);
            }
            v
        }
        None => base,
    }
}
