//! Arithmetic, comparison, logical, and fold kernels.
//!
//! One generic dispatcher per arity unifies operand element types along the
//! coercion lattice and selects a typed kernel; each kernel handles the
//! scalar, scalar-vector, vector-scalar, and vector-vector forms through the
//! same recycling loop. NA propagates through every kernel: integer NA is
//! the sentinel, double NA rides NaN, logical NA is the sentinel byte.
//!
//! Mixed lengths recycle the shorter operand to the longer's length; if
//! either operand is zero-length the result is zero-length of the unified
//! element type.

use std::rc::Rc;

use num_complex::Complex64;
use num_traits::Zero;

use crate::{
    bytecode::Opcode,
    error::{RunError, RunResult},
    interp::Thread,
    tracer::JitTracer,
    value::{
        NA_INTEGER, NA_LOGICAL, Ty, Value, double_is_na, integer_to_double, logical_to_double, logical_to_integer,
        na_real,
    },
};

/// Elementwise zip with recycling of the shorter operand.
fn recycle_zip<A: Copy, B: Copy, R>(a: &[A], b: &[B], f: impl Fn(A, B) -> R) -> Vec<R> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let n = a.len().max(b.len());
    (0..n).map(|i| f(a[i % a.len()], b[i % b.len()])).collect()
}

// ---- integer kernels ----

#[inline]
pub(crate) fn iadd(a: i64, b: i64) -> i64 {
    if a == NA_INTEGER || b == NA_INTEGER {
        NA_INTEGER
    } else {
        a.checked_add(b).unwrap_or(NA_INTEGER)
    }
}

#[inline]
pub(crate) fn isub(a: i64, b: i64) -> i64 {
    if a == NA_INTEGER || b == NA_INTEGER {
        NA_INTEGER
    } else {
        a.checked_sub(b).unwrap_or(NA_INTEGER)
    }
}

#[inline]
pub(crate) fn imul(a: i64, b: i64) -> i64 {
    if a == NA_INTEGER || b == NA_INTEGER {
        NA_INTEGER
    } else {
        a.checked_mul(b).unwrap_or(NA_INTEGER)
    }
}

/// Floored modulo matching the language's `%%`: the result takes the sign
/// of the divisor.
#[inline]
pub(crate) fn imod(a: i64, b: i64) -> i64 {
    if a == NA_INTEGER || b == NA_INTEGER || b == 0 {
        NA_INTEGER
    } else {
        let r = a % b;
        if r != 0 && (r < 0) != (b < 0) { r + b } else { r }
    }
}

#[inline]
pub(crate) fn icmp(a: i64, b: i64, f: impl Fn(std::cmp::Ordering) -> bool) -> u8 {
    if a == NA_INTEGER || b == NA_INTEGER {
        NA_LOGICAL
    } else {
        u8::from(f(a.cmp(&b)))
    }
}

// ---- double kernels ----

#[inline]
pub(crate) fn dmod(a: f64, b: f64) -> f64 {
    // floored modulo
    a - (a / b).floor() * b
}

#[inline]
pub(crate) fn dcmp(a: f64, b: f64, f: impl Fn(std::cmp::Ordering) -> bool) -> u8 {
    match a.partial_cmp(&b) {
        Some(ord) => u8::from(f(ord)),
        None => NA_LOGICAL,
    }
}

// ---- logical kernels (three-valued) ----

#[inline]
pub(crate) fn land(a: u8, b: u8) -> u8 {
    // FALSE dominates NA
    if a == 0 || b == 0 {
        0
    } else if a == NA_LOGICAL || b == NA_LOGICAL {
        NA_LOGICAL
    } else {
        1
    }
}

#[inline]
pub(crate) fn lor(a: u8, b: u8) -> u8 {
    // TRUE dominates NA
    if a == 1 || b == 1 {
        1
    } else if a == NA_LOGICAL || b == NA_LOGICAL {
        NA_LOGICAL
    } else {
        0
    }
}

/// Result element type of a binary operation after unification.
pub(crate) fn binary_result_ty(op: Opcode, a: Ty, b: Ty) -> RunResult<Ty> {
    let unified = a.unify(b);
    if !matches!(unified, Ty::Null | Ty::Logical | Ty::Integer | Ty::Double | Ty::Complex | Ty::Character) {
        return Err(RunError::type_error(format!("invalid operand type {unified} for {op}")));
    }
    Ok(match op {
        Opcode::Add | Opcode::Sub | Opcode::Mul => match unified {
            Ty::Character => return Err(RunError::type_error("non-numeric argument to binary operator")),
            Ty::Null | Ty::Logical | Ty::Integer => Ty::Integer,
            other => other,
        },
        Opcode::Div | Opcode::Pow => match unified {
            Ty::Character => return Err(RunError::type_error("non-numeric argument to binary operator")),
            Ty::Complex => Ty::Complex,
            _ => Ty::Double,
        },
        Opcode::Mod => match unified {
            Ty::Null | Ty::Logical | Ty::Integer => Ty::Integer,
            Ty::Double => Ty::Double,
            _ => return Err(RunError::type_error("invalid operand type for %%")),
        },
        Opcode::Eq | Opcode::Neq | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => Ty::Logical,
        Opcode::And | Opcode::Or => Ty::Logical,
        other => return Err(RunError::internal(format!("{other} is not a binary operation"))),
    })
}

/// The unified operand type the kernels run at.
pub(crate) fn binary_operand_ty(op: Opcode, a: Ty, b: Ty) -> Ty {
    let unified = a.unify(b);
    match op {
        Opcode::And | Opcode::Or => Ty::Logical,
        Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Mod if unified <= Ty::Integer => Ty::Integer,
        Opcode::Div | Opcode::Pow if unified <= Ty::Double => Ty::Double,
        _ if unified <= Ty::Integer => Ty::Integer,
        _ => unified,
    }
}

/// Binary dispatch: unify, cast, recycle, run the typed kernel.
pub(crate) fn binary<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    op: Opcode,
    a: &Value,
    b: &Value,
) -> RunResult<Value> {
    let a = a.strip();
    let b = b.strip();
    let result_ty = binary_result_ty(op, a.ty(), b.ty())?;
    let operand_ty = binary_operand_ty(op, a.ty(), b.ty());

    match operand_ty {
        Ty::Logical if matches!(op, Opcode::And | Opcode::Or) => {
            let av = as_logical(&a)?;
            let bv = as_logical(&b)?;
            let out = match op {
                Opcode::And => recycle_zip(&av, &bv, land),
                _ => recycle_zip(&av, &bv, lor),
            };
            Ok(Value::Logical(Rc::new(out)))
        }
        Ty::Null | Ty::Logical | Ty::Integer => {
            let _ = result_ty;
            let av = as_integer(thread, &a)?;
            let bv = as_integer(thread, &b)?;
            integer_binary(op, &av, &bv)
        }
        Ty::Double => {
            let av = as_double(thread, &a)?;
            let bv = as_double(thread, &b)?;
            double_binary(op, &av, &bv)
        }
        Ty::Complex => {
            let av = as_complex(thread, &a)?;
            let bv = as_complex(thread, &b)?;
            complex_binary(op, &av, &bv)
        }
        Ty::Character => {
            let av = as_character(thread, &a)?;
            let bv = as_character(thread, &b)?;
            character_binary(thread, op, &av, &bv)
        }
        other => Err(RunError::type_error(format!("invalid operand type {other} for {op}"))),
    }
}

/// Integer kernels. `div` and `pow` never land here: operand typing routes
/// them through the double kernels.
fn integer_binary(op: Opcode, a: &[i64], b: &[i64]) -> RunResult<Value> {
    Ok(match op {
        Opcode::Add => Value::Integer(Rc::new(recycle_zip(a, b, iadd))),
        Opcode::Sub => Value::Integer(Rc::new(recycle_zip(a, b, isub))),
        Opcode::Mul => Value::Integer(Rc::new(recycle_zip(a, b, imul))),
        Opcode::Mod => Value::Integer(Rc::new(recycle_zip(a, b, imod))),
        Opcode::Eq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| icmp(x, y, std::cmp::Ordering::is_eq)))),
        Opcode::Neq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| icmp(x, y, std::cmp::Ordering::is_ne)))),
        Opcode::Lt => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| icmp(x, y, std::cmp::Ordering::is_lt)))),
        Opcode::Le => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| icmp(x, y, std::cmp::Ordering::is_le)))),
        Opcode::Gt => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| icmp(x, y, std::cmp::Ordering::is_gt)))),
        Opcode::Ge => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| icmp(x, y, std::cmp::Ordering::is_ge)))),
        other => return Err(RunError::internal(format!("{other} on integers"))),
    })
}

fn double_binary(op: Opcode, a: &[f64], b: &[f64]) -> RunResult<Value> {
    Ok(match op {
        Opcode::Add => Value::Double(Rc::new(recycle_zip(a, b, |x, y| x + y))),
        Opcode::Sub => Value::Double(Rc::new(recycle_zip(a, b, |x, y| x - y))),
        Opcode::Mul => Value::Double(Rc::new(recycle_zip(a, b, |x, y| x * y))),
        Opcode::Div => Value::Double(Rc::new(recycle_zip(a, b, |x, y| x / y))),
        Opcode::Mod => Value::Double(Rc::new(recycle_zip(a, b, dmod))),
        Opcode::Pow => Value::Double(Rc::new(recycle_zip(a, b, f64::powf))),
        Opcode::Eq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| dcmp(x, y, std::cmp::Ordering::is_eq)))),
        Opcode::Neq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| dcmp(x, y, std::cmp::Ordering::is_ne)))),
        Opcode::Lt => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| dcmp(x, y, std::cmp::Ordering::is_lt)))),
        Opcode::Le => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| dcmp(x, y, std::cmp::Ordering::is_le)))),
        Opcode::Gt => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| dcmp(x, y, std::cmp::Ordering::is_gt)))),
        Opcode::Ge => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| dcmp(x, y, std::cmp::Ordering::is_ge)))),
        other => return Err(RunError::internal(format!("{other} on doubles"))),
    })
}

fn complex_binary(op: Opcode, a: &[Complex64], b: &[Complex64]) -> RunResult<Value> {
    let na = |z: &Complex64| double_is_na(z.re) || double_is_na(z.im);
    Ok(match op {
        Opcode::Add => Value::Complex(Rc::new(recycle_zip(a, b, |x, y| x + y))),
        Opcode::Sub => Value::Complex(Rc::new(recycle_zip(a, b, |x, y| x - y))),
        Opcode::Mul => Value::Complex(Rc::new(recycle_zip(a, b, |x, y| x * y))),
        Opcode::Div => Value::Complex(Rc::new(recycle_zip(a, b, |x, y| x / y))),
        Opcode::Pow => Value::Complex(Rc::new(recycle_zip(a, b, Complex64::powc))),
        Opcode::Eq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| {
            if na(&x) || na(&y) { NA_LOGICAL } else { u8::from(x == y) }
        }))),
        Opcode::Neq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| {
            if na(&x) || na(&y) { NA_LOGICAL } else { u8::from(x != y) }
        }))),
        _ => return Err(RunError::type_error("invalid comparison with complex values")),
    })
}

fn character_binary<Tr: JitTracer>(
    thread: &Thread<Tr>,
    op: Opcode,
    a: &[crate::intern::StringId],
    b: &[crate::intern::StringId],
) -> RunResult<Value> {
    let cmp = |x: crate::intern::StringId, y: crate::intern::StringId, f: fn(std::cmp::Ordering) -> bool| {
        if x.is_na() || y.is_na() {
            NA_LOGICAL
        } else {
            u8::from(f(thread.interns.get(x).cmp(thread.interns.get(y))))
        }
    };
    Ok(match op {
        Opcode::Eq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| cmp(x, y, std::cmp::Ordering::is_eq)))),
        Opcode::Neq => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| cmp(x, y, std::cmp::Ordering::is_ne)))),
        Opcode::Lt => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| cmp(x, y, std::cmp::Ordering::is_lt)))),
        Opcode::Le => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| cmp(x, y, std::cmp::Ordering::is_le)))),
        Opcode::Gt => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| cmp(x, y, std::cmp::Ordering::is_gt)))),
        Opcode::Ge => Value::Logical(Rc::new(recycle_zip(a, b, |x, y| cmp(x, y, std::cmp::Ordering::is_ge)))),
        _ => return Err(RunError::type_error("non-numeric argument to binary operator")),
    })
}

// ---- operand views ----

fn as_logical(v: &Value) -> RunResult<Vec<u8>> {
    match v {
        Value::Null => Ok(vec![]),
        Value::Logical(x) => Ok((**x).clone()),
        Value::Integer(x) => Ok(x.iter().map(|&i| if i == NA_INTEGER { NA_LOGICAL } else { u8::from(i != 0) }).collect()),
        Value::Double(x) => Ok(x.iter().map(|&d| crate::value::double_to_logical(d)).collect()),
        other => Err(RunError::type_error(format!("invalid logical operand of type {}", other.ty()))),
    }
}

fn as_integer<Tr: JitTracer>(_thread: &Thread<Tr>, v: &Value) -> RunResult<Vec<i64>> {
    match v {
        Value::Null => Ok(vec![]),
        Value::Logical(x) => Ok(x.iter().map(|&b| logical_to_integer(b)).collect()),
        Value::Integer(x) => Ok((**x).clone()),
        other => Err(RunError::type_error(format!("invalid integer operand of type {}", other.ty()))),
    }
}

fn as_double<Tr: JitTracer>(_thread: &Thread<Tr>, v: &Value) -> RunResult<Vec<f64>> {
    match v {
        Value::Null => Ok(vec![]),
        Value::Logical(x) => Ok(x.iter().map(|&b| logical_to_double(b)).collect()),
        Value::Integer(x) => Ok(x.iter().map(|&i| integer_to_double(i)).collect()),
        Value::Double(x) => Ok((**x).clone()),
        other => Err(RunError::type_error(format!("invalid double operand of type {}", other.ty()))),
    }
}

fn as_complex<Tr: JitTracer>(thread: &Thread<Tr>, v: &Value) -> RunResult<Vec<Complex64>> {
    match v {
        Value::Complex(x) => Ok((**x).clone()),
        other => Ok(as_double(thread, other)?.into_iter().map(|d| Complex64::new(d, 0.0)).collect()),
    }
}

fn as_character<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    v: &Value,
) -> RunResult<Vec<crate::intern::StringId>> {
    match v.coerce(Ty::Character, &mut thread.interns)? {
        Value::Character(x) => Ok((*x).clone()),
        _ => Err(RunError::internal("character coercion produced a non-character")),
    }
}

// ---- unary ----

pub(crate) fn unary<Tr: JitTracer>(thread: &mut Thread<Tr>, op: Opcode, a: &Value) -> RunResult<Value> {
    let a = a.strip();
    match op {
        Opcode::Neg => match &a {
            Value::Integer(v) => Ok(Value::Integer(Rc::new(
                v.iter().map(|&i| if i == NA_INTEGER { NA_INTEGER } else { -i }).collect(),
            ))),
            Value::Logical(v) => Ok(Value::Integer(Rc::new(
                v.iter().map(|&b| if b == NA_LOGICAL { NA_INTEGER } else { -i64::from(b) }).collect(),
            ))),
            Value::Double(v) => Ok(Value::Double(Rc::new(v.iter().map(|&x| -x).collect()))),
            Value::Complex(v) => Ok(Value::Complex(Rc::new(v.iter().map(|&z| -z).collect()))),
            other => Err(RunError::type_error(format!("invalid argument of type {} to negation", other.ty()))),
        },
        Opcode::Not => {
            let v = as_logical(&a)?;
            Ok(Value::Logical(Rc::new(
                v.iter().map(|&b| if b == NA_LOGICAL { NA_LOGICAL } else { 1 - b }).collect(),
            )))
        }
        Opcode::IsNa => {
            // identifies NA and NaN for doubles
            let out: Vec<u8> = match &a {
                Value::Logical(v) => v.iter().map(|&b| u8::from(b == NA_LOGICAL)).collect(),
                Value::Integer(v) => v.iter().map(|&i| u8::from(i == NA_INTEGER)).collect(),
                Value::Double(v) => v.iter().map(|&x| u8::from(double_is_na(x))).collect(),
                Value::Complex(v) => v.iter().map(|z| u8::from(double_is_na(z.re) || double_is_na(z.im))).collect(),
                Value::Character(v) => v.iter().map(|s| u8::from(s.is_na())).collect(),
                Value::List(v) => v.iter().map(|_| 0).collect(),
                Value::Null => vec![],
                other => return Err(RunError::type_error(format!("is.na on type {}", other.ty()))),
            };
            Ok(Value::Logical(Rc::new(out)))
        }
        Opcode::IsFinite => {
            let out: Vec<u8> = match &a {
                Value::Logical(v) => v.iter().map(|&b| u8::from(b != NA_LOGICAL)).collect(),
                Value::Integer(v) => v.iter().map(|&i| u8::from(i != NA_INTEGER)).collect(),
                Value::Double(v) => v.iter().map(|&x| u8::from(x.is_finite())).collect(),
                Value::Complex(v) => v.iter().map(|z| u8::from(z.re.is_finite() && z.im.is_finite())).collect(),
                Value::Null => vec![],
                other => return Err(RunError::type_error(format!("is.finite on type {}", other.ty()))),
            };
            Ok(Value::Logical(Rc::new(out)))
        }
        Opcode::Log | Opcode::Exp | Opcode::Sqrt => {
            let v = as_double(thread, &a)?;
            let f = match op {
                Opcode::Log => f64::ln,
                Opcode::Exp => f64::exp,
                _ => f64::sqrt,
            };
            Ok(Value::Double(Rc::new(v.iter().map(|&x| f(x)).collect())))
        }
        Opcode::Abs => match &a {
            Value::Integer(v) => Ok(Value::Integer(Rc::new(
                v.iter().map(|&i| if i == NA_INTEGER { NA_INTEGER } else { i.abs() }).collect(),
            ))),
            _ => {
                let v = as_double(thread, &a)?;
                Ok(Value::Double(Rc::new(v.iter().map(|&x| x.abs()).collect())))
            }
        },
        Opcode::Floor | Opcode::Ceiling => {
            let v = as_double(thread, &a)?;
            let f = if op == Opcode::Floor { f64::floor } else { f64::ceil };
            Ok(Value::Double(Rc::new(v.iter().map(|&x| f(x)).collect())))
        }
        other => Err(RunError::internal(format!("{other} is not a unary operation"))),
    }
}

// ---- folds ----

pub(crate) fn fold<Tr: JitTracer>(thread: &mut Thread<Tr>, op: Opcode, a: &Value) -> RunResult<Value> {
    let a = a.strip();
    match op {
        Opcode::Sum => match &a {
            Value::Null => Ok(Value::int(0)),
            Value::Logical(_) | Value::Integer(_) => {
                let v = as_integer(thread, &a)?;
                let mut acc: i64 = 0;
                for &x in &v {
                    if x == NA_INTEGER {
                        return Ok(Value::int(NA_INTEGER));
                    }
                    match acc.checked_add(x) {
                        Some(next) => acc = next,
                        None => return Ok(Value::int(NA_INTEGER)),
                    }
                }
                Ok(Value::int(acc))
            }
            Value::Double(v) => Ok(Value::dbl(v.iter().sum())),
            Value::Complex(v) => Ok(Value::cplx(v.iter().sum())),
            other => Err(RunError::type_error(format!("invalid argument of type {} to sum", other.ty()))),
        },
        Opcode::Prod => match &a {
            Value::Null => Ok(Value::dbl(1.0)),
            Value::Logical(_) | Value::Integer(_) => {
                let v = as_double(thread, &a)?;
                Ok(Value::dbl(v.iter().product()))
            }
            Value::Double(v) => Ok(Value::dbl(v.iter().product())),
            Value::Complex(v) => Ok(Value::cplx(v.iter().fold(Complex64::new(1.0, 0.0), |acc, z| acc * z))),
            other => Err(RunError::type_error(format!("invalid argument of type {} to prod", other.ty()))),
        },
        Opcode::Max | Opcode::Min => fold_extreme(thread, op, &a),
        Opcode::Any | Opcode::All => {
            let v = as_logical(&a)?;
            let mut saw_na = false;
            if op == Opcode::Any {
                for &b in &v {
                    if b == 1 {
                        return Ok(Value::lgl(true));
                    }
                    saw_na |= b == NA_LOGICAL;
                }
                Ok(if saw_na { Value::na_lgl() } else { Value::lgl(false) })
            } else {
                for &b in &v {
                    if b == 0 {
                        return Ok(Value::lgl(false));
                    }
                    saw_na |= b == NA_LOGICAL;
                }
                Ok(if saw_na { Value::na_lgl() } else { Value::lgl(true) })
            }
        }
        other => Err(RunError::internal(format!("{other} is not a fold"))),
    }
}

fn fold_extreme<Tr: JitTracer>(thread: &mut Thread<Tr>, op: Opcode, a: &Value) -> RunResult<Value> {
    let take_max = op == Opcode::Max;
    match a {
        Value::Integer(_) | Value::Logical(_) => {
            let v = as_integer(thread, a)?;
            if v.is_empty() {
                // empty reductions promote through doubles, like div and pow
                return Ok(Value::dbl(if take_max { f64::NEG_INFINITY } else { f64::INFINITY }));
            }
            let mut acc = v[0];
            for &x in &v {
                if x == NA_INTEGER {
                    return Ok(Value::int(NA_INTEGER));
                }
                acc = if take_max { acc.max(x) } else { acc.min(x) };
            }
            Ok(Value::int(acc))
        }
        Value::Complex(v) => {
            // ordered lexicographically by (re, im); identity is the origin
            let mut acc = Complex64::zero();
            for z in v.iter() {
                if double_is_na(z.re) || double_is_na(z.im) {
                    return Ok(Value::cplx(Complex64::new(na_real(), na_real())));
                }
                let better = match z.re.total_cmp(&acc.re).then(z.im.total_cmp(&acc.im)) {
                    std::cmp::Ordering::Greater => take_max,
                    std::cmp::Ordering::Less => !take_max,
                    std::cmp::Ordering::Equal => false,
                };
                if better {
                    acc = *z;
                }
            }
            Ok(Value::cplx(acc))
        }
        other => {
            let v = as_double(thread, other)?;
            let mut acc = if take_max { f64::NEG_INFINITY } else { f64::INFINITY };
            for &x in &v {
                if double_is_na(x) {
                    return Ok(Value::dbl(na_real()));
                }
                acc = if take_max { acc.max(x) } else { acc.min(x) };
            }
            Ok(Value::dbl(acc))
        }
    }
}

// ---- ternary ----

/// Elementwise `ifelse(cond, yes, no)`: the result takes the condition's
/// length; `yes`/`no` recycle; NA conditions produce NA elements.
pub(crate) fn ifelse<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    cond: &Value,
    yes: &Value,
    no: &Value,
) -> RunResult<Value> {
    let mask = as_logical(&cond.strip())?;
    let ty = yes.strip().ty().unify(no.strip().ty());
    if !matches!(ty, Ty::Logical | Ty::Integer | Ty::Double | Ty::Complex | Ty::Character) {
        return Err(RunError::type_error(format!("invalid ifelse arm type {ty}")));
    }
    let yes = yes.coerce(ty, &mut thread.interns)?;
    let no = no.coerce(ty, &mut thread.interns)?;
    let n = mask.len();
    let pick = |i: usize| -> Value {
        match mask[i] {
            1 => yes.element(i % yes.len().max(1)),
            0 => no.element(i % no.len().max(1)),
            _ => Value::empty_of(ty, 1),
        }
    };
    let parts: Vec<Value> = (0..n).map(pick).collect();
    crate::deparse::combine_values(&parts, &mut thread.interns)
}

/// `split(x, f, n)`: distribute `x` into `n` buckets by the 1-based integer
/// factor `f` (recycled to x's length).
pub(crate) fn split<Tr: JitTracer>(
    thread: &mut Thread<Tr>,
    data: &Value,
    factor: &Value,
    levels: &Value,
) -> RunResult<Value> {
    let n = levels
        .as_integer_scalar()
        .ok_or_else(|| RunError::type_error("split level count must be an integer scalar"))?;
    let n = usize::try_from(n).map_err(|_| RunError::type_error("split level count must be non-negative"))?;
    let f = match factor.strip() {
        Value::Integer(v) => v,
        other => return Err(RunError::type_error(format!("split factor must be integer, got {}", other.ty()))),
    };
    let data = data.strip();
    let mut buckets: Vec<Vec<Value>> = vec![Vec::new(); n];
    for i in 0..data.len() {
        if f.is_empty() {
            break;
        }
        let level = f[i % f.len()];
        if level >= 1 && (level as usize) <= n {
            buckets[(level - 1) as usize].push(data.element(i));
        }
    }
    // each bucket collapses back to a vector of the data's type
    let mut items = Vec::with_capacity(buckets.len());
    for b in buckets {
        if b.is_empty() {
            items.push(Value::empty_of(data.ty(), 0));
        } else {
            items.push(crate::deparse::combine_values(&b, &mut thread.interns)?);
        }
    }
    Ok(Value::list(items))
}

// ---- vector construction ----

/// `seq(len, step)`: integer sequence `1, 1+step, …` of length `len`.
pub(crate) fn seq(len: &Value, step: &Value) -> RunResult<Value> {
    let n = len
        .as_integer_scalar()
        .ok_or_else(|| RunError::type_error("seq length must be an integer scalar"))?;
    let n = usize::try_from(n).map_err(|_| RunError::type_error("seq length must be non-negative"))?;
    let step = step.as_integer_scalar().unwrap_or(1);
    let mut out = Vec::with_capacity(n);
    let mut x: i64 = 1;
    for _ in 0..n {
        out.push(x);
        x += step;
    }
    Ok(Value::Integer(Rc::new(out)))
}

/// `from:to`, ascending or descending.
pub(crate) fn colon(from: &Value, to: &Value) -> RunResult<Value> {
    let from = from
        .as_integer_scalar()
        .ok_or_else(|| RunError::type_error("colon bounds must be integer scalars"))?;
    let to = to
        .as_integer_scalar()
        .ok_or_else(|| RunError::type_error("colon bounds must be integer scalars"))?;
    let out: Vec<i64> = if from <= to {
        (from..=to).collect()
    } else {
        (to..=from).rev().collect()
    };
    Ok(Value::Integer(Rc::new(out)))
}

/// `rep(x, times)`: the whole vector repeated.
pub(crate) fn rep(x: &Value, times: &Value) -> RunResult<Value> {
    let times = times
        .as_integer_scalar()
        .ok_or_else(|| RunError::type_error("rep times must be an integer scalar"))?;
    let times = usize::try_from(times).map_err(|_| RunError::type_error("rep times must be non-negative"))?;
    let x = x.strip();
    Ok(match &x {
        Value::Logical(v) => Value::Logical(Rc::new(v.iter().copied().cycle().take(v.len() * times).collect())),
        Value::Integer(v) => Value::Integer(Rc::new(v.iter().copied().cycle().take(v.len() * times).collect())),
        Value::Double(v) => Value::Double(Rc::new(v.iter().copied().cycle().take(v.len() * times).collect())),
        Value::Complex(v) => Value::Complex(Rc::new(v.iter().copied().cycle().take(v.len() * times).collect())),
        Value::Character(v) => Value::Character(Rc::new(v.iter().copied().cycle().take(v.len() * times).collect())),
        Value::List(v) => Value::List(Rc::new(v.iter().cloned().cycle().take(v.len() * times).collect())),
        other => return Err(RunError::type_error(format!("cannot rep type {}", other.ty()))),
    })
}
