//! Tagged runtime values.
//!
//! A [`Value`] is a tagged union over the language's data types. Scalars are
//! length-1 vectors; every vector variant owns a contiguous buffer of its
//! element type behind an `Rc`, so copying a `Value` between registers and
//! environments is cheap and mutation is copy-on-write via `Rc::make_mut`.
//!
//! NA sentinels per element type:
//! * logical — the byte [`NA_LOGICAL`] (`0` false, `1` true, `2` NA)
//! * integer — [`NA_INTEGER`] (`i64::MIN`)
//! * double — a distinguished NaN payload ([`NA_REAL_BITS`]); `is.na` is
//!   additionally true for every other NaN
//! * character — the [`NA_STRING`](crate::intern::NA_STRING) sentinel id
//! * complex — NA real part
//!
//! Environments are arena indices ([`EnvId`]) rather than owning references;
//! closures, promises, and frames hold indices, and the arena free list owned
//! by the thread keeps them alive. No garbage collector is required.

use std::rc::Rc;

use num_complex::Complex64;
use strum::{Display, IntoStaticStr};

use crate::{
    bytecode::Prototype,
    error::{ErrorKind, RunError, RunResult},
    intern::{Interns, NA_STRING, StringId},
};

/// Logical NA sentinel byte. `0` is false, `1` is true.
pub const NA_LOGICAL: u8 = 2;

/// Integer NA sentinel.
pub const NA_INTEGER: i64 = i64::MIN;

/// Bit pattern of the double NA: a NaN with payload 1954.
pub const NA_REAL_BITS: u64 = 0x7FF0_0000_0000_07A2;

/// The double NA value.
#[must_use]
pub fn na_real() -> f64 {
    f64::from_bits(NA_REAL_BITS)
}

/// Whether a double is the NA sentinel specifically (not just any NaN).
#[inline]
#[must_use]
pub fn is_na_real(x: f64) -> bool {
    x.to_bits() == NA_REAL_BITS
}

/// `is.na` semantics for doubles: true for NA and for NaN.
#[inline]
#[must_use]
pub fn double_is_na(x: f64) -> bool {
    x.is_nan()
}

/// Arena index of an environment.
///
/// Environments form a cyclic graph (closures refer to envs that refer to
/// closures), so they are referenced by index into the thread-owned arena
/// instead of by owning pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub(crate) u32);

impl EnvId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Element type tags, ordered by the coercion lattice:
/// `null < logical < integer < double < complex < character < list`.
///
/// `Nil` denotes "absent" and never participates in unification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Ty {
    Nil,
    Null,
    Logical,
    Integer,
    Double,
    Complex,
    Character,
    List,
    Function,
    Environment,
    Promise,
}

impl Ty {
    /// Unifies two element types for mixed-type vector operations.
    #[must_use]
    pub fn unify(self, other: Self) -> Self {
        self.max(other)
    }

    /// Whether values of this type can flow through the trace pipeline.
    #[must_use]
    pub fn is_numeric_like(self) -> bool {
        matches!(self, Self::Logical | Self::Integer | Self::Double)
    }
}

/// A function value: compiled prototype plus defining environment.
#[derive(Debug)]
pub struct Closure {
    pub proto: Rc<Prototype>,
    /// Lexical environment captured at `function` evaluation.
    pub env: EnvId,
}

/// A promise: a thunk captured at call time, forced on first read.
///
/// `Default` promises share this representation; the variant on [`Value`]
/// distinguishes them because defaults evaluate in the callee's environment.
#[derive(Debug)]
pub struct PromiseData {
    /// Compiled thunk for the unevaluated expression.
    pub proto: Rc<Prototype>,
    /// Environment the thunk evaluates in.
    pub env: EnvId,
    /// Binding the forced value replaces: the callee environment and the
    /// parameter name the promise was matched to.
    pub slot: (EnvId, StringId),
}

/// Attribute bag wrapping a base value.
///
/// Setting any attribute on a non-Object promotes it to an Object; removing
/// the last attribute does not demote (callers use `strip` for that).
#[derive(Debug, Clone)]
pub struct ObjectData {
    pub base: Value,
    /// Attribute name/value pairs in insertion order.
    pub attributes: Vec<(StringId, Value)>,
}

impl ObjectData {
    #[must_use]
    pub fn get(&self, name: StringId) -> Option<&Value> {
        self.attributes.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn set(&mut self, name: StringId, value: Value) {
        if let Some(entry) = self.attributes.iter_mut().find(|(n, _)| *n == name) {
            entry.1 = value;
        } else {
            self.attributes.push((name, value));
        }
    }

    pub fn remove(&mut self, name: StringId) {
        self.attributes.retain(|(n, _)| *n != name);
    }
}

/// Primary runtime value.
///
/// `Clone` is cheap: vector payloads are shared behind `Rc` and mutated
/// copy-on-write, which is exactly the language's value semantics.
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absent binding; produced by environment lookups of unbound names.
    /// Consuming a Nil raises "object not found".
    #[default]
    Nil,
    /// The null singleton.
    Null,
    Logical(Rc<Vec<u8>>),
    Integer(Rc<Vec<i64>>),
    Double(Rc<Vec<f64>>),
    Complex(Rc<Vec<Complex64>>),
    Character(Rc<Vec<StringId>>),
    List(Rc<Vec<Value>>),
    Function(Rc<Closure>),
    Environment(EnvId),
    Promise(Rc<PromiseData>),
    /// Like Promise but for default-argument expressions, which evaluate in
    /// the callee's environment.
    Default(Rc<PromiseData>),
    /// Base value plus attribute bag.
    Object(Rc<ObjectData>),
}

impl Value {
    // ---- constructors ----

    #[must_use]
    pub fn lgl(b: bool) -> Self {
        Self::Logical(Rc::new(vec![u8::from(b)]))
    }

    #[must_use]
    pub fn na_lgl() -> Self {
        Self::Logical(Rc::new(vec![NA_LOGICAL]))
    }

    #[must_use]
    pub fn int(i: i64) -> Self {
        Self::Integer(Rc::new(vec![i]))
    }

    #[must_use]
    pub fn dbl(x: f64) -> Self {
        Self::Double(Rc::new(vec![x]))
    }

    #[must_use]
    pub fn cplx(z: Complex64) -> Self {
        Self::Complex(Rc::new(vec![z]))
    }

    #[must_use]
    pub fn chr(id: StringId) -> Self {
        Self::Character(Rc::new(vec![id]))
    }

    #[must_use]
    pub fn list(values: Vec<Self>) -> Self {
        Self::List(Rc::new(values))
    }

    /// Constructs an empty vector of the given element type and length,
    /// filled with NA (zero for `seq`-style callers to overwrite).
    #[must_use]
    pub fn empty_of(ty: Ty, len: usize) -> Self {
        match ty {
            Ty::Logical => Self::Logical(Rc::new(vec![NA_LOGICAL; len])),
            Ty::Integer => Self::Integer(Rc::new(vec![NA_INTEGER; len])),
            Ty::Double => Self::Double(Rc::new(vec![na_real(); len])),
            Ty::Complex => Self::Complex(Rc::new(vec![Complex64::new(na_real(), 0.0); len])),
            Ty::Character => Self::Character(Rc::new(vec![NA_STRING; len])),
            Ty::List => Self::List(Rc::new(vec![Self::Null; len])),
            _ => Self::Null,
        }
    }

    // ---- header ----

    /// The type tag. Objects report their base type; S3 dispatch looks at the
    /// class attribute separately.
    #[must_use]
    pub fn ty(&self) -> Ty {
        match self {
            Self::Nil => Ty::Nil,
            Self::Null => Ty::Null,
            Self::Logical(_) => Ty::Logical,
            Self::Integer(_) => Ty::Integer,
            Self::Double(_) => Ty::Double,
            Self::Complex(_) => Ty::Complex,
            Self::Character(_) => Ty::Character,
            Self::List(_) => Ty::List,
            Self::Function(_) => Ty::Function,
            Self::Environment(_) => Ty::Environment,
            Self::Promise(_) | Self::Default(_) => Ty::Promise,
            Self::Object(o) => o.base.ty(),
        }
    }

    /// Vector length. Null and Nil have length 0; non-vector values length 1.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Nil | Self::Null => 0,
            Self::Logical(v) => v.len(),
            Self::Integer(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::Complex(v) => v.len(),
            Self::Character(v) => v.len(),
            Self::List(v) => v.len(),
            Self::Object(o) => o.base.len(),
            _ => 1,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether this is an Object wrapper (attribute carrier).
    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    /// Strips any attribute wrapper, returning the base value.
    #[must_use]
    pub fn strip(&self) -> Self {
        match self {
            Self::Object(o) => o.base.clone(),
            other => other.clone(),
        }
    }

    // ---- attributes ----

    /// Reads an attribute; Null when absent or when the value is no Object.
    #[must_use]
    pub fn attr(&self, name: StringId) -> Self {
        match self {
            Self::Object(o) => o.get(name).cloned().unwrap_or(Self::Null),
            _ => Self::Null,
        }
    }

    /// Sets an attribute, promoting a non-Object to an Object wrapper.
    /// Setting Null removes the attribute; an Object left with no attributes
    /// collapses back to its base.
    #[must_use]
    pub fn with_attr(&self, name: StringId, value: Self) -> Self {
        let mut data = match self {
            Self::Object(o) => (**o).clone(),
            other => ObjectData {
                base: other.clone(),
                attributes: Vec::with_capacity(1),
            },
        };
        if matches!(value, Self::Null) {
            data.remove(name);
        } else {
            data.set(name, value);
        }
        if data.attributes.is_empty() {
            data.base
        } else {
            Self::Object(Rc::new(data))
        }
    }

    /// The first element of the class attribute, if any.
    #[must_use]
    pub fn class(&self) -> Option<StringId> {
        match self.attr(crate::intern::CLASS_ATTR) {
            Self::Character(v) => v.first().copied(),
            _ => None,
        }
    }

    // ---- scalar access ----

    /// Condition test for `jc`/`ifelse`: first element as bool.
    /// Errors on zero length, NA, and non-coercible types.
    pub fn as_condition(&self) -> RunResult<bool> {
        match self.strip() {
            Self::Logical(v) => match v.first() {
                Some(&b) if b != NA_LOGICAL => Ok(b == 1),
                Some(_) => Err(RunError::new(ErrorKind::Type, "missing value where TRUE/FALSE needed")),
                None => Err(RunError::new(ErrorKind::Type, "argument is of length zero")),
            },
            Self::Integer(v) => match v.first() {
                Some(&i) if i != NA_INTEGER => Ok(i != 0),
                Some(_) => Err(RunError::new(ErrorKind::Type, "missing value where TRUE/FALSE needed")),
                None => Err(RunError::new(ErrorKind::Type, "argument is of length zero")),
            },
            Self::Double(v) => match v.first() {
                Some(&x) if !double_is_na(x) => Ok(x != 0.0),
                Some(_) => Err(RunError::new(ErrorKind::Type, "missing value where TRUE/FALSE needed")),
                None => Err(RunError::new(ErrorKind::Type, "argument is of length zero")),
            },
            other => Err(RunError::type_error(format!(
                "argument of type {} is not interpretable as logical",
                other.ty()
            ))),
        }
    }

    /// First element as an i64 index-like scalar, NA-propagating to None.
    #[must_use]
    pub fn as_integer_scalar(&self) -> Option<i64> {
        match self.strip() {
            Self::Integer(v) => v.first().copied().filter(|&i| i != NA_INTEGER),
            Self::Double(v) => v.first().copied().filter(|x| !double_is_na(*x)).map(|x| x as i64),
            Self::Logical(v) => v.first().copied().filter(|&b| b != NA_LOGICAL).map(i64::from),
            _ => None,
        }
    }

    /// First element as a double, NA-propagating to None.
    #[must_use]
    pub fn as_double_scalar(&self) -> Option<f64> {
        match self.strip() {
            Self::Double(v) => v.first().copied().filter(|x| !double_is_na(*x)),
            Self::Integer(v) => v.first().copied().filter(|&i| i != NA_INTEGER).map(|i| i as f64),
            Self::Logical(v) => v.first().copied().filter(|&b| b != NA_LOGICAL).map(f64::from),
            _ => None,
        }
    }

    /// Extracts element `i` (0-based) as a length-1 value of the same type.
    /// Out-of-range reads produce the type's NA, matching `[` semantics;
    /// `[[` callers bounds-check first.
    #[must_use]
    pub fn element(&self, i: usize) -> Self {
        match self.strip() {
            Self::Logical(v) => Self::Logical(Rc::new(vec![v.get(i).copied().unwrap_or(NA_LOGICAL)])),
            Self::Integer(v) => Self::Integer(Rc::new(vec![v.get(i).copied().unwrap_or(NA_INTEGER)])),
            Self::Double(v) => Self::Double(Rc::new(vec![v.get(i).copied().unwrap_or_else(na_real)])),
            Self::Complex(v) => {
                Self::Complex(Rc::new(vec![v.get(i).copied().unwrap_or_else(|| Complex64::new(na_real(), 0.0))]))
            }
            Self::Character(v) => Self::Character(Rc::new(vec![v.get(i).copied().unwrap_or(NA_STRING)])),
            Self::List(v) => v.get(i).cloned().unwrap_or(Self::Null),
            _ => Self::Null,
        }
    }

    // ---- coercion ----

    /// Coerces to the target element type with NA propagation.
    ///
    /// The precedence `null < logical < integer < double < complex <
    /// character < list` means coercion upward never loses information;
    /// downward casts are not provided.
    pub fn coerce(&self, target: Ty, interns: &mut Interns) -> RunResult<Self> {
        let base = self.strip();
        if base.ty() == target {
            return Ok(base);
        }
        match target {
            Ty::Logical => match &base {
                Self::Null => Ok(Self::Logical(Rc::new(vec![]))),
                _ => Err(coercion_error(base.ty(), target)),
            },
            Ty::Integer => match &base {
                Self::Null => Ok(Self::Integer(Rc::new(vec![]))),
                Self::Logical(v) => Ok(Self::Integer(Rc::new(v.iter().map(|&b| logical_to_integer(b)).collect()))),
                _ => Err(coercion_error(base.ty(), target)),
            },
            Ty::Double => match &base {
                Self::Null => Ok(Self::Double(Rc::new(vec![]))),
                Self::Logical(v) => Ok(Self::Double(Rc::new(v.iter().map(|&b| logical_to_double(b)).collect()))),
                Self::Integer(v) => Ok(Self::Double(Rc::new(v.iter().map(|&i| integer_to_double(i)).collect()))),
                _ => Err(coercion_error(base.ty(), target)),
            },
            Ty::Complex => match &base {
                Self::Null => Ok(Self::Complex(Rc::new(vec![]))),
                Self::Logical(v) => {
                    Ok(Self::Complex(Rc::new(v.iter().map(|&b| Complex64::new(logical_to_double(b), 0.0)).collect())))
                }
                Self::Integer(v) => {
                    Ok(Self::Complex(Rc::new(v.iter().map(|&i| Complex64::new(integer_to_double(i), 0.0)).collect())))
                }
                Self::Double(v) => Ok(Self::Complex(Rc::new(v.iter().map(|&x| Complex64::new(x, 0.0)).collect()))),
                _ => Err(coercion_error(base.ty(), target)),
            },
            Ty::Character => {
                let formatted: Vec<StringId> = match &base {
                    Self::Null => vec![],
                    Self::Logical(v) => v
                        .iter()
                        .map(|&b| match b {
                            NA_LOGICAL => NA_STRING,
                            0 => interns.intern("FALSE"),
                            _ => interns.intern("TRUE"),
                        })
                        .collect(),
                    Self::Integer(v) => v
                        .iter()
                        .map(|&i| {
                            if i == NA_INTEGER {
                                NA_STRING
                            } else {
                                interns.intern(&i.to_string())
                            }
                        })
                        .collect(),
                    // only the exact NA bit pattern becomes the NA string;
                    // ordinary NaN keeps its text
                    Self::Double(v) => v
                        .iter()
                        .map(|&x| {
                            if is_na_real(x) {
                                NA_STRING
                            } else {
                                interns.intern(ryu::Buffer::new().format(x))
                            }
                        })
                        .collect(),
                    Self::Complex(v) => v
                        .iter()
                        .map(|z| {
                            if is_na_real(z.re) {
                                NA_STRING
                            } else {
                                let mut re = ryu::Buffer::new();
                                let mut im = ryu::Buffer::new();
                                interns.intern(&format!("{}+{}i", re.format(z.re), im.format(z.im)))
                            }
                        })
                        .collect(),
                    _ => return Err(coercion_error(base.ty(), target)),
                };
                Ok(Self::Character(Rc::new(formatted)))
            }
            Ty::List => {
                let n = base.len();
                Ok(Self::List(Rc::new((0..n).map(|i| base.element(i)).collect())))
            }
            _ => Err(coercion_error(base.ty(), target)),
        }
    }

    // ---- environment capture ----

    /// Whether returning this value out of a frame that owns `env` is safe
    /// for recycling the environment: the value must not reference `env`
    /// through a closure, promise, environment handle, or nested list.
    #[must_use]
    pub fn is_closure_safe(&self, env: EnvId) -> bool {
        match self {
            Self::Function(c) => c.env != env,
            Self::Environment(id) => *id != env,
            Self::Promise(p) | Self::Default(p) => p.env != env && p.slot.0 != env,
            Self::List(items) => items.iter().all(|v| v.is_closure_safe(env)),
            Self::Object(o) => {
                o.base.is_closure_safe(env) && o.attributes.iter().all(|(_, v)| v.is_closure_safe(env))
            }
            _ => true,
        }
    }
}

// ---- element-level casts, shared with the arith kernels and the trace
// executor ----

#[inline]
#[must_use]
pub fn logical_to_integer(b: u8) -> i64 {
    if b == NA_LOGICAL { NA_INTEGER } else { i64::from(b) }
}

#[inline]
#[must_use]
pub fn logical_to_double(b: u8) -> f64 {
    if b == NA_LOGICAL { na_real() } else { f64::from(b) }
}

#[inline]
#[must_use]
pub fn integer_to_double(i: i64) -> f64 {
    if i == NA_INTEGER { na_real() } else { i as f64 }
}

#[inline]
#[must_use]
pub fn double_to_logical(x: f64) -> u8 {
    if double_is_na(x) {
        NA_LOGICAL
    } else {
        u8::from(x != 0.0)
    }
}

fn coercion_error(from: Ty, to: Ty) -> RunError {
    RunError::type_error(format!("cannot coerce type {from} to {to}"))
}

/// Structural equality used by tests and `deparse` round trips: bitwise for
/// doubles so NA and NaN compare by pattern, recursive for lists and objects.
#[must_use]
pub fn structurally_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) | (Value::Null, Value::Null) => true,
        (Value::Logical(x), Value::Logical(y)) => x == y,
        (Value::Integer(x), Value::Integer(y)) => x == y,
        (Value::Double(x), Value::Double(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| a.to_bits() == b.to_bits())
        }
        (Value::Complex(x), Value::Complex(y)) => {
            x.len() == y.len()
                && x.iter()
                    .zip(y.iter())
                    .all(|(a, b)| a.re.to_bits() == b.re.to_bits() && a.im.to_bits() == b.im.to_bits())
        }
        (Value::Character(x), Value::Character(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| structurally_equal(a, b))
        }
        (Value::Environment(x), Value::Environment(y)) => x == y,
        (Value::Object(x), Value::Object(y)) => {
            structurally_equal(&x.base, &y.base)
                && x.attributes.len() == y.attributes.len()
                && x.attributes
                    .iter()
                    .zip(y.attributes.iter())
                    .all(|((an, av), (bn, bv))| an == bn && structurally_equal(av, bv))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::CLASS_ATTR;

    #[test]
    fn coercion_lattice_order() {
        assert!(Ty::Null < Ty::Logical);
        assert!(Ty::Logical < Ty::Integer);
        assert!(Ty::Integer < Ty::Double);
        assert!(Ty::Double < Ty::Complex);
        assert!(Ty::Complex < Ty::Character);
        assert!(Ty::Character < Ty::List);
        assert_eq!(Ty::Integer.unify(Ty::Double), Ty::Double);
    }

    #[test]
    fn na_double_is_nan_with_payload() {
        let na = na_real();
        assert!(na.is_nan());
        assert!(is_na_real(na));
        assert!(double_is_na(na));
        // a plain NaN is "na" for is.na but not the NA sentinel
        assert!(double_is_na(f64::NAN));
        assert!(!is_na_real(f64::NAN));
    }

    #[test]
    fn logical_to_integer_propagates_na() {
        assert_eq!(logical_to_integer(1), 1);
        assert_eq!(logical_to_integer(0), 0);
        assert_eq!(logical_to_integer(NA_LOGICAL), NA_INTEGER);
    }

    #[test]
    fn attribute_set_promotes_and_strip_demotes() {
        let mut interns = Interns::new();
        let cls = interns.intern("foo");
        let x = Value::int(1);
        assert!(!x.is_object());
        let tagged = x.with_attr(CLASS_ATTR, Value::chr(cls));
        assert!(tagged.is_object());
        assert_eq!(tagged.class(), Some(cls));
        assert_eq!(tagged.ty(), Ty::Integer);
        let stripped = tagged.strip();
        assert!(!stripped.is_object());
        assert!(structurally_equal(&stripped, &Value::int(1)));
    }

    #[test]
    fn removing_last_attribute_collapses_object() {
        let x = Value::int(1).with_attr(CLASS_ATTR, Value::chr(NA_STRING));
        let collapsed = x.with_attr(CLASS_ATTR, Value::Null);
        assert!(!collapsed.is_object());
    }

    #[test]
    fn coerce_integer_to_double_preserves_na() {
        let mut interns = Interns::new();
        let v = Value::Integer(Rc::new(vec![1, NA_INTEGER, 3]));
        let d = v.coerce(Ty::Double, &mut interns).unwrap();
        match d {
            Value::Double(xs) => {
                assert_eq!(xs[0], 1.0);
                assert!(double_is_na(xs[1]));
                assert_eq!(xs[2], 3.0);
            }
            other => panic!("expected double, got {other:?}"),
        }
    }

    #[test]
    fn condition_rejects_na_and_empty() {
        assert!(Value::lgl(true).as_condition().unwrap());
        assert!(!Value::int(0).as_condition().unwrap());
        assert!(Value::na_lgl().as_condition().is_err());
        assert!(Value::Null.as_condition().is_err());
    }
}
