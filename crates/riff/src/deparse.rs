//! `deparse` and its inverse for the printable subset of values.
//!
//! `deparse` renders vectors, lists, and attribute-carrying objects as source
//! text (`c(1L, 2L)`, `structure(1, class = "foo")`); [`read_literal`] parses
//! that text back. For every printable value the round trip reproduces a
//! structurally equal value. Functions, environments, and promises are not
//! printable; they deparse to a diagnostic form the reader rejects.
//!
//! The NA double is distinguished from ordinary NaN by its exact bit
//! pattern: only [`is_na_real`] values spell `NA_real_`, every other NaN
//! spells `NaN` (and canonicalizes to the standard quiet NaN on the way
//! back in).
//!
//! The full surface parser lives outside this crate; this reader handles only
//! deparse output.

use std::fmt::Write;
use std::rc::Rc;

use num_complex::Complex64;

use crate::{
    error::{ErrorKind, RunError, RunResult},
    intern::{Interns, NA_STRING, StringId},
    value::{NA_INTEGER, NA_LOGICAL, Ty, Value, is_na_real, na_real},
};

/// Renders a value as parseable source text.
#[must_use]
pub fn deparse(value: &Value, interns: &Interns) -> String {
    let mut out = String::new();
    deparse_into(value, interns, &mut out);
    out
}

fn deparse_into(value: &Value, interns: &Interns, out: &mut String) {
    match value {
        Value::Nil => out.push_str("<nil>"),
        Value::Null => out.push_str("NULL"),
        Value::Logical(v) => deparse_vector(out, v, "logical(0)", |out, &b| {
            out.push_str(match b {
                0 => "FALSE",
                NA_LOGICAL => "NA",
                _ => "TRUE",
            });
        }),
        Value::Integer(v) => deparse_vector(out, v, "integer(0)", |out, &i| {
            if i == NA_INTEGER {
                out.push_str("NA_integer_");
            } else {
                let _ = write!(out, "{i}L");
            }
        }),
        Value::Double(v) => deparse_vector(out, v, "double(0)", |out, &x| push_double(out, x)),
        Value::Complex(v) => deparse_vector(out, v, "complex(0)", |out, z| push_complex(out, z)),
        Value::Character(v) => deparse_vector(out, v, "character(0)", |out, &id| push_string(out, id, interns)),
        Value::List(items) => {
            out.push_str("list(");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                deparse_into(item, interns, out);
            }
            out.push(')');
        }
        Value::Function(_) => out.push_str("<function>"),
        Value::Environment(_) => out.push_str("<environment>"),
        Value::Promise(_) | Value::Default(_) => out.push_str("<promise>"),
        Value::Object(o) => {
            out.push_str("structure(");
            deparse_into(&o.base, interns, out);
            for (name, attr) in &o.attributes {
                let _ = write!(out, ", {} = ", interns.get(*name));
                deparse_into(attr, interns, out);
            }
            out.push(')');
        }
    }
}

fn deparse_vector<T>(out: &mut String, v: &[T], empty: &str, mut element: impl FnMut(&mut String, &T)) {
    match v {
        [] => out.push_str(empty),
        [single] => element(out, single),
        _ => {
            out.push_str("c(");
            for (i, item) in v.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                element(out, item);
            }
            out.push(')');
        }
    }
}

fn push_double(out: &mut String, x: f64) {
    if is_na_real(x) {
        out.push_str("NA_real_");
    } else if x.is_nan() {
        out.push_str("NaN");
    } else if x.is_infinite() {
        out.push_str(if x > 0.0 { "Inf" } else { "-Inf" });
    } else {
        let mut buf = ryu::Buffer::new();
        out.push_str(buf.format(x));
    }
}

fn push_complex(out: &mut String, z: &Complex64) {
    if is_na_real(z.re) {
        out.push_str("NA_complex_");
        return;
    }
    push_double_part(out, z.re);
    if z.im >= 0.0 || z.im.is_nan() {
        out.push('+');
    }
    push_double_part(out, z.im);
    out.push('i');
}

/// One component of a complex literal; the NA spelling is carried by the
/// whole number, not its parts.
fn push_double_part(out: &mut String, x: f64) {
    if x.is_nan() {
        out.push_str("NaN");
    } else if x.is_infinite() {
        out.push_str(if x > 0.0 { "Inf" } else { "-Inf" });
    } else {
        let mut buf = ryu::Buffer::new();
        out.push_str(buf.format(x));
    }
}

fn push_string(out: &mut String, id: StringId, interns: &Interns) {
    if id.is_na() {
        out.push_str("NA_character_");
        return;
    }
    out.push('"');
    for c in interns.get(id).chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
}

/// Parses deparse output back into a value.
pub fn read_literal(text: &str, interns: &mut Interns) -> RunResult<Value> {
    let mut reader = Reader {
        bytes: text.as_bytes(),
        pos: 0,
    };
    let value = reader.value(interns)?;
    reader.skip_ws();
    if reader.pos != reader.bytes.len() {
        return Err(reader.error("trailing input"));
    }
    Ok(value)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn error(&self, message: &str) -> RunError {
        RunError::new(ErrorKind::Invalid, format!("literal parse error at byte {}: {message}", self.pos))
    }

    fn skip_ws(&mut self) {
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, expected: u8) -> RunResult<()> {
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}'", expected as char)))
        }
    }

    fn try_keyword(&mut self, kw: &str) -> bool {
        let end = self.pos + kw.len();
        if self.bytes.get(self.pos..end) == Some(kw.as_bytes())
            && !self.bytes.get(end).is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            self.pos = end;
            true
        } else {
            false
        }
    }

    /// Consumes an exact byte run with no word-boundary check; complex-part
    /// tokens sit directly against the trailing `i`.
    fn eat_bytes(&mut self, token: &[u8]) -> bool {
        if self.bytes.get(self.pos..self.pos + token.len()) == Some(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self, interns: &mut Interns) -> RunResult<Value> {
        self.skip_ws();
        if self.try_keyword("NULL") {
            return Ok(Value::Null);
        }
        if self.try_keyword("TRUE") {
            return Ok(Value::lgl(true));
        }
        if self.try_keyword("FALSE") {
            return Ok(Value::lgl(false));
        }
        if self.try_keyword("NA_integer_") {
            return Ok(Value::int(NA_INTEGER));
        }
        if self.try_keyword("NA_real_") {
            return Ok(Value::dbl(na_real()));
        }
        if self.try_keyword("NA_complex_") {
            return Ok(Value::cplx(Complex64::new(na_real(), 0.0)));
        }
        if self.try_keyword("NA_character_") {
            return Ok(Value::chr(NA_STRING));
        }
        if self.try_keyword("NA") {
            return Ok(Value::na_lgl());
        }
        if self.try_keyword("Inf") {
            return Ok(self.complex_tail(f64::INFINITY).unwrap_or_else(|| Value::dbl(f64::INFINITY)));
        }
        if self.try_keyword("-Inf") {
            return Ok(self.complex_tail(f64::NEG_INFINITY).unwrap_or_else(|| Value::dbl(f64::NEG_INFINITY)));
        }
        if self.try_keyword("NaN") {
            return Ok(self.complex_tail(f64::NAN).unwrap_or_else(|| Value::dbl(f64::NAN)));
        }
        if self.try_keyword("logical(0)") {
            return Ok(Value::Logical(Rc::new(vec![])));
        }
        if self.try_keyword("integer(0)") {
            return Ok(Value::Integer(Rc::new(vec![])));
        }
        if self.try_keyword("double(0)") {
            return Ok(Value::Double(Rc::new(vec![])));
        }
        if self.try_keyword("complex(0)") {
            return Ok(Value::Complex(Rc::new(vec![])));
        }
        if self.try_keyword("character(0)") {
            return Ok(Value::Character(Rc::new(vec![])));
        }
        if self.try_keyword("c") {
            return self.combine(interns);
        }
        if self.try_keyword("list") {
            return self.list(interns);
        }
        if self.try_keyword("structure") {
            return self.structure(interns);
        }
        match self.peek() {
            Some(b'"') => self.string(interns),
            Some(b'-' | b'+' | b'0'..=b'9' | b'.') => self.number(),
            _ => Err(self.error("expected a literal")),
        }
    }

    fn combine(&mut self, interns: &mut Interns) -> RunResult<Value> {
        let items = self.arguments(interns)?;
        combine_values(&items, interns)
    }

    fn list(&mut self, interns: &mut Interns) -> RunResult<Value> {
        let items = self.arguments(interns)?;
        Ok(Value::list(items))
    }

    fn structure(&mut self, interns: &mut Interns) -> RunResult<Value> {
        self.eat(b'(')?;
        let mut value = self.value(interns)?;
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b',') => {
                    self.pos += 1;
                    self.skip_ws();
                    let name_start = self.pos;
                    while self.peek().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.') {
                        self.pos += 1;
                    }
                    if self.pos == name_start {
                        return Err(self.error("expected attribute name"));
                    }
                    let name = std::str::from_utf8(&self.bytes[name_start..self.pos])
                        .map_err(|_| self.error("attribute name is not utf-8"))?
                        .to_owned();
                    self.skip_ws();
                    self.eat(b'=')?;
                    let attr = self.value(interns)?;
                    let id = interns.intern(&name);
                    value = value.with_attr(id, attr);
                }
                Some(b')') => {
                    self.pos += 1;
                    return Ok(value);
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }

    fn arguments(&mut self, interns: &mut Interns) -> RunResult<Vec<Value>> {
        self.eat(b'(')?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b')') {
            self.pos += 1;
            return Ok(items);
        }
        loop {
            items.push(self.value(interns)?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b')') => {
                    self.pos += 1;
                    return Ok(items);
                }
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
    }

    fn string(&mut self, interns: &mut Interns) -> RunResult<Value> {
        self.eat(b'"')?;
        let mut text = String::new();
        loop {
            match self.peek() {
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Value::chr(interns.intern(&text)));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let escaped = self.peek().ok_or_else(|| self.error("unterminated escape"))?;
                    text.push(match escaped {
                        b'n' => '\n',
                        b't' => '\t',
                        b'"' => '"',
                        b'\\' => '\\',
                        _ => return Err(self.error("unknown escape")),
                    });
                    self.pos += 1;
                }
                Some(_) => {
                    let start = self.pos;
                    while self.peek().is_some_and(|b| b != b'"' && b != b'\\') {
                        self.pos += 1;
                    }
                    text.push_str(
                        std::str::from_utf8(&self.bytes[start..self.pos])
                            .map_err(|_| self.error("string is not utf-8"))?,
                    );
                }
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn number(&mut self) -> RunResult<Value> {
        let start = self.pos;
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        let mut saw_dot_or_exp = false;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => self.pos += 1,
                b'.' => {
                    saw_dot_or_exp = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    saw_dot_or_exp = true;
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'-' | b'+')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
        let text = std::str::from_utf8(&self.bytes[start..self.pos]).map_err(|_| self.error("bad number"))?;
        // integer literal
        if self.peek() == Some(b'L') && !saw_dot_or_exp {
            self.pos += 1;
            let i: i64 = text.parse().map_err(|_| self.error("bad integer literal"))?;
            return Ok(Value::int(i));
        }
        let re: f64 = text.parse().map_err(|_| self.error("bad numeric literal"))?;
        // pure imaginary: 2i
        if self.peek() == Some(b'i') {
            self.pos += 1;
            return Ok(Value::cplx(Complex64::new(0.0, re)));
        }
        Ok(self.complex_tail(re).unwrap_or_else(|| Value::dbl(re)))
    }

    /// Parses the `±im i` tail of a complex literal (`1+2i`, `1-Infi`,
    /// `0.0+NaNi`), if present. Rolls back and returns None when the sign
    /// does not introduce an imaginary part.
    fn complex_tail(&mut self, re: f64) -> Option<Value> {
        if !matches!(self.peek(), Some(b'-' | b'+')) {
            return None;
        }
        let mark = self.pos;
        let sign = if self.peek() == Some(b'-') { -1.0 } else { 1.0 };
        self.pos += 1;
        let im = if self.eat_bytes(b"NaN") {
            Some(f64::NAN)
        } else if self.eat_bytes(b"Inf") {
            Some(f64::INFINITY)
        } else {
            let im_start = self.pos;
            while self.peek().is_some_and(|b| b.is_ascii_digit() || b == b'.' || b == b'e' || b == b'E') {
                self.pos += 1;
            }
            if self.pos > im_start {
                std::str::from_utf8(&self.bytes[im_start..self.pos])
                    .ok()
                    .and_then(|t| t.parse().ok())
            } else {
                None
            }
        };
        match im {
            Some(im) if self.peek() == Some(b'i') => {
                self.pos += 1;
                Some(Value::cplx(Complex64::new(re, sign * im)))
            }
            _ => {
                self.pos = mark;
                None
            }
        }
    }
}

/// `c(...)` semantics: unify element types along the coercion lattice and
/// concatenate. Null contributes nothing.
pub fn combine_values(items: &[Value], interns: &mut Interns) -> RunResult<Value> {
    let mut ty = Ty::Null;
    for item in items {
        let item_ty = item.strip().ty();
        if item_ty == Ty::Null {
            continue;
        }
        ty = ty.unify(item_ty);
    }
    if ty == Ty::Null {
        return Ok(Value::Null);
    }
    let mut parts: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        if matches!(item.strip(), Value::Null) {
            continue;
        }
        parts.push(item.coerce(ty, interns)?);
    }
    let total: usize = parts.iter().map(Value::len).sum();
    Ok(match ty {
        Ty::Logical => {
            let mut out = Vec::with_capacity(total);
            for p in &parts {
                if let Value::Logical(v) = p {
                    out.extend_from_slice(v);
                }
            }
            Value::Logical(Rc::new(out))
        }
        Ty::Integer => {
            let mut out = Vec::with_capacity(total);
            for p in &parts {
                if let Value::Integer(v) = p {
                    out.extend_from_slice(v);
                }
            }
            Value::Integer(Rc::new(out))
        }
        Ty::Double => {
            let mut out = Vec::with_capacity(total);
            for p in &parts {
                if let Value::Double(v) = p {
                    out.extend_from_slice(v);
                }
            }
            Value::Double(Rc::new(out))
        }
        Ty::Complex => {
            let mut out = Vec::with_capacity(total);
            for p in &parts {
                if let Value::Complex(v) = p {
                    out.extend_from_slice(v);
                }
            }
            Value::Complex(Rc::new(out))
        }
        Ty::Character => {
            let mut out = Vec::with_capacity(total);
            for p in &parts {
                if let Value::Character(v) = p {
                    out.extend_from_slice(v);
                }
            }
            Value::Character(Rc::new(out))
        }
        Ty::List => {
            let mut out = Vec::with_capacity(total);
            for p in &parts {
                if let Value::List(v) = p {
                    out.extend_from_slice(v);
                }
            }
            Value::List(Rc::new(out))
        }
        _ => return Err(RunError::type_error(format!("cannot combine values of type {ty}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::structurally_equal;

    fn round_trip(v: &Value) {
        let mut interns = Interns::new();
        let text = deparse(v, &interns);
        let back = read_literal(&text, &mut interns).unwrap_or_else(|e| panic!("{text}: {e}"));
        assert!(structurally_equal(v, &back), "{text} round-tripped to {back:?}");
    }

    #[test]
    fn scalars_round_trip() {
        round_trip(&Value::int(42));
        round_trip(&Value::int(NA_INTEGER));
        round_trip(&Value::dbl(1.5));
        round_trip(&Value::dbl(na_real()));
        round_trip(&Value::lgl(true));
        round_trip(&Value::na_lgl());
        round_trip(&Value::Null);
        round_trip(&Value::cplx(Complex64::new(1.0, -2.0)));
    }

    #[test]
    fn vectors_round_trip() {
        round_trip(&Value::Integer(Rc::new(vec![1, 2, NA_INTEGER])));
        round_trip(&Value::Double(Rc::new(vec![1.0, -0.5, na_real()])));
        round_trip(&Value::Logical(Rc::new(vec![1, 0, NA_LOGICAL])));
        round_trip(&Value::Integer(Rc::new(vec![])));
        round_trip(&Value::Double(Rc::new(vec![])));
    }

    #[test]
    fn strings_round_trip_with_escapes() {
        let mut interns = Interns::new();
        let id = interns.intern("a \"quoted\"\nline\\");
        let v = Value::chr(id);
        let text = deparse(&v, &interns);
        let back = read_literal(&text, &mut interns).unwrap();
        assert!(structurally_equal(&v, &back));
    }

    #[test]
    fn lists_and_structures_round_trip() {
        round_trip(&Value::list(vec![Value::int(1), Value::dbl(2.0), Value::Null]));
        let mut interns = Interns::new();
        let cls = interns.intern("foo");
        let obj = Value::int(1).with_attr(crate::intern::CLASS_ATTR, Value::chr(cls));
        let text = deparse(&obj, &interns);
        assert_eq!(text, "structure(1L, class = \"foo\")");
        let back = read_literal(&text, &mut interns).unwrap();
        assert!(structurally_equal(&obj, &back));
    }

    #[test]
    fn combine_unifies_types() {
        let mut interns = Interns::new();
        let v = combine_values(&[Value::int(1), Value::dbl(2.5)], &mut interns).unwrap();
        match v {
            Value::Double(xs) => assert_eq!(*xs, vec![1.0, 2.5]),
            other => panic!("expected double, got {other:?}"),
        }
    }

    #[test]
    fn na_double_and_plain_nan_stay_distinct() {
        let interns = Interns::new();
        assert_eq!(deparse(&Value::dbl(na_real()), &interns), "NA_real_");
        assert_eq!(deparse(&Value::dbl(f64::NAN), &interns), "NaN");
        round_trip(&Value::dbl(f64::NAN));
        round_trip(&Value::Double(Rc::new(vec![f64::NAN, na_real(), 1.0])));
    }

    #[test]
    fn nonfinite_complex_parts_round_trip() {
        round_trip(&Value::cplx(Complex64::new(f64::INFINITY, 2.0)));
        round_trip(&Value::cplx(Complex64::new(1.0, f64::NAN)));
        round_trip(&Value::cplx(Complex64::new(1.0, f64::NEG_INFINITY)));
        round_trip(&Value::cplx(Complex64::new(na_real(), 0.0)));
    }
}
