//! String interning for names and character-vector elements.
//!
//! The interner stores unique strings in a vector and hands out `StringId`
//! indices for cheap storage and comparison. Bytecode operands, environment
//! binding keys, and `Character` vector elements are all `StringId`s; the
//! actual text is needed only for error messages, `deparse`, and method-name
//! mangling.
//!
//! Id layout:
//! * 0 — the empty string (always pre-interned)
//! * 1–3 — attribute names the runtime itself consults (`class`, `names`, `dim`)
//! * 4.. — strings interned per thread, in first-seen order
//! * `u32::MAX` — the NA string sentinel (never a real table index)

use ahash::AHashMap;

/// Index into the string interner's storage.
///
/// Uses `u32` to save space. Bytecode operands encode a `StringId` as a
/// positive `i32`, so ids stay below `i32::MAX` in practice; the interner
/// would need two billion distinct names before that mattered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StringId(u32);

/// The empty string, pre-interned at index 0.
///
/// A distinguished value: unnamed arguments and empty dots names use it, and
/// it is never a valid variable name.
pub const EMPTY_STRING: StringId = StringId(0);

/// The NA string sentinel. Not a table index.
pub const NA_STRING: StringId = StringId(u32::MAX);

/// The `class` attribute name, pre-interned for S3 dispatch.
pub const CLASS_ATTR: StringId = StringId(1);

/// The `names` attribute name.
pub const NAMES_ATTR: StringId = StringId(2);

/// The `dim` attribute name.
pub const DIM_ATTR: StringId = StringId(3);

impl StringId {
    /// Reconstructs a StringId from a raw index, as stored in bytecode
    /// operands. The caller is responsible for validity.
    #[inline]
    #[must_use]
    pub fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this id is the NA string sentinel.
    #[inline]
    #[must_use]
    pub fn is_na(self) -> bool {
        self == NA_STRING
    }
}

/// Thread-owned intern table.
///
/// Populated by the compiler interface and by `Character` vector
/// construction; lookups during execution are needed only for error
/// messages, S3 method mangling, and output.
#[derive(Debug, Default)]
pub struct Interns {
    strings: Vec<String>,
    ids: AHashMap<String, StringId>,
}

impl Interns {
    /// Creates an interner with the empty string pre-interned at index 0.
    #[must_use]
    pub fn new() -> Self {
        let mut interns = Self {
            strings: Vec::with_capacity(64),
            ids: AHashMap::with_capacity(64),
        };
        let empty = interns.intern("");
        debug_assert_eq!(empty, EMPTY_STRING);
        debug_assert_eq!(interns.intern("class"), CLASS_ATTR);
        debug_assert_eq!(interns.intern("names"), NAMES_ATTR);
        debug_assert_eq!(interns.intern("dim"), DIM_ATTR);
        interns
    }

    /// Interns a string, returning the existing id if already present.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(&id) = self.ids.get(s) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("intern table overflow"));
        self.strings.push(s.to_owned());
        self.ids.insert(s.to_owned(), id);
        id
    }

    /// Returns the text for an id.
    ///
    /// The NA sentinel deparses as `NA_character_`; callers that need NA-aware
    /// formatting should check [`StringId::is_na`] first.
    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        if id.is_na() {
            "NA"
        } else {
            &self.strings[id.index()]
        }
    }

    /// Looks up a string without interning it.
    #[must_use]
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        self.ids.get(s).copied()
    }

    /// Number of interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Whether the table holds only the pre-interned empty string.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.len() <= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_id_zero() {
        let mut interns = Interns::new();
        assert_eq!(interns.intern(""), EMPTY_STRING);
        assert_eq!(interns.get(EMPTY_STRING), "");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut interns = Interns::new();
        let a = interns.intern("x");
        let b = interns.intern("x");
        assert_eq!(a, b);
        assert_eq!(interns.get(a), "x");
    }

    #[test]
    fn distinct_strings_get_distinct_ids() {
        let mut interns = Interns::new();
        let a = interns.intern("x");
        let b = interns.intern("y");
        assert_ne!(a, b);
    }

    #[test]
    fn na_sentinel_is_not_a_table_index() {
        let interns = Interns::new();
        assert!(NA_STRING.is_na());
        assert_eq!(interns.get(NA_STRING), "NA");
    }
}
