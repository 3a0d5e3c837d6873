//! Environments: ordered name→value mappings with lexical and dynamic
//! parent chains.
//!
//! All environments live in a thread-owned arena and are referenced by
//! [`EnvId`]. Closures, frames, and IR nodes hold indices, not owning
//! references, which sidesteps the cyclic closure↔environment graph without
//! a garbage collector. Frame-owned environments are recycled through a free
//! list when a call returns a closure-safe value.
//!
//! Lookups never force promises: a binding holding a Promise or Default is
//! returned uninterpreted, and only the interpreter decides to force.

use indexmap::IndexMap;

use crate::{
    intern::StringId,
    value::{EnvId, Value},
};

/// An argument bound into the dots slot: optional name plus value (usually a
/// promise). `..1`, `..2`, … index this sequence in order.
#[derive(Debug, Clone)]
pub struct DotArg {
    pub name: Option<StringId>,
    pub value: Value,
}

type Bindings = IndexMap<StringId, Value, ahash::RandomState>;

/// A single environment.
#[derive(Debug, Default)]
pub struct Environment {
    bindings: Bindings,
    /// Static scope captured at function creation; nil at the global.
    lexical: Option<EnvId>,
    /// Caller's environment at invocation; nil at the global.
    dynamic: Option<EnvId>,
    /// The `...` arguments, in match order.
    dots: Vec<DotArg>,
    /// Reified call expression (a list value), Null when absent.
    call: Value,
}

impl Environment {
    pub fn lexical(&self) -> Option<EnvId> {
        self.lexical
    }

    pub fn dynamic(&self) -> Option<EnvId> {
        self.dynamic
    }

    pub fn dots(&self) -> &[DotArg] {
        &self.dots
    }

    pub fn set_dots(&mut self, dots: Vec<DotArg>) {
        self.dots = dots;
    }

    pub fn call(&self) -> &Value {
        &self.call
    }

    pub fn set_call(&mut self, call: Value) {
        self.call = call;
    }

    /// Binds a name, replacing any existing binding.
    pub fn assign(&mut self, name: StringId, value: Value) {
        self.bindings.insert(name, value);
    }

    /// Reads a binding; Nil if unbound. Promises come back uninterpreted.
    pub fn get(&self, name: StringId) -> Value {
        self.bindings.get(&name).cloned().unwrap_or(Value::Nil)
    }

    /// Borrowing read used on hot interpreter paths.
    pub fn get_ref(&self, name: StringId) -> Option<&Value> {
        self.bindings.get(&name)
    }

    /// Whether the name is bound at all (promise or not).
    pub fn is_bound(&self, name: StringId) -> bool {
        self.bindings.contains_key(&name)
    }

    /// Removes a binding; true if one existed.
    pub fn rm(&mut self, name: StringId) -> bool {
        self.bindings.shift_remove(&name).is_some()
    }

    /// Binding names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = StringId> + '_ {
        self.bindings.keys().copied()
    }

    fn reset(&mut self, lexical: Option<EnvId>, dynamic: Option<EnvId>) {
        self.bindings.clear();
        self.dots.clear();
        self.call = Value::default();
        self.lexical = lexical;
        self.dynamic = dynamic;
    }
}

/// Thread-owned arena of environments with a recycling free list.
#[derive(Debug, Default)]
pub struct EnvArena {
    slots: Vec<Environment>,
    free: Vec<EnvId>,
}

impl EnvArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an environment, reusing a freed slot when one exists.
    pub fn alloc(&mut self, lexical: Option<EnvId>, dynamic: Option<EnvId>) -> EnvId {
        if let Some(id) = self.free.pop() {
            self.slots[id.index()].reset(lexical, dynamic);
            id
        } else {
            let id = EnvId(u32::try_from(self.slots.len()).expect("environment arena overflow"));
            self.slots.push(Environment {
                lexical,
                dynamic,
                ..Environment::default()
            });
            id
        }
    }

    /// Returns a frame-owned environment to the free list.
    ///
    /// The caller must have established that nothing escaping the frame still
    /// references `id` (see [`Value::is_closure_safe`]).
    pub fn release(&mut self, id: EnvId) {
        self.slots[id.index()].reset(None, None);
        self.free.push(id);
    }

    #[must_use]
    pub fn get(&self, id: EnvId) -> &Environment {
        &self.slots[id.index()]
    }

    pub fn get_mut(&mut self, id: EnvId) -> &mut Environment {
        &mut self.slots[id.index()]
    }

    /// `getRecursive`: walks the lexical chain starting at `env` until a
    /// binding for `name` is found. Returns the environment it was found in
    /// alongside the value; Nil (and `env` itself) when unbound everywhere.
    #[must_use]
    pub fn get_recursive(&self, env: EnvId, name: StringId) -> (EnvId, Value) {
        let mut current = env;
        loop {
            let e = self.get(current);
            if let Some(value) = e.get_ref(name) {
                return (current, value.clone());
            }
            match e.lexical() {
                Some(parent) => current = parent,
                None => return (env, Value::Nil),
            }
        }
    }

    /// `insertRecursive` (superassignment): writes to the nearest *enclosing*
    /// environment already binding `name`, starting at the lexical parent of
    /// `env`; falls back to the chain's root (the global environment) when no
    /// binding exists.
    pub fn insert_recursive(&mut self, env: EnvId, name: StringId, value: Value) {
        let mut current = match self.get(env).lexical() {
            Some(parent) => parent,
            None => env,
        };
        loop {
            if self.get(current).is_bound(name) {
                self.get_mut(current).assign(name, value);
                return;
            }
            match self.get(current).lexical() {
                Some(parent) => current = parent,
                None => {
                    // reached the global environment
                    self.get_mut(current).assign(name, value);
                    return;
                }
            }
        }
    }

    /// Live (non-free) environment count, for tests.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{intern::Interns, value::structurally_equal};

    #[test]
    fn get_returns_nil_when_unbound() {
        let mut interns = Interns::new();
        let x = interns.intern("x");
        let mut arena = EnvArena::new();
        let global = arena.alloc(None, None);
        assert!(matches!(arena.get(global).get(x), Value::Nil));
    }

    #[test]
    fn recursive_lookup_walks_lexical_parents() {
        let mut interns = Interns::new();
        let x = interns.intern("x");
        let mut arena = EnvArena::new();
        let global = arena.alloc(None, None);
        let inner = arena.alloc(Some(global), Some(global));
        arena.get_mut(global).assign(x, Value::int(7));
        let (found_in, value) = arena.get_recursive(inner, x);
        assert_eq!(found_in, global);
        assert!(structurally_equal(&value, &Value::int(7)));
    }

    #[test]
    fn insert_recursive_updates_enclosing_binding() {
        let mut interns = Interns::new();
        let n = interns.intern("n");
        let mut arena = EnvArena::new();
        let global = arena.alloc(None, None);
        let mid = arena.alloc(Some(global), Some(global));
        let inner = arena.alloc(Some(mid), Some(mid));
        arena.get_mut(mid).assign(n, Value::int(0));
        // n <<- 1 from inner updates mid, not global or inner
        arena.insert_recursive(inner, n, Value::int(1));
        assert!(structurally_equal(&arena.get(mid).get(n), &Value::int(1)));
        assert!(matches!(arena.get(global).get(n), Value::Nil));
        assert!(matches!(arena.get(inner).get(n), Value::Nil));
    }

    #[test]
    fn insert_recursive_falls_back_to_global() {
        let mut interns = Interns::new();
        let y = interns.intern("y");
        let mut arena = EnvArena::new();
        let global = arena.alloc(None, None);
        let inner = arena.alloc(Some(global), Some(global));
        arena.insert_recursive(inner, y, Value::int(9));
        assert!(structurally_equal(&arena.get(global).get(y), &Value::int(9)));
    }

    #[test]
    fn released_slots_are_reused() {
        let mut arena = EnvArena::new();
        let global = arena.alloc(None, None);
        let a = arena.alloc(Some(global), None);
        arena.release(a);
        let b = arena.alloc(Some(global), None);
        assert_eq!(a, b);
        assert_eq!(arena.live(), 2);
    }
}
