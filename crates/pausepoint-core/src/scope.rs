//! Variable bindings captured at a pause point.

use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use serde_json::Value;

/// A named set of variable bindings.
pub type Bindings = BTreeMap<String, Value>;

/// Local and enclosing bindings of a call site.
///
/// Cloning a `Scope` yields another handle to the *same* bindings, so
/// mutations made by a controller or an executed command are visible to the
/// code that created the scope once it resumes.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    locals: Arc<RwLock<Bindings>>,
    globals: Arc<RwLock<Bindings>>,
}

impl Scope {
    /// Create an empty scope with fresh local and enclosing bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a scope whose enclosing bindings are shared with `self`, with
    /// fresh, empty locals.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            locals: Arc::new(RwLock::new(Bindings::new())),
            globals: Arc::clone(&self.globals),
        }
    }

    /// Create a scope with initial local bindings.
    #[must_use]
    pub fn with_locals(locals: Bindings) -> Self {
        Self {
            locals: Arc::new(RwLock::new(locals)),
            globals: Arc::default(),
        }
    }

    /// Look up a name, locals first, then enclosing bindings.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(value) = read(&self.locals).get(name) {
            return Some(value.clone());
        }
        read(&self.globals).get(name).cloned()
    }

    /// Whether a name is bound in either table.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        read(&self.locals).contains_key(name) || read(&self.globals).contains_key(name)
    }

    /// Bind a local name, returning the previous value.
    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        write(&self.locals).insert(name.into(), value)
    }

    /// Bind a name in the enclosing bindings, returning the previous value.
    pub fn set_global(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        write(&self.globals).insert(name.into(), value)
    }

    /// Remove a name, locals first. Returns the removed value.
    pub fn remove(&self, name: &str) -> Option<Value> {
        if let Some(value) = write(&self.locals).remove(name) {
            return Some(value);
        }
        write(&self.globals).remove(name)
    }

    /// Snapshot of the local bindings.
    #[must_use]
    pub fn locals(&self) -> Bindings {
        read(&self.locals).clone()
    }

    /// Snapshot of the enclosing bindings.
    #[must_use]
    pub fn globals(&self) -> Bindings {
        read(&self.globals).clone()
    }

    /// Whether two handles refer to the same local bindings.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.locals, &other.locals)
    }
}

fn read(lock: &RwLock<Bindings>) -> RwLockReadGuard<'_, Bindings> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &RwLock<Bindings>) -> RwLockWriteGuard<'_, Bindings> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_locals_shadow_globals() {
        let scope = Scope::new();
        scope.set_global("x", json!(1));
        assert_eq!(scope.get("x"), Some(json!(1)));

        scope.set("x", json!(2));
        assert_eq!(scope.get("x"), Some(json!(2)));

        assert_eq!(scope.remove("x"), Some(json!(2)));
        assert_eq!(scope.get("x"), Some(json!(1)));
    }

    #[test]
    fn test_clones_share_bindings() {
        let scope = Scope::new();
        let handle = scope.clone();
        handle.set("answer", json!(42));
        assert_eq!(scope.get("answer"), Some(json!(42)));
        assert!(scope.same_as(&handle));
    }

    #[test]
    fn test_child_shares_only_globals() {
        let parent = Scope::new();
        parent.set("local", json!("parent"));
        let child = parent.child();
        child.set_global("shared", json!(true));

        assert_eq!(parent.get("shared"), Some(json!(true)));
        assert!(!child.contains("local"));
        assert!(!parent.same_as(&child));
    }
}
