//! Per-namespace variable scopes
//!
//! Each namespace owns one [`Scope`], a concurrent key-value store that
//! trigger expressions read and action scripts write. Scopes are handed out
//! by a [`ScopeRegistry`] that counts references explicitly: a scope is
//! dropped from the registry when its last holder calls `release`.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::Value;

/// Variable store of one namespace
#[derive(Debug, Default)]
pub struct Scope {
    namespace: String,
    vars: DashMap<String, Value>,
}

impl Scope {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            vars: DashMap::new(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get a copy of a variable's value
    pub fn get(&self, name: &str) -> Option<Value> {
        self.vars.get(name).map(|v| v.value().clone())
    }

    /// Set a variable, returning the previous value
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.vars.insert(name.into(), value.into())
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.vars.remove(name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Copy of all variables
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.vars
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

#[derive(Debug)]
struct ScopeSlot {
    scope: Arc<Scope>,
    refs: usize,
}

/// Registry of namespace scopes with explicit reference counts
#[derive(Debug, Default)]
pub struct ScopeRegistry {
    slots: Mutex<HashMap<String, ScopeSlot>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the scope for a namespace, creating it if needed, and take a reference
    pub fn acquire(&self, namespace: &str) -> Arc<Scope> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.entry(namespace.to_string()).or_insert_with(|| {
            debug!(namespace, "Creating namespace scope");
            ScopeSlot {
                scope: Arc::new(Scope::new(namespace)),
                refs: 0,
            }
        });
        slot.refs += 1;
        slot.scope.clone()
    }

    /// Drop one reference; returns true if this was the last one and the
    /// scope was removed
    pub fn release(&self, namespace: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get_mut(namespace) else {
            return false;
        };
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            slots.remove(namespace);
            debug!(namespace, "Namespace scope released");
            true
        } else {
            false
        }
    }

    /// Remove a namespace scope regardless of outstanding references
    pub fn close(&self, namespace: &str) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(namespace).is_some()
    }

    /// Get a scope without taking a reference
    pub fn get(&self, namespace: &str) -> Option<Arc<Scope>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(namespace).map(|s| s.scope.clone())
    }

    pub fn ref_count(&self, namespace: &str) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(namespace).map(|s| s.refs).unwrap_or(0)
    }

    pub fn namespaces(&self) -> Vec<String> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = slots.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_get_set() {
        let scope = Scope::new("lights");
        assert!(scope.get("x").is_none());
        assert_eq!(scope.set("x", 1), None);
        assert_eq!(scope.set("x", 2), Some(Value::from(1)));
        assert_eq!(scope.get("x"), Some(Value::from(2)));
        assert_eq!(scope.remove("x"), Some(Value::from(2)));
        assert!(scope.is_empty());
    }

    #[test]
    fn test_registry_shares_scope_per_namespace() {
        let registry = ScopeRegistry::new();
        let a = registry.acquire("m");
        let b = registry.acquire("m");
        a.set("count", 5);
        assert_eq!(b.get("count"), Some(Value::from(5)));
        assert_eq!(registry.ref_count("m"), 2);
    }

    #[test]
    fn test_release_to_zero_removes() {
        let registry = ScopeRegistry::new();
        registry.acquire("m");
        registry.acquire("m");

        assert!(!registry.release("m"));
        assert!(registry.get("m").is_some());
        assert!(registry.release("m"));
        assert!(registry.get("m").is_none());

        // releasing again is a no-op
        assert!(!registry.release("m"));
    }

    #[test]
    fn test_reacquire_after_release_is_fresh() {
        let registry = ScopeRegistry::new();
        registry.acquire("m").set("x", 1);
        registry.release("m");
        assert!(registry.acquire("m").get("x").is_none());
    }
}
