//! Supervision scopes: weakly-referenced sets of forked children.
//!
//! Entering a scope pushes an empty set; forks register with the innermost
//! set; exiting pops it so the leftovers can be interrupted. Children are
//! held through `Weak`, so fibers that complete and drop simply disappear
//! from their enclosing scopes.

use std::sync::{Arc, Weak};

/// A stack of supervision scopes, innermost last.
pub(crate) struct SupervisionScopes<T> {
    scopes: Vec<Vec<Weak<T>>>,
}

impl<T> SupervisionScopes<T> {
    pub(crate) fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    /// Opens a new innermost scope.
    pub(crate) fn enter(&mut self) {
        self.scopes.push(Vec::new());
    }

    /// Closes the innermost scope, returning its surviving children.
    pub(crate) fn exit(&mut self) -> Vec<Arc<T>> {
        self.scopes
            .pop()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|weak| weak.upgrade())
            .collect()
    }

    /// Registers a child with the innermost scope, if one is open.
    pub(crate) fn register(&mut self, child: &Arc<T>) {
        if let Some(innermost) = self.scopes.last_mut() {
            innermost.push(Arc::downgrade(child));
        }
    }

    /// Current nesting depth.
    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.scopes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_outside_any_scope_is_a_noop() {
        let mut scopes: SupervisionScopes<u32> = SupervisionScopes::new();
        let child = Arc::new(1);
        scopes.register(&child);
        assert_eq!(scopes.depth(), 0);
    }

    #[test]
    fn exit_returns_only_live_children() {
        let mut scopes: SupervisionScopes<u32> = SupervisionScopes::new();
        scopes.enter();
        let live = Arc::new(1);
        let dead = Arc::new(2);
        scopes.register(&live);
        scopes.register(&dead);
        drop(dead);

        let survivors = scopes.exit();
        assert_eq!(survivors.len(), 1);
        assert_eq!(*survivors[0], 1);
        assert_eq!(scopes.depth(), 0);
    }

    #[test]
    fn forks_register_with_the_innermost_scope() {
        let mut scopes: SupervisionScopes<u32> = SupervisionScopes::new();
        scopes.enter();
        scopes.enter();
        let child = Arc::new(7);
        scopes.register(&child);

        let inner = scopes.exit();
        assert_eq!(inner.len(), 1);
        let outer = scopes.exit();
        assert!(outer.is_empty());
    }
}
