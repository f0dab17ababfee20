//! Cooperative cancellation.
//!
//! Presence of `(context, callback)` in the registry means "stop depositing
//! partial results for this job and ask the transport to abort". It is
//! best-effort: the job still deposits its terminal result, which is what
//! reclaims the callback ref.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tickbridge_common::{CallbackRef, ContextId};

pub type CancelKey = (ContextId, CallbackRef);

#[derive(Debug, Default)]
pub struct CancellationRegistry {
    entries: Mutex<HashSet<CancelKey>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashSet<CancelKey>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Flags an operation for abort. Returns false if it was already flagged.
    pub fn register(&self, context: ContextId, callback: CallbackRef) -> bool {
        self.entries().insert((context, callback))
    }

    pub fn is_cancelled(&self, context: ContextId, callback: CallbackRef) -> bool {
        self.entries().contains(&(context, callback))
    }

    /// True if any of `refs` is flagged, checked under a single lock.
    pub fn any_cancelled(
        &self,
        context: ContextId,
        refs: impl IntoIterator<Item = CallbackRef>,
    ) -> bool {
        let entries = self.entries();
        refs.into_iter().any(|r| entries.contains(&(context, r)))
    }

    pub fn unregister(&self, context: ContextId, callback: CallbackRef) -> bool {
        self.entries().remove(&(context, callback))
    }

    /// Drops every entry belonging to `context`, returning how many were removed.
    pub fn clear_context(&self, context: ContextId) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(ctx, _)| *ctx != context);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_query() {
        let registry = CancellationRegistry::new();
        let ctx = ContextId(1);

        assert!(!registry.is_cancelled(ctx, CallbackRef(5)));
        assert!(registry.register(ctx, CallbackRef(5)));
        assert!(registry.is_cancelled(ctx, CallbackRef(5)));
        assert!(!registry.is_cancelled(ContextId(2), CallbackRef(5)));
    }

    #[test]
    fn test_register_twice_reports_existing() {
        let registry = CancellationRegistry::new();
        assert!(registry.register(ContextId(1), CallbackRef(1)));
        assert!(!registry.register(ContextId(1), CallbackRef(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = CancellationRegistry::new();
        registry.register(ContextId(1), CallbackRef(1));

        assert!(registry.unregister(ContextId(1), CallbackRef(1)));
        assert!(!registry.unregister(ContextId(1), CallbackRef(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_any_cancelled() {
        let registry = CancellationRegistry::new();
        registry.register(ContextId(1), CallbackRef(2));

        assert!(registry.any_cancelled(ContextId(1), [CallbackRef(1), CallbackRef(2)]));
        assert!(!registry.any_cancelled(ContextId(1), [CallbackRef(3)]));
    }

    #[test]
    fn test_clear_context_only_touches_that_context() {
        let registry = CancellationRegistry::new();
        registry.register(ContextId(1), CallbackRef(1));
        registry.register(ContextId(1), CallbackRef(2));
        registry.register(ContextId(2), CallbackRef(1));

        assert_eq!(registry.clear_context(ContextId(1)), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.is_cancelled(ContextId(2), CallbackRef(1)));
    }
}
