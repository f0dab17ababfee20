//! Ownership ledger for callback refs handed to the bridge.
//!
//! Every ref the bridge takes over (job callbacks, progress refs, endpoint
//! handlers) is recorded here and removed exactly once on release. A release
//! of a ref that is not recorded is refused, which is how double frees are
//! caught; whatever is still recorded is what would leak.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tickbridge_common::{CallbackRef, ContextId};

#[derive(Debug, Default)]
pub struct RefLedger {
    refs: Mutex<HashMap<ContextId, HashSet<CallbackRef>>>,
}

impl RefLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn refs(&self) -> MutexGuard<'_, HashMap<ContextId, HashSet<CallbackRef>>> {
        self.refs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records ownership. Returns false if the ref is already owned.
    pub fn acquire(&self, context: ContextId, callback: CallbackRef) -> bool {
        self.refs().entry(context).or_default().insert(callback)
    }

    /// Records ownership of all `callbacks` or of none of them.
    pub fn acquire_all(&self, context: ContextId, callbacks: &[CallbackRef]) -> bool {
        let mut refs = self.refs();
        let unique: HashSet<_> = callbacks.iter().collect();
        let clash = refs
            .get(&context)
            .is_some_and(|owned| callbacks.iter().any(|cb| owned.contains(cb)));
        if unique.len() != callbacks.len() || clash {
            return false;
        }
        if !callbacks.is_empty() {
            refs.entry(context).or_default().extend(callbacks.iter().copied());
        }
        true
    }

    /// Removes ownership. Returns false if the ref was not owned.
    pub fn release(&self, context: ContextId, callback: CallbackRef) -> bool {
        let mut refs = self.refs();
        let Some(owned) = refs.get_mut(&context) else {
            return false;
        };
        let removed = owned.remove(&callback);
        if owned.is_empty() {
            refs.remove(&context);
        }
        removed
    }

    pub fn holds(&self, context: ContextId, callback: CallbackRef) -> bool {
        self.refs()
            .get(&context)
            .map(|owned| owned.contains(&callback))
            .unwrap_or(false)
    }

    pub fn outstanding(&self, context: ContextId) -> usize {
        self.refs().get(&context).map(HashSet::len).unwrap_or(0)
    }

    /// Forgets every ref of `context`, returning them sorted.
    pub fn clear_context(&self, context: ContextId) -> Vec<CallbackRef> {
        let mut cleared: Vec<_> = self
            .refs()
            .remove(&context)
            .map(|owned| owned.into_iter().collect())
            .unwrap_or_default();
        cleared.sort();
        cleared
    }
}
