//! Script-engine collaborator interface.
//!
//! The bridge never marshals values into or out of a script engine itself. It
//! asks the engine to invoke a referenced callback with a [`Payload`] and gets
//! the callback's return value back as JSON.

use serde_json::Value;
use tickbridge_common::{BridgeError, CallbackRef, ContextId, Payload, Result};

/// What the bridge needs from the engine that owns an execution context.
///
/// All methods are called on the context's own thread. `invoke` and
/// `release_ref` are only called after `context_is_alive` returned true.
pub trait ScriptEngine {
    /// Engine-side value a ref can be created from (usually a function).
    type Value;

    /// Stores `value` in the engine's reference table.
    fn new_ref(&mut self, context: ContextId, value: Self::Value) -> Result<CallbackRef>;

    /// Invokes the referenced callback with `payload`.
    ///
    /// Returns the callback's return value. For partial results a return
    /// value of `false` asks the bridge to cancel the job.
    fn invoke(&mut self, context: ContextId, callback: CallbackRef, payload: &Payload) -> Result<Value>;

    fn release_ref(&mut self, context: ContextId, callback: CallbackRef);

    fn context_is_alive(&self, context: ContextId) -> bool;
}

/// Receives callback errors raised while the pump delivers results.
pub trait ErrorSink: Send + Sync {
    fn report(&self, context: ContextId, callback: CallbackRef, error: &BridgeError);
}

/// Default sink: logs every callback error.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, context: ContextId, callback: CallbackRef, error: &BridgeError) {
        tracing::error!(context = %context, callback = %callback, "Callback failed: {}", error);
    }
}

/// A freshly created ref that is released on drop unless handed over.
///
/// Used on the owner thread between `new_ref` and a successful submission,
/// so every early return releases the ref and a handed-over ref is never
/// released twice.
///
/// # Example
///
/// ```
/// use std::cell::RefCell;
/// use tickbridge_common::{CallbackRef, ContextId};
/// use tickbridge_core::RefGuard;
///
/// let released = RefCell::new(Vec::new());
/// {
///     let _guard = RefGuard::new(ContextId(1), CallbackRef(3), |_, cb| released.borrow_mut().push(cb));
/// }
/// assert_eq!(*released.borrow(), vec![CallbackRef(3)]);
///
/// let guard = RefGuard::new(ContextId(1), CallbackRef(4), |_, cb| released.borrow_mut().push(cb));
/// assert_eq!(guard.into_inner(), CallbackRef(4));
/// assert_eq!(released.borrow().len(), 1);
/// ```
pub struct RefGuard<F>
where
    F: FnOnce(ContextId, CallbackRef),
{
    context: ContextId,
    callback: CallbackRef,
    release: Option<F>,
}

impl<F> RefGuard<F>
where
    F: FnOnce(ContextId, CallbackRef),
{
    pub fn new(context: ContextId, callback: CallbackRef, release: F) -> Self {
        Self {
            context,
            callback,
            release: Some(release),
        }
    }

    pub fn callback(&self) -> CallbackRef {
        self.callback
    }

    /// Hands ownership over; the guard will no longer release the ref.
    pub fn into_inner(mut self) -> CallbackRef {
        self.release = None;
        self.callback
    }
}

impl<F> Drop for RefGuard<F>
where
    F: FnOnce(ContextId, CallbackRef),
{
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(self.context, self.callback);
        }
    }
}
