//! Boa-backed script engine collaborator.
//!
//! A [`HostState`] is the per-context state shared between the engine and
//! the native `bridge.*` functions: the reference table, the bridge handle
//! and the liveness flag. Native functions cannot capture it directly, so
//! each one captures its [`ContextId`] and looks the state up in a
//! thread-local registry. Contexts never leave their thread, so neither does
//! their state.

use crate::conversions::{js_value_to_json, json_to_js_value, payload_arguments};
use boa_engine::object::JsObject;
use boa_engine::value::JsValue;
use boa_engine::{Context, JsNativeError, JsResult};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tickbridge_common::{BridgeError, CallbackRef, ContextId, Payload, Result};
use tickbridge_core::{Bridge, ScriptEngine};

thread_local! {
    static HOSTS: RefCell<HashMap<ContextId, Rc<HostState>>> = RefCell::new(HashMap::new());
}

/// JavaScript functions the bridge holds refs to.
#[derive(Default)]
pub(crate) struct RefTable {
    next: u64,
    entries: HashMap<CallbackRef, JsObject>,
}

impl RefTable {
    pub(crate) fn insert(&mut self, function: JsObject) -> CallbackRef {
        self.next += 1;
        let callback = CallbackRef(self.next);
        self.entries.insert(callback, function);
        callback
    }

    pub(crate) fn get(&self, callback: CallbackRef) -> Option<JsObject> {
        self.entries.get(&callback).cloned()
    }

    pub(crate) fn remove(&mut self, callback: CallbackRef) -> bool {
        self.entries.remove(&callback).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

pub(crate) struct HostState {
    pub(crate) context: ContextId,
    pub(crate) bridge: Arc<Bridge>,
    pub(crate) refs: RefCell<RefTable>,
    alive: Cell<bool>,
}

impl HostState {
    pub(crate) fn new(context: ContextId, bridge: Arc<Bridge>) -> Rc<Self> {
        Rc::new(Self {
            context,
            bridge,
            refs: RefCell::new(RefTable::default()),
            alive: Cell::new(true),
        })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.get()
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.set(false);
    }

    /// Removes a ref from the table; used by scoped guards on failed hand-overs.
    pub(crate) fn release(&self, callback: CallbackRef) {
        self.refs.borrow_mut().remove(callback);
    }

    pub(crate) fn register(state: &Rc<Self>) {
        HOSTS.with(|hosts| hosts.borrow_mut().insert(state.context, state.clone()));
    }

    pub(crate) fn unregister(context: ContextId) {
        HOSTS.with(|hosts| hosts.borrow_mut().remove(&context));
    }

    /// State of `context` for a native function running on this thread.
    pub(crate) fn lookup(context: ContextId) -> JsResult<Rc<Self>> {
        HOSTS
            .with(|hosts| hosts.borrow().get(&context).cloned())
            .filter(|state| state.is_alive())
            .ok_or_else(|| {
                JsNativeError::error()
                    .with_message(format!("Execution context {} is gone", context))
                    .into()
            })
    }
}

/// [`ScriptEngine`] over one Boa [`Context`].
pub struct BoaEngine {
    context: Context,
    state: Rc<HostState>,
}

impl BoaEngine {
    pub(crate) fn new(context: Context, state: Rc<HostState>) -> Self {
        Self { context, state }
    }

    pub fn context_id(&self) -> ContextId {
        self.state.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub(crate) fn state(&self) -> &Rc<HostState> {
        &self.state
    }

    /// Refs currently held in the table.
    pub fn live_refs(&self) -> usize {
        self.state.refs.borrow().len()
    }
}

impl ScriptEngine for BoaEngine {
    type Value = JsObject;

    fn new_ref(&mut self, context: ContextId, value: JsObject) -> Result<CallbackRef> {
        if context != self.state.context || !self.state.is_alive() {
            return Err(BridgeError::ContextGone(context));
        }
        if !value.is_callable() {
            return Err(BridgeError::InvalidRequest("Callback must be a function".into()));
        }
        Ok(self.state.refs.borrow_mut().insert(value))
    }

    fn invoke(&mut self, context: ContextId, callback: CallbackRef, payload: &Payload) -> Result<Value> {
        if context != self.state.context {
            return Err(BridgeError::ContextGone(context));
        }
        // the borrow must end before the call: the callback may create refs
        let function = self
            .state
            .refs
            .borrow()
            .get(callback)
            .ok_or_else(|| BridgeError::Callback(format!("{} was already released", callback)))?;

        let args = payload_arguments(payload)
            .iter()
            .map(|arg| json_to_js_value(arg, &mut self.context))
            .collect::<Result<Vec<JsValue>>>()?;

        let result = function
            .call(&JsValue::undefined(), &args, &mut self.context)
            .map_err(|e| BridgeError::Callback(e.to_string()))?;

        js_value_to_json(&result, &mut self.context)
    }

    fn release_ref(&mut self, _context: ContextId, callback: CallbackRef) {
        if !self.state.refs.borrow_mut().remove(callback) {
            tracing::warn!(context = %self.state.context, callback = %callback, "Released an unknown ref");
        }
    }

    fn context_is_alive(&self, context: ContextId) -> bool {
        context == self.state.context && self.state.is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;
    use tickbridge_common::TransportResponse;
    use tickbridge_core::testing::ScriptedTransport;

    fn engine(source: &str) -> (BoaEngine, JsObject) {
        let bridge = Bridge::builder(ScriptedTransport::new()).build().unwrap();
        let state = HostState::new(ContextId::next(), bridge);
        let mut context = Context::default();
        let value = context.eval(Source::from_bytes(source)).unwrap();
        let function = value.as_object().unwrap().clone();
        (BoaEngine::new(context, state), function)
    }

    #[test]
    fn test_invoke_passes_payload_and_returns_json() {
        let (mut engine, function) = engine("(function(err, res) { return { err: err, status: res.status }; })");
        let context = engine.context_id();
        let callback = engine.new_ref(context, function).unwrap();

        let result = engine
            .invoke(context, callback, &Payload::Response(TransportResponse::new(404)))
            .unwrap();
        assert_eq!(result, json!({"err": null, "status": 404}));
    }

    #[test]
    fn test_thrown_error_is_a_callback_error() {
        let (mut engine, function) = engine("(function() { throw new Error('nope'); })");
        let context = engine.context_id();
        let callback = engine.new_ref(context, function).unwrap();

        let err = engine
            .invoke(context, callback, &Payload::Failure("x".into()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Callback(m) if m.contains("nope")));
    }

    #[test]
    fn test_released_ref_cannot_be_invoked() {
        let (mut engine, function) = engine("(function() {})");
        let context = engine.context_id();
        let callback = engine.new_ref(context, function).unwrap();
        assert_eq!(engine.live_refs(), 1);

        engine.release_ref(context, callback);
        assert_eq!(engine.live_refs(), 0);
        assert!(engine.invoke(context, callback, &Payload::Failure("x".into())).is_err());
    }

    #[test]
    fn test_non_function_is_rejected() {
        let (mut engine, object) = engine("({})");
        let context = engine.context_id();
        assert!(matches!(engine.new_ref(context, object), Err(BridgeError::InvalidRequest(_))));
    }

    #[test]
    fn test_dead_context() {
        let (engine, _) = engine("(function() {})");
        let context = engine.context_id();
        assert!(engine.context_is_alive(context));
        assert!(!engine.context_is_alive(ContextId::next()));

        engine.state().mark_dead();
        assert!(!engine.context_is_alive(context));
    }
}
