//! JavaScript bindings for tickbridge
//!
//! Installs the global `bridge` object:
//!
//! - `bridge.fetch(target, options, callback[, onProgress])` - queue an outbound
//!   request; returns an id usable with `bridge.cancel`
//! - `bridge.cancel(id)` - ask a running request to abort
//! - `bridge.serve(addr, handler)` - start an inbound HTTP server
//! - `bridge.listen(addr, handler)` - start an inbound WebSocket server
//! - `bridge.log(...args)` - log through the host's tracing subscriber
//!
//! Every function captures only the [`ContextId`] of the context it was
//! installed into and finds the host state through [`HostState::lookup`].
//! Refs created here are held by a [`RefGuard`] until the bridge accepted
//! them, so a refused request never leaks a ref.

use crate::conversions::js_value_to_json;
use crate::engine::HostState;
use boa_engine::native_function::NativeFunction;
use boa_engine::object::{FunctionObjectBuilder, JsObject};
use boa_engine::property::Attribute;
use boa_engine::value::JsValue;
use boa_engine::{js_string, Context, JsError, JsNativeError, JsResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::rc::Rc;
use tickbridge_common::{BridgeError, CallbackRef, ContextId, Job, Operation, Result};
use tickbridge_core::{InboundEndpoint, RefGuard};
use tickbridge_net::{attach_endpoint, HttpEndpoint, WsEndpoint};

/// `options` argument of `bridge.fetch`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FetchOptions {
    method: Option<String>,
    headers: BTreeMap<String, Value>,
    params: BTreeMap<String, Value>,
    body: Option<Value>,
    timeout_ms: Option<u64>,
    stream: bool,
}

impl FetchOptions {
    fn into_operation(self, target: String) -> Operation {
        let mut operation = Operation::new(self.method.as_deref().unwrap_or("GET"), target);
        operation.headers = self.headers.into_iter().map(|(k, v)| (k, plain_string(v))).collect();
        operation.params = self.params.into_iter().map(|(k, v)| (k, plain_string(v))).collect();
        operation.timeout_ms = self.timeout_ms;
        operation.stream = self.stream;

        match self.body {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => operation.body = Some(text.into_bytes()),
            Some(other) => {
                if !operation.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                    operation.headers.push(("Content-Type".into(), "application/json".into()));
                }
                operation.body = Some(other.to_string().into_bytes());
            }
        }
        operation
    }
}

fn plain_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

fn to_js_error(err: BridgeError) -> JsError {
    match err {
        BridgeError::InvalidRequest(message) => JsNativeError::typ().with_message(message).into(),
        other => JsNativeError::error().with_message(other.to_string()).into(),
    }
}

fn string_arg(args: &[JsValue], index: usize, name: &str, ctx: &mut Context) -> JsResult<String> {
    match args.get(index) {
        Some(value) if !value.is_undefined() && !value.is_null() => {
            Ok(value.to_string(ctx)?.to_std_string_escaped())
        }
        _ => Err(JsNativeError::typ()
            .with_message(format!("{} is required", name))
            .into()),
    }
}

fn function_arg(args: &[JsValue], index: usize, name: &str) -> JsResult<JsObject> {
    args.get(index)
        .and_then(|v| v.as_object())
        .filter(|o| o.is_callable())
        .map(|o| o.clone())
        .ok_or_else(|| {
            JsNativeError::typ()
                .with_message(format!("{} must be a function", name))
                .into()
        })
}

fn optional_function_arg(args: &[JsValue], index: usize, name: &str) -> JsResult<Option<JsObject>> {
    match args.get(index) {
        None => Ok(None),
        Some(value) if value.is_undefined() || value.is_null() => Ok(None),
        Some(_) => function_arg(args, index, name).map(Some),
    }
}

fn addr_arg(args: &[JsValue], ctx: &mut Context) -> JsResult<SocketAddr> {
    let addr = string_arg(args, 0, "Address", ctx)?;
    addr.parse().map_err(|e| {
        JsNativeError::typ()
            .with_message(format!("Invalid address '{}': {}", addr, e))
            .into()
    })
}

/// Creates a ref for `function` guarded until it is handed to the bridge.
fn guarded_ref(state: &Rc<HostState>, function: JsObject) -> RefGuard<impl FnOnce(ContextId, CallbackRef) + '_> {
    let callback = state.refs.borrow_mut().insert(function);
    RefGuard::new(state.context, callback, move |_, callback| state.release(callback))
}

fn fetch(context: ContextId, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let state = HostState::lookup(context)?;

    let target = string_arg(args, 0, "Target", ctx)?;
    let options = match args.get(1) {
        Some(value) => js_value_to_json(value, ctx).map_err(to_js_error)?,
        None => Value::Null,
    };
    let options: FetchOptions = if options.is_null() {
        FetchOptions::default()
    } else {
        serde_json::from_value(options)
            .map_err(|e| JsNativeError::typ().with_message(format!("Invalid fetch options: {}", e)))?
    };
    let callback = function_arg(args, 2, "Callback")?;
    let on_progress = optional_function_arg(args, 3, "onProgress")?;

    if options.stream && on_progress.is_none() {
        return Err(JsNativeError::typ()
            .with_message("A streamed fetch needs an onProgress function to receive chunks")
            .into());
    }
    let operation = options.into_operation(target);

    let callback = guarded_ref(&state, callback);
    let progress = on_progress.map(|function| guarded_ref(&state, function));

    let mut job = Job::new(context, callback.callback(), operation);
    if let Some(progress) = &progress {
        job = job.with_progress(progress.callback());
    }

    tracing::debug!(context = %context, callback = %job.callback, target_url = %job.operation.target, "Script fetch");
    state.bridge.submit(job).map_err(to_js_error)?;

    let id = callback.into_inner();
    if let Some(progress) = progress {
        progress.into_inner();
    }
    Ok(JsValue::new(id.0 as f64))
}

fn cancel(context: ContextId, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let state = HostState::lookup(context)?;
    let id = args.get(0).cloned().unwrap_or_default().to_number(ctx)?;
    if !(id.is_finite() && id >= 1.0 && id.fract() == 0.0) {
        return Ok(JsValue::new(false));
    }
    Ok(JsValue::new(state.bridge.cancel(context, CallbackRef(id as u64))))
}

fn serve(context: ContextId, args: &[JsValue], ctx: &mut Context, websocket: bool) -> JsResult<JsValue> {
    let state = HostState::lookup(context)?;
    let addr = addr_arg(args, ctx)?;
    let handler = function_arg(args, 1, "Handler")?;

    let handler = guarded_ref(&state, handler);
    let channel = state.bridge.inbound_channel();

    let bound: Result<Option<SocketAddr>> = if websocket {
        WsEndpoint::bind(addr, channel)
            .and_then(|endpoint| attach_endpoint(&state.bridge, context, handler.callback(), endpoint))
            .map(|endpoint| endpoint.local_addr())
    } else {
        HttpEndpoint::bind(addr, channel)
            .and_then(|endpoint| attach_endpoint(&state.bridge, context, handler.callback(), endpoint))
            .map(|endpoint| endpoint.local_addr())
    };
    let bound = bound.map_err(to_js_error)?;
    handler.into_inner();

    let bound = bound.map(|a| a.to_string()).unwrap_or_default();
    Ok(JsValue::new(js_string!(bound.as_str())))
}

fn log(context: ContextId, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        let part = if arg.is_object() {
            js_value_to_json(arg, ctx).map_err(to_js_error)?.to_string()
        } else {
            arg.to_string(ctx)?.to_std_string_escaped()
        };
        parts.push(part);
    }
    tracing::info!(target: "tickbridge::script", context = %context, "{}", parts.join(" "));
    Ok(JsValue::undefined())
}

/// Installs the global `bridge` object for `context`.
pub(crate) fn install_bridge_bindings(ctx: &mut Context, context: ContextId) -> Result<()> {
    let bridge = JsObject::with_object_proto(ctx.intrinsics());

    let functions: [(&str, usize, NativeFunction); 5] = [
        (
            "fetch",
            3,
            NativeFunction::from_copy_closure(move |_this, args, ctx| fetch(context, args, ctx)),
        ),
        (
            "cancel",
            1,
            NativeFunction::from_copy_closure(move |_this, args, ctx| cancel(context, args, ctx)),
        ),
        (
            "serve",
            2,
            NativeFunction::from_copy_closure(move |_this, args, ctx| serve(context, args, ctx, false)),
        ),
        (
            "listen",
            2,
            NativeFunction::from_copy_closure(move |_this, args, ctx| serve(context, args, ctx, true)),
        ),
        (
            "log",
            0,
            NativeFunction::from_copy_closure(move |_this, args, ctx| log(context, args, ctx)),
        ),
    ];

    for (name, length, function) in functions {
        let function = FunctionObjectBuilder::new(ctx.realm(), function)
            .name(js_string!(name))
            .length(length)
            .build();
        bridge
            .set(js_string!(name), function, false, ctx)
            .map_err(|e| BridgeError::Script(e.to_string()))?;
    }

    ctx.register_global_property(js_string!("bridge"), bridge, Attribute::all())
        .map_err(|e| BridgeError::Script(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fetch_options_to_operation() {
        let options: FetchOptions = serde_json::from_value(json!({
            "method": "post",
            "headers": {"X-Trace": "1"},
            "params": {"page": 2},
            "body": {"a": 1},
            "timeoutMs": 250,
            "stream": true
        }))
        .unwrap();
        let operation = options.into_operation("http://upstream/".into());

        assert_eq!(operation.method, "POST");
        assert_eq!(operation.params, vec![("page".to_string(), "2".to_string())]);
        assert!(operation.headers.contains(&("X-Trace".to_string(), "1".to_string())));
        assert!(operation.headers.contains(&("Content-Type".to_string(), "application/json".to_string())));
        assert_eq!(operation.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
        assert_eq!(operation.timeout_ms, Some(250));
        assert!(operation.stream);
    }

    #[test]
    fn test_default_options_are_a_get() {
        let operation = FetchOptions::default().into_operation("http://upstream/".into());
        assert_eq!(operation.method, "GET");
        assert!(operation.body.is_none());
        assert!(!operation.stream);
    }

    #[test]
    fn test_unknown_option_types_are_rejected() {
        let result: std::result::Result<FetchOptions, _> = serde_json::from_value(json!({"timeoutMs": "soon"}));
        assert!(result.is_err());
    }

    #[test]
    fn test_bindings_are_installed() {
        let mut ctx = Context::default();
        install_bridge_bindings(&mut ctx, ContextId::next()).unwrap();

        let bridge = ctx.global_object().get(js_string!("bridge"), &mut ctx).unwrap();
        let bridge = bridge.as_object().unwrap().clone();
        for name in ["fetch", "cancel", "serve", "listen", "log"] {
            let function = bridge.get(js_string!(name), &mut ctx).unwrap();
            assert!(function.as_object().map(|o| o.is_callable()).unwrap_or(false), "{}", name);
        }
    }
}
