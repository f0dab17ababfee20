//! JSON <-> JavaScript value conversions, and the argument lists callbacks
//! are invoked with.
//!
//! # Type Mapping
//!
//! | JSON | JavaScript |
//! |------|------------|
//! | null | null (and undefined, symbols, functions on the way back) |
//! | boolean | Boolean |
//! | number | Number; integral values come back as JSON integers |
//! | string | String |
//! | array | Array |
//! | object | Object (symbol keys skipped) |
//!
//! # Callback arguments
//!
//! | Payload | Arguments |
//! |---------|-----------|
//! | response | `(null, {status, headers, body})` |
//! | failure | `({message})` |
//! | progress | `({totalOut, sentOut, totalIn, receivedIn})` |
//! | chunk | `({chunk})` |
//! | inbound request | `({method, path, query, headers, body, remote})` |
//! | socket event | `({type, connection, data?, binary?})` |

use boa_engine::object::builtins::JsArray;
use boa_engine::object::JsObject;
use boa_engine::property::PropertyKey;
use boa_engine::value::JsValue;
use boa_engine::{js_string, Context};
use serde_json::{json, Map, Value as JsonValue};
use tickbridge_common::{BridgeError, Payload, Result, SocketEvent};

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

pub fn json_to_js_value(json: &JsonValue, ctx: &mut Context) -> Result<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                return Ok(JsValue::new(i));
            }
            n.as_f64()
                .map(JsValue::new)
                .ok_or_else(|| BridgeError::InvalidRequest("Number out of range".into()))
        }
        JsonValue::String(s) => Ok(JsValue::new(js_string!(s.as_str()))),
        JsonValue::Array(items) => {
            let array = JsArray::new(ctx);
            for (i, item) in items.iter().enumerate() {
                let value = json_to_js_value(item, ctx)?;
                array
                    .push(value, ctx)
                    .map_err(|e| BridgeError::Script(format!("Failed to push array element {}: {}", i, e)))?;
            }
            Ok(array.into())
        }
        JsonValue::Object(map) => {
            let object = JsObject::with_object_proto(ctx.intrinsics());
            for (key, value) in map {
                let value = json_to_js_value(value, ctx)?;
                object
                    .create_data_property_or_throw(js_string!(key.as_str()), value, ctx)
                    .map_err(|e| BridgeError::Script(format!("Failed to set property '{}': {}", key, e)))?;
            }
            Ok(object.into())
        }
    }
}

/// Converts a script value to JSON.
///
/// Cyclic values and nesting deeper than [`MAX_DEPTH`] are a
/// [`BridgeError::Script`]; shared (non-cyclic) references are copied.
pub fn js_value_to_json(value: &JsValue, ctx: &mut Context) -> Result<JsonValue> {
    let mut ancestors = Vec::new();
    value_to_json(value, &mut ancestors, ctx)
}

/// Nesting limit for [`js_value_to_json`].
pub const MAX_DEPTH: usize = 128;

fn value_to_json(value: &JsValue, ancestors: &mut Vec<JsObject>, ctx: &mut Context) -> Result<JsonValue> {
    if value.is_undefined() || value.is_null() || value.is_symbol() {
        return Ok(JsonValue::Null);
    }
    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }
    if let Some(n) = value.as_number() {
        return number_to_json(n);
    }
    if let Some(s) = value.as_string() {
        return Ok(JsonValue::String(s.to_std_string_escaped()));
    }

    let Some(object) = value.as_object() else {
        // bigint and anything else without a JSON form
        return Ok(JsonValue::Null);
    };
    if object.is_callable() {
        return Ok(JsonValue::Null);
    }
    let object = object.clone();

    if ancestors.iter().any(|seen| JsObject::equals(seen, &object)) {
        return Err(BridgeError::Script("cyclic value".into()));
    }
    if ancestors.len() >= MAX_DEPTH {
        return Err(BridgeError::Script(format!("value nested deeper than {} levels", MAX_DEPTH)));
    }

    ancestors.push(object.clone());
    let converted = object_to_json(&object, ancestors, ctx);
    ancestors.pop();
    converted
}

fn object_to_json(object: &JsObject, ancestors: &mut Vec<JsObject>, ctx: &mut Context) -> Result<JsonValue> {
    if object.is_array() {
        let array = JsArray::from_object(object.clone())
            .map_err(|e| BridgeError::Script(format!("Object is not a valid array: {}", e)))?;
        let length = array
            .length(ctx)
            .map_err(|e| BridgeError::Script(format!("Failed to get array length: {}", e)))?;

        let mut items = Vec::new();
        for i in 0..length {
            let item = array
                .get(i, ctx)
                .map_err(|e| BridgeError::Script(format!("Failed to get array element {}: {}", i, e)))?;
            items.push(value_to_json(&item, ancestors, ctx)?);
        }
        return Ok(JsonValue::Array(items));
    }

    let keys = object
        .own_property_keys(ctx)
        .map_err(|e| BridgeError::Script(format!("Failed to get object keys: {}", e)))?;

    let mut map = Map::new();
    for key in keys {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let property = object
            .get(key.clone(), ctx)
            .map_err(|e| BridgeError::Script(format!("Failed to get property '{}': {}", name, e)))?;
        map.insert(name, value_to_json(&property, ancestors, ctx)?);
    }
    Ok(JsonValue::Object(map))
}

fn number_to_json(n: f64) -> Result<JsonValue> {
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        return Ok(JsonValue::from(n as i64));
    }
    // NaN and the infinities have no JSON form, as in JSON.stringify
    Ok(serde_json::Number::from_f64(n)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null))
}

/// Repeated header names are folded into one comma-separated value.
fn headers_object(headers: &[(String, String)]) -> JsonValue {
    let mut map = Map::new();
    for (name, value) in headers {
        match map.get_mut(name) {
            Some(JsonValue::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            _ => {
                map.insert(name.clone(), JsonValue::String(value.clone()));
            }
        }
    }
    JsonValue::Object(map)
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// The JSON arguments a callback receives for `payload`.
pub fn payload_arguments(payload: &Payload) -> Vec<JsonValue> {
    match payload {
        Payload::Response(response) => vec![
            JsonValue::Null,
            json!({
                "status": response.status,
                "headers": headers_object(&response.headers),
                "body": text(&response.body),
            }),
        ],
        Payload::Failure(message) => vec![json!({ "message": message })],
        Payload::Progress(progress) => vec![json!({
            "totalOut": progress.total_out,
            "sentOut": progress.sent_out,
            "totalIn": progress.total_in,
            "receivedIn": progress.received_in,
        })],
        Payload::Chunk(data) => vec![json!({ "chunk": text(data) })],
        Payload::Request(request) => vec![json!({
            "method": request.method,
            "path": request.path,
            "query": request.query,
            "headers": headers_object(&request.headers),
            "body": text(&request.body),
            "remote": request.remote,
        })],
        Payload::Socket(event) => vec![match event {
            SocketEvent::Open { connection } => json!({ "type": "open", "connection": connection }),
            SocketEvent::Message { connection, data, binary } => json!({
                "type": "message",
                "connection": connection,
                "data": text(data),
                "binary": binary,
            }),
            SocketEvent::Close { connection } => json!({ "type": "close", "connection": connection }),
        }],
    }
}
