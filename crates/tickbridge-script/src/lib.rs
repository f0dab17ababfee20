//! tickbridge Script Host
//!
//! Runs JavaScript in a Boa context attached to a tickbridge
//! [`Bridge`](tickbridge_core::Bridge).
//!
//! # Architecture
//!
//! - [`ScriptHost`] - owns the context, evaluates the script, and runs one
//!   pump plus the promise jobs per [`tick`](ScriptHost::tick)
//! - [`BoaEngine`] - the [`ScriptEngine`](tickbridge_core::ScriptEngine)
//!   collaborator: reference table, invocation and liveness
//! - `bindings` - the global `bridge` object scripts talk to
//! - [`conversions`] - JSON marshalling in both directions
//!
//! # JavaScript API
//!
//! ```javascript
//! var id = bridge.fetch("http://127.0.0.1:8080/data", { method: "GET" }, function(err, res) {
//!     if (err) { bridge.log("failed:", err.message); return; }
//!     bridge.log(res.status, res.body);
//! }, function(progress) {
//!     return progress.receivedIn < 1000000;  // false aborts
//! });
//!
//! bridge.serve("127.0.0.1:9000", function(req) {
//!     return { status: 200, body: { path: req.path } };
//! });
//! ```

mod bindings;
pub mod conversions;
pub mod engine;
pub mod host;

pub use engine::BoaEngine;
pub use host::ScriptHost;
