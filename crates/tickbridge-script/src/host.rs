//! One script execution context and its tick loop.

use crate::bindings::install_bridge_bindings;
use crate::conversions::js_value_to_json;
use crate::engine::{BoaEngine, HostState};
use boa_engine::{Context, Source};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tickbridge_common::{BridgeError, ContextId, Result};
use tickbridge_core::{Bridge, PumpReport};

/// Owns a Boa context attached to a [`Bridge`].
///
/// Not `Send`: a host lives and dies on the thread that created it, which is
/// the only thread that may call [`tick`](Self::tick).
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use tickbridge_core::Bridge;
/// use tickbridge_net::HttpTransport;
/// use tickbridge_script::ScriptHost;
///
/// let bridge = Bridge::builder(HttpTransport::new().unwrap()).build().unwrap();
/// let mut host = ScriptHost::from_source(
///     "bridge.fetch('http://127.0.0.1:8080/', {}, function(err, res) { bridge.log(res.status); });",
///     bridge,
/// )
/// .unwrap();
///
/// while !host.is_idle() {
///     host.tick().unwrap();
///     std::thread::sleep(Duration::from_millis(10));
/// }
/// host.shutdown();
/// ```
pub struct ScriptHost {
    engine: BoaEngine,
    bridge: Arc<Bridge>,
    context: ContextId,
    shut_down: bool,
}

impl ScriptHost {
    /// Creates a context, attaches it, installs `bridge.*` and evaluates `source`.
    pub fn from_source(source: &str, bridge: Arc<Bridge>) -> Result<Self> {
        let context = ContextId::next();
        let state = HostState::new(context, bridge.clone());

        let mut ctx = Context::default();
        install_bridge_bindings(&mut ctx, context)?;

        bridge.attach_context(context);
        HostState::register(&state);

        let mut host = Self {
            engine: BoaEngine::new(ctx, state),
            bridge,
            context,
            shut_down: false,
        };
        tracing::debug!(context = %context, "Script context attached");

        // on failure the host is dropped, which detaches the context again
        host.eval(source)?;
        Ok(host)
    }

    pub fn from_file(path: impl AsRef<Path>, bridge: Arc<Bridge>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::InvalidRequest(format!("Failed to load script {}: {}", path.display(), e))
        })?;
        Self::from_source(&source, bridge)
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Evaluates more source in the context and returns its completion value.
    pub fn eval(&mut self, source: &str) -> Result<Value> {
        if self.shut_down {
            return Err(BridgeError::ContextGone(self.context));
        }
        let ctx = self.engine.context_mut();
        let value = ctx
            .eval(Source::from_bytes(source))
            .map_err(|e| BridgeError::Script(format!("Script evaluation error: {}", e)))?;
        let value = js_value_to_json(&value, ctx)?;
        self.run_jobs();
        Ok(value)
    }

    /// One owner tick: delivers results and inbound units, then runs the
    /// promise jobs they queued.
    pub fn tick(&mut self) -> Result<PumpReport> {
        if self.shut_down {
            return Err(BridgeError::ContextGone(self.context));
        }
        let report = self.bridge.pump(self.context, &mut self.engine);
        self.run_jobs();
        if !report.is_empty() {
            tracing::trace!(context = %self.context, ?report, "Tick");
        }
        Ok(report)
    }

    fn run_jobs(&mut self) {
        if let Err(e) = self.engine.context_mut().run_jobs() {
            tracing::warn!(context = %self.context, "Promise job failed: {}", e);
        }
    }

    /// True when the bridge owns no refs of this context: no request in
    /// flight and no server running.
    pub fn is_idle(&self) -> bool {
        self.shut_down || self.bridge.outstanding_refs(self.context) == 0
    }

    /// Marks the context dead and detaches it. Returns how many refs the
    /// bridge still owned. Idempotent.
    pub fn shutdown(&mut self) -> usize {
        if self.shut_down {
            return 0;
        }
        self.shut_down = true;

        let state = self.engine.state().clone();
        state.mark_dead();
        let released = self.bridge.detach_context(self.context, &mut self.engine);
        state.refs.borrow_mut().clear();
        HostState::unregister(self.context);

        tracing::debug!(context = %self.context, released, "Script context shut down");
        released
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tickbridge_core::testing::ScriptedTransport;

    fn bridge() -> Arc<Bridge> {
        Bridge::builder(ScriptedTransport::new()).build().unwrap()
    }

    #[test]
    fn test_eval_returns_json() {
        let mut host = ScriptHost::from_source("var counter = 41;", bridge()).unwrap();
        assert_eq!(host.eval("counter + 1").unwrap(), json!(42));
        assert!(host.is_idle());
    }

    #[test]
    fn test_syntax_error_is_a_script_error() {
        let bridge = bridge();
        let result = ScriptHost::from_source("this is not valid javascript ))", bridge.clone());
        assert!(matches!(result, Err(BridgeError::Script(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = ScriptHost::from_file("/nonexistent/tickbridge/script.js", bridge());
        assert!(matches!(result, Err(BridgeError::InvalidRequest(_))));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut host = ScriptHost::from_source("1", bridge()).unwrap();
        let context = host.context_id();
        assert!(host.bridge().is_attached(context));

        host.shutdown();
        host.shutdown();
        assert!(host.is_shut_down());
        assert!(!host.bridge().is_attached(context));
        assert!(matches!(host.tick(), Err(BridgeError::ContextGone(_))));
    }
}
