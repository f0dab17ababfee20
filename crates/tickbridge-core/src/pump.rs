//! The execution pump: the one place results and inbound units enter a context.

use crate::bridge::Bridge;
use crate::engine::ScriptEngine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tickbridge_common::{CallbackRef, ContextId, JobResult};

/// What one pump call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpReport {
    /// Callbacks invoked with a job result
    pub delivered: usize,
    /// Results discarded because the context was not alive
    pub dropped: usize,
    /// Callback invocations that raised an error
    pub errors: usize,
    /// Jobs newly flagged for abort by their progress callback
    pub cancelled: usize,
    /// Refs released back to the engine's table
    pub released: usize,
    /// Inbound units answered
    pub admitted: usize,
    /// Stopped endpoints removed from the registry
    pub endpoints_closed: usize,
}

impl PumpReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Bridge {
    /// Delivers everything queued for `context` and flushes its endpoints.
    ///
    /// Must be called by the thread owning `context`, never concurrently for
    /// the same context. Results deposited while the pump runs are left for
    /// the next call.
    ///
    /// For each result, in deposit order:
    /// 1. if the context is not alive, the result is dropped (terminal
    ///    results still give their refs back to the ledger);
    /// 2. otherwise its target callback is invoked; a partial result whose
    ///    callback errors or returns `false` flags the job for abort;
    /// 3. a terminal result releases the job's refs and clears its
    ///    cancellation entries.
    pub fn pump<E>(&self, context: ContextId, engine: &mut E) -> PumpReport
    where
        E: ScriptEngine + ?Sized,
    {
        let mut report = PumpReport::default();
        let Some(mailbox) = self.mailboxes.get(context) else {
            return report;
        };

        for result in mailbox.take_all() {
            self.deliver(context, result, engine, &mut report);
        }

        self.flush_endpoints(context, engine, &mut report);
        report
    }

    fn deliver<E>(&self, context: ContextId, result: JobResult, engine: &mut E, report: &mut PumpReport)
    where
        E: ScriptEngine + ?Sized,
    {
        if !engine.context_is_alive(context) {
            report.dropped += 1;
            self.stats.result_dropped();
        } else {
            let target = result.target();
            let stop = match engine.invoke(context, target, &result.payload) {
                Ok(value) => value == Value::Bool(false),
                Err(err) => {
                    report.errors += 1;
                    self.error_sink.report(context, target, &err);
                    true
                }
            };
            report.delivered += 1;
            self.stats.result_delivered();

            if stop && result.payload.is_partial() && self.cancellations.register(context, target) {
                report.cancelled += 1;
                self.stats.cancellation();
                tracing::debug!(context = %context, callback = %target, "Progress callback requested abort");
            }
        }

        if result.is_terminal() {
            report.released += self.release(context, result.refs(), engine);
        }
    }

    fn flush_endpoints<E>(&self, context: ContextId, engine: &mut E, report: &mut PumpReport)
    where
        E: ScriptEngine + ?Sized,
    {
        for registered in self.connections.endpoints(context) {
            let handler = registered.handler;
            let sink = &self.error_sink;

            report.admitted += registered.endpoint.flush(&mut |payload| {
                if !engine.context_is_alive(context) {
                    return json!({ "status": 503, "body": "context is gone" });
                }
                match engine.invoke(context, handler, &payload) {
                    Ok(value) => value,
                    Err(err) => {
                        sink.report(context, handler, &err);
                        json!({ "status": 500, "body": err.to_string() })
                    }
                }
            });

            if !registered.endpoint.is_running() {
                self.connections.remove(context, registered.endpoint.id());
                report.released += self.release(context, [handler], engine);
                report.endpoints_closed += 1;
                tracing::debug!(context = %context, endpoint = %registered.endpoint.id(), "Endpoint closed");
            }
        }
    }

    /// Gives refs back: ledger first, then the engine if the context is alive.
    fn release<E, I>(&self, context: ContextId, refs: I, engine: &mut E) -> usize
    where
        E: ScriptEngine + ?Sized,
        I: IntoIterator<Item = CallbackRef>,
    {
        let alive = engine.context_is_alive(context);
        let mut released = 0;
        for callback in refs {
            self.cancellations.unregister(context, callback);
            if !self.ledger.release(context, callback) {
                tracing::warn!(context = %context, callback = %callback, "Refusing to release a ref twice");
                continue;
            }
            if alive {
                engine.release_ref(context, callback);
            }
            released += 1;
        }
        released
    }
}
