//! The bridge object tying the pool, mailboxes, tickets and registries together.
//!
//! One [`Bridge`] serves any number of execution contexts. Each context is
//! attached once, submits jobs and registers endpoints from its own thread,
//! calls [`Bridge::pump`] once per tick, and is detached on teardown.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tickbridge_common::{ContextId, Job, Operation, Payload};
//! use tickbridge_core::testing::{RecordingEngine, ScriptedTransport};
//! use tickbridge_core::{Bridge, ScriptEngine};
//!
//! let bridge = Bridge::builder(ScriptedTransport::new()).build().unwrap();
//! let mut engine = RecordingEngine::new();
//! let context = ContextId::next();
//! bridge.attach_context(context);
//!
//! let callback = engine.new_ref(context, "done".to_string()).unwrap();
//! bridge.submit(Job::new(context, callback, Operation::get("http://example"))).unwrap();
//! assert!(bridge.wait_idle(Duration::from_secs(5)));
//!
//! let report = bridge.pump(context, &mut engine);
//! assert_eq!(report.delivered, 1);
//! assert!(matches!(engine.payloads(callback)[0], Payload::Response(_)));
//! assert_eq!(bridge.outstanding_refs(context), 0);
//! ```

use crate::cancel::CancellationRegistry;
use crate::connections::{ConnectionRegistry, InboundChannel, InboundEndpoint};
use crate::engine::{ErrorSink, ScriptEngine, TracingErrorSink};
use crate::ledger::RefLedger;
use crate::mailbox::Mailboxes;
use crate::pool::WorkerPool;
use crate::stats::{BridgeStats, StatsSnapshot};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tickbridge_common::{BridgeConfig, BridgeError, CallbackRef, ContextId, Job, Result};

/// Builder for [`Bridge`].
pub struct BridgeBuilder {
    transport: Arc<dyn Transport>,
    config: BridgeConfig,
    error_sink: Arc<dyn ErrorSink>,
}

impl BridgeBuilder {
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the default [`TracingErrorSink`].
    pub fn error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.error_sink = Arc::new(sink);
        self
    }

    /// Validates the configuration and builds the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidRequest`] if the configuration is invalid.
    pub fn build(self) -> Result<Arc<Bridge>> {
        self.config.validate().map_err(BridgeError::InvalidRequest)?;

        let mailboxes = Arc::new(Mailboxes::new());
        let cancellations = Arc::new(CancellationRegistry::new());
        let stats = Arc::new(BridgeStats::new());
        let pool = WorkerPool::new(
            &self.config,
            self.transport,
            mailboxes.clone(),
            cancellations.clone(),
            stats.clone(),
        );

        tracing::debug!(
            max_workers = self.config.max_workers,
            queue_capacity = ?self.config.queue_capacity,
            admission_timeout_ms = ?self.config.admission_timeout_ms,
            "Bridge built"
        );

        Ok(Arc::new(Bridge {
            config: self.config,
            pool,
            mailboxes,
            cancellations,
            ledger: RefLedger::new(),
            connections: ConnectionRegistry::new(),
            stats,
            error_sink: self.error_sink,
        }))
    }
}

/// Asynchronous I/O bridge between native threads and script contexts.
pub struct Bridge {
    config: BridgeConfig,
    pool: WorkerPool,
    pub(crate) mailboxes: Arc<Mailboxes>,
    pub(crate) cancellations: Arc<CancellationRegistry>,
    pub(crate) ledger: RefLedger,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) stats: Arc<BridgeStats>,
    pub(crate) error_sink: Arc<dyn ErrorSink>,
}

impl Bridge {
    pub fn builder(transport: impl Transport) -> BridgeBuilder {
        Self::builder_shared(Arc::new(transport))
    }

    /// Like [`builder`](Self::builder) for a transport the caller keeps a handle to.
    pub fn builder_shared(transport: Arc<dyn Transport>) -> BridgeBuilder {
        BridgeBuilder {
            transport,
            config: BridgeConfig::default(),
            error_sink: Arc::new(TracingErrorSink),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Creates the context's mailbox. Idempotent.
    pub fn attach_context(&self, context: ContextId) {
        self.mailboxes.attach(context);
        tracing::debug!(context = %context, "Context attached");
    }

    pub fn is_attached(&self, context: ContextId) -> bool {
        self.mailboxes.contains(context)
    }

    /// Takes ownership of the job's refs and queues it.
    ///
    /// On error the bridge owns nothing: the caller still holds the refs and
    /// must release them (see [`RefGuard`](crate::RefGuard)).
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ContextGone`] if the context is not attached
    /// - [`BridgeError::InvalidRequest`] if a ref is already owned by the bridge
    /// - [`BridgeError::QueueFull`] / [`BridgeError::Shutdown`] from the pool
    pub fn submit(&self, job: Job) -> Result<()> {
        let context = job.context;
        if !self.mailboxes.contains(context) {
            return Err(BridgeError::ContextGone(context));
        }

        let refs: Vec<CallbackRef> = job.refs().collect();
        if !self.ledger.acquire_all(context, &refs) {
            return Err(BridgeError::InvalidRequest(format!(
                "{} is already owned by the bridge",
                job.callback
            )));
        }

        if let Err(err) = self.pool.enqueue(job) {
            for callback in &refs {
                self.ledger.release(context, *callback);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Asks the job owning `callback` to abort. Returns false if the bridge
    /// does not own that ref.
    pub fn cancel(&self, context: ContextId, callback: CallbackRef) -> bool {
        if !self.ledger.holds(context, callback) {
            return false;
        }
        if self.cancellations.register(context, callback) {
            self.stats.cancellation();
            tracing::debug!(context = %context, callback = %callback, "Cancellation requested");
        }
        true
    }

    /// A channel configured with this bridge's admission timeout, for a new endpoint.
    pub fn inbound_channel(&self) -> InboundChannel {
        InboundChannel::new(self.config.admission_timeout(), self.stats.clone())
    }

    /// Hands an endpoint and its handler ref to the context.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ContextGone`] if the context is not attached
    /// - [`BridgeError::InvalidRequest`] if the handler ref is already owned
    pub fn register_endpoint(
        &self,
        context: ContextId,
        handler: CallbackRef,
        endpoint: Arc<dyn InboundEndpoint>,
    ) -> Result<()> {
        if !self.mailboxes.contains(context) {
            return Err(BridgeError::ContextGone(context));
        }
        if !self.ledger.acquire(context, handler) {
            return Err(BridgeError::InvalidRequest(format!(
                "{} is already owned by the bridge",
                handler
            )));
        }
        self.connections.register(context, handler, endpoint);
        Ok(())
    }

    pub fn endpoint_count(&self, context: ContextId) -> usize {
        self.connections.count(context)
    }

    /// Refs of `context` the bridge still owns.
    pub fn outstanding_refs(&self, context: ContextId) -> usize {
        self.ledger.outstanding(context)
    }

    /// Results waiting for the next pump.
    pub fn pending_results(&self, context: ContextId) -> usize {
        self.mailboxes.get(context).map(|m| m.len()).unwrap_or(0)
    }

    /// Tears a context down.
    ///
    /// Stops its endpoints, drops its mailbox and undelivered results, and
    /// releases every ref it still owns (through `engine` only if the context
    /// is alive). Jobs still running abort at their next checkpoint and their
    /// terminal results are dropped. Returns how many refs were released.
    pub fn detach_context<E>(&self, context: ContextId, engine: &mut E) -> usize
    where
        E: ScriptEngine + ?Sized,
    {
        let endpoints = self.connections.take_context(context);

        let dropped = self
            .mailboxes
            .detach(context)
            .map(|mailbox| mailbox.take_all().len())
            .unwrap_or(0);
        for _ in 0..dropped {
            self.stats.result_dropped();
        }

        let refs = self.ledger.clear_context(context);
        self.cancellations.clear_context(context);

        if engine.context_is_alive(context) {
            for callback in &refs {
                engine.release_ref(context, *callback);
            }
        }

        tracing::debug!(
            context = %context,
            endpoints = endpoints.len(),
            dropped,
            released = refs.len(),
            "Context detached"
        );
        refs.len()
    }

    /// Blocks until no job is queued or running.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Refuses new jobs, fails queued ones and stops every endpoint.
    ///
    /// Results still reach their contexts through the pump; the contexts
    /// should be detached afterwards.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down bridge");
        self.pool.shutdown();
        self.connections.stop_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.pool.is_shut_down()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.pool.shutdown();
        self.connections.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingEngine, ScriptedTransport, Step};
    use tickbridge_common::Operation;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = Bridge::builder(ScriptedTransport::new())
            .config(BridgeConfig::default().with_max_workers(0))
            .build();
        assert!(matches!(result, Err(BridgeError::InvalidRequest(_))));
    }

    #[test]
    fn test_submit_to_unattached_context_fails() {
        let bridge = Bridge::builder(ScriptedTransport::new()).build().unwrap();
        let job = Job::new(ContextId(77), CallbackRef(1), Operation::get("http://a"));
        assert!(matches!(bridge.submit(job), Err(BridgeError::ContextGone(ContextId(77)))));
    }

    #[test]
    fn test_ref_cannot_be_submitted_twice() {
        let transport = ScriptedTransport::new().route("http://held", vec![Step::Hold], 200);
        let bridge = Bridge::builder(transport).build().unwrap();
        let context = ContextId::next();
        bridge.attach_context(context);

        bridge
            .submit(Job::new(context, CallbackRef(1), Operation::get("http://held")))
            .unwrap();
        let again = bridge.submit(Job::new(context, CallbackRef(1), Operation::get("http://b")));
        assert!(matches!(again, Err(BridgeError::InvalidRequest(_))));
        assert_eq!(bridge.outstanding_refs(context), 1);
        bridge.shutdown();
    }

    #[test]
    fn test_rejected_submission_rolls_back_ownership() {
        let transport = ScriptedTransport::new().route("http://held", vec![Step::Hold], 200);
        let bridge = Bridge::builder(transport)
            .config(BridgeConfig::default().with_max_workers(1).with_queue_capacity(Some(1)))
            .build()
            .unwrap();
        let context = ContextId::next();
        bridge.attach_context(context);

        bridge.submit(Job::new(context, CallbackRef(1), Operation::get("http://held"))).unwrap();
        // Either still queued or running; fill the queue until it rejects.
        let mut next = 2;
        let err = loop {
            let job = Job::new(context, CallbackRef(next), Operation::get("http://held"))
                .with_progress(CallbackRef(next + 1000));
            match bridge.submit(job) {
                Ok(()) => next += 1,
                Err(err) => break err,
            }
            assert!(next < 10);
        };
        assert!(matches!(err, BridgeError::QueueFull { capacity: 1 }));
        assert!(!bridge.ledger.holds(context, CallbackRef(next)));
        assert!(!bridge.ledger.holds(context, CallbackRef(next + 1000)));
        bridge.shutdown();
    }

    #[test]
    fn test_cancel_requires_owned_ref() {
        let bridge = Bridge::builder(ScriptedTransport::new()).build().unwrap();
        let context = ContextId::next();
        bridge.attach_context(context);
        assert!(!bridge.cancel(context, CallbackRef(9)));
        assert_eq!(bridge.stats().cancellations, 0);
    }

    #[test]
    fn test_detach_releases_everything_once() {
        let transport = ScriptedTransport::new().route("http://held", vec![Step::Hold], 200);
        let bridge = Bridge::builder(transport).build().unwrap();
        let mut engine = RecordingEngine::new();
        let context = ContextId::next();
        bridge.attach_context(context);

        let callback = engine.new_ref(context, "cb".into()).unwrap();
        let progress = engine.new_ref(context, "progress".into()).unwrap();
        bridge
            .submit(Job::new(context, callback, Operation::get("http://held")).with_progress(progress))
            .unwrap();

        assert_eq!(bridge.detach_context(context, &mut engine), 2);
        assert!(bridge.wait_idle(WAIT));

        assert_eq!(engine.released(), &[callback, progress]);
        assert!(engine.double_releases().is_empty());
        assert!(!bridge.is_attached(context));
        assert!(bridge.cancellations.is_empty());
        assert_eq!(bridge.stats().results_dropped, 1);
    }
}
