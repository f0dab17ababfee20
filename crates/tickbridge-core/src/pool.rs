//! Bounded worker pool draining the outbound job queue.
//!
//! # Architecture
//!
//! ```text
//! owner thread                worker threads (at most max_workers)
//! ------------                ------------------------------------
//! enqueue(job) --> [ FIFO ] --> pop --> Transport::execute --> Completion
//!                                          |                       |
//!                                     Checkpoint              terminal result
//!                                  (partials, cancel)         (exactly once)
//! ```
//!
//! A worker is spawned on enqueue while fewer than `max_workers` are alive.
//! Each worker loops popping jobs and exits as soon as the queue is empty, so
//! an idle pool holds no threads. Jobs start in queue order.

use crate::cancel::CancellationRegistry;
use crate::mailbox::Mailboxes;
use crate::stats::BridgeStats;
use crate::transport::{Checkpoint, Transport};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tickbridge_common::{BridgeConfig, BridgeError, Job, Payload, Result};

struct PoolState {
    jobs: VecDeque<Job>,
    active: usize,
    spawned: u64,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    idle: Condvar,
    closing: AtomicBool,
    max_workers: usize,
    queue_capacity: Option<usize>,
    stack_size: Option<usize>,
    name_prefix: String,
    transport: Arc<dyn Transport>,
    mailboxes: Arc<Mailboxes>,
    cancellations: Arc<CancellationRegistry>,
    stats: Arc<BridgeStats>,
}

/// Pool of native threads executing outbound jobs.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::Duration;
/// use tickbridge_common::{BridgeConfig, CallbackRef, ContextId, Job, Operation};
/// use tickbridge_core::testing::ScriptedTransport;
/// use tickbridge_core::{BridgeStats, CancellationRegistry, Mailboxes, WorkerPool};
///
/// let mailboxes = Arc::new(Mailboxes::new());
/// let mailbox = mailboxes.attach(ContextId(1));
/// let pool = WorkerPool::new(
///     &BridgeConfig::default(),
///     Arc::new(ScriptedTransport::new()),
///     mailboxes,
///     Arc::new(CancellationRegistry::new()),
///     Arc::new(BridgeStats::new()),
/// );
///
/// pool.enqueue(Job::new(ContextId(1), CallbackRef(1), Operation::get("http://a"))).unwrap();
/// assert!(pool.wait_idle(Duration::from_secs(5)));
/// assert_eq!(mailbox.len(), 1);
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(
        config: &BridgeConfig,
        transport: Arc<dyn Transport>,
        mailboxes: Arc<Mailboxes>,
        cancellations: Arc<CancellationRegistry>,
        stats: Arc<BridgeStats>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    jobs: VecDeque::new(),
                    active: 0,
                    spawned: 0,
                    shutdown: false,
                }),
                idle: Condvar::new(),
                closing: AtomicBool::new(false),
                max_workers: config.max_workers.max(1),
                queue_capacity: config.queue_capacity,
                stack_size: config.worker_stack_size,
                name_prefix: config.worker_name_prefix.clone(),
                transport,
                mailboxes,
                cancellations,
                stats,
            }),
        }
    }

    /// Appends a job to the queue, spawning a worker if below the cap.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Shutdown`] after [`shutdown`](Self::shutdown)
    /// - [`BridgeError::QueueFull`] when `queue_capacity` jobs are already waiting
    /// - [`BridgeError::Io`] when no worker is alive and none could be spawned
    ///
    /// A rejected job produces no result at all.
    pub fn enqueue(&self, job: Job) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state();

        if state.shutdown {
            return Err(BridgeError::Shutdown);
        }
        if let Some(capacity) = shared.queue_capacity {
            if state.jobs.len() >= capacity {
                shared.stats.job_rejected();
                tracing::warn!(context = %job.context, capacity, "Job queue full, rejecting job");
                return Err(BridgeError::QueueFull { capacity });
            }
        }

        state.jobs.push_back(job);

        if state.active < shared.max_workers {
            if let Err(e) = PoolShared::spawn_worker(shared, &mut state) {
                if state.active == 0 {
                    state.jobs.pop_back();
                    tracing::error!("Failed to spawn worker thread: {}", e);
                    return Err(BridgeError::Io(e));
                }
                tracing::warn!(active = state.active, "Failed to spawn extra worker: {}", e);
            }
        }

        shared.stats.job_submitted();
        Ok(())
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state().jobs.len()
    }

    pub fn active_workers(&self) -> usize {
        self.shared.state().active
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state().shutdown
    }

    /// Blocks until the queue is empty and no worker is alive.
    ///
    /// Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state();
        while !state.jobs.is_empty() || state.active > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .idle
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Stops accepting jobs and fails every queued one.
    ///
    /// Queued jobs get a terminal `Failure`; running jobs observe cancellation
    /// at their next checkpoint. Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        shared.closing.store(true, Ordering::Release);

        let drained: Vec<Job> = {
            let mut state = shared.state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.jobs.drain(..).collect()
        };

        if !drained.is_empty() {
            tracing::info!(jobs = drained.len(), "Failing queued jobs on shutdown");
        }
        for job in &drained {
            Completion::new(job, shared).complete(Payload::Failure(BridgeError::Shutdown.to_string()));
        }
        shared.idle.notify_all();
    }
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_worker(shared: &Arc<PoolShared>, state: &mut PoolState) -> std::io::Result<()> {
        state.spawned += 1;
        let mut builder = thread::Builder::new().name(format!("{}-{}", shared.name_prefix, state.spawned));
        if let Some(size) = shared.stack_size {
            builder = builder.stack_size(size);
        }

        let worker = Arc::clone(shared);
        builder.spawn(move || worker.work())?;

        state.active += 1;
        shared.stats.observe_workers(state.active);
        Ok(())
    }

    fn work(&self) {
        tracing::debug!("Worker started");
        loop {
            let job = {
                let mut state = self.state();
                match state.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        state.active -= 1;
                        if state.active == 0 {
                            self.idle.notify_all();
                        }
                        break;
                    }
                }
            };
            self.run(job);
        }
        tracing::debug!("Worker exited");
    }

    fn run(&self, job: Job) {
        let completion = Completion::new(&job, self);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut checkpoint = Checkpoint::new(
                &job,
                &self.mailboxes,
                &self.cancellations,
                &self.stats,
                &self.closing,
            );
            if checkpoint.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            self.transport.execute(&job.operation, &mut checkpoint)
        }));

        let payload = match outcome {
            Ok(Ok(response)) => Payload::Response(response),
            Ok(Err(err)) => {
                tracing::debug!(context = %job.context, callback = %job.callback, "Job failed: {}", err);
                Payload::Failure(err.to_string())
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                tracing::error!(context = %job.context, callback = %job.callback, "Transport panicked: {}", message);
                Payload::Failure(format!("Transport panicked: {}", message))
            }
        };
        completion.complete(payload);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Deposits exactly one terminal result for a job.
///
/// Dropping it without calling [`complete`](Self::complete) deposits a failure.
struct Completion<'a> {
    job: &'a Job,
    shared: &'a PoolShared,
    done: bool,
}

impl<'a> Completion<'a> {
    fn new(job: &'a Job, shared: &'a PoolShared) -> Self {
        Self { job, shared, done: false }
    }

    fn complete(mut self, payload: Payload) {
        self.deposit(payload);
    }

    fn deposit(&mut self, payload: Payload) {
        debug_assert!(payload.is_terminal());
        self.done = true;

        let job = self.job;
        let shared = self.shared;
        shared.stats.job_completed();
        if !shared.mailboxes.deposit(job.result(payload)) {
            shared.stats.result_dropped();
            for callback in job.refs() {
                shared.cancellations.unregister(job.context, callback);
            }
            tracing::debug!(context = %job.context, callback = %job.callback, "Context gone, terminal result dropped");
        }
    }
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.deposit(Payload::Failure("Job abandoned before completion".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, Step};
    use tickbridge_common::{CallbackRef, ContextId, Operation};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        pool: WorkerPool,
        transport: Arc<ScriptedTransport>,
        mailboxes: Arc<Mailboxes>,
        cancellations: Arc<CancellationRegistry>,
        stats: Arc<BridgeStats>,
    }

    fn fixture(config: BridgeConfig, transport: ScriptedTransport) -> Fixture {
        let transport = Arc::new(transport);
        let mailboxes = Arc::new(Mailboxes::new());
        mailboxes.attach(ContextId(1));
        let cancellations = Arc::new(CancellationRegistry::new());
        let stats = Arc::new(BridgeStats::new());
        let pool = WorkerPool::new(
            &config,
            transport.clone(),
            mailboxes.clone(),
            cancellations.clone(),
            stats.clone(),
        );
        Fixture { pool, transport, mailboxes, cancellations, stats }
    }

    fn job(callback: u64, target: &str) -> Job {
        Job::new(ContextId(1), CallbackRef(callback), Operation::get(target))
    }

    fn terminal_payloads(f: &Fixture) -> Vec<(CallbackRef, Payload)> {
        f.mailboxes
            .get(ContextId(1))
            .unwrap()
            .take_all()
            .into_iter()
            .filter(|r| r.is_terminal())
            .map(|r| (r.callback, r.payload))
            .collect()
    }

    #[test]
    fn test_never_exceeds_worker_cap() {
        let transport = (0..10).fold(ScriptedTransport::new(), |t, i| {
            t.route(&format!("http://held/{}", i), vec![Step::Hold], 200)
        });
        let f = fixture(BridgeConfig::default().with_max_workers(3), transport);

        for i in 0..10 {
            f.pool.enqueue(job(i, &format!("http://held/{}", i))).unwrap();
        }
        assert!(f.transport.wait_for_running(3, WAIT));
        assert_eq!(f.pool.active_workers(), 3);
        assert_eq!(f.pool.queued(), 7);

        f.transport.release_held();
        assert!(f.pool.wait_idle(WAIT));
        assert_eq!(f.transport.peak(), 3);
        assert_eq!(f.stats.snapshot().peak_workers, 3);
        assert_eq!(terminal_payloads(&f).len(), 10);
    }

    #[test]
    fn test_idle_pool_has_no_workers() {
        let f = fixture(BridgeConfig::default(), ScriptedTransport::new());
        f.pool.enqueue(job(1, "http://a")).unwrap();
        assert!(f.pool.wait_idle(WAIT));
        assert_eq!(f.pool.active_workers(), 0);
    }

    #[test]
    fn test_full_queue_rejects() {
        let transport = ScriptedTransport::new().route("http://held", vec![Step::Hold], 200);
        let f = fixture(
            BridgeConfig::default().with_max_workers(1).with_queue_capacity(Some(1)),
            transport,
        );

        f.pool.enqueue(job(1, "http://held")).unwrap();
        assert!(f.transport.wait_for_running(1, WAIT));
        f.pool.enqueue(job(2, "http://b")).unwrap();

        let err = f.pool.enqueue(job(3, "http://c")).unwrap_err();
        assert!(matches!(err, BridgeError::QueueFull { capacity: 1 }));
        assert_eq!(f.stats.snapshot().jobs_rejected, 1);

        f.transport.release_held();
        assert!(f.pool.wait_idle(WAIT));
        let callbacks: Vec<_> = terminal_payloads(&f).into_iter().map(|(cb, _)| cb).collect();
        assert_eq!(callbacks, vec![CallbackRef(1), CallbackRef(2)]);
    }

    #[test]
    fn test_transport_failure_is_terminal() {
        let transport = ScriptedTransport::new().route("http://down", vec![Step::Fail("refused".into())], 200);
        let f = fixture(BridgeConfig::default(), transport);

        f.pool.enqueue(job(1, "http://down")).unwrap();
        assert!(f.pool.wait_idle(WAIT));
        assert_eq!(
            terminal_payloads(&f),
            vec![(CallbackRef(1), Payload::Failure("Transport error: refused".into()))]
        );
    }

    #[test]
    fn test_panicking_transport_still_completes() {
        let transport = ScriptedTransport::new().route("http://boom", vec![Step::Panic("kaboom".into())], 200);
        let f = fixture(BridgeConfig::default().with_max_workers(1), transport);

        f.pool.enqueue(job(1, "http://boom")).unwrap();
        f.pool.enqueue(job(2, "http://fine")).unwrap();
        assert!(f.pool.wait_idle(WAIT));

        let results = terminal_payloads(&f);
        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0].1, Payload::Failure(m) if m.contains("kaboom")));
        assert!(matches!(&results[1].1, Payload::Response(r) if r.status == 200));
    }

    #[test]
    fn test_cancelled_before_start_fails_without_executing() {
        let f = fixture(BridgeConfig::default(), ScriptedTransport::new());
        f.cancellations.register(ContextId(1), CallbackRef(4));

        f.pool.enqueue(job(4, "http://never")).unwrap();
        assert!(f.pool.wait_idle(WAIT));
        assert!(f.transport.started().is_empty());
        assert_eq!(
            terminal_payloads(&f),
            vec![(CallbackRef(4), Payload::Failure("Operation cancelled".into()))]
        );
    }

    #[test]
    fn test_detached_context_drops_terminal_and_clears_cancellation() {
        let transport = ScriptedTransport::new().route("http://held", vec![Step::Hold], 200);
        let f = fixture(BridgeConfig::default(), transport);

        f.pool.enqueue(job(1, "http://held")).unwrap();
        assert!(f.transport.wait_for_running(1, WAIT));
        f.cancellations.register(ContextId(1), CallbackRef(1));
        f.mailboxes.detach(ContextId(1));

        assert!(f.pool.wait_idle(WAIT));
        assert!(f.cancellations.is_empty());
        let snapshot = f.stats.snapshot();
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.results_dropped, 1);
    }

    #[test]
    fn test_shutdown_fails_queued_jobs() {
        let transport = ScriptedTransport::new().route("http://held", vec![Step::Hold], 200);
        let f = fixture(BridgeConfig::default().with_max_workers(1), transport);

        f.pool.enqueue(job(1, "http://held")).unwrap();
        assert!(f.transport.wait_for_running(1, WAIT));
        f.pool.enqueue(job(2, "http://queued")).unwrap();

        f.pool.shutdown();
        assert!(matches!(f.pool.enqueue(job(3, "http://late")), Err(BridgeError::Shutdown)));
        assert!(f.pool.wait_idle(WAIT));

        let results = terminal_payloads(&f);
        assert_eq!(results.len(), 2);
        assert!(results.contains(&(CallbackRef(2), Payload::Failure("Bridge is shut down".into()))));
        assert!(results.contains(&(CallbackRef(1), Payload::Failure("Operation cancelled".into()))));
        assert!(!f.transport.started().contains(&"http://queued".to_string()));
    }

    #[test]
    fn test_wait_idle_times_out() {
        let transport = ScriptedTransport::new().route("http://held", vec![Step::Hold], 200);
        let f = fixture(BridgeConfig::default(), transport);

        f.pool.enqueue(job(1, "http://held")).unwrap();
        assert!(!f.pool.wait_idle(Duration::from_millis(20)));
        f.transport.release_held();
        assert!(f.pool.wait_idle(WAIT));
    }
}
