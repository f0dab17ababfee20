//! Deterministic collaborators for exercising the bridge without a network
//! or a real script engine.
//!
//! - [`ScriptedTransport`] runs a per-target list of [`Step`]s and tracks how
//!   many operations execute at once.
//! - [`RecordingEngine`] hands out refs, records every invocation and every
//!   release, and can be told that a context died.
//! - [`LocalEndpoint`] is an inbound endpoint without a socket; tests admit
//!   units into it from plain threads.

use crate::connections::{InboundChannel, InboundEndpoint};
use crate::engine::ScriptEngine;
use crate::transport::{Checkpoint, Transport};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tickbridge_common::{
    BridgeError, CallbackRef, ContextId, EndpointId, Operation, Payload, Progress, Result,
    TransportResponse,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One step of a scripted operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Report progress; abort with `Cancelled` if the checkpoint says so
    Progress(Progress),
    /// Stream a chunk, or append it to the body when the operation is not streamed
    Chunk(Vec<u8>),
    /// Block until [`ScriptedTransport::release_held`] or cancellation
    Hold,
    /// Fail with a transport error
    Fail(String),
    /// Panic inside the worker
    Panic(String),
}

/// Transport whose behavior is scripted per target URL.
///
/// Targets without a script respond `200` with the target as body.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, (Vec<Step>, u16)>>,
    gate_open: Mutex<bool>,
    gate: Condvar,
    running: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts `target` to run `steps` and then respond with `status`.
    pub fn route(self, target: &str, steps: Vec<Step>, status: u16) -> Self {
        lock(&self.scripts).insert(target.to_string(), (steps, status));
        self
    }

    /// Opens the gate for every current and future [`Step::Hold`].
    pub fn release_held(&self) {
        *lock(&self.gate_open) = true;
        self.gate.notify_all();
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of operations seen executing at the same time.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Targets in the order their execution started.
    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    /// Polls until `count` operations are executing at once.
    pub fn wait_for_running(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.running() == count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.running() == count
    }

    fn hold(&self, checkpoint: &mut Checkpoint<'_>) -> Result<()> {
        let mut open = lock(&self.gate_open);
        while !*open {
            if checkpoint.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }
            open = self
                .gate
                .wait_timeout(open, Duration::from_millis(5))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Ok(())
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, operation: &Operation, checkpoint: &mut Checkpoint<'_>) -> Result<TransportResponse> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = Running(&self.running);
        self.peak.fetch_max(now, Ordering::SeqCst);
        lock(&self.started).push(operation.target.clone());

        let script = lock(&self.scripts).get(&operation.target).cloned();
        let Some((steps, status)) = script else {
            return Ok(TransportResponse::new(200).with_body(operation.target.clone()));
        };

        let mut body = Vec::new();
        for step in steps {
            match step {
                Step::Progress(p) => {
                    if !checkpoint.progress(p.total_out, p.sent_out, p.total_in, p.received_in) {
                        return Err(BridgeError::Cancelled);
                    }
                }
                Step::Chunk(data) => {
                    if checkpoint.wants_stream() {
                        if !checkpoint.chunk(&data) {
                            return Err(BridgeError::Cancelled);
                        }
                    } else {
                        body.extend_from_slice(&data);
                    }
                }
                Step::Hold => self.hold(checkpoint)?,
                Step::Fail(message) => return Err(BridgeError::Transport(message)),
                Step::Panic(message) => panic!("{}", message),
            }
        }

        Ok(TransportResponse::new(status).with_body(body))
    }
}

/// One recorded callback invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub context: ContextId,
    pub callback: CallbackRef,
    pub label: String,
    pub payload: Payload,
}

/// Script engine stand-in; a ref's value is a label used in assertions.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    next_ref: u64,
    labels: HashMap<CallbackRef, String>,
    dead: HashSet<ContextId>,
    returns: HashMap<CallbackRef, Value>,
    failures: HashMap<CallbackRef, String>,
    invocations: Vec<Invocation>,
    released: Vec<CallbackRef>,
    double_releases: Vec<CallbackRef>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `context` dead; the bridge must stop touching it.
    pub fn kill(&mut self, context: ContextId) {
        self.dead.insert(context);
    }

    /// Makes `callback` return `value` from now on.
    pub fn set_return(&mut self, callback: CallbackRef, value: Value) {
        self.returns.insert(callback, value);
    }

    /// Makes `callback` raise an error from now on.
    pub fn fail_on(&mut self, callback: CallbackRef, message: &str) {
        self.failures.insert(callback, message.to_string());
    }

    pub fn invocations(&self) -> &[Invocation] {
        &self.invocations
    }

    /// Payloads `callback` was invoked with, in order.
    pub fn payloads(&self, callback: CallbackRef) -> Vec<Payload> {
        self.invocations
            .iter()
            .filter(|i| i.callback == callback)
            .map(|i| i.payload.clone())
            .collect()
    }

    pub fn released(&self) -> &[CallbackRef] {
        &self.released
    }

    pub fn double_releases(&self) -> &[CallbackRef] {
        &self.double_releases
    }

    /// Refs created and not yet released.
    pub fn live_refs(&self) -> usize {
        self.labels.len()
    }
}

impl ScriptEngine for RecordingEngine {
    type Value = String;

    fn new_ref(&mut self, _context: ContextId, value: String) -> Result<CallbackRef> {
        self.next_ref += 1;
        let callback = CallbackRef(self.next_ref);
        self.labels.insert(callback, value);
        Ok(callback)
    }

    fn invoke(&mut self, context: ContextId, callback: CallbackRef, payload: &Payload) -> Result<Value> {
        let label = self
            .labels
            .get(&callback)
            .cloned()
            .ok_or_else(|| BridgeError::Callback(format!("{} was already released", callback)))?;
        self.invocations.push(Invocation {
            context,
            callback,
            label,
            payload: payload.clone(),
        });

        if let Some(message) = self.failures.get(&callback) {
            return Err(BridgeError::Callback(message.clone()));
        }
        Ok(self.returns.get(&callback).cloned().unwrap_or(Value::Null))
    }

    fn release_ref(&mut self, _context: ContextId, callback: CallbackRef) {
        if self.labels.remove(&callback).is_some() {
            self.released.push(callback);
        } else {
            self.double_releases.push(callback);
        }
    }

    fn context_is_alive(&self, context: ContextId) -> bool {
        !self.dead.contains(&context)
    }
}

/// Inbound endpoint with no socket behind it.
pub struct LocalEndpoint {
    id: EndpointId,
    channel: InboundChannel,
    running: AtomicBool,
}

impl LocalEndpoint {
    pub fn new(channel: InboundChannel) -> Self {
        Self {
            id: EndpointId::next(),
            channel,
            running: AtomicBool::new(true),
        }
    }

    /// Blocks like an accepting thread until the owner answers.
    pub fn admit(&self, payload: Payload) -> Result<Value> {
        self.channel.admit(payload)
    }

    pub fn notify(&self, payload: Payload) {
        self.channel.notify(payload);
    }

    pub fn channel(&self) -> &InboundChannel {
        &self.channel
    }
}

impl InboundEndpoint for LocalEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn flush(&self, dispatch: &mut dyn FnMut(Payload) -> Value) -> usize {
        self.channel.flush(dispatch)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.channel.close();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
