//! Outbound Transport Tests
//!
//! Runs real HTTP requests through a bridge backed by [`HttpTransport`]
//! against a local upstream server. These are plain (non-async) tests since
//! the blocking client must live outside any tokio runtime.

mod common;

use common::{spawn_upstream, BIG_BODY_LEN};
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tickbridge_common::{CallbackRef, ContextId, Job, Operation, Payload};
use tickbridge_core::testing::RecordingEngine;
use tickbridge_core::{Bridge, ScriptEngine};
use tickbridge_net::HttpTransport;

struct Harness {
    bridge: Arc<Bridge>,
    context: ContextId,
    engine: RecordingEngine,
}

impl Harness {
    fn new() -> Self {
        Self::with_transport(HttpTransport::new().unwrap())
    }

    fn with_transport(transport: HttpTransport) -> Self {
        let bridge = Bridge::builder(transport).build().unwrap();
        let context = ContextId::next();
        bridge.attach_context(context);
        Self {
            bridge,
            context,
            engine: RecordingEngine::new(),
        }
    }

    fn submit(&mut self, operation: Operation, with_progress: bool) -> (CallbackRef, Option<CallbackRef>) {
        let callback = self.engine.new_ref(self.context, "done".into()).unwrap();
        let mut job = Job::new(self.context, callback, operation);
        let progress = if with_progress {
            let progress = self.engine.new_ref(self.context, "progress".into()).unwrap();
            job = job.with_progress(progress);
            Some(progress)
        } else {
            None
        };
        self.bridge.submit(job).unwrap();
        (callback, progress)
    }

    /// Pumps until `callback` received its terminal result.
    fn terminal(&mut self, callback: CallbackRef) -> Payload {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            self.bridge.pump(self.context, &mut self.engine);
            if let Some(payload) = self.engine.payloads(callback).into_iter().find(Payload::is_terminal) {
                return payload;
            }
            assert!(Instant::now() < deadline, "no terminal result for {}", callback);
            thread::sleep(Duration::from_millis(2));
        }
    }
}

fn url(addr: std::net::SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

// ============================================================================
// Test 1: Plain Requests
// ============================================================================

#[test]
fn test_get_returns_response() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let (callback, _) = harness.submit(Operation::get(url(upstream, "/hello")), false);
    match harness.terminal(callback) {
        Payload::Response(response) => {
            assert_eq!(response.status, 200);
            assert_eq!(response.body_text(), "hello");
            assert!(response.headers.iter().any(|(k, v)| k == "content-length" && v == "5"));
        }
        other => panic!("unexpected payload: {:?}", other),
    }
    assert_eq!(harness.bridge.outstanding_refs(harness.context), 0);
    assert_eq!(harness.engine.released(), &[callback]);
}

#[test]
fn test_error_status_is_a_response_not_a_failure() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let (callback, _) = harness.submit(Operation::get(url(upstream, "/missing")), false);
    match harness.terminal(callback) {
        Payload::Response(response) => assert_eq!(response.status, 404),
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn test_method_headers_params_and_body_are_sent() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let operation = Operation::post(url(upstream, "/echo"), "payload")
        .with_header("X-Trace", "abc")
        .with_param("page", "2");
    let (callback, _) = harness.submit(operation, false);

    let Payload::Response(response) = harness.terminal(callback) else {
        panic!("expected a response");
    };
    let echoed: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(
        echoed,
        json!({"method": "POST", "query": "page=2", "trace": "abc", "body": "payload"})
    );
}

// ============================================================================
// Test 2: Progress and Streaming
// ============================================================================

#[test]
fn test_streamed_body_arrives_as_chunks() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let (callback, progress) = harness.submit(Operation::get(url(upstream, "/big")).streamed(), true);
    let progress = progress.unwrap();

    let Payload::Response(response) = harness.terminal(callback) else {
        panic!("expected a response");
    };
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());

    let partials = harness.engine.payloads(progress);
    let streamed: usize = partials
        .iter()
        .map(|p| match p {
            Payload::Chunk(data) => data.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(streamed, BIG_BODY_LEN);

    let last_tick = partials
        .iter()
        .rev()
        .find_map(|p| match p {
            Payload::Progress(progress) => Some(*progress),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_tick.received_in, BIG_BODY_LEN as u64);
    assert_eq!(last_tick.total_in, BIG_BODY_LEN as u64);

    // partials never reach the terminal callback
    assert_eq!(harness.engine.payloads(callback).len(), 1);
}

#[test]
fn test_buffered_body_with_progress() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let (callback, progress) = harness.submit(Operation::get(url(upstream, "/big")), true);

    let Payload::Response(response) = harness.terminal(callback) else {
        panic!("expected a response");
    };
    assert_eq!(response.body.len(), BIG_BODY_LEN);

    let partials = harness.engine.payloads(progress.unwrap());
    assert!(partials.iter().all(|p| matches!(p, Payload::Progress(_))));
    assert!(partials.len() >= 2);
}

#[test]
fn test_progress_callback_returning_false_cancels() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let (callback, progress) = harness.submit(Operation::get(url(upstream, "/slow")), true);
    harness.engine.set_return(progress.unwrap(), json!(false));

    assert_eq!(harness.terminal(callback), Payload::Failure("Operation cancelled".into()));
    assert!(harness.bridge.stats().cancellations >= 1);
    assert_eq!(harness.bridge.outstanding_refs(harness.context), 0);
}

// ============================================================================
// Test 3: Failures
// ============================================================================

#[test]
fn test_per_operation_timeout() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let (callback, _) = harness.submit(Operation::get(url(upstream, "/slow")).with_timeout(50), false);
    match harness.terminal(callback) {
        Payload::Failure(message) => assert!(message.starts_with("Transport error"), "{}", message),
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn test_no_deadline_without_timeout_ms() {
    let upstream = spawn_upstream();
    let transport = HttpTransport::new().unwrap();
    assert_eq!(transport.default_timeout(), None);
    let mut harness = Harness::with_transport(transport);

    let (callback, _) = harness.submit(Operation::get(url(upstream, "/slow")), false);
    match harness.terminal(callback) {
        Payload::Response(response) => assert_eq!(response.status, 200),
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn test_transport_default_timeout_applies_without_timeout_ms() {
    let upstream = spawn_upstream();
    let transport = HttpTransport::with_default_timeout(Some(Duration::from_millis(50))).unwrap();
    let mut harness = Harness::with_transport(transport);

    let (timed_out, _) = harness.submit(Operation::get(url(upstream, "/slow")), false);
    assert!(matches!(harness.terminal(timed_out), Payload::Failure(m) if m.contains("timed out")));

    // an explicit timeout_ms replaces the transport default
    let (answered, _) = harness.submit(Operation::get(url(upstream, "/slow")).with_timeout(5_000), false);
    assert!(matches!(harness.terminal(answered), Payload::Response(r) if r.status == 200));
}

#[test]
fn test_refused_connection_fails() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut harness = Harness::new();

    let (callback, _) = harness.submit(Operation::get(url(addr, "/")), false);
    assert!(matches!(harness.terminal(callback), Payload::Failure(m) if m.starts_with("Transport error")));
}

#[test]
fn test_invalid_method_fails() {
    let upstream = spawn_upstream();
    let mut harness = Harness::new();

    let (callback, _) = harness.submit(Operation::new("NOT VALID", url(upstream, "/hello")), false);
    assert!(matches!(harness.terminal(callback), Payload::Failure(m) if m.starts_with("Invalid request")));
}
