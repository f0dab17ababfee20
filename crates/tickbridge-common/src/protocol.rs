//! tickbridge Data Model
//!
//! Identities, outbound jobs, deposited results and inbound units.
//!
//! # Lifecycle
//!
//! A [`Job`] is captured by value when a script asks for an outbound call, so
//! it outlives the submitting call frame. A worker runs it, may deposit any
//! number of partial [`JobResult`]s (progress ticks, streamed chunks) and then
//! deposits exactly one terminal result (response or failure).
//!
//! Inbound units ([`InboundRequest`], [`SocketEvent`]) travel the other way:
//! an accepting thread hands them to the owning context, which answers with a
//! JSON reply mapped through [`InboundReply::from_value`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static CONTEXT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static ENDPOINT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one script engine instance.
///
/// The bridge never owns the context it names; every access is preceded by a
/// liveness check through the script-engine collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Allocates a process-unique context id.
    pub fn next() -> Self {
        Self(CONTEXT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Handle into a script engine's reference table.
///
/// Released exactly once, by whichever side owns it at the time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallbackRef(pub u64);

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}", self.0)
    }
}

/// Identity of a registered inbound endpoint (server instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub u64);

impl EndpointId {
    pub fn next() -> Self {
        Self(ENDPOINT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint#{}", self.0)
    }
}

/// Allocates a process-unique id for an inbound connection.
pub fn next_connection_id() -> u64 {
    CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An outbound network operation, copied by value at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// URL of the remote resource
    pub target: String,
    /// HTTP method, upper case
    pub method: String,
    pub headers: Vec<(String, String)>,
    /// Query parameters appended to the target
    pub params: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Deadline handed to the transport itself; the bridge enforces none
    pub timeout_ms: Option<u64>,
    /// Deliver the response body as streamed chunks instead of one buffer
    pub stream: bool,
}

impl Operation {
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into().to_ascii_uppercase(),
            headers: Vec::new(),
            params: Vec::new(),
            body: None,
            timeout_ms: None,
            stream: false,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new("GET", target)
    }

    pub fn post(target: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::new("POST", target).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn streamed(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Size of the request body in bytes.
    pub fn body_len(&self) -> u64 {
        self.body.as_ref().map(|b| b.len() as u64).unwrap_or(0)
    }
}

/// Transfer progress as reported by a transport checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total_out: u64,
    pub sent_out: u64,
    pub total_in: u64,
    pub received_in: u64,
}

impl Progress {
    pub fn new(total_out: u64, sent_out: u64, total_in: u64, received_in: u64) -> Self {
        Self { total_out, sent_out, total_in, received_in }
    }
}

/// Final response of a successful outbound operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn new(status: u16) -> Self {
        Self { status, ..Default::default() }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One inbound HTTP request admitted into a context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub remote: Option<String>,
}

/// Inbound WebSocket activity for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SocketEvent {
    Open { connection: u64 },
    Message { connection: u64, data: Vec<u8>, binary: bool },
    Close { connection: u64 },
}

impl SocketEvent {
    pub fn connection(&self) -> u64 {
        match self {
            Self::Open { connection }
            | Self::Message { connection, .. }
            | Self::Close { connection } => *connection,
        }
    }
}

/// What a callback is invoked with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Partial: a transfer progress tick
    Progress(Progress),
    /// Partial: one streamed body chunk
    Chunk(Vec<u8>),
    /// Terminal: the operation completed with a response
    Response(TransportResponse),
    /// Terminal: the operation failed or was aborted
    Failure(String),
    /// Inbound HTTP request for a handler
    Request(InboundRequest),
    /// Inbound WebSocket event for a handler
    Socket(SocketEvent),
}

impl Payload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Response(_) | Self::Failure(_))
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, Self::Progress(_) | Self::Chunk(_))
    }
}

/// One outbound job as queued for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub context: ContextId,
    /// Receives the terminal result
    pub callback: CallbackRef,
    /// Receives partial results when present
    pub progress: Option<CallbackRef>,
    pub operation: Operation,
}

impl Job {
    pub fn new(context: ContextId, callback: CallbackRef, operation: Operation) -> Self {
        Self { context, callback, progress: None, operation }
    }

    pub fn with_progress(mut self, progress: CallbackRef) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Every ref this job owns, terminal callback first.
    pub fn refs(&self) -> impl Iterator<Item = CallbackRef> {
        std::iter::once(self.callback).chain(self.progress)
    }

    /// Builds a result for this job carrying `payload`.
    pub fn result(&self, payload: Payload) -> JobResult {
        JobResult {
            context: self.context,
            callback: self.callback,
            progress: self.progress,
            payload,
        }
    }
}

/// A (possibly partial) outcome of a job, deposited for later delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub context: ContextId,
    pub callback: CallbackRef,
    pub progress: Option<CallbackRef>,
    pub payload: Payload,
}

impl JobResult {
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    /// The ref to invoke: partial results go to the progress ref when the job has one.
    pub fn target(&self) -> CallbackRef {
        if self.payload.is_partial() {
            self.progress.unwrap_or(self.callback)
        } else {
            self.callback
        }
    }

    pub fn refs(&self) -> impl Iterator<Item = CallbackRef> {
        std::iter::once(self.callback).chain(self.progress)
    }
}

/// Reply produced by an inbound handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// `None` means "no content"
    pub body: Option<Vec<u8>>,
}

impl InboundReply {
    pub fn new(status: u16) -> Self {
        Self { status, headers: Vec::new(), body: None }
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
            body: Some(message.into().into_bytes()),
        }
    }

    /// Maps a handler's JSON return value onto a reply.
    ///
    /// - `null` → 204
    /// - string → 200 `text/plain`
    /// - object with any of `status`, `headers`, `body` → that reply
    /// - anything else → 200 `application/json`
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => Self::no_content(),
            Value::String(text) => Self {
                status: 200,
                headers: vec![("Content-Type".into(), "text/plain; charset=utf-8".into())],
                body: Some(text.clone().into_bytes()),
            },
            Value::Object(map)
                if map.contains_key("status") || map.contains_key("body") || map.contains_key("headers") =>
            {
                let status = map
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(200);

                let mut headers: Vec<(String, String)> = map
                    .get("headers")
                    .and_then(Value::as_object)
                    .map(|h| {
                        h.iter()
                            .map(|(k, v)| {
                                let v = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                                (k.clone(), v)
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let body = match map.get("body") {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) => Some(s.clone().into_bytes()),
                    Some(other) => {
                        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                            headers.push(("Content-Type".into(), "application/json".into()));
                        }
                        Some(other.to_string().into_bytes())
                    }
                };

                Self { status, headers, body }
            }
            other => Self {
                status: 200,
                headers: vec![("Content-Type".into(), "application/json".into())],
                body: Some(other.to_string().into_bytes()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_ids_are_unique() {
        let a = ContextId::next();
        let b = ContextId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_operation_builder() {
        let op = Operation::new("post", "http://localhost/upload")
            .with_header("X-Trace", "1")
            .with_param("page", "2")
            .with_body("hello")
            .with_timeout(500)
            .streamed();

        assert_eq!(op.method, "POST");
        assert_eq!(op.headers, vec![("X-Trace".to_string(), "1".to_string())]);
        assert_eq!(op.params, vec![("page".to_string(), "2".to_string())]);
        assert_eq!(op.body_len(), 5);
        assert_eq!(op.timeout_ms, Some(500));
        assert!(op.stream);
    }

    #[test]
    fn test_payload_classification() {
        assert!(Payload::Progress(Progress::default()).is_partial());
        assert!(Payload::Chunk(vec![1]).is_partial());
        assert!(Payload::Response(TransportResponse::new(200)).is_terminal());
        assert!(Payload::Failure("boom".into()).is_terminal());
        let request = Payload::Request(InboundRequest::default());
        assert!(!request.is_terminal() && !request.is_partial());
    }

    #[test]
    fn test_partial_results_target_progress_ref() {
        let job = Job::new(ContextId(1), CallbackRef(10), Operation::get("http://x"))
            .with_progress(CallbackRef(11));

        assert_eq!(job.result(Payload::Chunk(vec![])).target(), CallbackRef(11));
        assert_eq!(job.result(Payload::Failure("x".into())).target(), CallbackRef(10));
        assert_eq!(job.refs().collect::<Vec<_>>(), vec![CallbackRef(10), CallbackRef(11)]);
    }

    #[test]
    fn test_partial_results_fall_back_to_callback() {
        let job = Job::new(ContextId(1), CallbackRef(10), Operation::get("http://x"));
        assert_eq!(job.result(Payload::Progress(Progress::default())).target(), CallbackRef(10));
    }

    #[test]
    fn test_reply_from_null_is_no_content() {
        assert_eq!(InboundReply::from_value(&Value::Null).status, 204);
    }

    #[test]
    fn test_reply_from_string() {
        let reply = InboundReply::from_value(&json!("hi"));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, Some(b"hi".to_vec()));
    }

    #[test]
    fn test_reply_from_object_with_status() {
        let reply = InboundReply::from_value(&json!({
            "status": 201,
            "headers": {"X-Id": "9"},
            "body": {"ok": true}
        }));
        assert_eq!(reply.status, 201);
        assert!(reply.headers.contains(&("X-Id".to_string(), "9".to_string())));
        assert!(reply.headers.iter().any(|(k, v)| k == "Content-Type" && v == "application/json"));
        assert_eq!(reply.body, Some(br#"{"ok":true}"#.to_vec()));
    }

    #[test]
    fn test_reply_from_plain_object_is_json() {
        let reply = InboundReply::from_value(&json!({"answer": 42}));
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, Some(br#"{"answer":42}"#.to_vec()));
    }

    #[test]
    fn test_socket_event_serializes_with_type_tag() {
        let event = SocketEvent::Close { connection: 4 };
        assert_eq!(serde_json::to_value(&event).unwrap(), json!({"type": "close", "connection": 4}));
        assert_eq!(event.connection(), 4);
    }
}
