//! Outbound HTTP transport backed by a blocking `reqwest` client.
//!
//! Runs on pool workers only. The body is read in fixed-size pieces so the
//! checkpoint sees every piece: progress is reported before the request is
//! sent, once the response head arrived, and after every piece of the body.

use reqwest::blocking::{Client, Response};
use reqwest::Method;
use std::io::Read;
use std::time::Duration;
use tickbridge_common::{BridgeError, Operation, Result, TransportResponse};
use tickbridge_core::{Checkpoint, Transport};

const READ_CHUNK: usize = 16 * 1024;

/// HTTP(S) transport shared by all workers of a bridge.
///
/// # Example
///
/// ```no_run
/// use tickbridge_core::Bridge;
/// use tickbridge_net::HttpTransport;
///
/// let bridge = Bridge::builder(HttpTransport::new().unwrap()).build().unwrap();
/// ```
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    read_chunk: usize,
    default_timeout: Option<Duration>,
}

impl HttpTransport {
    /// A transport without any deadline of its own: only an operation's
    /// `timeout_ms` bounds it.
    pub fn new() -> Result<Self> {
        Self::with_default_timeout(None)
    }

    /// A transport whose operations without `timeout_ms` are bounded by `timeout`.
    pub fn with_default_timeout(timeout: Option<Duration>) -> Result<Self> {
        // reqwest's blocking client would otherwise apply its own 30s default
        let client = Client::builder()
            .user_agent(concat!("tickbridge/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            default_timeout: timeout,
            ..Self::with_client(client)
        })
    }

    /// Wraps a preconfigured client; its own timeout settings apply.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            read_chunk: READ_CHUNK,
            default_timeout: None,
        }
    }

    /// Deadline applied to operations without `timeout_ms`, as configured
    /// through [`with_default_timeout`](Self::with_default_timeout).
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Size of the pieces the body is read (and streamed) in.
    pub fn with_read_chunk(mut self, size: usize) -> Self {
        self.read_chunk = size.max(1);
        self
    }

    fn send(&self, operation: &Operation) -> Result<Response> {
        let method = Method::from_bytes(operation.method.as_bytes())
            .map_err(|_| BridgeError::InvalidRequest(format!("Invalid HTTP method: {}", operation.method)))?;

        let mut request = self.client.request(method, &operation.target);
        if !operation.params.is_empty() {
            request = request.query(&operation.params);
        }
        for (name, value) in &operation.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(timeout_ms) = operation.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }
        if let Some(body) = &operation.body {
            request = request.body(body.clone());
        }

        request.send().map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> BridgeError {
    if err.is_timeout() {
        BridgeError::Transport(format!("Request timed out: {}", err))
    } else if err.is_connect() {
        BridgeError::Transport(format!("Connection failed: {}", err))
    } else {
        BridgeError::Transport(err.to_string())
    }
}

impl Transport for HttpTransport {
    fn execute(&self, operation: &Operation, checkpoint: &mut Checkpoint<'_>) -> Result<TransportResponse> {
        let total_out = operation.body_len();
        if !checkpoint.progress(total_out, 0, 0, 0) {
            return Err(BridgeError::Cancelled);
        }

        let mut response = self.send(operation)?;
        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let total_in = response.content_length().unwrap_or(0);

        if !checkpoint.progress(total_out, total_out, total_in, 0) {
            return Err(BridgeError::Cancelled);
        }

        let stream = checkpoint.wants_stream();
        let mut body = Vec::new();
        let mut buf = vec![0u8; self.read_chunk];
        let mut received: u64 = 0;

        loop {
            let n = response
                .read(&mut buf)
                .map_err(|e| BridgeError::Transport(format!("Failed to read response body: {}", e)))?;
            if n == 0 {
                break;
            }
            received += n as u64;

            if stream {
                if !checkpoint.chunk(&buf[..n]) {
                    return Err(BridgeError::Cancelled);
                }
            } else {
                body.extend_from_slice(&buf[..n]);
            }
            if !checkpoint.progress(total_out, total_out, total_in.max(received), received) {
                return Err(BridgeError::Cancelled);
            }
        }

        tracing::debug!(target_url = %operation.target, status, received, "Outbound request finished");
        Ok(TransportResponse { status, headers, body })
    }
}
