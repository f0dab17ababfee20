//! Inbound HTTP endpoint.
//!
//! # Architecture
//!
//! The endpoint runs a hyper HTTP/1.1 server on its own [`ServerThread`]:
//! - Each accepted connection is served by a tokio task
//! - Each request is collected and admitted into the owning context through
//!   the endpoint's [`InboundChannel`], on a blocking task
//! - The handler's return value is mapped with [`InboundReply::from_value`]
//!
//! Requests are answered strictly in admission order, one at a time. A
//! request that cannot be admitted (timeout or shutdown) gets a 503 and its
//! connection is closed.

use crate::server::ServerThread;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONNECTION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tickbridge_common::{EndpointId, InboundReply, InboundRequest, Payload, Result};
use tickbridge_core::{InboundChannel, InboundEndpoint};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// HTTP server whose requests are handled by a script context.
///
/// # Example
///
/// ```no_run
/// use tickbridge_core::{Bridge, testing::ScriptedTransport};
/// use tickbridge_common::{CallbackRef, ContextId};
/// use tickbridge_net::HttpEndpoint;
///
/// let bridge = Bridge::builder(ScriptedTransport::new()).build().unwrap();
/// let context = ContextId::next();
/// bridge.attach_context(context);
///
/// let endpoint = HttpEndpoint::bind("127.0.0.1:0".parse().unwrap(), bridge.inbound_channel()).unwrap();
/// bridge.register_endpoint(context, CallbackRef(1), endpoint).unwrap();
/// ```
pub struct HttpEndpoint {
    id: EndpointId,
    channel: Arc<InboundChannel>,
    server: ServerThread,
}

impl HttpEndpoint {
    /// Binds `addr` and starts accepting. Port 0 picks a free port.
    pub fn bind(addr: SocketAddr, channel: InboundChannel) -> Result<Arc<Self>> {
        let id = EndpointId::next();
        let channel = Arc::new(channel);

        let accept_channel = channel.clone();
        let server = ServerThread::spawn(format!("tickbridge-http-{}", id.0), addr, move |listener, shutdown| {
            accept_loop(listener, accept_channel, shutdown)
        })?;

        tracing::info!(endpoint = %id, "HTTP endpoint listening on {}", server.local_addr());
        Ok(Arc::new(Self { id, channel, server }))
    }

    pub fn channel(&self) -> &InboundChannel {
        &self.channel
    }
}

impl InboundEndpoint for HttpEndpoint {
    fn id(&self) -> EndpointId {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.server.local_addr())
    }

    fn flush(&self, dispatch: &mut dyn FnMut(Payload) -> Value) -> usize {
        self.channel.flush(dispatch)
    }

    fn stop(&self) {
        if !self.channel.is_closed() {
            tracing::info!(endpoint = %self.id, "Stopping HTTP endpoint");
        }
        // Waiting requests must be failed before the runtime is torn down.
        self.channel.close();
        self.server.stop();
    }

    fn is_running(&self) -> bool {
        !self.channel.is_closed() && self.server.is_running()
    }
}

async fn accept_loop(listener: TcpListener, channel: Arc<InboundChannel>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                };

                let channel = channel.clone();
                tokio::task::spawn(async move {
                    let service = service_fn(move |req| {
                        let channel = channel.clone();
                        async move { handle_request(channel, remote, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        tracing::debug!(remote = %remote, "Error serving connection: {}", err);
                    }
                });
            }
        }
    }
    tracing::debug!("HTTP accept loop finished");
}

async fn handle_request(
    channel: Arc<InboundChannel>,
    remote: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => {
            tracing::debug!(remote = %remote, "Failed to read request body: {}", e);
            return Ok(to_response(InboundReply::error(400, "Failed to read request body")));
        }
    };

    let request = InboundRequest {
        method: parts.method.as_str().to_string(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body,
        remote: Some(remote.to_string()),
    };

    let admitted = tokio::task::spawn_blocking(move || channel.admit(Payload::Request(request))).await;

    let response = match admitted {
        Ok(Ok(value)) => to_response(InboundReply::from_value(&value)),
        Ok(Err(err)) if err.is_connection_fatal() => {
            tracing::warn!(remote = %remote, "Request not admitted: {}", err);
            let mut response = to_response(InboundReply::error(503, err.to_string()));
            response.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
            response
        }
        Ok(Err(err)) => to_response(InboundReply::error(500, err.to_string())),
        Err(e) => {
            tracing::error!(remote = %remote, "Admission task failed: {}", e);
            to_response(InboundReply::error(500, "Internal server error"))
        }
    };
    Ok(response)
}

fn to_response(reply: InboundReply) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(reply.body.unwrap_or_default())));
    *response.status_mut() = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    for (name, value) in reply.headers {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping invalid reply header"),
        }
    }
    response
}
