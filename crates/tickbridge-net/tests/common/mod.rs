//! Shared fixtures for the network tests: an upstream HTTP server for the
//! outbound transport and an owner loop that pumps a context on its own thread.

#![allow(dead_code)]

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tickbridge_common::ContextId;
use tickbridge_core::testing::RecordingEngine;
use tickbridge_core::Bridge;
use tokio::net::TcpListener;

pub const BIG_BODY_LEN: usize = 64 * 1024;
pub const SLOW_DELAY: Duration = Duration::from_millis(500);

/// Starts the upstream server on a background runtime thread.
///
/// Routes:
/// - `/hello` - 200 `hello`
/// - `/echo` - 200 with a JSON description of the request
/// - `/big` - 200 with [`BIG_BODY_LEN`] bytes
/// - `/slow` - 200 `late` after [`SLOW_DELAY`]
/// - anything else - 404
pub fn spawn_upstream() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service_fn(route))
                        .await;
                });
            }
        });
    });

    addr
}

async fn route(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/hello" => Response::new(Full::new(Bytes::from_static(b"hello"))),
        "/echo" => {
            let method = req.method().to_string();
            let query = req.uri().query().map(str::to_string);
            let trace = req
                .headers()
                .get("x-trace")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let description = json!({
                "method": method,
                "query": query,
                "trace": trace,
                "body": String::from_utf8_lossy(&body),
            });
            Response::new(Full::new(Bytes::from(description.to_string())))
        }
        "/big" => Response::new(Full::new(Bytes::from(vec![b'x'; BIG_BODY_LEN]))),
        "/slow" => {
            tokio::time::sleep(SLOW_DELAY).await;
            Response::new(Full::new(Bytes::from_static(b"late")))
        }
        _ => {
            let mut response = Response::new(Full::new(Bytes::from_static(b"not found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

/// Owner thread that pumps one context until finished.
pub struct OwnerLoop {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<RecordingEngine>,
}

impl OwnerLoop {
    pub fn start(bridge: Arc<Bridge>, context: ContextId, mut engine: RecordingEngine) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                bridge.pump(context, &mut engine);
                thread::sleep(Duration::from_millis(2));
            }
            bridge.pump(context, &mut engine);
            engine
        });
        Self { stop, handle }
    }

    /// Stops pumping and hands the engine back for assertions.
    pub fn finish(self) -> RecordingEngine {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap()
    }
}
