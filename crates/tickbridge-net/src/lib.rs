//! tickbridge Network
//!
//! Concrete network collaborators for the bridge:
//!
//! - [`HttpTransport`] - outbound HTTP(S) over a blocking `reqwest` client,
//!   run on the bridge's worker threads
//! - [`HttpEndpoint`] - inbound HTTP/1.1 server built on hyper
//! - [`WsEndpoint`] - inbound WebSocket server built on tokio-tungstenite
//!
//! Each inbound endpoint owns a small tokio runtime on a dedicated thread.
//! Accepted units are admitted into the owning context through an
//! [`InboundChannel`](tickbridge_core::InboundChannel); nothing here touches
//! script state.

pub mod http;
pub mod outbound;
mod server;
pub mod ws;

pub use http::HttpEndpoint;
pub use outbound::HttpTransport;
pub use ws::WsEndpoint;

use std::sync::Arc;
use tickbridge_common::{CallbackRef, ContextId, Result};
use tickbridge_core::{Bridge, InboundEndpoint};

/// Registers a freshly bound endpoint with `context`, stopping it again if
/// the bridge refuses it.
pub fn attach_endpoint<T>(bridge: &Bridge, context: ContextId, handler: CallbackRef, endpoint: Arc<T>) -> Result<Arc<T>>
where
    T: InboundEndpoint + 'static,
{
    if let Err(err) = bridge.register_endpoint(context, handler, endpoint.clone()) {
        endpoint.stop();
        return Err(err);
    }
    Ok(endpoint)
}
