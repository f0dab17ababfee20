//! Inbound WebSocket endpoint.
//!
//! Every connection produces an `open` event, one admitted `message` unit per
//! text or binary frame, and a `close` event. Events are buffered and handed
//! over on the next flush; messages wait for the handler. A non-null handler
//! return value is sent back on the same connection as a text frame.

use crate::server::ServerThread;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tickbridge_common::{next_connection_id, EndpointId, Payload, Result, SocketEvent};
use tickbridge_core::{InboundChannel, InboundEndpoint};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// WebSocket server whose frames are handled by a script context.
pub struct WsEndpoint {
    id: EndpointId,
    channel: Arc<InboundChannel>,
    server: ServerThread,
}

impl WsEndpoint {
    pub fn bind(addr: SocketAddr, channel: InboundChannel) -> Result<Arc<Self>> {
        let id = EndpointId::next();
        let channel = Arc::new(channel);

        let accept_channel = channel.clone();
        let server = ServerThread::spawn(format!("tickbridge-ws-{}", id.0), addr, move |listener, shutdown| {
            accept_loop(listener, accept_channel, shutdown)
        })?;

        tracing::info!(endpoint = %id, "WebSocket endpoint listening on {}", server.local_addr());
        Ok(Arc::new(Self { id, channel, server }))
    }

    pub fn channel(&self) -> &InboundChannel {
        &self.channel
    }
}

impl InboundEndpoint for WsEndpoint {
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
            tracing::info!(endpoint = %self.id, "Stopping WebSocket endpoint");
        }
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
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(serve_socket(stream, remote, channel.clone(), shutdown.clone()));
                }
                Err(e) => tracing::warn!("Failed to accept connection: {}", e),
            }
        }
    }
}

async fn serve_socket(
    stream: TcpStream,
    remote: SocketAddr,
    channel: Arc<InboundChannel>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!(remote = %remote, "WebSocket handshake failed: {}", e);
            return;
        }
    };

    let connection = next_connection_id();
    tracing::debug!(remote = %remote, connection, "WebSocket connection opened");
    channel.notify(Payload::Socket(SocketEvent::Open { connection }));

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            frame = receiver.next() => {
                let (data, binary) = match frame {
                    Some(Ok(Message::Text(text))) => (text.as_str().as_bytes().to_vec(), false),
                    Some(Ok(Message::Binary(data))) => (data.to_vec(), true),
                    Some(Ok(Message::Close(_))) | None => break,
                    // ping/pong are answered by tungstenite itself
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(connection, "WebSocket error: {}", e);
                        break;
                    }
                };

                let admit_channel = channel.clone();
                let event = Payload::Socket(SocketEvent::Message { connection, data, binary });
                let admitted = tokio::task::spawn_blocking(move || admit_channel.admit(event)).await;

                match admitted {
                    Ok(Ok(Value::Null)) => {}
                    Ok(Ok(value)) => {
                        let text = match value {
                            Value::String(text) => text,
                            other => other.to_string(),
                        };
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(connection, "Message not admitted: {}", err);
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(connection, "Admission task failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    channel.notify(Payload::Socket(SocketEvent::Close { connection }));
    tracing::debug!(connection, "WebSocket connection closed");
}
