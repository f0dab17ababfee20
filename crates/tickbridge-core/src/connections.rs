//! Inbound endpoints and the per-context registry that owns them.
//!
//! An [`InboundEndpoint`] is a server (HTTP, WebSocket, or anything else)
//! whose accepting threads funnel work through an [`InboundChannel`]. The
//! [`ConnectionRegistry`] remembers which endpoints belong to which context so
//! the pump can flush them and teardown can stop them.

use crate::stats::BridgeStats;
use crate::ticket::{AdmissionTicket, TicketSnapshot};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tickbridge_common::{BridgeError, CallbackRef, ContextId, EndpointId, Payload, Result};

/// A live inbound server owned by one context.
pub trait InboundEndpoint: Send + Sync {
    fn id(&self) -> EndpointId;

    /// Address the server is bound to, if it has one.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Hands buffered events and admitted units to `dispatch`, on the owner
    /// thread. Returns how many admitted units were answered.
    fn flush(&self, dispatch: &mut dyn FnMut(Payload) -> Value) -> usize;

    /// Stops accepting, fails waiting units and releases native resources.
    /// Must not return while accepting threads still run.
    fn stop(&self);

    fn is_running(&self) -> bool;
}

/// The owner-facing half of an inbound server.
///
/// Accepting threads call [`admit`](Self::admit) for units that need a reply
/// and [`notify`](Self::notify) for events that do not; the pump calls
/// [`flush`](Self::flush).
pub struct InboundChannel {
    ticket: AdmissionTicket<Payload, Value>,
    events: Mutex<VecDeque<Payload>>,
    stats: Arc<BridgeStats>,
}

impl InboundChannel {
    pub fn new(admission_timeout: Option<Duration>, stats: Arc<BridgeStats>) -> Self {
        Self {
            ticket: AdmissionTicket::new(admission_timeout),
            events: Mutex::new(VecDeque::new()),
            stats,
        }
    }

    fn events(&self) -> MutexGuard<'_, VecDeque<Payload>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks the calling accepting thread until the handler answered.
    pub fn admit(&self, payload: Payload) -> Result<Value> {
        let result = self.ticket.admit(payload);
        if let Err(BridgeError::ProtocolViolation(_)) = &result {
            self.stats.ticket_timed_out();
        }
        result
    }

    /// Buffers an event to be handed over on the next flush. Ignored once closed.
    pub fn notify(&self, payload: Payload) {
        if self.ticket.is_closed() {
            return;
        }
        self.events().push_back(payload);
    }

    /// Buffered events first, then admitted units in ticket order.
    pub fn flush(&self, dispatch: &mut dyn FnMut(Payload) -> Value) -> usize {
        let events = std::mem::take(&mut *self.events());
        for event in events {
            dispatch(event);
        }

        let admitted = self.ticket.drain(|_, payload| dispatch(payload));
        if admitted > 0 {
            self.stats.tickets_admitted(admitted as u64);
        }
        admitted
    }

    pub fn close(&self) {
        self.ticket.close();
        self.events().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.ticket.is_closed()
    }

    pub fn snapshot(&self) -> TicketSnapshot {
        self.ticket.snapshot()
    }

    pub fn pending_events(&self) -> usize {
        self.events().len()
    }
}

/// An endpoint together with the handler ref its units are delivered to.
#[derive(Clone)]
pub struct Registered {
    pub endpoint: Arc<dyn InboundEndpoint>,
    pub handler: CallbackRef,
}

/// Live inbound endpoints per context.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<ContextId, Vec<Registered>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ContextId, Vec<Registered>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, context: ContextId, handler: CallbackRef, endpoint: Arc<dyn InboundEndpoint>) {
        tracing::debug!(context = %context, endpoint = %endpoint.id(), "Registering inbound endpoint");
        self.entries()
            .entry(context)
            .or_default()
            .push(Registered { endpoint, handler });
    }

    /// Copy of the context's endpoints, so flushing runs without the lock.
    pub fn endpoints(&self, context: ContextId) -> Vec<Registered> {
        self.entries().get(&context).cloned().unwrap_or_default()
    }

    pub fn remove(&self, context: ContextId, id: EndpointId) -> Option<Registered> {
        let mut entries = self.entries();
        let list = entries.get_mut(&context)?;
        let index = list.iter().position(|r| r.endpoint.id() == id)?;
        let removed = list.remove(index);
        if list.is_empty() {
            entries.remove(&context);
        }
        Some(removed)
    }

    /// Removes every endpoint of `context` and stops each one.
    pub fn take_context(&self, context: ContextId) -> Vec<Registered> {
        let taken = self.entries().remove(&context).unwrap_or_default();
        for registered in &taken {
            registered.endpoint.stop();
        }
        taken
    }

    /// Stops every endpoint of every context, leaving them registered so the
    /// next pump releases their handlers.
    pub fn stop_all(&self) {
        let all: Vec<Registered> = self.entries().values().flatten().cloned().collect();
        for registered in all {
            registered.endpoint.stop();
        }
    }

    pub fn count(&self, context: ContextId) -> usize {
        self.entries().get(&context).map(Vec::len).unwrap_or(0)
    }
}
