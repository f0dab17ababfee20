//! Strict-FIFO admission of inbound units into an owning context.
//!
//! Every inbound unit (an HTTP request, a WebSocket frame) takes a ticket
//! number from `awaiting` and waits, parked on a condition variable, until the
//! owner reaches that number in [`AdmissionTicket::drain`]. The owner runs the
//! handler for one unit at a time, strictly in ticket order, and hands each
//! reply back to the waiting thread.
//!
//! # States
//!
//! ```text
//! IDLE --admit--> ADMITTED --drain picks it--> EXECUTING --reply--> DONE
//!                    |
//!                    +--timeout / close--> abandoned (ticket number skipped)
//! ```
//!
//! Tickets start at 1. The admission timeout covers ADMITTED only: a unit the
//! owner has not picked up in time is abandoned, its number is skipped, and the
//! accepting thread gets a [`BridgeError::ProtocolViolation`] which is fatal to
//! that connection only. Once the handler runs, the unit waits for its reply
//! however long that takes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tickbridge_common::{BridgeError, Result};

/// Counter state of one ticket, as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketSnapshot {
    /// Next ticket to dispense
    pub awaiting: u64,
    /// Next ticket allowed to run
    pub exchange: u64,
    /// A handler is running right now
    pub processing: bool,
    /// The owner is inside `drain`
    pub exchanging: bool,
}

struct TicketState<Req, Resp> {
    awaiting: u64,
    exchange: u64,
    processing: bool,
    exchanging: bool,
    closed: bool,
    pending: BTreeMap<u64, Req>,
    replies: HashMap<u64, Resp>,
    abandoned: BTreeSet<u64>,
}

impl<Req, Resp> TicketState<Req, Resp> {
    fn flushed(&self) -> bool {
        self.awaiting == self.exchange && !self.processing
    }

    fn advance(&mut self) {
        self.exchange += 1;
        while self.abandoned.remove(&self.exchange) {
            self.exchange += 1;
        }
    }
}

/// Ticket counters plus the hand-off slots for one inbound server.
pub struct AdmissionTicket<Req, Resp> {
    state: Mutex<TicketState<Req, Resp>>,
    changed: Condvar,
    timeout: Option<Duration>,
}

impl<Req, Resp> AdmissionTicket<Req, Resp> {
    /// Creates a ticket. `timeout` bounds how long [`admit`](Self::admit)
    /// waits for the owner to pick its unit up; `None` waits until the owner
    /// answers or closes.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(TicketState {
                awaiting: 1,
                exchange: 1,
                processing: false,
                exchanging: false,
                closed: false,
                pending: BTreeMap::new(),
                replies: HashMap::new(),
                abandoned: BTreeSet::new(),
            }),
            changed: Condvar::new(),
            timeout,
        }
    }

    fn state(&self) -> MutexGuard<'_, TicketState<Req, Resp>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> TicketSnapshot {
        self.state().snapshot()
    }

    /// Takes a ticket for `request` and blocks until the owner replied.
    ///
    /// Called from accepting threads only; never from the owner thread, which
    /// would deadlock waiting on itself.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::ProtocolViolation`] if the owner did not pick the unit up within the timeout
    /// - [`BridgeError::Shutdown`] if the ticket was closed
    pub fn admit(&self, request: Req) -> Result<Resp> {
        self.admit_within(request, self.timeout)
    }

    /// [`admit`](Self::admit) with an explicit timeout for this one unit.
    pub fn admit_within(&self, request: Req, timeout: Option<Duration>) -> Result<Resp> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state();
        if state.closed {
            return Err(BridgeError::Shutdown);
        }

        let ticket = state.awaiting;
        state.awaiting += 1;
        state.pending.insert(ticket, request);
        self.changed.notify_all();

        loop {
            if let Some(reply) = state.replies.remove(&ticket) {
                return Ok(reply);
            }
            if state.closed {
                return Err(BridgeError::Shutdown);
            }

            // the owner took the unit: the handler is running, its reply is due
            let executing = !state.pending.contains_key(&ticket);
            state = match deadline.filter(|_| !executing) {
                None => self.changed.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        Self::abandon(&mut state, ticket);
                        tracing::warn!(ticket, "Inbound unit not admitted in time, abandoning ticket");
                        return Err(BridgeError::ProtocolViolation(format!(
                            "ticket {} was not admitted within {:?}",
                            ticket,
                            timeout.unwrap_or_default()
                        )));
                    }
                    self.changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Withdraws a still pending `ticket` on behalf of its accepting thread.
    fn abandon(state: &mut TicketState<Req, Resp>, ticket: u64) {
        state.pending.remove(&ticket);
        if ticket == state.exchange && !state.processing {
            state.advance();
        } else {
            state.abandoned.insert(ticket);
        }
    }

    /// Runs `handler` for every admitted unit, in ticket order, on the
    /// calling (owner) thread, until `awaiting == exchange && !processing`.
    ///
    /// Returns how many units were handled. On a flushed ticket it returns 0
    /// immediately, so repeated calls are harmless.
    pub fn drain<F>(&self, mut handler: F) -> usize
    where
        F: FnMut(u64, Req) -> Resp,
    {
        let mut state = self.state();
        if state.flushed() {
            return 0;
        }

        state.exchanging = true;
        let mut handled = 0;

        while !state.flushed() {
            let ticket = state.exchange;
            let Some(request) = state.pending.remove(&ticket) else {
                // Dispensed but withdrawn before we got to it.
                state.abandoned.remove(&ticket);
                state.advance();
                continue;
            };

            state.processing = true;
            drop(state);
            let reply = handler(ticket, request);
            state = self.state();
            state.processing = false;

            if state.closed {
                tracing::debug!(ticket, "Dropping reply for closed ticket");
            } else {
                state.replies.insert(ticket, reply);
            }
            state.advance();
            handled += 1;
            self.changed.notify_all();
        }

        state.exchanging = false;
        handled
    }

    /// Fails every waiting unit with `Shutdown` and refuses new ones.
    pub fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.pending.clear();
        state.replies.clear();
        state.abandoned.clear();
        if !state.processing {
            state.exchange = state.awaiting;
        }
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl<Req, Resp> TicketState<Req, Resp> {
    fn snapshot(&self) -> TicketSnapshot {
        TicketSnapshot {
            awaiting: self.awaiting,
            exchange: self.exchange,
            processing: self.processing,
            exchanging: self.exchanging,
        }
    }
}
