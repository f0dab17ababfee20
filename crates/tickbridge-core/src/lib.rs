//! tickbridge Core
//!
//! The asynchronous I/O bridge between native threads and single-threaded
//! script execution contexts.
//!
//! # Architecture
//!
//! ```text
//!  worker threads            accepting threads
//!  (outbound jobs)           (inbound HTTP / WebSocket)
//!        |                          |
//!   deposit results           admit via ticket / notify
//!        v                          v
//!  +-----------+             +---------------+
//!  | Mailboxes |             | InboundChannel|
//!  +-----------+             +---------------+
//!        \                          /
//!         \__________  ____________/
//!                    \/
//!            Bridge::pump(context)      <- owner thread, once per tick
//!                    |
//!              ScriptEngine::invoke
//! ```
//!
//! Native threads never touch script state. They deposit into mailboxes or
//! wait on admission tickets; only the owning context thread consumes, and
//! only from inside [`Bridge::pump`].
//!
//! # Components
//!
//! - [`cancel`] - cooperative cancellation registry
//! - [`mailbox`] - per-context result queues
//! - [`pool`] - bounded worker pool and job queue
//! - [`transport`] - outbound transport trait and progress checkpoint
//! - [`ticket`] - strict-FIFO admission of inbound units
//! - [`connections`] - inbound endpoints per context
//! - [`engine`] - script engine trait, error sink and [`RefGuard`]
//! - [`ledger`] - ownership of callback refs
//! - [`bridge`] / [`pump`] - the [`Bridge`] object and its execution pump
//! - [`stats`] - activity counters
//! - `testing` - deterministic transport, engine and endpoint fakes (`testing`
//!   feature)

pub mod bridge;
pub mod cancel;
pub mod connections;
pub mod engine;
pub mod ledger;
pub mod mailbox;
pub mod pool;
pub mod pump;
pub mod stats;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod ticket;
pub mod transport;

pub use bridge::{Bridge, BridgeBuilder};
pub use cancel::CancellationRegistry;
pub use connections::{ConnectionRegistry, InboundChannel, InboundEndpoint, Registered};
pub use engine::{ErrorSink, RefGuard, ScriptEngine, TracingErrorSink};
pub use ledger::RefLedger;
pub use mailbox::{Mailboxes, ResultMailbox};
pub use pool::WorkerPool;
pub use pump::PumpReport;
pub use stats::{BridgeStats, StatsSnapshot};
pub use ticket::{AdmissionTicket, TicketSnapshot};
pub use transport::{Checkpoint, Transport};
