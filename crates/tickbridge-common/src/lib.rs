//! tickbridge Common Types
//!
//! This crate provides the data model shared by every tickbridge component:
//! identities of script contexts and callback references, outbound operations,
//! the results deposited for a context, the inbound units admitted into it,
//! the error type and the bridge configuration.
//!
//! # Overview
//!
//! tickbridge connects native worker threads (outbound network calls) and
//! accepting threads (inbound HTTP/WebSocket servers) to a single-threaded
//! script context. Native threads only ever *deposit*; the owning context
//! thread *consumes* from inside its periodic pump call.
//!
//! # Components
//!
//! - [`protocol`] - Ids, jobs, payloads and results
//! - [`error`] - [`BridgeError`] and the crate-wide [`Result`] alias
//! - [`config`] - [`BridgeConfig`] with file and environment loading
//!
//! # Example
//!
//! ```
//! use tickbridge_common::{CallbackRef, ContextId, Job, Operation};
//!
//! let context = ContextId::next();
//! let job = Job::new(context, CallbackRef(7), Operation::get("http://127.0.0.1:8080/"));
//! assert_eq!(job.callback, CallbackRef(7));
//! assert!(job.progress.is_none());
//! ```

pub mod config;
pub mod error;
pub mod protocol;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use protocol::*;
