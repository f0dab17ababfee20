//! Transport collaborator interface and the progress checkpoint.
//!
//! A [`Transport`] performs one blocking network operation on a pool worker.
//! While it runs it reports through a [`Checkpoint`], which is where
//! cooperative cancellation is observed and partial results are deposited.

use crate::cancel::CancellationRegistry;
use crate::mailbox::Mailboxes;
use crate::stats::BridgeStats;
use std::sync::atomic::{AtomicBool, Ordering};
use tickbridge_common::{Job, Operation, Payload, Progress, Result, TransportResponse};

/// Performs outbound operations. Called from worker threads only.
pub trait Transport: Send + Sync + 'static {
    /// Runs `operation` to completion.
    ///
    /// Implementations call [`Checkpoint::progress`] and, for streamed
    /// operations, [`Checkpoint::chunk`]; when either returns false the
    /// operation should be abandoned with [`tickbridge_common::BridgeError::Cancelled`].
    /// Any deadline is the transport's own business (see `Operation::timeout_ms`).
    fn execute(&self, operation: &Operation, checkpoint: &mut Checkpoint<'_>) -> Result<TransportResponse>;
}

/// Progress and streaming callback handed to a running transport.
pub struct Checkpoint<'a> {
    job: &'a Job,
    mailboxes: &'a Mailboxes,
    cancellations: &'a CancellationRegistry,
    stats: &'a BridgeStats,
    closing: &'a AtomicBool,
    last: Option<Progress>,
    aborted: bool,
}

impl<'a> Checkpoint<'a> {
    pub(crate) fn new(
        job: &'a Job,
        mailboxes: &'a Mailboxes,
        cancellations: &'a CancellationRegistry,
        stats: &'a BridgeStats,
        closing: &'a AtomicBool,
    ) -> Self {
        Self {
            job,
            mailboxes,
            cancellations,
            stats,
            closing,
            last: None,
            aborted: false,
        }
    }

    /// True once the job was flagged for abort or its context was detached,
    /// and while the pool is shutting down. Sticky.
    pub fn is_cancelled(&mut self) -> bool {
        if !self.aborted {
            self.aborted = self.closing.load(Ordering::Acquire)
                || self.cancellations.any_cancelled(self.job.context, self.job.refs())
                || !self.mailboxes.contains(self.job.context);
        }
        self.aborted
    }

    /// Whether the operation asked for its body as streamed chunks.
    pub fn wants_stream(&self) -> bool {
        self.job.operation.stream
    }

    /// Reports transfer progress. Returns false if the transport should abort.
    ///
    /// Ticks are deposited only for jobs with a progress ref, and identical
    /// consecutive values are not deposited again.
    pub fn progress(&mut self, total_out: u64, sent_out: u64, total_in: u64, received_in: u64) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if self.job.progress.is_none() {
            return true;
        }

        let progress = Progress::new(total_out, sent_out, total_in, received_in);
        if self.last == Some(progress) {
            return true;
        }
        self.last = Some(progress);
        self.deposit(Payload::Progress(progress))
    }

    /// Hands one streamed body chunk over. Returns false if the transport should abort.
    pub fn chunk(&mut self, data: &[u8]) -> bool {
        if self.is_cancelled() {
            return false;
        }
        if data.is_empty() {
            return true;
        }
        self.deposit(Payload::Chunk(data.to_vec()))
    }

    fn deposit(&mut self, payload: Payload) -> bool {
        if self.mailboxes.deposit(self.job.result(payload)) {
            self.stats.partial_deposited();
            true
        } else {
            tracing::debug!(context = %self.job.context, "Context detached mid-flight, aborting job");
            self.aborted = true;
            false
        }
    }
}
