// Copyright 2025 tickbridge Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters describing bridge activity.
///
/// Counters only ever grow, except `peak_workers` which tracks a maximum.
/// Use [`BridgeStats::snapshot`] to read them consistently enough for logs
/// and tests; individual counters are read with `Relaxed` ordering.
#[derive(Debug, Default)]
pub struct BridgeStats {
    jobs_submitted: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_completed: AtomicU64,
    partials_deposited: AtomicU64,
    results_delivered: AtomicU64,
    results_dropped: AtomicU64,
    cancellations: AtomicU64,
    tickets_admitted: AtomicU64,
    tickets_timed_out: AtomicU64,
    peak_workers: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub jobs_submitted: u64,
    pub jobs_rejected: u64,
    pub jobs_completed: u64,
    pub partials_deposited: u64,
    pub results_delivered: u64,
    pub results_dropped: u64,
    pub cancellations: u64,
    pub tickets_admitted: u64,
    pub tickets_timed_out: u64,
    pub peak_workers: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_submitted(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn partial_deposited(&self) {
        self.partials_deposited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_delivered(&self) {
        self.results_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn result_dropped(&self) {
        self.results_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tickets_admitted(&self, count: u64) {
        self.tickets_admitted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn ticket_timed_out(&self) {
        self.tickets_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the current number of live workers, keeping the maximum seen.
    pub fn observe_workers(&self, active: usize) {
        self.peak_workers.fetch_max(active as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            partials_deposited: self.partials_deposited.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            tickets_admitted: self.tickets_admitted.load(Ordering::Relaxed),
            tickets_timed_out: self.tickets_timed_out.load(Ordering::Relaxed),
            peak_workers: self.peak_workers.load(Ordering::Relaxed),
        }
    }
}
