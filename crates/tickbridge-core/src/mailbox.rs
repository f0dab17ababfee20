//! Per-context result mailboxes.
//!
//! Any worker thread may deposit at any time; only the owning context thread
//! takes, and only from inside the pump. Deposits from one job land in one
//! FIFO, which is what keeps results sharing a callback ref in order.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tickbridge_common::{ContextId, JobResult};

/// Thread-safe queue of completed and partial outcomes for one context.
#[derive(Debug)]
pub struct ResultMailbox {
    context: ContextId,
    queue: Mutex<VecDeque<JobResult>>,
}

impl ResultMailbox {
    pub fn new(context: ContextId) -> Self {
        Self {
            context,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<JobResult>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn deposit(&self, result: JobResult) {
        self.queue().push_back(result);
    }

    /// Removes and returns everything queued right now.
    ///
    /// Results deposited after this call are left for the next one, which
    /// bounds the work of a single pump.
    pub fn take_all(&self) -> VecDeque<JobResult> {
        std::mem::take(&mut *self.queue())
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }
}

/// The set of mailboxes for every attached context.
#[derive(Debug, Default)]
pub struct Mailboxes {
    boxes: RwLock<HashMap<ContextId, Arc<ResultMailbox>>>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the mailbox for `context`, or returns the existing one.
    pub fn attach(&self, context: ContextId) -> Arc<ResultMailbox> {
        let mut boxes = self.boxes.write().unwrap_or_else(PoisonError::into_inner);
        boxes
            .entry(context)
            .or_insert_with(|| Arc::new(ResultMailbox::new(context)))
            .clone()
    }

    pub fn detach(&self, context: ContextId) -> Option<Arc<ResultMailbox>> {
        self.boxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&context)
    }

    pub fn get(&self, context: ContextId) -> Option<Arc<ResultMailbox>> {
        self.boxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&context)
            .cloned()
    }

    pub fn contains(&self, context: ContextId) -> bool {
        self.boxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&context)
    }

    /// Deposits into the result's context mailbox.
    ///
    /// Returns false when the context has been detached; the result is dropped.
    /// The map stays read-locked for the push, so a deposit either lands
    /// before [`detach`](Self::detach) or is refused.
    pub fn deposit(&self, result: JobResult) -> bool {
        let boxes = self.boxes.read().unwrap_or_else(PoisonError::into_inner);
        match boxes.get(&result.context) {
            Some(mailbox) => {
                mailbox.deposit(result);
                true
            }
            None => false,
        }
    }
}
