//! Per-processor callback FIFO.
//!
//! Each record carries the grace-period version its processor had
//! acknowledged at enqueue time. Because the local version is monotonic and
//! enqueues are serialized by the shard's exclusion, stamps are
//! non-decreasing along the queue, so the drainer only ever detaches a
//! prefix.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// A deferred callback and the version it was enqueued under.
pub(crate) struct Callback {
    version: u64,
    func: Box<dyn FnOnce() + Send>,
}

impl Callback {
    /// Consume the record and run its function.
    pub(crate) fn invoke(self) {
        (self.func)()
    }
}

/// FIFO of deferred callbacks owned by one processor.
pub(crate) struct CbList {
    queue: VecDeque<Callback>,
}

impl CbList {
    pub(crate) const fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Append a callback stamped with `version`.
    pub(crate) fn enqueue(&mut self, version: u64, func: Box<dyn FnOnce() + Send>) {
        self.queue.push_back(Callback { version, func });
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Detach every leading record whose stamp is older than `cb_version`.
    ///
    /// Records behind the first unauthorized one are left queued; stamp
    /// monotonicity guarantees none of them could run either.
    pub(crate) fn detach_ready(&mut self, cb_version: u64) -> Vec<Callback> {
        let mut ready = Vec::new();
        while self.queue.front().is_some_and(|cb| cb.version < cb_version) {
            if let Some(cb) = self.queue.pop_front() {
                ready.push(cb);
            }
        }
        ready
    }
}
