//! Preemptible read-copy update (PRCU).
//!
//! A read-mostly mutual-exclusion mechanism: readers run a per-processor
//! fast path with no atomic read-modify-write and may be preempted and
//! migrated while inside a critical section; writers wait for a **grace
//! period** — every critical section active when it began has exited —
//! before reclaiming shared state, either synchronously
//! ([`Prcu::synchronize`]) or through deferred callbacks ([`Prcu::call`],
//! drained by the softirq-equivalent [`Prcu::process_callbacks`] and
//! flushed by [`Prcu::barrier`]).
//!
//! The instance is a non-copyable singleton handed to readers, writers and
//! the scheduler glue. Per-processor state lives in a cache-line-aligned
//! shard table indexed by processor id; the host names the executing
//! processor on every call and reports preemption through
//! [`Prcu::note_context_switch`].
//!
//! ```
//! use prcu::Prcu;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! let prcu = Prcu::new(4);
//!
//! // Reader on processor 0.
//! prcu.read_lock(0);
//! prcu.read_unlock(0);
//!
//! // Deferred reclamation: runs once a grace period has authorized it.
//! let freed = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&freed);
//! prcu.call(0, Box::new(move || flag.store(true, Ordering::Release)));
//!
//! prcu.synchronize(1);
//! prcu.process_callbacks(0);
//! assert!(freed.load(Ordering::Acquire));
//! ```

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod cblist;
pub mod cell;
pub mod cpu;
pub mod prcu;
pub mod sync;

pub use cell::{CellGuard, PrcuCell};
pub use cpu::{CACHE_LINE_SIZE, MAX_CPUS};
pub use prcu::{Prcu, PrcuStats, ReadGuard};
