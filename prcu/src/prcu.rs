//! Preemptible RCU core.
//!
//! Readers run a near wait-free per-processor fast path with no atomic
//! read-modify-write. Writers issue a fresh grace-period version, probe
//! every processor, cross-call the laggards and wait out readers whose
//! nesting depth was donated to the global pool by a context switch.
//! Deferred callbacks are stamped with the enqueuing processor's
//! acknowledged version and run only once the global callback version has
//! moved past them.
//!
//! # Usage
//!
//! ```
//! use prcu::Prcu;
//!
//! let prcu = Prcu::new(4);
//!
//! // Reader on processor 0.
//! prcu.read_lock(0);
//! // ... dereference shared state ...
//! prcu.read_unlock(0);
//!
//! // Writer on processor 1: unlinks state, then waits out readers.
//! let version = prcu.synchronize(1);
//! assert!(prcu.callback_version() >= version);
//! ```

use core::sync::atomic::{
    AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering, compiler_fence, fence,
};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, trace, warn};
use static_assertions::const_assert;

use crate::cblist::CbList;
use crate::cpu::{CACHE_LINE_SIZE, CpuMask, clamp_cpu_count};
use crate::sync::{Completion, IrqLock, WaitQueue};

/// State a processor only touches with its local exclusion held.
struct CpuLocal {
    /// Read-side nesting depth of the task currently on this processor.
    locked: u32,
    /// Callback version most recently observed by the drainer here.
    cb_version: u64,
    /// Deferred callbacks owned by this processor.
    cblist: CbList,
}

impl CpuLocal {
    const fn new() -> Self {
        Self {
            locked: 0,
            cb_version: 0,
            cblist: CbList::new(),
        }
    }
}

/// Per-processor PRCU state, cache-line aligned so shards never share.
///
/// Mutated by its owner, by the cross-call handler and by the scheduler's
/// context-switch hook, all under the shard's local exclusion. Other
/// processors only read `online` and `version`.
#[repr(align(64))]
struct PerCpu {
    /// Owner-side state; the lock models interrupts-off on this processor.
    local: IrqLock<CpuLocal>,
    /// 1 while a `read_lock` has run since the last context switch.
    online: AtomicU32,
    /// Latest grace-period version this processor has acknowledged.
    version: AtomicU64,
    /// Softirq-equivalent pending flag for the callback drainer.
    softirq: AtomicBool,
}

const_assert!(core::mem::align_of::<PerCpu>() >= CACHE_LINE_SIZE);
const_assert!(core::mem::size_of::<PerCpu>() % CACHE_LINE_SIZE == 0);

impl PerCpu {
    const fn new() -> Self {
        Self {
            local: IrqLock::new(CpuLocal::new()),
            online: AtomicU32::new(0),
            version: AtomicU64::new(0),
            softirq: AtomicBool::new(false),
        }
    }
}

/// Outstanding-sentinel count and latch shared with barrier callbacks.
struct BarrierState {
    cpu_count: AtomicI32,
    completion: Completion,
}

impl BarrierState {
    /// Drop one hold on the barrier; the last hold fires the latch.
    fn put(&self) {
        if self.cpu_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.completion.complete();
        }
    }
}

/// Global grace-period state.
struct Global {
    /// Grace-period version; each `synchronize` issues the next.
    version: AtomicU64,
    /// Version up to which callbacks are authorized to run.
    cb_version: AtomicU64,
    /// Reader depth donated by context switches, drained by `read_unlock`.
    active_ctr: AtomicI32,
    /// Serializes the probe/await/drain phases of `synchronize`.
    mtx: spin::Mutex<()>,
    /// Writer sleeps here while donated readers drain.
    wait_q: WaitQueue,
    /// Serializes `barrier`.
    barrier_mtx: spin::Mutex<()>,
    /// Shared with barrier sentinels queued on the per-processor lists.
    barrier: Arc<BarrierState>,
}

/// Monotone event counters, for diagnostics only.
#[derive(Default)]
struct Counters {
    grace_periods: AtomicU64,
    cross_calls: AtomicU64,
    callbacks_invoked: AtomicU64,
    donations: AtomicU64,
}

/// Snapshot of the [`Prcu`] event counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrcuStats {
    /// Grace periods completed by `synchronize`.
    pub grace_periods: u64,
    /// Cross-calls issued to lagging processors.
    pub cross_calls: u64,
    /// Callbacks the drainers have invoked.
    pub callbacks_invoked: u64,
    /// Reader nesting levels donated by context switches.
    pub donations: u64,
}

/// The PRCU instance: a non-copyable singleton handed to readers, writers
/// and the scheduler glue.
///
/// Every operation names the calling processor by index; passing an index
/// at or above [`Prcu::nr_cpus`] panics. The host guarantees that at most
/// one execution context acts for a given processor at a time, exactly as a
/// scheduler guarantees one running task per CPU; a context moved to
/// another processor must be separated from its old shard by
/// [`Prcu::note_context_switch`].
pub struct Prcu {
    global: Global,
    percpu: Box<[PerCpu]>,
    /// Hotplug facility consumed by the drainer's offline guard.
    online_cpus: CpuMask,
    counters: Counters,
}

impl Prcu {
    /// Initialize PRCU for `nr_cpus` processors (clamped to `1..=MAX_CPUS`).
    pub fn new(nr_cpus: usize) -> Self {
        let nr_cpus = clamp_cpu_count(nr_cpus);
        let mut percpu = Vec::with_capacity(nr_cpus);
        for _ in 0..nr_cpus {
            percpu.push(PerCpu::new());
        }
        debug!("prcu: initialized for {nr_cpus} processors");
        Self {
            global: Global {
                version: AtomicU64::new(0),
                cb_version: AtomicU64::new(0),
                active_ctr: AtomicI32::new(0),
                mtx: spin::Mutex::new(()),
                wait_q: WaitQueue::new(),
                barrier_mtx: spin::Mutex::new(()),
                barrier: Arc::new(BarrierState {
                    cpu_count: AtomicI32::new(0),
                    completion: Completion::new(),
                }),
            },
            percpu: percpu.into_boxed_slice(),
            online_cpus: CpuMask::new_online(nr_cpus),
            counters: Counters::default(),
        }
    }

    /// Number of processor shards.
    pub fn nr_cpus(&self) -> usize {
        self.percpu.len()
    }

    fn shard(&self, cpu: usize) -> &PerCpu {
        &self.percpu[cpu]
    }

    // ========================================================================
    // Reader fast path
    // ========================================================================

    /// Enter a read-side critical section on `cpu`. Never blocks, nests to
    /// any depth.
    pub fn read_lock(&self, cpu: usize) {
        let shard = self.shard(cpu);
        let mut local = shard.local.lock();
        if shard.online.load(Ordering::Relaxed) == 0 {
            shard.online.store(1, Ordering::Relaxed);
            // Writers must observe the online transition before the
            // nesting increment can become visible.
            fence(Ordering::SeqCst);
        }
        local.locked += 1;
    }

    /// Leave a read-side critical section.
    ///
    /// If the section was preempted and its depth donated to the global
    /// pool, this may run on a different processor than the matching
    /// [`Prcu::read_lock`].
    pub fn read_unlock(&self, cpu: usize) {
        // The critical section must not sink below the decrement.
        compiler_fence(Ordering::SeqCst);
        let shard = self.shard(cpu);
        let mut local = shard.local.lock();
        if local.locked > 0 {
            local.locked -= 1;
            if local.locked == 0 {
                self.report(shard);
            }
        } else {
            drop(local);
            // Depth was donated by a context switch; settle the debt with
            // the global pool and wake the writer on the last departure.
            let prev = self.global.active_ctr.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(prev > 0, "read_unlock without matching read_lock");
            if prev == 1 {
                self.global.wait_q.wake_all();
            } else if prev <= 0 {
                warn!("prcu: unbalanced read_unlock on cpu {cpu}");
            }
        }
    }

    /// Enter a read-side critical section, leaving it when the guard drops.
    ///
    /// The guard unlocks on the processor it locked on; readers that may be
    /// migrated mid-section use the raw `read_lock`/`read_unlock` pair.
    pub fn read(&self, cpu: usize) -> ReadGuard<'_> {
        self.read_lock(cpu);
        ReadGuard { prcu: self, cpu }
    }

    /// Publish the freshest global version this processor can acknowledge.
    ///
    /// Called with the shard's local exclusion held. A failed exchange
    /// means a concurrent writer already advanced this processor past our
    /// load; that is not retried.
    fn report(&self, shard: &PerCpu) {
        let global = self.global.version.load(Ordering::Acquire);
        let local = shard.version.load(Ordering::Relaxed);
        if global > local {
            let _ = shard
                .version
                .compare_exchange(local, global, Ordering::AcqRel, Ordering::Relaxed);
        }
    }

    // ========================================================================
    // Writer - grace periods
    // ========================================================================

    /// Wait for a full grace period: every read-side critical section
    /// active on entry has exited when this returns.
    ///
    /// Returns the grace-period version it issued. Serialized against other
    /// synchronizers; must not be called from within a read-side critical
    /// section.
    pub fn synchronize(&self, cpu: usize) -> u64 {
        // Version first, lock second: concurrent synchronizers still get
        // distinct, monotonically increasing versions.
        let version = self.global.version.fetch_add(1, Ordering::Relaxed) + 1;
        let gp = self.global.mtx.lock();
        trace!("prcu: grace period {version} begin");

        // The calling processor is trivially quiescent for this version.
        self.shard(cpu).version.fetch_max(version, Ordering::AcqRel);

        // Probe phase: every processor either already acknowledged a
        // recent enough version, went offline (a context switch published
        // its quiescent state), or gets a cross-call.
        let mut lagging: Vec<usize> = Vec::new();
        for (id, shard) in self.percpu.iter().enumerate() {
            if shard.online.load(Ordering::Acquire) == 0 {
                continue;
            }
            if shard.version.load(Ordering::Acquire) < version {
                self.cross_call(shard);
                lagging.push(id);
            }
        }

        // Await phase: a lagging processor catches up either through the
        // cross-call handler or through its reader's own unlock/switch.
        for id in lagging {
            let shard = self.shard(id);
            while shard.version.load(Ordering::Acquire) < version {
                core::hint::spin_loop();
            }
        }

        // Drain phase: wait out readers whose depth context switches
        // donated to the global pool.
        if self.global.active_ctr.load(Ordering::Acquire) != 0 {
            self.global
                .wait_q
                .wait_until(|| self.global.active_ctr.load(Ordering::Acquire) == 0);
        }

        // Authorize callbacks stamped below this version. The monotone
        // store keeps the callback version from regressing when
        // synchronizers finish out of issue order.
        self.global.cb_version.fetch_max(version, Ordering::AcqRel);
        self.counters.grace_periods.fetch_add(1, Ordering::Relaxed);
        trace!("prcu: grace period {version} end");
        drop(gp);
        version
    }

    /// Run the quiescent-state handler on `shard` exactly as an IPI would:
    /// under the target's local exclusion, with its reader state stable.
    fn cross_call(&self, shard: &PerCpu) {
        self.counters.cross_calls.fetch_add(1, Ordering::Relaxed);
        let local = shard.local.lock();
        if local.locked == 0 {
            let global = self.global.version.load(Ordering::Acquire);
            shard.version.fetch_max(global, Ordering::AcqRel);
        }
        // A reader in flight reports itself at its unlock or switch.
    }

    // ========================================================================
    // Scheduler hook
    // ========================================================================

    /// Record that the context currently on `cpu` is being switched out.
    ///
    /// Any read-side nesting depth is donated to the global pool (the
    /// eventual `read_unlock` calls settle it from wherever they run), the
    /// processor goes offline for probing purposes, and the freshest global
    /// version is acknowledged.
    pub fn note_context_switch(&self, cpu: usize) {
        let shard = self.shard(cpu);
        let mut local = shard.local.lock();
        if local.locked > 0 {
            self.global
                .active_ctr
                .fetch_add(local.locked as i32, Ordering::AcqRel);
            self.counters
                .donations
                .fetch_add(u64::from(local.locked), Ordering::Relaxed);
            local.locked = 0;
        }
        shard.online.store(0, Ordering::Release);
        self.report(shard);
    }

    // ========================================================================
    // Callback subsystem
    // ========================================================================

    /// Enqueue `func` to run after a future grace period. Interrupt-safe,
    /// never blocks.
    pub fn call(&self, cpu: usize, func: Box<dyn FnOnce() + Send>) {
        let shard = self.shard(cpu);
        let mut local = shard.local.lock();
        // The stamp is the newest version this processor is known to have
        // been quiescent for; any strictly newer grace period ends after
        // this enqueue.
        let version = shard.version.load(Ordering::Relaxed);
        local.cblist.enqueue(version, func);
    }

    /// Drain authorized callbacks on `cpu` (the softirq-equivalent
    /// handler).
    ///
    /// Returns without touching the lists when the processor is
    /// hotplug-offline. Callbacks are detached under the local exclusion
    /// and invoked after it is released, so a callback may re-enter
    /// [`Prcu::call`].
    pub fn process_callbacks(&self, cpu: usize) {
        if !self.online_cpus.contains(cpu) {
            return;
        }
        let shard = self.shard(cpu);
        shard.softirq.store(false, Ordering::Release);
        let cb_version = self.global.cb_version.load(Ordering::Acquire);
        let ready = {
            let mut local = shard.local.lock();
            let ready = local.cblist.detach_ready(cb_version);
            local.cb_version = cb_version;
            ready
        };
        if ready.is_empty() {
            return;
        }
        self.counters
            .callbacks_invoked
            .fetch_add(ready.len() as u64, Ordering::Relaxed);
        for cb in ready {
            cb.invoke();
        }
    }

    /// Whether `cpu` has callbacks a completed grace period has authorized.
    pub fn pending(&self, cpu: usize) -> bool {
        let shard = self.shard(cpu);
        let cb_version = self.global.cb_version.load(Ordering::Acquire);
        let local = shard.local.lock();
        local.cb_version < cb_version && !local.cblist.is_empty()
    }

    /// Tick hook: raise the softirq-equivalent flag when callbacks are
    /// ready on `cpu`.
    pub fn check_callbacks(&self, cpu: usize) {
        if self.pending(cpu) {
            self.shard(cpu).softirq.store(true, Ordering::Release);
        }
    }

    /// Whether the softirq-equivalent flag is raised on `cpu`. The host's
    /// deferred-work dispatch polls this and runs
    /// [`Prcu::process_callbacks`].
    pub fn softirq_raised(&self, cpu: usize) -> bool {
        self.shard(cpu).softirq.load(Ordering::Acquire)
    }

    // ========================================================================
    // Barrier
    // ========================================================================

    /// Wait until every callback enqueued before this call has been
    /// invoked.
    ///
    /// A sentinel is queued behind the existing callbacks of each online
    /// processor; the barrier then advances a grace period itself and
    /// drives the drainers, so it terminates without any concurrent
    /// `synchronize` (closing the liveness gap a bare flush would have).
    pub fn barrier(&self, cpu: usize) {
        let guard = self.global.barrier_mtx.lock();
        let barrier = &self.global.barrier;
        barrier.completion.reinit();
        // Hold the latch ourselves so no sentinel can fire it before every
        // processor has one queued.
        barrier.cpu_count.store(1, Ordering::Release);

        for id in 0..self.percpu.len() {
            if !self.online_cpus.contains(id) {
                // A downed processor cannot invoke callbacks.
                continue;
            }
            barrier.cpu_count.fetch_add(1, Ordering::AcqRel);
            let state = Arc::clone(barrier);
            // Cross-call equivalent: queue the sentinel behind the
            // processor's existing callbacks, under its exclusion.
            self.call(id, Box::new(move || state.put()));
        }

        self.global.barrier.put();

        // Sentinels fire only once a grace period authorizes their stamps;
        // advance one and run the drainers rather than waiting on the host
        // tick.
        self.synchronize(cpu);
        for id in 0..self.percpu.len() {
            self.process_callbacks(id);
        }

        self.global.barrier.completion.wait();
        drop(guard);
    }

    // ========================================================================
    // Hotplug and introspection
    // ========================================================================

    /// Hotplug facility: mark `cpu` online or offline for the drainer.
    pub fn set_cpu_online(&self, cpu: usize, online: bool) {
        self.online_cpus.set(cpu, online);
    }

    /// Whether `cpu` is hotplug-online.
    pub fn cpu_online(&self, cpu: usize) -> bool {
        self.online_cpus.contains(cpu)
    }

    /// Current grace-period version.
    pub fn global_version(&self) -> u64 {
        self.global.version.load(Ordering::Acquire)
    }

    /// Version up to which callbacks are authorized to run.
    pub fn callback_version(&self) -> u64 {
        self.global.cb_version.load(Ordering::Acquire)
    }

    /// Grace-period version `cpu` has acknowledged.
    pub fn local_version(&self, cpu: usize) -> u64 {
        self.shard(cpu).version.load(Ordering::Acquire)
    }

    /// Whether `cpu` has run a `read_lock` since its last context switch.
    pub fn reader_online(&self, cpu: usize) -> bool {
        self.shard(cpu).online.load(Ordering::Acquire) != 0
    }

    /// Read-side nesting depth currently on `cpu`.
    pub fn nesting_depth(&self, cpu: usize) -> u32 {
        self.shard(cpu).local.lock().locked
    }

    /// Reader depth donated to the global pool and not yet unlocked.
    pub fn preempted_readers(&self) -> i32 {
        self.global.active_ctr.load(Ordering::Acquire)
    }

    /// Callbacks queued on `cpu` and not yet drained.
    pub fn callbacks_queued(&self, cpu: usize) -> usize {
        self.shard(cpu).local.lock().cblist.len()
    }

    /// Snapshot of the event counters.
    pub fn stats(&self) -> PrcuStats {
        PrcuStats {
            grace_periods: self.counters.grace_periods.load(Ordering::Relaxed),
            cross_calls: self.counters.cross_calls.load(Ordering::Relaxed),
            callbacks_invoked: self.counters.callbacks_invoked.load(Ordering::Relaxed),
            donations: self.counters.donations.load(Ordering::Relaxed),
        }
    }
}

/// RAII read-side critical section pinned to one processor.
pub struct ReadGuard<'a> {
    prcu: &'a Prcu,
    cpu: usize,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.prcu.read_unlock(self.cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counting_cb(hits: &Arc<AtomicUsize>) -> Box<dyn FnOnce() + Send> {
        let hits = Arc::clone(hits);
        Box::new(move || {
            hits.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn balanced_pair_round_trip() {
        let prcu = Prcu::new(4);
        prcu.read_lock(2);
        assert_eq!(prcu.nesting_depth(2), 1);
        assert!(prcu.reader_online(2));
        prcu.read_unlock(2);
        assert_eq!(prcu.nesting_depth(2), 0);
        assert_eq!(prcu.preempted_readers(), 0);
        // No grace period ran, so there was no version to pick up.
        assert_eq!(prcu.local_version(2), 0);
    }

    #[test]
    fn unlock_publishes_latest_version() {
        let prcu = Prcu::new(2);
        let version = prcu.synchronize(0);
        prcu.read_lock(1);
        prcu.read_unlock(1);
        assert_eq!(prcu.local_version(1), version);
    }

    #[test]
    fn nested_sections_touch_nothing_global() {
        let prcu = Prcu::new(2);
        for _ in 0..5 {
            prcu.read_lock(0);
        }
        assert_eq!(prcu.nesting_depth(0), 5);
        for _ in 0..5 {
            prcu.read_unlock(0);
        }
        assert_eq!(prcu.nesting_depth(0), 0);
        assert_eq!(prcu.preempted_readers(), 0);
        assert_eq!(prcu.global_version(), 0);
    }

    #[test]
    fn context_switch_donates_depth() {
        let prcu = Prcu::new(8);
        prcu.read_lock(3);
        prcu.read_lock(3);
        prcu.note_context_switch(3);

        assert_eq!(prcu.nesting_depth(3), 0);
        assert!(!prcu.reader_online(3));
        assert_eq!(prcu.preempted_readers(), 2);

        // The migrated reader unlocks twice from another processor.
        prcu.read_unlock(5);
        prcu.read_unlock(5);
        assert_eq!(prcu.preempted_readers(), 0);
        assert_eq!(prcu.stats().donations, 2);
    }

    #[test]
    fn synchronize_versions_are_sequential() {
        let prcu = Prcu::new(2);
        let first = prcu.synchronize(0);
        let second = prcu.synchronize(0);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(prcu.callback_version(), second);
        assert_eq!(prcu.stats().grace_periods, 2);
    }

    #[test]
    fn callbacks_wait_for_authorization() {
        let prcu = Prcu::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        prcu.call(0, counting_cb(&hits));

        // No grace period yet: nothing may run.
        prcu.process_callbacks(0);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert!(!prcu.pending(0));

        prcu.synchronize(1);
        assert!(prcu.pending(0));
        prcu.check_callbacks(0);
        assert!(prcu.softirq_raised(0));
        prcu.process_callbacks(0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!prcu.softirq_raised(0));
        assert_eq!(prcu.callbacks_queued(0), 0);
    }

    #[test]
    fn drainer_skips_offline_processor() {
        let prcu = Prcu::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        prcu.call(1, counting_cb(&hits));
        prcu.synchronize(0);

        prcu.set_cpu_online(1, false);
        prcu.process_callbacks(1);
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(prcu.callbacks_queued(1), 1);

        prcu.set_cpu_online(1, true);
        prcu.process_callbacks(1);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn callback_reenqueue_from_drainer() {
        let prcu = Arc::new(Prcu::new(2));
        let hits = Arc::new(AtomicUsize::new(0));
        let inner_hits = Arc::clone(&hits);
        let handle = Arc::downgrade(&prcu);
        prcu.call(
            0,
            Box::new(move || {
                inner_hits.fetch_add(1, Ordering::Relaxed);
                if let Some(prcu) = handle.upgrade() {
                    let again = Arc::clone(&inner_hits);
                    prcu.call(
                        0,
                        Box::new(move || {
                            again.fetch_add(1, Ordering::Relaxed);
                        }),
                    );
                }
            }),
        );

        prcu.synchronize(1);
        prcu.process_callbacks(0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(prcu.callbacks_queued(0), 1);

        prcu.synchronize(1);
        prcu.process_callbacks(0);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn read_guard_unlocks_on_drop() {
        let prcu = Prcu::new(2);
        {
            let _guard = prcu.read(1);
            assert_eq!(prcu.nesting_depth(1), 1);
        }
        assert_eq!(prcu.nesting_depth(1), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "read_unlock without matching read_lock")]
    fn unbalanced_unlock_asserts() {
        let prcu = Prcu::new(1);
        prcu.read_unlock(0);
    }
}
