//! Synchronization primitives for the PRCU core.
//!
//! `IrqLock` is the local-exclusion lock standing in for "interrupts
//! disabled on this processor": the owner fast path, the cross-call handler
//! and the context-switch hook all hold it, which is exactly the
//! serialization the per-processor state requires. `WaitQueue` and
//! `Completion` are the poll-based blocking primitives the writer side
//! sleeps on.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

// ============================================================================
// IrqLock - per-processor exclusion with RAII guard
// ============================================================================

/// A spinlock protecting one processor's locally-owned state.
///
/// Holding the guard models running with interrupts and preemption disabled
/// on that processor. Contention is expected to be rare (the owner, a
/// cross-call, or the scheduler hook), so the lock spins with a relaxation
/// hint and keeps lightweight contention analytics.
pub struct IrqLock<T: ?Sized> {
    locked: AtomicBool,
    acquire_count: AtomicU64,
    contended_count: AtomicU64,
    data: UnsafeCell<T>,
}

// Safety: the lock provides exclusive access to the protected data.
unsafe impl<T: ?Sized + Send> Sync for IrqLock<T> {}
unsafe impl<T: ?Sized + Send> Send for IrqLock<T> {}

impl<T> IrqLock<T> {
    /// Creates a new lock protecting the given data.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            acquire_count: AtomicU64::new(0),
            contended_count: AtomicU64::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes the lock and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> IrqLock<T> {
    /// Acquires the lock, spinning until available.
    pub fn lock(&self) -> IrqGuard<'_, T> {
        let mut contended = false;
        while self.locked.swap(true, Ordering::Acquire) {
            contended = true;
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        self.acquire_count.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.contended_count.fetch_add(1, Ordering::Relaxed);
        }
        IrqGuard { lock: self }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<IrqGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            self.acquire_count.fetch_add(1, Ordering::Relaxed);
            Some(IrqGuard { lock: self })
        }
    }

    /// Check if the lock is currently held
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Get total lock acquisitions (for diagnostics)
    pub fn acquire_count(&self) -> u64 {
        self.acquire_count.load(Ordering::Relaxed)
    }

    /// Get total contended acquisitions (for diagnostics)
    pub fn contended_count(&self) -> u64 {
        self.contended_count.load(Ordering::Relaxed)
    }
}

/// RAII guard for [`IrqLock`].
pub struct IrqGuard<'a, T: ?Sized> {
    lock: &'a IrqLock<T>,
}

impl<T: ?Sized> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ============================================================================
// WaitQueue - poll-based writer-side sleep
// ============================================================================

/// Wait queue the grace-period writer blocks on while preempted readers
/// drain.
///
/// Waiters poll their condition with a relaxation hint; `wake_all` is an
/// advisory generation bump, kept so wakeups remain observable. The waiter
/// count is exported for diagnostics.
pub struct WaitQueue {
    waiters: AtomicUsize,
    wakeups: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            wakeups: AtomicU64::new(0),
        }
    }

    /// Block until `cond` returns true.
    pub fn wait_until<F: Fn() -> bool>(&self, cond: F) {
        if cond() {
            return;
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        while !cond() {
            core::hint::spin_loop();
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wake every waiter.
    pub fn wake_all(&self) {
        self.wakeups.fetch_add(1, Ordering::Release);
    }

    /// Number of contexts currently blocked on the queue.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    /// Total wakeups issued (for diagnostics)
    pub fn wakeup_count(&self) -> u64 {
        self.wakeups.load(Ordering::Relaxed)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Completion - one-shot event latch
// ============================================================================

/// One-shot completion latch, reusable via `reinit` under external
/// serialization.
pub struct Completion {
    done: AtomicBool,
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// Re-arm the latch. Callers must serialize `reinit` against `wait`.
    pub fn reinit(&self) {
        self.done.store(false, Ordering::Release);
    }

    /// Fire the latch, releasing every waiter.
    pub fn complete(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Whether the latch has fired.
    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Block until the latch fires.
    pub fn wait(&self) {
        while !self.done.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}
