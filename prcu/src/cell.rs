//! A PRCU-protected pointer cell.
//!
//! Readers enter a read-side critical section and borrow the current value
//! through a guard; writers swap the pointer and defer freeing the old
//! value until a grace period has passed.

use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

use crate::prcu::{Prcu, ReadGuard};

/// Owns a heap value until a grace period ends, then frees it.
struct Reclaim<T> {
    ptr: NonNull<T>,
}

// Safety: Reclaim is the sole owner of the allocation behind `ptr`.
unsafe impl<T: Send> Send for Reclaim<T> {}

impl<T> Drop for Reclaim<T> {
    fn drop(&mut self) {
        // Safety: created from Box::into_raw and dropped exactly once.
        unsafe { drop(Box::from_raw(self.ptr.as_ptr())) }
    }
}

/// A value behind an atomic pointer with PRCU-coordinated reclamation.
///
/// `read` is the lock-free read path; `update`/`replace` publish a new
/// value and hand the old allocation to [`Prcu::call`], so no reader that
/// might still see it is ever freed out from under.
///
/// Updaters must be externally serialized (a single writer, or a writer
/// lock around `update`/`replace`).
pub struct PrcuCell<T> {
    data: AtomicPtr<T>,
    _marker: PhantomData<T>,
}

impl<T: Send + Sync + 'static> PrcuCell<T> {
    /// Create a cell owning `value`.
    pub fn new(value: T) -> Self {
        Self {
            data: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _marker: PhantomData,
        }
    }

    /// Enter a read-side critical section on `cpu` and borrow the current
    /// value. Lock-free; the borrow lives as long as the guard.
    pub fn read<'a>(&'a self, prcu: &'a Prcu, cpu: usize) -> CellGuard<'a, T> {
        let section = prcu.read(cpu);
        let ptr = self.data.load(Ordering::Acquire);
        // Safety: the pointer was published by new/update and is freed
        // only after a grace period, which cannot end while `section` is
        // held (or, if preempted, while its donated depth is outstanding).
        let value = unsafe { &*ptr };
        CellGuard {
            _section: section,
            inner: value,
        }
    }

    /// Publish `f(current)` as the new value, deferring reclamation of the
    /// old one past a grace period.
    pub fn update<F: FnOnce(&T) -> T>(&self, prcu: &Prcu, cpu: usize, f: F) {
        let old = self.data.load(Ordering::Acquire);
        // Safety: updaters are serialized, so `old` stays valid here.
        let new = f(unsafe { &*old });
        let new_ptr = Box::into_raw(Box::new(new));
        let old = self.data.swap(new_ptr, Ordering::AcqRel);
        if let Some(ptr) = NonNull::new(old) {
            let reclaim = Reclaim { ptr };
            prcu.call(cpu, Box::new(move || drop(reclaim)));
        }
    }

    /// Publish `value`, deferring reclamation of the old one.
    pub fn replace(&self, prcu: &Prcu, cpu: usize, value: T) {
        self.update(prcu, cpu, |_| value);
    }
}

impl<T> Drop for PrcuCell<T> {
    fn drop(&mut self) {
        // Exclusive access: no reader guard can outlive the cell, so the
        // current value is freed directly rather than through a grace
        // period.
        let ptr = *self.data.get_mut();
        if !ptr.is_null() {
            // Safety: the cell owns the allocation and drops it once.
            unsafe { drop(Box::from_raw(ptr)) }
        }
    }
}

/// Guard borrowing the cell's value inside a read-side critical section.
pub struct CellGuard<'a, T> {
    _section: ReadGuard<'a>,
    inner: &'a T,
}

impl<T> Deref for CellGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug)]
    struct DropTally {
        value: u64,
        drops: Arc<AtomicUsize>,
    }

    impl Drop for DropTally {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn read_sees_current_value() {
        let prcu = Prcu::new(2);
        let cell = PrcuCell::new(41u64);
        {
            let guard = cell.read(&prcu, 0);
            assert_eq!(*guard, 41);
            assert_eq!(prcu.nesting_depth(0), 1);
        }
        assert_eq!(prcu.nesting_depth(0), 0);
    }

    #[test]
    fn update_defers_reclamation_past_grace_period() {
        let prcu = Prcu::new(2);
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = PrcuCell::new(DropTally {
            value: 1,
            drops: Arc::clone(&drops),
        });

        cell.update(&prcu, 0, |old| DropTally {
            value: old.value + 1,
            drops: Arc::clone(&drops),
        });
        assert_eq!(cell.read(&prcu, 0).value, 2);
        // Old value is queued, not yet reclaimed.
        assert_eq!(drops.load(Ordering::Relaxed), 0);
        assert_eq!(prcu.callbacks_queued(0), 1);

        prcu.synchronize(1);
        prcu.process_callbacks(0);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(cell.read(&prcu, 0).value, 2);
    }

    #[test]
    fn drop_frees_current_value_directly() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = PrcuCell::new(DropTally {
            value: 9,
            drops: Arc::clone(&drops),
        });
        drop(cell);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn replace_publishes_value() {
        let prcu = Prcu::new(2);
        let cell = PrcuCell::new(10u64);
        cell.replace(&prcu, 1, 20);
        assert_eq!(*cell.read(&prcu, 1), 20);
        prcu.barrier(0);
    }
}
