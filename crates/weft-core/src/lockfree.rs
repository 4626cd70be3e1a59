//! Lock-free and low-level synchronization primitives for the real-time path.

use core::sync::atomic::{AtomicU64, Ordering};
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;

/// Cache-line aligned atomic u64, used for frame-time counters.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFrame {
    value: AtomicU64,
}

impl AtomicFrame {
    pub fn new(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, value: u64) {
        self.value.store(value, Ordering::Release);
    }
}

impl Default for AtomicFrame {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Counting semaphore.
///
/// Used for the per-cycle whip/finish handshake between the driver thread and
/// the workers, and for blocking-event completion. These are soft wait points
/// off the per-node hot path; the per-node readiness waits in the scheduler
/// use raw atomics instead.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    /// Block until the count is positive, then decrement it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &*self.count.lock())
            .finish()
    }
}

/// A cell whose contents are written only at cycle boundaries by the
/// real-time thread that currently owns the enclosing object.
///
/// This replaces ambient "is this the audio thread" flags: every write path
/// goes through an event `execute()` or the scheduler's single-winner claim,
/// both of which guarantee exclusive access for the duration of the write.
/// Reads from non-real-time code happen only during event preparation with
/// the graph lock held, while the cell's owner is quiescent.
pub(crate) struct RtCell<T> {
    inner: UnsafeCell<T>,
}

impl<T> RtCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    /// Shared read. Caller must hold one of the accesses described above.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn get(&self) -> &T {
        // SAFETY: writes are confined to the single owner described in the
        // type-level contract; concurrent readers only observe quiescent
        // state.
        unsafe { &*self.inner.get() }
    }

    /// Exclusive access from the cell's current owner.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn get_mut(&self) -> &mut T {
        // SAFETY: see `get`; the caller is the unique owner for this cycle.
        unsafe { &mut *self.inner.get() }
    }

    /// Swap in a prepared value, returning the previous one for deferred
    /// disposal off the real-time thread.
    #[inline]
    pub(crate) fn replace(&self, value: T) -> T {
        std::mem::replace(self.get_mut(), value)
    }
}

// SAFETY: access discipline is enforced by the event/scheduler protocols
// documented on the type.
unsafe impl<T: Send> Send for RtCell<T> {}
unsafe impl<T: Send> Sync for RtCell<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RtCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RtCell").field(self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_atomic_frame_roundtrip() {
        let frame = AtomicFrame::new(0);
        assert_eq!(frame.load(), 0);
        frame.store(4096);
        assert_eq!(frame.load(), 4096);
    }

    #[test]
    fn test_semaphore_handshake() {
        let sem = Arc::new(Semaphore::new(0));
        let done = Arc::new(Semaphore::new(0));

        let worker = {
            let sem = sem.clone();
            let done = done.clone();
            thread::spawn(move || {
                for _ in 0..4 {
                    sem.wait();
                    done.post();
                }
            })
        };

        for _ in 0..4 {
            sem.post();
            done.wait();
        }
        worker.join().unwrap();
    }

    #[test]
    fn test_rt_cell_replace() {
        let cell = RtCell::new(vec![1, 2, 3]);
        let old = cell.replace(vec![4]);
        assert_eq!(old, vec![1, 2, 3]);
        assert_eq!(cell.get(), &vec![4]);
    }
}
