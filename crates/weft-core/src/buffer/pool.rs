//! Lock-free buffer pool with per-kind free lists.
//!
//! `acquire` pops from an intrusive CAS free list; an empty list allocates
//! only off the real-time thread. `release` happens implicitly when the last
//! [`BufferRef`](super::BufferRef) drops. Pools are pre-warmed during engine
//! activation so the real-time path never allocates.

use super::{Buffer, BufferKind, BufferRef};
use arc_swap::ArcSwapOption;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::ptr::NonNull;
use std::sync::Arc;

/// Intrusive lock-free singly-linked free list (Treiber stack).
///
/// Pushes may race freely. Pops follow a single-consumer-per-attempt
/// discipline: the real-time thread pops during resolution, the pre-process
/// thread pops only while holding the graph lock, so two pops never race and
/// the classic ABA hazard does not arise.
struct FreeList {
    head: AtomicPtr<Buffer>,
}

impl FreeList {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    fn push(&self, buf: *mut Buffer) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: buf is free-listed, so we are its only accessor.
            unsafe { (*buf).next.store(head, Ordering::Relaxed) };
            if self
                .head
                .compare_exchange_weak(head, buf, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn pop(&self) -> Option<NonNull<Buffer>> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let head = NonNull::new(head)?;
            // SAFETY: head was observed on the list; concurrent pushes only
            // prepend, and pops are externally serialized.
            let next = unsafe { head.as_ref().next.load(Ordering::Acquire) };
            if self
                .head
                .compare_exchange_weak(
                    head.as_ptr(),
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                unsafe { head.as_ref().next.store(std::ptr::null_mut(), Ordering::Relaxed) };
                return Some(head);
            }
        }
    }
}

/// Pool state shared by the pool handle and every live buffer.
pub(crate) struct PoolShared {
    free: [FreeList; BufferKind::COUNT],
    /// Total buffers ever allocated, per kind. Exposed for the round-trip
    /// high-water property.
    allocated: [AtomicUsize; BufferKind::COUNT],
    cycle_frames: AtomicUsize,
    seq_capacity: usize,
    silence: ArcSwapOption<BufferRef>,
}

impl PoolShared {
    fn free_list(&self, kind: BufferKind) -> &FreeList {
        &self.free[kind.index()]
    }

    /// Return a buffer whose refcount reached zero to its kind's free list.
    pub(crate) fn recycle(&self, buf: *mut Buffer) {
        // SAFETY: the caller was the last owner.
        let kind = unsafe { (*buf).kind };
        self.free_list(kind).push(buf);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        for list in &mut self.free {
            let mut head = *list.head.get_mut();
            while !head.is_null() {
                // SAFETY: free-listed buffers have no outstanding refs.
                let next = unsafe { *(*head).next.get_mut() };
                unsafe { drop(Box::from_raw(head)) };
                head = next;
            }
        }
    }
}

/// Typed, reference-counted buffer pool.
///
/// Cloning is cheap; clones share the same free lists.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create a pool for the given cycle length (frames) and sequence
    /// capacity (items). Also creates the shared silence buffer.
    pub fn new(cycle_frames: usize, seq_capacity: usize) -> Self {
        let pool = Self {
            shared: Arc::new(PoolShared {
                free: [
                    FreeList::new(),
                    FreeList::new(),
                    FreeList::new(),
                    FreeList::new(),
                ],
                allocated: Default::default(),
                cycle_frames: AtomicUsize::new(cycle_frames),
                seq_capacity,
                silence: ArcSwapOption::empty(),
            }),
        };
        pool.set_cycle_frames(cycle_frames);
        pool
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    /// Default capacity for a kind, in that kind's units.
    pub fn default_capacity(&self, kind: BufferKind) -> usize {
        match kind {
            BufferKind::Control => 1,
            BufferKind::Audio | BufferKind::Cv => {
                self.shared.cycle_frames.load(Ordering::Acquire)
            }
            BufferKind::Sequence => self.shared.seq_capacity,
        }
    }

    fn create(&self, kind: BufferKind, capacity: usize) -> BufferRef {
        let capacity = capacity.max(self.default_capacity(kind));
        self.shared.allocated[kind.index()].fetch_add(1, Ordering::Relaxed);
        let buf = Box::new(Buffer::new(kind, capacity, Arc::downgrade(&self.shared)));
        // Freed via the free list or BufferRef's final drop.
        let ptr = NonNull::from(Box::leak(buf));
        BufferRef::from_raw(ptr)
    }

    fn pop(&self, kind: BufferKind) -> Option<BufferRef> {
        let head = self.shared.free_list(kind).pop()?;
        // SAFETY: popped buffers have no owners; we become the first.
        unsafe {
            head.as_ref().refs.store(1, Ordering::Release);
        }
        let buf = BufferRef::from_raw(head);
        buf.clear();
        Some(buf)
    }

    /// Acquire a buffer of at least `capacity`, allocating on miss.
    ///
    /// Non-real-time callers only; the real-time path never acquires, it
    /// reads the buffers bound during event preparation.
    pub fn acquire(&self, kind: BufferKind, capacity: usize) -> BufferRef {
        match self.pop(kind) {
            Some(buf) => {
                if buf.capacity() < capacity {
                    // SAFETY precondition of grow: we hold the only ref.
                    unsafe { (*buf.as_ptr()).grow(capacity) };
                }
                buf
            }
            None => self.create(kind, capacity),
        }
    }

    /// Grow a buffer's storage. Non-real-time-thread-only; the caller must
    /// hold the only reference.
    pub fn resize(&self, buf: &BufferRef, capacity: usize) {
        // SAFETY: per the documented precondition.
        unsafe { (*buf.as_ptr()).grow(capacity) };
    }

    /// Pre-allocate `count` buffers of a kind into the free list.
    pub fn prewarm(&self, kind: BufferKind, count: usize) {
        for _ in 0..count {
            let buf = self.create(kind, self.default_capacity(kind));
            drop(buf); // refcount 1 -> 0, pushes onto the free list
        }
    }

    /// Update the cycle length and recreate the silence buffer for it.
    pub fn set_cycle_frames(&self, frames: usize) {
        self.shared.cycle_frames.store(frames, Ordering::Release);
        let silence = self.create(BufferKind::Audio, frames);
        silence.clear();
        self.shared.silence.store(Some(Arc::new(silence)));
    }

    /// The process-wide silence buffer: immutable, shared, read by
    /// unconnected audio inputs. Non-real-time callers clone it during event
    /// preparation.
    pub fn silence(&self) -> BufferRef {
        match self.shared.silence.load_full() {
            Some(s) => (*s).clone(),
            // Only reachable mid-construction.
            None => self.create(BufferKind::Audio, self.default_capacity(BufferKind::Audio)),
        }
    }

    /// Total buffers ever allocated for a kind (high-water diagnostics).
    pub fn allocated(&self, kind: BufferKind) -> usize {
        self.shared.allocated[kind.index()].load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field(
                "cycle_frames",
                &self.shared.cycle_frames.load(Ordering::Relaxed),
            )
            .field("seq_capacity", &self.shared.seq_capacity)
            .finish()
    }
}
