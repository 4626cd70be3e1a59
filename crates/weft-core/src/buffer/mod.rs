//! Typed, reference-counted signal buffers.
//!
//! A [`Buffer`] is a fixed-kind, fixed-capacity block of signal data. Buffers
//! are shared through [`BufferRef`] handles; when the last handle drops, the
//! buffer is pushed back onto its kind's lock-free free list instead of being
//! freed, so the real-time thread can reacquire it without allocating.

mod pool;

pub use pool::BufferPool;
pub(crate) use pool::PoolShared;

use atomic_float::AtomicF32;
use core::sync::atomic::{fence, AtomicPtr, AtomicUsize, Ordering};
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::Weak;

/// The kind of signal a buffer carries.
///
/// Fixed at acquisition; a buffer never changes kind while any port holds a
/// reference to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    /// Single control scalar, updated at cycle boundaries.
    Control,
    /// One audio sample per frame.
    Audio,
    /// Discrete control-voltage vector (audio-rate, control semantics).
    Cv,
    /// Timestamped structured event sequence.
    Sequence,
}

impl BufferKind {
    pub(crate) const COUNT: usize = 4;

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            BufferKind::Control => 0,
            BufferKind::Audio => 1,
            BufferKind::Cv => 2,
            BufferKind::Sequence => 3,
        }
    }

    /// Whether this kind carries one value per frame.
    #[inline]
    pub fn is_frame_rate(self) -> bool {
        matches!(self, BufferKind::Audio | BufferKind::Cv)
    }
}

/// One timestamped item in a sequence buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeqEvent {
    /// Absolute frame time.
    pub frame: u64,
    /// Application-defined event tag.
    pub kind: u32,
    /// Event payload.
    pub value: f32,
}

enum BufferData {
    /// Value lives in the `value` atomic.
    Control,
    /// Audio or CV frames.
    Frames(Box<[f32]>),
    /// Sequence items; capacity fixed at creation, never reallocated on the
    /// real-time thread.
    Sequence(Vec<SeqEvent>),
}

/// A typed signal buffer. Always handled through [`BufferRef`].
pub struct Buffer {
    kind: BufferKind,
    value: AtomicF32,
    data: UnsafeCell<BufferData>,
    refs: AtomicUsize,
    /// Intrusive free-list link, owned by the pool.
    pub(crate) next: AtomicPtr<Buffer>,
    pool: Weak<PoolShared>,
}

// SAFETY: `data` is only written by the cycle's single winner for the node
// that owns the buffer (see RtCell's contract); all other fields are atomic.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(kind: BufferKind, capacity: usize, pool: Weak<PoolShared>) -> Self {
        let data = match kind {
            BufferKind::Control => BufferData::Control,
            BufferKind::Audio | BufferKind::Cv => {
                BufferData::Frames(vec![0.0; capacity].into_boxed_slice())
            }
            BufferKind::Sequence => BufferData::Sequence(Vec::with_capacity(capacity)),
        };
        Self {
            kind,
            value: AtomicF32::new(0.0),
            data: UnsafeCell::new(data),
            refs: AtomicUsize::new(1),
            next: AtomicPtr::new(std::ptr::null_mut()),
            pool,
        }
    }

    /// Reallocate storage upward. Pool-only; never called from the real-time
    /// thread (see `BufferPool::resize`).
    pub(crate) fn grow(&self, capacity: usize) {
        // SAFETY: resize is non-real-time-only and the caller guarantees no
        // concurrent reader (buffer is free-listed or exclusively held).
        let data = unsafe { &mut *self.data.get() };
        match data {
            BufferData::Frames(frames) => {
                if capacity > frames.len() {
                    let mut grown = vec![0.0f32; capacity];
                    grown[..frames.len()].copy_from_slice(frames);
                    *frames = grown.into_boxed_slice();
                }
            }
            BufferData::Sequence(events) => {
                if capacity > events.capacity() {
                    events.reserve_exact(capacity - events.capacity());
                }
            }
            BufferData::Control => {}
        }
    }

    #[inline]
    pub(crate) fn current_capacity(&self) -> usize {
        // SAFETY: read-only peek; concurrent writers never change lengths.
        match unsafe { &*self.data.get() } {
            BufferData::Control => 1,
            BufferData::Frames(f) => f.len(),
            BufferData::Sequence(e) => e.capacity(),
        }
    }
}

/// Shared-ownership handle to a [`Buffer`].
///
/// Cloning increments the reference count; dropping the last handle returns
/// the buffer to its pool's free list (lock-free push), or frees it if the
/// pool is gone.
pub struct BufferRef {
    buf: NonNull<Buffer>,
}

// SAFETY: Buffer is Send + Sync and the refcount is atomic.
unsafe impl Send for BufferRef {}
unsafe impl Sync for BufferRef {}

impl BufferRef {
    /// Wrap a heap-allocated buffer whose refcount is already 1.
    pub(crate) fn from_raw(buf: NonNull<Buffer>) -> Self {
        Self { buf }
    }

    #[inline]
    fn inner(&self) -> &Buffer {
        // SAFETY: the refcount keeps the allocation alive for our lifetime.
        unsafe { self.buf.as_ref() }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut Buffer {
        self.buf.as_ptr()
    }

    /// The buffer's kind. Never changes.
    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.inner().kind
    }

    /// Capacity in frames (Audio/Cv) or items (Sequence).
    #[inline]
    pub fn capacity(&self) -> usize {
        match self.data() {
            BufferData::Control => 1,
            BufferData::Frames(f) => f.len(),
            BufferData::Sequence(e) => e.capacity(),
        }
    }

    /// Whether two handles point at the same underlying buffer.
    #[inline]
    pub fn ptr_eq(a: &BufferRef, b: &BufferRef) -> bool {
        a.buf == b.buf
    }

    #[inline]
    fn data(&self) -> &BufferData {
        // SAFETY: see Buffer's Sync justification.
        unsafe { &*self.inner().data.get() }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn data_mut(&self) -> &mut BufferData {
        // SAFETY: callers are the cycle's unique writer for this buffer; the
        // compiled order guarantees the writing node runs before any reader.
        unsafe { &mut *self.inner().data.get() }
    }

    /// Current control value.
    #[inline]
    pub fn control(&self) -> f32 {
        self.inner().value.load(Ordering::Acquire)
    }

    /// Set the control value. Lock-free; safe from any thread.
    #[inline]
    pub fn set_control(&self, value: f32) {
        self.inner().value.store(value, Ordering::Release);
    }

    /// Frame contents (Audio/Cv). Empty for other kinds.
    #[inline]
    pub fn samples(&self) -> &[f32] {
        match self.data() {
            BufferData::Frames(f) => f,
            _ => &[],
        }
    }

    /// Mutable frame contents, for the cycle's single writer.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub fn samples_mut(&self) -> &mut [f32] {
        match self.data_mut() {
            BufferData::Frames(f) => f,
            _ => &mut [],
        }
    }

    /// Sequence items. Empty for other kinds.
    #[inline]
    pub fn events(&self) -> &[SeqEvent] {
        match self.data() {
            BufferData::Sequence(e) => e,
            _ => &[],
        }
    }

    /// Append a sequence item without reallocating.
    ///
    /// Returns `false` (and the item is dropped) when the buffer is full;
    /// the caller logs. Never allocates.
    #[inline]
    pub fn push_event(&self, event: SeqEvent) -> bool {
        match self.data_mut() {
            BufferData::Sequence(e) => {
                if e.len() == e.capacity() {
                    false
                } else {
                    e.push(event);
                    true
                }
            }
            _ => false,
        }
    }

    /// Bulk-replace sequence contents from pre-sorted items.
    pub(crate) fn set_events(&self, items: &[SeqEvent]) {
        if let BufferData::Sequence(e) = self.data_mut() {
            e.clear();
            let n = items.len().min(e.capacity());
            e.extend_from_slice(&items[..n]);
        }
    }

    /// Zero/clear contents in place.
    pub fn clear(&self) {
        match self.data_mut() {
            BufferData::Control => {}
            BufferData::Frames(f) => f.fill(0.0),
            BufferData::Sequence(e) => e.clear(),
        }
        self.inner().value.store(0.0, Ordering::Release);
    }

    /// Copy another buffer's contents. Kinds must match; mismatches are
    /// handled by the mix rules, not here.
    pub fn copy_from(&self, src: &BufferRef) {
        match (self.data_mut(), src.data()) {
            (BufferData::Frames(dst), BufferData::Frames(s)) => {
                let n = dst.len().min(s.len());
                dst[..n].copy_from_slice(&s[..n]);
            }
            (BufferData::Sequence(dst), BufferData::Sequence(s)) => {
                dst.clear();
                let n = s.len().min(dst.capacity());
                dst.extend_from_slice(&s[..n]);
            }
            _ => {}
        }
        self.set_control(src.control());
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        self.inner().refs.fetch_add(1, Ordering::Relaxed);
        Self { buf: self.buf }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        if self.inner().refs.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            let ptr = self.buf.as_ptr();
            // SAFETY: we were the last owner.
            let pool = unsafe { (*ptr).pool.clone() };
            match pool.upgrade() {
                Some(pool) => pool.recycle(ptr),
                // Pool is gone; free outright (non-real-time by then).
                None => unsafe {
                    drop(Box::from_raw(ptr));
                },
            }
        }
    }
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRef")
            .field("kind", &self.kind())
            .field("capacity", &self.capacity())
            .finish()
    }
}
