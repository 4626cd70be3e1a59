//! Per-worker real-time execution context.
//!
//! An [`RtContext`] is handed to each thread that participates in a cycle and
//! doubles as a capability token: operations that are only legal on the
//! real-time path (pool pops, notification pushes) take `&RtContext`, so a
//! non-real-time caller cannot reach them by accident.

use crate::lockfree::AtomicFrame;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// A unit of work the real-time path wants the post-processor to act on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Notification {
    /// Originating block.
    pub block: crate::block::BlockId,
    /// Port index within the block.
    pub port: u32,
    /// Observed value.
    pub value: f32,
    /// Absolute frame time of the observation.
    pub frame: u64,
}

/// Cycle timing shared between the driver and every worker context.
///
/// The driver advances it once per cycle before waking the workers.
pub(crate) struct CycleClock {
    start: AtomicFrame,
    frames: AtomicUsize,
    sample_rate: u32,
}

impl CycleClock {
    pub(crate) fn new(sample_rate: u32) -> Self {
        Self {
            start: AtomicFrame::new(0),
            frames: AtomicUsize::new(0),
            sample_rate,
        }
    }

    pub(crate) fn begin_cycle(&self, start: u64, frames: usize) {
        self.frames.store(frames, Ordering::Relaxed);
        self.start.store(start);
    }
}

/// Real-time execution context for one worker thread.
///
/// Owned exclusively by its worker; the notification ring's consumer end
/// lives with the post-processor.
pub struct RtContext {
    worker: usize,
    clock: Arc<CycleClock>,
    notifications: HeapProd<Notification>,
}

impl RtContext {
    pub(crate) fn new(
        worker: usize,
        clock: Arc<CycleClock>,
        ring_size: usize,
    ) -> (Self, NotificationRx) {
        let (prod, cons) = HeapRb::new(ring_size).split();
        (
            Self {
                worker,
                clock,
                notifications: prod,
            },
            NotificationRx { cons },
        )
    }

    /// Index of the thread this context belongs to. The driver is 0.
    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker
    }

    /// First frame of the current cycle.
    #[inline]
    pub fn start(&self) -> u64 {
        self.clock.start.load()
    }

    /// One past the last frame of the current cycle.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start() + self.frames() as u64
    }

    /// Length of the current cycle in frames.
    #[inline]
    pub fn frames(&self) -> usize {
        self.clock.frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.clock.sample_rate
    }

    /// Queue a notification for the post-processor. Lock-free; drops (with a
    /// warning) when the ring is full rather than blocking.
    pub fn notify(&mut self, note: Notification) {
        if self.notifications.try_push(note).is_err() {
            warn!(worker = self.worker, "notification ring full, dropping");
        }
    }
}

/// Non-real-time consumer end of one worker's notification ring.
pub(crate) struct NotificationRx {
    cons: HeapCons<Notification>,
}

impl NotificationRx {
    /// Drain all pending notifications into `f`.
    pub(crate) fn drain(&mut self, mut f: impl FnMut(Notification)) {
        while let Some(note) = self.cons.try_pop() {
            f(note);
        }
    }
}
