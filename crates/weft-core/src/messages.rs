//! The message context: soft-real-time, time-ordered execution.
//!
//! Work too slow or too irregular for the audio cycle runs here, ordered by
//! a virtual clock the driver advances once per cycle. Real-time submitters
//! push to a lock-free ring and wake the thread at cycle end; non-real-time
//! submitters hand off synchronously, blocking until receipt (not until
//! execution).

use crate::block::Block;
use crate::context::RtContext;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::lockfree::Semaphore;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// One deferred execution: run `block` at virtual time `time`.
pub(crate) struct MessageItem {
    pub(crate) time: u64,
    pub(crate) block: Arc<Block>,
}

/// Min-heap entry: earliest time first, insertion order breaking ties.
struct HeapEntry {
    time: u64,
    seq: u64,
    item: MessageItem,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the earliest on top.
        (other.time, other.seq).cmp(&(self.time, self.seq))
    }
}

struct Shared {
    /// Real-time submissions.
    ring: ArrayQueue<MessageItem>,
    /// Non-real-time submissions, drained synchronously.
    handoff: Mutex<Vec<MessageItem>>,
    received: Condvar,
    wake: Semaphore,
    /// Virtual clock: last announced cycle-end time. Items beyond it wait.
    cycle_end: AtomicU64,
    running: AtomicBool,
    /// Held by the currently-executing item; re-entry is rejected, not
    /// deadlocked.
    in_item: AtomicBool,
    root: Arc<Graph>,
    sample_rate: u32,
}

impl Shared {
    fn execute(&self, item: &MessageItem) {
        match self.try_enter() {
            Ok(()) => {
                item.block.run_message(item.time, self.sample_rate);
                // This thread owns a message-domain tail's buffers, so its
                // cross-domain outputs serialize here, right after the run.
                if let Some(plan) = self.root.current_plan() {
                    for conn in plan.queued() {
                        if conn.tail().block.id() == item.block.id() {
                            conn.enqueue_cycle_output(item.time);
                        }
                    }
                }
                self.in_item.store(false, Ordering::Release);
            }
            Err(e) => warn!("{e}"),
        }
    }

    fn try_enter(&self) -> Result<()> {
        if self.in_item.swap(true, Ordering::AcqRel) {
            return Err(Error::MessageReentry);
        }
        Ok(())
    }
}

fn context_loop(shared: Arc<Shared>) {
    let mut heap: BinaryHeap<HeapEntry> = BinaryHeap::new();
    let mut seq: u64 = 0;
    while shared.running.load(Ordering::Acquire) {
        shared.wake.wait();
        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        loop {
            // Pull every pending submission into the ordered set before
            // re-checking the bound, so items enqueued by an executing item
            // are sequenced correctly.
            while let Some(item) = shared.ring.pop() {
                heap.push(HeapEntry {
                    time: item.time,
                    seq,
                    item,
                });
                seq += 1;
            }
            {
                let mut handoff = shared.handoff.lock();
                for item in handoff.drain(..) {
                    heap.push(HeapEntry {
                        time: item.time,
                        seq,
                        item,
                    });
                    seq += 1;
                }
                shared.received.notify_all();
            }

            let bound = shared.cycle_end.load(Ordering::Acquire);
            match heap.peek() {
                Some(entry) if entry.time <= bound => {
                    if let Some(entry) = heap.pop() {
                        shared.execute(&entry.item);
                    }
                }
                _ => break,
            }
        }
    }
    debug!("message context exiting");
}

pub(crate) struct MessageContext {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl MessageContext {
    pub(crate) fn spawn(
        root: Arc<Graph>,
        sample_rate: u32,
        ring_size: usize,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            ring: ArrayQueue::new(ring_size),
            handoff: Mutex::new(Vec::new()),
            received: Condvar::new(),
            wake: Semaphore::new(0),
            cycle_end: AtomicU64::new(0),
            running: AtomicBool::new(true),
            in_item: AtomicBool::new(false),
            root,
            sample_rate,
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("weft-messages".into())
            .spawn(move || context_loop(thread_shared))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Submit from the real-time thread: lock-free push, woken at cycle end.
    /// A full ring drops the item with a warning.
    pub(crate) fn submit_rt(&self, item: MessageItem, _rt: &RtContext) {
        if self.shared.ring.push(item).is_err() {
            warn!("message ring full, dropping item");
        }
    }

    /// Submit from a non-real-time thread. Blocks until the context has
    /// taken receipt of the item; execution still happens on its own clock.
    pub(crate) fn submit(&self, item: MessageItem) {
        let mut handoff = self.shared.handoff.lock();
        handoff.push(item);
        self.shared.wake.post();
        while !handoff.is_empty() {
            self.shared.received.wait(&mut handoff);
        }
    }

    /// Advance the virtual clock to the end of the cycle just rendered and
    /// wake the context. Driver thread, once per cycle.
    pub(crate) fn announce_cycle_end(&self, end: u64, _rt: &RtContext) {
        self.shared.cycle_end.store(end, Ordering::Release);
        self.shared.wake.post();
    }
}

impl Drop for MessageContext {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.wake.post();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockId, Domain};
    use crate::buffer::BufferPool;
    use crate::internals;
    use std::time::Duration;

    #[test]
    fn test_items_wait_for_the_virtual_clock() {
        let pool = BufferPool::new(16, 8);
        let root = Arc::new(Graph::new());
        let ctx = MessageContext::spawn(root, 48_000, 16).unwrap();

        let (spec, seen) = internals::probe_spec("probe");
        let spec = spec.in_domain(Domain::Message);
        let block = Arc::new(Block::new(BlockId(1), &spec, &pool).unwrap());
        block
            .find_port("in")
            .unwrap()
            .voice_buffer(0)
            .unwrap()
            .set_control(4.5);

        ctx.submit(MessageItem {
            time: 1000,
            block: block.clone(),
        });
        // Clock still at 0: nothing runs.
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(seen.load(Ordering::Acquire), 0.0);

        // Advance past the item's time.
        ctx.shared.cycle_end.store(1024, Ordering::Release);
        ctx.shared.wake.post();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.load(Ordering::Acquire) != 4.5 {
            assert!(std::time::Instant::now() < deadline, "item never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_nrt_submit_returns_after_receipt() {
        let root = Arc::new(Graph::new());
        let ctx = MessageContext::spawn(root, 48_000, 16).unwrap();
        let pool = BufferPool::new(16, 8);
        let (spec, _seen) = internals::probe_spec("probe");
        let block = Arc::new(
            Block::new(BlockId(1), &spec.in_domain(Domain::Message), &pool).unwrap(),
        );
        // Returns promptly even though time 5000 is far in the future.
        ctx.submit(MessageItem { time: 5000, block });
    }

    #[test]
    fn test_reentry_is_rejected() {
        let root = Arc::new(Graph::new());
        let ctx = MessageContext::spawn(root, 48_000, 16).unwrap();
        assert!(ctx.shared.try_enter().is_ok());
        assert!(matches!(
            ctx.shared.try_enter(),
            Err(Error::MessageReentry)
        ));
        ctx.shared.in_item.store(false, Ordering::Release);
    }
}
