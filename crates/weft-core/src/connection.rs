//! Directed links between ports.
//!
//! A connection derives its routing policy from its endpoints: a polyphony or
//! kind mismatch forces mixing at the head, and a timing-domain crossing
//! forces serialized, timestamped delivery through a ring owned by the
//! connection itself.

use crate::block::Block;
use crate::buffer::{BufferKind, BufferRef, SeqEvent};
use crate::lockfree::RtCell;
use atomic_float::AtomicF32;
use core::sync::atomic::Ordering;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use std::sync::Arc;
use tracing::warn;

/// One end of a connection: a block and a port index on it.
#[derive(Clone)]
pub struct Endpoint {
    pub block: Arc<Block>,
    pub port: u32,
}

impl Endpoint {
    pub(crate) fn port(&self) -> &crate::port::Port {
        self.block.port(self.port)
    }
}

/// Cross-domain delivery ring. The producer end belongs to the thread that
/// runs the tail block, the consumer end to the thread that runs the head
/// block; each side is that thread's alone for the duration of its access.
struct QueueRing {
    prod: RtCell<HeapProd<SeqEvent>>,
    cons: RtCell<HeapCons<SeqEvent>>,
    /// Last scalar forwarded, for change detection on non-sequence tails.
    last_sent: AtomicF32,
}

pub struct Connection {
    tail: Endpoint,
    head: Endpoint,
    ring: Option<QueueRing>,
}

impl Connection {
    pub(crate) fn new(tail: Endpoint, head: Endpoint, ring_size: usize) -> Self {
        let queued = tail.block.domain() != head.block.domain();
        let ring = queued.then(|| {
            let (prod, cons) = HeapRb::new(ring_size).split();
            QueueRing {
                prod: RtCell::new(prod),
                cons: RtCell::new(cons),
                last_sent: AtomicF32::new(f32::NAN),
            }
        });
        Self { tail, head, ring }
    }

    #[inline]
    pub fn tail(&self) -> &Endpoint {
        &self.tail
    }

    #[inline]
    pub fn head(&self) -> &Endpoint {
        &self.head
    }

    pub(crate) fn matches(
        &self,
        tail_block: crate::block::BlockId,
        tail_port: u32,
        head_block: crate::block::BlockId,
        head_port: u32,
    ) -> bool {
        self.tail.block.id() == tail_block
            && self.tail.port == tail_port
            && self.head.block.id() == head_block
            && self.head.port == head_port
    }

    /// Whether the head needs a local mix-down buffer for this connection
    /// alone: polyphony mismatch in either direction, or kind coercion.
    pub(crate) fn must_mix(&self) -> bool {
        self.tail.port().kind() != self.head.port().kind()
            || self.tail.block.polyphony() != self.head.block.polyphony()
    }

    /// `must_mix` as it will stand once every prepared-but-unexecuted
    /// polyphony change has been applied. Event preparation only.
    pub(crate) fn must_mix_planned(&self) -> bool {
        self.tail.port().kind() != self.head.port().kind()
            || self.tail.block.planned_polyphony() != self.head.block.planned_polyphony()
    }

    /// Whether the endpoints execute in different timing domains.
    #[inline]
    pub(crate) fn must_queue(&self) -> bool {
        self.ring.is_some()
    }

    pub(crate) fn tail_voice_count(&self) -> usize {
        self.tail.port().voice_count()
    }

    pub(crate) fn tail_buffer(&self, voice: usize) -> Option<BufferRef> {
        self.tail.port().voice_buffer(voice)
    }

    /// Like [`tail_buffer`](Self::tail_buffer), but preferring buffers
    /// staged by a prepared, not-yet-executed polyphony change on the tail.
    pub(crate) fn planned_tail_buffer(&self, voice: usize) -> Option<BufferRef> {
        self.tail.port().planned_voice_buffer(voice)
    }

    /// Serialize the tail's cycle output into the ring, consuming it.
    ///
    /// Called by the thread that owns the tail's buffers: the driver at
    /// cycle end for audio-domain tails, the message thread right after a
    /// message-domain tail has run. Returns true when anything was queued.
    pub(crate) fn enqueue_cycle_output(&self, cycle_end: u64) -> bool {
        let Some(ring) = &self.ring else {
            return false;
        };
        let prod = ring.prod.get_mut();
        let mut queued = false;
        let tail = self.tail.port();
        if tail.kind() == BufferKind::Sequence {
            'serialize: for v in 0..tail.voice_count() {
                let Some(buf) = tail.voice_buffer(v) else {
                    continue;
                };
                for &ev in buf.events() {
                    if prod.try_push(ev).is_err() {
                        warn!("queued connection ring full, dropping item");
                        break 'serialize;
                    }
                    queued = true;
                }
            }
            // Each item crosses the boundary exactly once; the tail starts
            // its next run with an empty buffer.
            for v in 0..tail.voice_count() {
                if let Some(buf) = tail.voice_buffer(v) {
                    buf.clear();
                }
            }
        } else if let Some(buf) = tail.voice_buffer(0) {
            let value = buf.control();
            let last = ring.last_sent.load(Ordering::Relaxed);
            if value != last {
                ring.last_sent.store(value, Ordering::Relaxed);
                let item = SeqEvent {
                    frame: cycle_end,
                    kind: 0,
                    value,
                };
                if prod.try_push(item).is_err() {
                    warn!("queued connection ring full, dropping item");
                } else {
                    queued = true;
                }
            }
        }
        queued
    }

    /// Drain queued items into the head port's buffers.
    ///
    /// Called through the head port's `deliver_queued_inputs` by the thread
    /// about to run the head block, so delivery lands at the head's own
    /// cycle boundary and never races its units.
    pub(crate) fn deliver_queued(&self) {
        let Some(ring) = &self.ring else { return };
        let cons = ring.cons.get_mut();
        let head = self.head.port();
        while let Some(item) = cons.try_pop() {
            if head.kind() == BufferKind::Sequence {
                for v in 0..head.voice_count() {
                    if let Some(buf) = head.voice_buffer(v) {
                        if !buf.push_event(item) {
                            warn!("head sequence buffer full, dropping item");
                        }
                    }
                }
            } else {
                for v in 0..head.voice_count() {
                    if let Some(buf) = head.voice_buffer(v) {
                        buf.set_control(item.value);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("tail", &(self.tail.block.symbol(), self.tail.port))
            .field("head", &(self.head.block.symbol(), self.head.port))
            .field("queued", &self.must_queue())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockId, BlockSpec, Domain, Unit, UnitCtor, UnitIo};
    use crate::buffer::BufferPool;
    use crate::port::PortSpec;

    struct Idle;

    impl Unit for Idle {
        fn run(&mut self, _io: &mut UnitIo<'_>) {}
    }

    fn idle_ctor() -> UnitCtor {
        Arc::new(|| Ok(Box::new(Idle) as Box<dyn Unit>))
    }

    fn queued_pair(
        tail_kind: BufferKind,
        head_kind: BufferKind,
        pool: &BufferPool,
    ) -> (Arc<Block>, Arc<Block>, Arc<Connection>) {
        let tail_spec = BlockSpec::new(
            "src",
            vec![PortSpec::output("out", tail_kind)],
            idle_ctor(),
        );
        let head_spec = BlockSpec::new("sink", vec![PortSpec::input("in", head_kind)], idle_ctor())
            .in_domain(Domain::Message);
        let tail = Arc::new(Block::new(BlockId(1), &tail_spec, pool).unwrap());
        let head = Arc::new(Block::new(BlockId(2), &head_spec, pool).unwrap());
        let conn = Arc::new(Connection::new(
            Endpoint {
                block: tail.clone(),
                port: 0,
            },
            Endpoint {
                block: head.clone(),
                port: 0,
            },
            8,
        ));
        head.port(0).swap_arcs(Arc::new(vec![conn.clone()]));
        (tail, head, conn)
    }

    #[test]
    fn test_queued_sequence_items_cross_once() {
        let pool = BufferPool::new(16, 8);
        let (tail, head, conn) = queued_pair(BufferKind::Sequence, BufferKind::Sequence, &pool);
        assert!(conn.must_queue());

        let out = tail.port(0).voice_buffer(0).unwrap();
        assert!(out.push_event(SeqEvent {
            frame: 3,
            kind: 0,
            value: 1.0,
        }));
        assert!(conn.enqueue_cycle_output(64));
        // Serializing consumes the tail's output.
        assert!(out.events().is_empty());

        head.port(0).deliver_queued_inputs();
        let delivered = head.port(0).voice_buffer(0).unwrap();
        assert_eq!(delivered.events().len(), 1);
        assert_eq!(delivered.events()[0].frame, 3);

        // A quiet follow-up cycle leaves nothing behind and repeats nothing.
        assert!(!conn.enqueue_cycle_output(128));
        head.port(0).deliver_queued_inputs();
        assert!(head.port(0).voice_buffer(0).unwrap().events().is_empty());
    }

    #[test]
    fn test_queued_control_forwards_only_on_change() {
        let pool = BufferPool::new(16, 8);
        let (tail, head, conn) = queued_pair(BufferKind::Control, BufferKind::Control, &pool);

        tail.port(0).voice_buffer(0).unwrap().set_control(0.7);
        assert!(conn.enqueue_cycle_output(64));
        head.port(0).deliver_queued_inputs();
        assert_eq!(head.port(0).voice_buffer(0).unwrap().control(), 0.7);

        // Unchanged value, nothing queued.
        assert!(!conn.enqueue_cycle_output(128));
    }
}
