//! Typed signal endpoints on blocks.
//!
//! A port owns a polyphony-matched array of per-voice buffer references. How
//! those references are bound is decided once per topology change by
//! [`Port::plan_voices`] (off the real-time thread) and installed with an
//! atomic swap; per-cycle work is limited to applying pending values and
//! mixing multiply-fed inputs.

use crate::buffer::{BufferKind, BufferPool, BufferRef};
use crate::connection::Connection;
use crate::context::{Notification, RtContext};
use crate::mix::mix_into;
use arc_swap::{ArcSwap, ArcSwapOption};
use atomic_float::AtomicF32;
use core::sync::atomic::{AtomicU8, Ordering};
use smallvec::SmallVec;
use std::sync::Arc;

/// Signal direction relative to the owning block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Input,
    Output,
}

/// Static description of a port, supplied at block creation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PortSpec {
    pub symbol: String,
    pub kind: BufferKind,
    pub direction: Direction,
    /// Initial value for control-like ports.
    pub default: f32,
}

impl PortSpec {
    pub fn input(symbol: impl Into<String>, kind: BufferKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            direction: Direction::Input,
            default: 0.0,
        }
    }

    pub fn output(symbol: impl Into<String>, kind: BufferKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            direction: Direction::Output,
            default: 0.0,
        }
    }

    pub fn with_default(mut self, default: f32) -> Self {
        self.default = default;
        self
    }
}

/// One polyphonic instance of a port's buffer binding.
pub(crate) struct Voice {
    pub buffer: BufferRef,
}

pub(crate) type Voices = Box<[Voice]>;
pub(crate) type ArcList = Vec<Arc<Connection>>;

const PENDING_EMPTY: u8 = 0;
const PENDING_ARMED: u8 = 1;

/// Latest-wins externally-set value, applied exactly once at a cycle
/// boundary.
struct PendingValue {
    state: AtomicU8,
    value: AtomicF32,
}

impl PendingValue {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING_EMPTY),
            value: AtomicF32::new(0.0),
        }
    }

    fn set(&self, value: f32) {
        self.value.store(value, Ordering::Release);
        self.state.store(PENDING_ARMED, Ordering::Release);
    }

    fn take(&self) -> Option<f32> {
        if self.state.swap(PENDING_EMPTY, Ordering::AcqRel) == PENDING_ARMED {
            Some(self.value.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

pub struct Port {
    index: u32,
    symbol: String,
    kind: BufferKind,
    direction: Direction,
    default: f32,
    /// Per-voice buffer bindings. Swapped whole by events; the real-time
    /// side only ever loads.
    voices: ArcSwap<Voices>,
    /// Voice array staged by a prepared, not-yet-executed polyphony change.
    /// Later event preparations bind against these so they reference the
    /// buffers that will be live when they execute.
    staged: ArcSwapOption<Voices>,
    /// Incoming connections in establishment order (inputs only).
    arcs: ArcSwap<ArcList>,
    pending: PendingValue,
}

impl Port {
    pub(crate) fn new(index: u32, spec: &PortSpec, pool: &BufferPool) -> Self {
        let port = Self {
            index,
            symbol: spec.symbol.clone(),
            kind: spec.kind,
            direction: spec.direction,
            default: spec.default,
            voices: ArcSwap::from_pointee(Vec::new().into_boxed_slice()),
            staged: ArcSwapOption::empty(),
            arcs: ArcSwap::from_pointee(Vec::new()),
            pending: PendingValue::new(),
        };
        let initial = port.plan_voices(1, pool, &[]);
        port.voices.store(initial);
        port
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }

    /// Current scalar value of voice zero. Safe from any thread.
    pub fn value(&self) -> f32 {
        let voices = self.voices.load();
        voices.first().map(|v| v.buffer.control()).unwrap_or(self.default)
    }

    /// Request a new value, applied cleanly at the next cycle boundary.
    /// Latest request wins.
    pub(crate) fn request_value(&self, value: f32) {
        self.pending.set(value);
    }

    /// Buffer bound to one voice. Real-time readers go through the guard.
    pub(crate) fn voice_buffer(&self, voice: usize) -> Option<BufferRef> {
        let voices = self.voices.load();
        let n = voices.len();
        if n == 0 {
            return None;
        }
        Some(voices[voice % n].buffer.clone())
    }

    pub(crate) fn voice_count(&self) -> usize {
        self.voices.load().len()
    }

    /// Like [`voice_buffer`](Self::voice_buffer), but preferring a staged
    /// voice array. Event preparation uses this for direct bindings so a
    /// pending polyphony change on the source cannot leave the head bound
    /// to buffers the change retires.
    pub(crate) fn planned_voice_buffer(&self, voice: usize) -> Option<BufferRef> {
        if let Some(staged) = self.staged.load_full() {
            let n = staged.len();
            if n > 0 {
                return Some(staged[voice % n].buffer.clone());
            }
        }
        self.voice_buffer(voice)
    }

    /// Record a planned voice array for later event preparations to bind
    /// against. Pre-process thread only.
    pub(crate) fn stage(&self, voices: Arc<Voices>) {
        self.staged.store(Some(voices));
    }

    /// Drop the staged array, but only if it is still the one given; a
    /// newer staging by a later event wins.
    pub(crate) fn clear_staged_if(&self, expected: &Arc<Voices>) {
        let current = self.staged.load();
        if current
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, expected))
        {
            self.staged.compare_and_swap(&current, None);
        }
    }

    /// Connections currently feeding this input, establishment order.
    pub(crate) fn arcs(&self) -> Arc<ArcList> {
        self.arcs.load_full()
    }

    pub(crate) fn num_arcs(&self) -> usize {
        self.arcs.load().len()
    }

    /// Install a new arc list. Called from event `execute`; the returned
    /// previous list is dropped off the real-time thread.
    pub(crate) fn swap_arcs(&self, arcs: Arc<ArcList>) -> Arc<ArcList> {
        self.arcs.swap(arcs)
    }

    /// Install a prepared voice array. Same discipline as [`swap_arcs`]
    /// (`Self::swap_arcs`).
    pub(crate) fn swap_voices(&self, voices: Arc<Voices>) -> Arc<Voices> {
        self.voices.swap(voices)
    }

    /// Whether an input with this arc list reads its single source's buffers
    /// directly, with no local copy. Judged against live polyphony; the
    /// real-time mix path uses this.
    pub(crate) fn wants_direct(arcs: &[Arc<Connection>]) -> bool {
        let mut feeding = arcs.iter().filter(|a| !a.must_queue());
        match (feeding.next(), feeding.next()) {
            (Some(only), None) => !only.must_mix(),
            _ => false,
        }
    }

    /// [`wants_direct`](Self::wants_direct) judged against planned
    /// polyphony, including changes staged but not yet applied. Event
    /// preparation uses this.
    fn wants_direct_planned(arcs: &[Arc<Connection>]) -> bool {
        let mut feeding = arcs.iter().filter(|a| !a.must_queue());
        match (feeding.next(), feeding.next()) {
            (Some(only), None) => !only.must_mix_planned(),
            _ => false,
        }
    }

    /// Compute the buffer binding for every voice under the given arc list.
    ///
    /// Off the real-time thread only; buffers come from the pool's non-real-
    /// time acquire path. The result is installed later by an event's
    /// `execute` via [`swap_voices`](Self::swap_voices).
    pub(crate) fn plan_voices(
        &self,
        poly: usize,
        pool: &BufferPool,
        arcs: &[Arc<Connection>],
    ) -> Arc<Voices> {
        let mut voices = Vec::with_capacity(poly);
        if self.direction == Direction::Output {
            for _ in 0..poly {
                voices.push(Voice {
                    buffer: pool.acquire(self.kind, pool.default_capacity(self.kind)),
                });
            }
        } else if arcs.is_empty() && self.kind == BufferKind::Audio {
            // Unconnected audio input: every voice reads shared silence. Cv
            // stays locally buffered so it remains settable.
            let silence = pool.silence();
            for _ in 0..poly {
                voices.push(Voice {
                    buffer: silence.clone(),
                });
            }
        } else if Self::wants_direct_planned(arcs) {
            // Zero-copy: bind the single source's per-voice buffers.
            let arc = arcs
                .iter()
                .find(|a| !a.must_queue())
                .cloned()
                .unwrap_or_else(|| arcs[0].clone());
            for v in 0..poly {
                let buffer = arc
                    .planned_tail_buffer(v)
                    .unwrap_or_else(|| pool.acquire(self.kind, pool.default_capacity(self.kind)));
                voices.push(Voice { buffer });
            }
        } else {
            // Mix target, queued-delivery target, or unconnected control or
            // sequence input: local buffers.
            return self.plan_local_voices(poly, pool);
        }
        Arc::new(voices.into_boxed_slice())
    }

    /// Voice array backed by freshly acquired local buffers, regardless of
    /// the arc shape. Used directly when a staged polyphony change makes the
    /// current-arc direct-connect decision unreliable.
    pub(crate) fn plan_local_voices(&self, poly: usize, pool: &BufferPool) -> Arc<Voices> {
        // Fresh buffers carry the current scalar forward, so set values
        // survive rebinding and polyphony changes.
        let value = self.value();
        let mut voices = Vec::with_capacity(poly);
        for _ in 0..poly {
            let buffer = pool.acquire(self.kind, pool.default_capacity(self.kind));
            if !self.kind.is_frame_rate() {
                buffer.set_control(value);
            }
            voices.push(Voice { buffer });
        }
        Arc::new(voices.into_boxed_slice())
    }

    /// Apply a pending value to every voice. Returns the value applied, if
    /// any. Called by the thread that currently owns the port's block.
    pub(crate) fn apply_pending(&self) -> Option<f32> {
        let value = self.pending.take()?;
        // An unconnected audio input is bound to the shared silence buffer,
        // which must never be written.
        if self.kind == BufferKind::Audio && self.is_input() && self.num_arcs() == 0 {
            return None;
        }
        let voices = self.voices.load();
        for voice in voices.iter() {
            voice.buffer.set_control(value);
            if self.kind.is_frame_rate() {
                voice.buffer.samples_mut().fill(value);
            }
        }
        Some(value)
    }

    /// Drain cross-domain deliveries into this input's buffers. Called by
    /// the thread about to run the owning block, before pending values and
    /// mixing, so each queued item lands at the head's own cycle boundary.
    pub(crate) fn deliver_queued_inputs(&self) {
        if self.direction != Direction::Input {
            return;
        }
        let arcs = self.arcs.load();
        let mut queued = arcs.iter().filter(|a| a.must_queue());
        let Some(first) = queued.next() else {
            return;
        };
        if self.kind == BufferKind::Sequence {
            // Items delivered for the previous run were consumed by it.
            for v in 0..self.voice_count() {
                if let Some(buf) = self.voice_buffer(v) {
                    buf.clear();
                }
            }
        }
        first.deliver_queued();
        for arc in queued {
            arc.deliver_queued();
        }
    }

    /// Mix the feeding connections into this input's local voices. A no-op
    /// for outputs, direct-connected inputs, and unconnected inputs.
    pub(crate) fn mix_inputs(&self) {
        if self.direction != Direction::Input {
            return;
        }
        let voices = self.voices.load();
        let arcs = self.arcs.load();
        if Self::wants_direct(&arcs) {
            return;
        }
        let feeding: SmallVec<[&Arc<Connection>; 8]> =
            arcs.iter().filter(|a| !a.must_queue()).collect();
        if feeding.is_empty() {
            return;
        }
        let poly = voices.len();
        for (v, voice) in voices.iter().enumerate() {
            let mut srcs: SmallVec<[BufferRef; 8]> = SmallVec::new();
            for arc in &feeding {
                let tail_poly = arc.tail_voice_count();
                if tail_poly <= poly {
                    if let Some(buf) = arc.tail_buffer(v) {
                        srcs.push(buf);
                    }
                } else {
                    // Poly collapse: every tail voice contributes.
                    for tv in 0..tail_poly {
                        if let Some(buf) = arc.tail_buffer(tv) {
                            srcs.push(buf);
                        }
                    }
                }
            }
            mix_into(&voice.buffer, &srcs);
        }
    }

    /// Per-cycle input preparation on the real-time path: drain queued
    /// deliveries, apply any pending value (notifying the post-processor),
    /// then mix multiply-fed voices. Runs on the worker that claimed the
    /// owning block, before its units.
    pub(crate) fn pre_run(&self, block: crate::block::BlockId, rt: &mut RtContext) {
        self.deliver_queued_inputs();
        if let Some(value) = self.apply_pending() {
            rt.notify(Notification {
                block,
                port: self.index,
                value,
                frame: rt.start(),
            });
        }
        self.mix_inputs();
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("index", &self.index)
            .field("symbol", &self.symbol)
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .finish()
    }
}
