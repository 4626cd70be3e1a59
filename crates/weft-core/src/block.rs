//! Graph nodes: processing units with ports and polyphony.
//!
//! A block either wraps per-voice unit instances obtained through the plugin
//! boundary, or nests a whole subgraph. The two shapes are a closed enum
//! resolved at construction; nothing downcasts at run time.

use crate::buffer::{BufferPool, BufferRef};
use crate::config::MAX_POLYPHONY;
use crate::context::RtContext;
use crate::error::{Error, Result};
use crate::lockfree::RtCell;
use crate::port::{Direction, Port, PortSpec, Voices};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use smallvec::SmallVec;
use std::sync::Arc;

/// Engine-unique block identity, stable for the block's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// Timing domain a block executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Domain {
    /// Hard-real-time: runs inside the audio cycle under the compiled plan.
    Audio,
    /// Soft-real-time: runs on the message thread, ordered by virtual time.
    Message,
}

/// Per-voice buffer views handed to a unit's `run`.
pub struct UnitIo<'a> {
    pub inputs: &'a [BufferRef],
    pub outputs: &'a [BufferRef],
    /// Cycle length in frames. Zero for message-domain invocations.
    pub frames: usize,
    /// Absolute frame time of the first frame.
    pub start: u64,
    /// Which voice this instance is.
    pub voice: usize,
    pub sample_rate: u32,
}

/// The plugin boundary. One instance per voice.
///
/// `run` is called on the real-time path and must not allocate, lock, or
/// block. `activate`/`deactivate` are always off the real-time thread.
pub trait Unit: Send {
    fn activate(&mut self, _sample_rate: u32, _max_frames: usize) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, io: &mut UnitIo<'_>);

    fn deactivate(&mut self) {}
}

/// Instantiates one voice of a unit. May fail (external plugin boundary).
pub type UnitCtor = Arc<dyn Fn() -> Result<Box<dyn Unit>> + Send + Sync>;

/// Full description of a block, supplied by the client at creation.
pub struct BlockSpec {
    pub symbol: String,
    pub domain: Domain,
    pub ports: Vec<PortSpec>,
    pub unit: UnitCtor,
}

impl BlockSpec {
    pub fn new(symbol: impl Into<String>, ports: Vec<PortSpec>, unit: UnitCtor) -> Self {
        Self {
            symbol: symbol.into(),
            domain: Domain::Audio,
            ports,
            unit,
        }
    }

    pub fn in_domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }
}

pub(crate) enum BlockBody {
    Units {
        ctor: UnitCtor,
        /// One instance per voice. Written only by the claiming worker or an
        /// event's `execute`.
        voices: RtCell<Box<[Box<dyn Unit>]>>,
    },
    /// Nested subgraph, executed inline in compiled order by the worker that
    /// claims this block.
    Graph(Arc<crate::graph::Graph>),
}

/// State staged off the real-time thread for a polyphony change; installed
/// later by a single atomic-swap pass in `apply_poly`.
pub(crate) struct PreparedPoly {
    poly: usize,
    units: Option<Box<[Box<dyn Unit>]>>,
    /// Per-port voice arrays, index-aligned with `Block::ports`.
    voices: Vec<Arc<Voices>>,
}

impl PreparedPoly {
    pub(crate) fn poly(&self) -> usize {
        self.poly
    }

    /// The staged voice array for one of the block's ports.
    pub(crate) fn port_voices(&self, port: usize) -> &Arc<Voices> {
        &self.voices[port]
    }

    /// All staged per-port voice arrays, index-aligned with the ports.
    pub(crate) fn voices(&self) -> &[Arc<Voices>] {
        &self.voices
    }
}

/// Previous polyphony state, handed back from `apply_poly` for disposal off
/// the real-time thread.
pub(crate) struct RetiredPoly {
    pub(crate) units: Option<Box<[Box<dyn Unit>]>>,
    pub(crate) voices: Vec<Arc<Voices>>,
}

pub struct Block {
    id: BlockId,
    symbol: String,
    domain: Domain,
    poly: AtomicUsize,
    /// Polyphony staged by a prepared, not-yet-executed change; zero when
    /// none is in flight. Later event preparations plan against it.
    staged_poly: AtomicUsize,
    ports: Box<[Port]>,
    body: BlockBody,
    enabled: AtomicBool,
    activated: AtomicBool,
}

impl Block {
    /// Instantiate a block with one voice. Fails if the unit constructor
    /// does (plugin boundary).
    pub(crate) fn new(id: BlockId, spec: &BlockSpec, pool: &BufferPool) -> Result<Self> {
        let unit = (spec.unit)()
            .map_err(|e| Error::UnitInstantiation(format!("{}: {e}", spec.symbol)))?;
        let ports = spec
            .ports
            .iter()
            .enumerate()
            .map(|(i, p)| Port::new(i as u32, p, pool))
            .collect();
        Ok(Self {
            id,
            symbol: spec.symbol.clone(),
            domain: spec.domain,
            poly: AtomicUsize::new(1),
            staged_poly: AtomicUsize::new(0),
            ports,
            body: BlockBody::Units {
                ctor: spec.unit.clone(),
                voices: RtCell::new(vec![unit].into_boxed_slice()),
            },
            enabled: AtomicBool::new(true),
            activated: AtomicBool::new(false),
        })
    }

    /// Wrap a subgraph as a single block of its parent.
    pub(crate) fn from_graph(
        id: BlockId,
        symbol: impl Into<String>,
        graph: Arc<crate::graph::Graph>,
        ports: Vec<PortSpec>,
        pool: &BufferPool,
    ) -> Self {
        let ports = ports
            .iter()
            .enumerate()
            .map(|(i, p)| Port::new(i as u32, p, pool))
            .collect();
        Self {
            id,
            symbol: symbol.into(),
            domain: Domain::Audio,
            poly: AtomicUsize::new(1),
            staged_poly: AtomicUsize::new(0),
            ports,
            body: BlockBody::Graph(graph),
            enabled: AtomicBool::new(true),
            activated: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[inline]
    pub fn domain(&self) -> Domain {
        self.domain
    }

    #[inline]
    pub fn polyphony(&self) -> usize {
        self.poly.load(Ordering::Acquire)
    }

    /// The polyphony this block will have once any staged change has been
    /// applied. Event preparation judges mix-versus-direct against this.
    pub(crate) fn planned_polyphony(&self) -> usize {
        match self.staged_poly.load(Ordering::Acquire) {
            0 => self.polyphony(),
            staged => staged,
        }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Port by index. Callers validate indices at the API boundary.
    pub(crate) fn port(&self, index: u32) -> &Port {
        &self.ports[index as usize]
    }

    pub fn find_port(&self, symbol: &str) -> Option<&Port> {
        self.ports.iter().find(|p| p.symbol() == symbol)
    }

    pub(crate) fn subgraph(&self) -> Option<&Arc<crate::graph::Graph>> {
        match &self.body {
            BlockBody::Graph(g) => Some(g),
            BlockBody::Units { .. } => None,
        }
    }

    /// Activate every voice. Off the real-time thread, before first use.
    pub(crate) fn activate(&self, sample_rate: u32, max_frames: usize) -> Result<()> {
        if let BlockBody::Units { voices, .. } = &self.body {
            for unit in voices.get_mut().iter_mut() {
                unit.activate(sample_rate, max_frames)
                    .map_err(|e| Error::UnitActivation(format!("{}: {e}", self.symbol)))?;
            }
        }
        self.activated.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn deactivate(&self) {
        if let BlockBody::Units { voices, .. } = &self.body {
            for unit in voices.get_mut().iter_mut() {
                unit.deactivate();
            }
        }
        self.activated.store(false, Ordering::Release);
    }

    /// Stage a polyphony change off the real-time thread: instantiate and
    /// activate new unit voices, plan new per-port buffer bindings. Nothing
    /// the real-time side can observe changes here.
    pub(crate) fn prepare_poly(
        &self,
        poly: usize,
        sample_rate: u32,
        max_frames: usize,
        pool: &BufferPool,
    ) -> Result<PreparedPoly> {
        if poly == 0 || poly > MAX_POLYPHONY as usize {
            return Err(Error::InvalidPolyphony(poly as u32));
        }
        let units = match &self.body {
            BlockBody::Units { ctor, .. } => {
                let mut units = Vec::with_capacity(poly);
                for _ in 0..poly {
                    let mut unit = ctor()
                        .map_err(|e| Error::UnitInstantiation(format!("{}: {e}", self.symbol)))?;
                    if self.activated.load(Ordering::Acquire) {
                        unit.activate(sample_rate, max_frames).map_err(|e| {
                            Error::UnitActivation(format!("{}: {e}", self.symbol))
                        })?;
                    }
                    units.push(unit);
                }
                Some(units.into_boxed_slice())
            }
            BlockBody::Graph(_) => None,
        };
        let voices: Vec<Arc<Voices>> = self
            .ports
            .iter()
            .map(|port| port.plan_voices(poly, pool, &port.arcs()))
            .collect();
        // Stage the plan where later event preparations can see it: a
        // connect prepared after this point must bind these arrays, not the
        // ones the apply retires.
        for (port, planned) in self.ports.iter().zip(&voices) {
            port.stage(planned.clone());
        }
        self.staged_poly.store(poly, Ordering::Release);
        Ok(PreparedPoly { poly, units, voices })
    }

    /// Retire the staged plan once its change has been finalized, unless a
    /// later preparation has staged something newer.
    pub(crate) fn clear_staged(&self, poly: usize, staged: &[Arc<Voices>]) {
        for (port, voices) in self.ports.iter().zip(staged) {
            port.clear_staged_if(voices);
        }
        let _ = self.staged_poly.compare_exchange(
            poly,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Commit a prepared polyphony change: pointer swaps only. Real-time
    /// path, inside an event's `execute`. The returned previous state must
    /// be dropped off the real-time thread.
    pub(crate) fn apply_poly(&self, prepared: PreparedPoly) -> RetiredPoly {
        let old_units = match (&self.body, prepared.units) {
            (BlockBody::Units { voices, .. }, Some(new_units)) => Some(voices.replace(new_units)),
            _ => None,
        };
        let old_voices = self
            .ports
            .iter()
            .zip(prepared.voices)
            .map(|(port, planned)| port.swap_voices(planned))
            .collect();
        self.poly.store(prepared.poly, Ordering::Release);
        RetiredPoly {
            units: old_units,
            voices: old_voices,
        }
    }

    fn clear_outputs(&self) {
        for port in self.ports.iter() {
            if port.direction() == Direction::Output {
                for v in 0..port.voice_count() {
                    if let Some(buf) = port.voice_buffer(v) {
                        buf.clear();
                    }
                }
            }
        }
    }

    fn run_voices(&self, frames: usize, start: u64, sample_rate: u32) {
        match &self.body {
            BlockBody::Units { voices, .. } => {
                // The claiming worker (or the message thread for message-
                // domain blocks) is this cell's unique owner right now.
                let units = voices.get_mut();
                for (v, unit) in units.iter_mut().enumerate() {
                    let mut inputs: SmallVec<[BufferRef; 8]> = SmallVec::new();
                    let mut outputs: SmallVec<[BufferRef; 8]> = SmallVec::new();
                    for port in self.ports.iter() {
                        if let Some(buf) = port.voice_buffer(v) {
                            match port.direction() {
                                Direction::Input => inputs.push(buf),
                                Direction::Output => outputs.push(buf),
                            }
                        }
                    }
                    let mut io = UnitIo {
                        inputs: &inputs,
                        outputs: &outputs,
                        frames,
                        start,
                        voice: v,
                        sample_rate,
                    };
                    unit.run(&mut io);
                }
            }
            BlockBody::Graph(graph) => {
                graph.run_inline(frames, start, sample_rate);
            }
        }
    }

    /// Execute one cycle for this block. Called exactly once per cycle by
    /// the worker that won the claim.
    pub(crate) fn process(&self, rt: &mut RtContext) {
        if !self.is_enabled() {
            self.clear_outputs();
            return;
        }
        for port in self.ports.iter() {
            port.pre_run(self.id, rt);
        }
        self.run_voices(rt.frames(), rt.start(), rt.sample_rate());
    }

    /// Execute one pass without a worker context: pending values are applied
    /// silently (no notification ring). Used for blocks inside a nested
    /// subgraph, which run inline on the parent's claiming worker, and for
    /// message-domain blocks on the message thread.
    pub(crate) fn run_local(&self, frames: usize, start: u64, sample_rate: u32) {
        if !self.is_enabled() {
            self.clear_outputs();
            return;
        }
        for port in self.ports.iter() {
            port.deliver_queued_inputs();
            port.apply_pending();
            port.mix_inputs();
        }
        self.run_voices(frames, start, sample_rate);
    }

    /// Execute this message-domain block once, at virtual time `time`.
    /// Message thread only.
    pub(crate) fn run_message(&self, time: u64, sample_rate: u32) {
        self.run_local(0, time, sample_rate);
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("symbol", &self.symbol)
            .field("domain", &self.domain)
            .field("poly", &self.polyphony())
            .field("ports", &self.ports.len())
            .finish()
    }
}
