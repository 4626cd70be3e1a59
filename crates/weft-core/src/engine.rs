//! Engine assembly: the non-real-time control handle, the real-time
//! backend, and the shared state both sides see.
//!
//! `EngineBuilder::build` wires the whole machine: the buffer pools, the
//! scheduler's worker team, the event pipeline's pre/post threads, and the
//! message context. It hands back an [`Engine`] (control side) and an
//! [`EngineBackend`] (real-time side, to be driven by the audio callback or
//! an equivalent clock source).

use crate::block::{BlockId, BlockSpec, Domain};
use crate::buffer::BufferPool;
use crate::config::EngineConfig;
use crate::context::CycleClock;
use crate::error::{Error, Result};
use crate::events::{
    ConnectEvent, CreateBlockEvent, DeleteBlockEvent, DisconnectAllEvent, DisconnectEvent,
    EnableBlockEvent, EventEnvelope, GraphEvent, PortAddr, RequestId, SetPolyphonyEvent,
    SetValueEvent, SubmitOpts,
};
use crate::graph::Graph;
use crate::messages::{MessageContext, MessageItem};
use crate::pipeline::{self, EventSubmitter, LogResponder, PipelineThreads, Responder, RtEventQueue};
use crate::scheduler::Scheduler;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// State shared between the control side, the pipeline threads, and event
/// preparation.
pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) pool: BufferPool,
    pub(crate) root: Arc<Graph>,
    pub(crate) next_block_id: AtomicU64,
    pub(crate) activated: AtomicBool,
}

/// Builds an engine pair from a configuration.
pub struct EngineBuilder {
    config: EngineConfig,
    responder: Arc<dyn Responder>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            responder: Arc::new(LogResponder),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Route event responses and notifications somewhere other than the log.
    pub fn responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = responder;
        self
    }

    /// Validate the configuration and spawn every engine thread.
    pub fn build(self) -> Result<(Engine, EngineBackend)> {
        self.config.validate()?;
        let config = self.config;

        let pool = BufferPool::new(config.max_cycle_frames, config.sequence_capacity);
        let root = Arc::new(Graph::new());
        let shared = Arc::new(EngineShared {
            pool,
            root: root.clone(),
            next_block_id: AtomicU64::new(1),
            activated: AtomicBool::new(false),
            config,
        });

        let clock = Arc::new(CycleClock::new(shared.config.sample_rate));
        let (scheduler, driver_rt, rings) = Scheduler::new(
            shared.config.threads,
            clock.clone(),
            shared.config.notification_ring_size,
        )
        .map_err(|e| Error::ThreadSpawn(e.to_string()))?;

        let (submitter, rt_events, threads) =
            pipeline::spawn(shared.clone(), self.responder, rings)
                .map_err(|e| Error::ThreadSpawn(e.to_string()))?;

        let messages = MessageContext::spawn(
            root,
            shared.config.sample_rate,
            shared.config.message_queue_size,
        )
        .map_err(|e| Error::ThreadSpawn(e.to_string()))?;

        let engine = Engine {
            shared: shared.clone(),
            submitter,
            next_request: AtomicU64::new(1),
        };
        let backend = EngineBackend {
            shared,
            clock,
            rt: driver_rt,
            rt_events,
            scheduler,
            messages,
            threads,
            frame: 0,
        };
        Ok((engine, backend))
    }
}

/// The non-real-time control handle. All graph mutations go through here as
/// events; reads go straight to the shared graph.
pub struct Engine {
    shared: Arc<EngineShared>,
    submitter: EventSubmitter,
    next_request: AtomicU64,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    fn submit(&self, event: Box<dyn GraphEvent>, opts: SubmitOpts) -> Result<RequestId> {
        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let envelope = EventEnvelope::new(event, request, opts);
        let gate = envelope.gate.clone();
        self.submitter.submit(envelope)?;
        if let Some(gate) = gate {
            // A blocking submission returns only after the real-time thread
            // has executed the event. The backend must be driven from
            // another thread, or this never completes.
            gate.wait();
        }
        Ok(request)
    }

    /// Add a block to the graph. The id is assigned here, before the event
    /// runs, so callers can refer to the block immediately.
    pub fn create_block(&self, spec: BlockSpec) -> Result<BlockId> {
        self.create_block_with(spec, SubmitOpts::default())
    }

    pub fn create_block_with(&self, spec: BlockSpec, opts: SubmitOpts) -> Result<BlockId> {
        let id = BlockId(self.shared.next_block_id.fetch_add(1, Ordering::Relaxed));
        self.submit(Box::new(CreateBlockEvent::new(spec, id)), opts)?;
        Ok(id)
    }

    pub fn connect(&self, tail: PortAddr, head: PortAddr) -> Result<RequestId> {
        self.connect_with(tail, head, SubmitOpts::default())
    }

    pub fn connect_with(
        &self,
        tail: PortAddr,
        head: PortAddr,
        opts: SubmitOpts,
    ) -> Result<RequestId> {
        self.submit(Box::new(ConnectEvent::new(tail, head)), opts)
    }

    pub fn disconnect(&self, tail: PortAddr, head: PortAddr) -> Result<RequestId> {
        self.disconnect_with(tail, head, SubmitOpts::default())
    }

    pub fn disconnect_with(
        &self,
        tail: PortAddr,
        head: PortAddr,
        opts: SubmitOpts,
    ) -> Result<RequestId> {
        self.submit(Box::new(DisconnectEvent::new(tail, head)), opts)
    }

    /// Remove every connection touching a block.
    pub fn disconnect_all(&self, block: BlockId) -> Result<RequestId> {
        self.disconnect_all_with(block, SubmitOpts::default())
    }

    pub fn disconnect_all_with(&self, block: BlockId, opts: SubmitOpts) -> Result<RequestId> {
        self.submit(Box::new(DisconnectAllEvent::new(block)), opts)
    }

    /// Remove a block, detaching its connections first.
    pub fn delete_block(&self, block: BlockId) -> Result<RequestId> {
        self.delete_block_with(block, SubmitOpts::default())
    }

    pub fn delete_block_with(&self, block: BlockId, opts: SubmitOpts) -> Result<RequestId> {
        self.submit(Box::new(DeleteBlockEvent::new(block)), opts)
    }

    /// Set a scalar input port's value, applied at the next cycle boundary.
    pub fn set_value(&self, addr: PortAddr, value: f32) -> Result<RequestId> {
        self.set_value_with(addr, value, SubmitOpts::default())
    }

    pub fn set_value_with(
        &self,
        addr: PortAddr,
        value: f32,
        opts: SubmitOpts,
    ) -> Result<RequestId> {
        self.submit(Box::new(SetValueEvent::new(addr, value)), opts)
    }

    pub fn set_polyphony(&self, block: BlockId, poly: usize) -> Result<RequestId> {
        self.set_polyphony_with(block, poly, SubmitOpts::default())
    }

    pub fn set_polyphony_with(
        &self,
        block: BlockId,
        poly: usize,
        opts: SubmitOpts,
    ) -> Result<RequestId> {
        self.submit(Box::new(SetPolyphonyEvent::new(block, poly)), opts)
    }

    /// Enable or bypass a block. A disabled block emits silence.
    pub fn set_enabled(&self, block: BlockId, enabled: bool) -> Result<RequestId> {
        self.set_enabled_with(block, enabled, SubmitOpts::default())
    }

    pub fn set_enabled_with(
        &self,
        block: BlockId,
        enabled: bool,
        opts: SubmitOpts,
    ) -> Result<RequestId> {
        self.submit(Box::new(EnableBlockEvent::new(block, enabled)), opts)
    }

    /// Read a port's current scalar value. Voice zero; safe from any thread.
    pub fn value(&self, addr: PortAddr) -> Result<f32> {
        let block = self
            .shared
            .root
            .block(addr.block)
            .ok_or_else(|| Error::BlockNotFound(addr.block.to_string()))?;
        let port = block
            .ports()
            .get(addr.port as usize)
            .ok_or_else(|| Error::PortNotFound(format!("{}:{}", addr.block, addr.port)))?;
        Ok(port.value())
    }

    /// Prepare for real-time operation: pre-warm the buffer pools, activate
    /// every block already in the graph, and install the initial plan.
    ///
    /// Blocks created after activation are activated by their create event.
    pub fn activate(&self) -> Result<()> {
        if self.shared.activated.load(Ordering::Acquire) {
            return Err(Error::AlreadyActivated);
        }
        let pool = &self.shared.pool;
        let counts = &self.shared.config.pool;
        pool.prewarm(crate::buffer::BufferKind::Control, counts.control);
        pool.prewarm(crate::buffer::BufferKind::Audio, counts.audio);
        pool.prewarm(crate::buffer::BufferKind::Cv, counts.cv);
        pool.prewarm(crate::buffer::BufferKind::Sequence, counts.sequence);

        for block in self.shared.root.blocks() {
            block.activate(
                self.shared.config.sample_rate,
                self.shared.config.max_cycle_frames,
            )?;
        }
        let plan = self.shared.root.compile();
        self.shared.root.install_plan(plan);
        self.shared.activated.store(true, Ordering::Release);
        info!(
            sample_rate = self.shared.config.sample_rate,
            threads = self.shared.config.threads,
            "engine activated"
        );
        Ok(())
    }

    /// Deactivate every block. The backend must no longer be driven when
    /// this is called.
    pub fn deactivate(&self) -> Result<()> {
        if !self.shared.activated.swap(false, Ordering::AcqRel) {
            return Err(Error::NotActivated);
        }
        for block in self.shared.root.blocks() {
            block.deactivate();
        }
        info!("engine deactivated");
        Ok(())
    }
}

/// The real-time side. `process` is the cycle entry point, called from the
/// audio callback (or any steady clock) with the cycle length in frames.
pub struct EngineBackend {
    shared: Arc<EngineShared>,
    clock: Arc<CycleClock>,
    rt: crate::context::RtContext,
    // Declared before `threads`: the executed-event channel must close
    // before the pipeline joins.
    rt_events: RtEventQueue,
    scheduler: Scheduler,
    messages: MessageContext,
    threads: PipelineThreads,
    frame: u64,
}

impl EngineBackend {
    /// Current engine frame time.
    pub fn now(&self) -> u64 {
        self.frame
    }

    /// Run one cycle: execute pending events at the boundary, sweep the
    /// plan across the worker team, flush queued connections, and hand the
    /// message context its new time bound.
    pub fn process(&mut self, frames: usize) {
        let frames = if frames > self.shared.config.max_cycle_frames {
            warn!(
                frames,
                max = self.shared.config.max_cycle_frames,
                "cycle longer than configured maximum, truncating"
            );
            self.shared.config.max_cycle_frames
        } else {
            frames
        };
        self.clock.begin_cycle(self.frame, frames);
        self.rt_events.run_cycle(&mut self.rt);

        if let Some(plan) = self.shared.root.current_plan() {
            self.scheduler.run_cycle(&plan, &mut self.rt);
            let end = self.rt.end();
            for conn in plan.queued() {
                // Audio-domain tails serialize here, where the driver owns
                // their buffers; message-domain tails serialize on the
                // message thread right after they run. A message-domain
                // head gets a run scheduled whenever new items crossed.
                let tail = &conn.tail().block;
                let head = &conn.head().block;
                if tail.domain() == Domain::Audio
                    && conn.enqueue_cycle_output(end)
                    && head.domain() == Domain::Message
                {
                    self.messages.submit_rt(
                        MessageItem {
                            time: end,
                            block: head.clone(),
                        },
                        &self.rt,
                    );
                }
            }
        }
        self.messages.announce_cycle_end(self.rt.end(), &self.rt);
        self.frame += frames as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internals;

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            threads: 2,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_build_and_activate() {
        let (engine, _backend) = EngineBuilder::new()
            .config(quiet_config())
            .build()
            .unwrap();
        engine.activate().unwrap();
        assert!(matches!(engine.activate(), Err(Error::AlreadyActivated)));
        engine.deactivate().unwrap();
        assert!(matches!(engine.deactivate(), Err(Error::NotActivated)));
    }

    #[test]
    fn test_value_roundtrip_through_cycle() {
        let (engine, mut backend) = EngineBuilder::new()
            .config(quiet_config())
            .build()
            .unwrap();
        engine.activate().unwrap();

        let (spec, _seen) = internals::probe_spec("probe");
        let block = engine.create_block(spec).unwrap();
        let gain = engine.create_block(internals::gain_spec("gain")).unwrap();
        engine.set_value(PortAddr::new(gain, 1), 0.5).unwrap();

        backend.process(64);
        // Pump until the submission chain has landed, then read back.
        for _ in 0..100 {
            if (engine.value(PortAddr::new(gain, 1)).unwrap() - 0.5).abs() < f32::EPSILON {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
            backend.process(64);
        }
        assert!((engine.value(PortAddr::new(gain, 1)).unwrap() - 0.5).abs() < f32::EPSILON);
        assert!(engine.value(PortAddr::new(block, 0)).is_ok());
    }

    #[test]
    fn test_unknown_block_value_read() {
        let (engine, _backend) = EngineBuilder::new()
            .config(quiet_config())
            .build()
            .unwrap();
        let missing = PortAddr::new(BlockId(999), 0);
        assert!(matches!(engine.value(missing), Err(Error::BlockNotFound(_))));
    }
}
