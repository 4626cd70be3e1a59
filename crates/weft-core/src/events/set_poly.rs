//! Change a block's polyphony through the two-phase protocol.
//!
//! `prepare` instantiates and activates the new voices and plans every
//! affected buffer binding off the real-time thread; `execute` is nothing
//! but pointer swaps. Downstream inputs fed by the resized block are
//! re-planned here too, since their mix-versus-direct decision depends on
//! the tail's polyphony.

use super::GraphEvent;
use crate::block::{Block, BlockId, PreparedPoly, RetiredPoly};
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::port::{ArcList, Voice, Voices};
use std::sync::Arc;

struct StagedHead {
    block: Arc<Block>,
    port: u32,
    voices: Arc<Voices>,
}

pub(crate) struct SetPolyphonyEvent {
    block: BlockId,
    poly: usize,
    staged: Option<(Arc<Block>, PreparedPoly, Vec<StagedHead>)>,
    /// Clones of the staged per-port arrays, kept so `finalize` can retire
    /// exactly this staging and no newer one.
    staged_ports: Vec<Arc<Voices>>,
    retired: Option<RetiredPoly>,
    old_voices: Vec<Arc<Voices>>,
}

impl SetPolyphonyEvent {
    pub(crate) fn new(block: BlockId, poly: usize) -> Self {
        Self {
            block,
            poly,
            staged: None,
            staged_ports: Vec::new(),
            retired: None,
            old_voices: Vec::new(),
        }
    }
}

impl GraphEvent for SetPolyphonyEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        let graph = &engine.root;
        let block = graph
            .block(self.block)
            .ok_or_else(|| Error::BlockNotFound(self.block.to_string()))?;
        let prepared = block.prepare_poly(
            self.poly,
            engine.config.sample_rate,
            engine.config.max_cycle_frames,
            &engine.pool,
        )?;
        self.staged_ports = prepared.voices().to_vec();

        // Re-plan downstream heads fed by this block's outputs. When the
        // head stays direct-connected after the change it must bind the
        // staged buffers, which are not yet visible through the tail port.
        let downstream: Vec<Arc<crate::connection::Connection>> = graph.with_nodes(|nodes| {
            nodes
                .arcs_touching(self.block)
                .into_iter()
                .filter(|a| a.tail().block.id() == self.block && !a.must_queue())
                .collect()
        });
        let mut heads = Vec::new();
        for arc in downstream {
            let head_block = arc.head().block.clone();
            let head_port_idx = arc.head().port;
            if heads
                .iter()
                .any(|h: &StagedHead| h.block.id() == head_block.id() && h.port == head_port_idx)
            {
                continue;
            }
            let head_port = head_block.port(head_port_idx);
            let head_poly = head_block.planned_polyphony();
            let head_arcs: ArcList = graph
                .with_nodes(|nodes| nodes.arcs_into(head_block.id(), head_port_idx))
                .iter()
                .filter(|a| !a.must_queue())
                .cloned()
                .collect();
            let direct = head_arcs.len() == 1
                && arc.tail().port().kind() == head_port.kind()
                && prepared.poly() == head_poly;
            let voices = if direct {
                let planned = prepared.port_voices(arc.tail().port as usize);
                let bound: Vec<Voice> = (0..head_poly)
                    .map(|v| Voice {
                        buffer: planned[v % planned.len()].buffer.clone(),
                    })
                    .collect();
                Arc::new(bound.into_boxed_slice())
            } else {
                head_port.plan_local_voices(head_poly, &engine.pool)
            };
            heads.push(StagedHead {
                block: head_block,
                port: head_port_idx,
                voices,
            });
        }

        self.staged = Some((block, prepared, heads));
        Ok(())
    }

    fn execute(&mut self, _rt: &mut RtContext) {
        if let Some((block, prepared, heads)) = self.staged.take() {
            // Tail first: its new voice arrays must be live before any
            // direct-bound head is swapped to reference them.
            self.retired = Some(block.apply_poly(prepared));
            for head in heads {
                self.old_voices
                    .push(head.block.port(head.port).swap_voices(head.voices));
            }
        }
    }

    fn finalize(&mut self, engine: &EngineShared) {
        // The staging is installed by now; clear it so preparation falls
        // back to the live arrays, unless a later change re-staged.
        if let Some(block) = engine.root.block(self.block) {
            block.clear_staged(self.poly, &self.staged_ports);
        }
    }
}
