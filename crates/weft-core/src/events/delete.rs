//! Remove a block from the graph.
//!
//! Deletion detaches every connection touching the block first, then unlinks
//! it from the node set; the block itself is deactivated and dropped in
//! `finalize`, once no in-flight cycle can still reach it.

use super::disconnect::{stage_detach, StagedPort};
use super::GraphEvent;
use crate::block::{Block, BlockId};
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::graph::{CompiledGraph, Graph};
use crate::port::{ArcList, Voices};
use std::sync::Arc;

pub(crate) struct DeleteBlockEvent {
    block: BlockId,
    staged: Option<(Arc<Graph>, Vec<StagedPort>, Arc<CompiledGraph>)>,
    removed: Option<Arc<Block>>,
    old: Vec<(Arc<ArcList>, Arc<Voices>)>,
    old_plan: Option<Arc<CompiledGraph>>,
}

impl DeleteBlockEvent {
    pub(crate) fn new(block: BlockId) -> Self {
        Self {
            block,
            staged: None,
            removed: None,
            old: Vec::new(),
            old_plan: None,
        }
    }
}

impl GraphEvent for DeleteBlockEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        let graph = engine.root.clone();
        if graph.block(self.block).is_none() {
            return Err(Error::BlockNotFound(self.block.to_string()));
        }
        let staged_ports = stage_detach(engine, self.block);
        self.removed = Some(graph.with_nodes(|nodes| nodes.remove_block(self.block))?);
        let plan = graph.compile();
        self.staged = Some((graph, staged_ports, plan));
        Ok(())
    }

    fn execute(&mut self, _rt: &mut RtContext) {
        if let Some((graph, staged, plan)) = self.staged.take() {
            for port in staged {
                self.old.push(port.install());
            }
            self.old_plan = graph.install_plan(plan);
        }
    }

    fn finalize(&mut self, _engine: &EngineShared) {
        // The plan that referenced this block was displaced in execute; the
        // cycle that installed the new plan has finished by the time the
        // post-processor runs us, so the units can be torn down.
        if let Some(block) = self.removed.take() {
            block.deactivate();
        }
    }
}
