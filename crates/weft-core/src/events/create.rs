//! Add a block to the graph.

use super::GraphEvent;
use crate::block::{Block, BlockId, BlockSpec};
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::graph::{CompiledGraph, Graph};
use core::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) struct CreateBlockEvent {
    /// Consumed by `prepare`; a spec is not reusable across attempts.
    spec: Option<BlockSpec>,
    id: BlockId,
    staged: Option<(Arc<Graph>, Arc<CompiledGraph>)>,
    old_plan: Option<Arc<CompiledGraph>>,
}

impl CreateBlockEvent {
    /// `id` is allocated by the engine at submission so the caller knows it
    /// immediately; creation itself is asynchronous.
    pub(crate) fn new(spec: BlockSpec, id: BlockId) -> Self {
        Self {
            spec: Some(spec),
            id,
            staged: None,
            old_plan: None,
        }
    }
}

impl GraphEvent for CreateBlockEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        let spec = self
            .spec
            .take()
            .ok_or_else(|| Error::InvalidConfig("block spec already consumed".into()))?;
        let block = Arc::new(Block::new(self.id, &spec, &engine.pool)?);
        if engine.activated.load(Ordering::Acquire) {
            block.activate(engine.config.sample_rate, engine.config.max_cycle_frames)?;
        }
        let graph = engine.root.clone();
        graph.with_nodes(|nodes| nodes.add_block(block));
        let plan = graph.compile();
        self.staged = Some((graph, plan));
        Ok(())
    }

    fn execute(&mut self, _rt: &mut RtContext) {
        if let Some((graph, plan)) = self.staged.take() {
            self.old_plan = graph.install_plan(plan);
        }
    }
}
