//! Enable or disable a block.

use super::GraphEvent;
use crate::block::{Block, BlockId};
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use std::sync::Arc;

pub(crate) struct EnableBlockEvent {
    block: BlockId,
    enabled: bool,
    staged: Option<Arc<Block>>,
}

impl EnableBlockEvent {
    pub(crate) fn new(block: BlockId, enabled: bool) -> Self {
        Self {
            block,
            enabled,
            staged: None,
        }
    }
}

impl GraphEvent for EnableBlockEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        self.staged = Some(
            engine
                .root
                .block(self.block)
                .ok_or_else(|| Error::BlockNotFound(self.block.to_string()))?,
        );
        Ok(())
    }

    fn execute(&mut self, _rt: &mut RtContext) {
        if let Some(block) = &self.staged {
            block.set_enabled(self.enabled);
        }
    }
}
