//! Set a port's value at a cycle boundary.

use super::connect::resolve;
use super::{GraphEvent, PortAddr};
use crate::block::Block;
use crate::buffer::BufferKind;
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use std::sync::Arc;

pub(crate) struct SetValueEvent {
    addr: PortAddr,
    value: f32,
    staged: Option<Arc<Block>>,
}

impl SetValueEvent {
    pub(crate) fn new(addr: PortAddr, value: f32) -> Self {
        Self {
            addr,
            value,
            staged: None,
        }
    }
}

impl GraphEvent for SetValueEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        let endpoint = resolve(&engine.root, self.addr)?;
        let port = endpoint.port();
        // Audio and sequence contents come from the graph, not from
        // set-value; Cv accepts a value broadcast across the cycle.
        if matches!(port.kind(), BufferKind::Audio | BufferKind::Sequence) {
            return Err(Error::PortNotSettable(format!(
                "{}.{}",
                endpoint.block.symbol(),
                port.symbol()
            )));
        }
        self.staged = Some(endpoint.block);
        Ok(())
    }

    fn execute(&mut self, _rt: &mut RtContext) {
        if let Some(block) = &self.staged {
            // Armed here, applied by the owning block's pre-run later this
            // same cycle. Latest submission wins.
            block.port(self.addr.port).request_value(self.value);
        }
    }
}
