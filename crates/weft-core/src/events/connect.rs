//! Connect two ports.

use super::{GraphEvent, PortAddr};
use crate::block::Block;
use crate::connection::{Connection, Endpoint};
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::graph::{CompiledGraph, Graph};
use crate::port::{ArcList, Voices};
use std::sync::Arc;

struct Staged {
    graph: Arc<Graph>,
    head_block: Arc<Block>,
    head_port: u32,
    arcs: Arc<ArcList>,
    voices: Arc<Voices>,
    plan: Arc<CompiledGraph>,
}

pub(crate) struct ConnectEvent {
    tail: PortAddr,
    head: PortAddr,
    staged: Option<Staged>,
    // Displaced state, dropped off the real-time thread with the event.
    old_arcs: Option<Arc<ArcList>>,
    old_voices: Option<Arc<Voices>>,
    old_plan: Option<Arc<CompiledGraph>>,
}

impl ConnectEvent {
    pub(crate) fn new(tail: PortAddr, head: PortAddr) -> Self {
        Self {
            tail,
            head,
            staged: None,
            old_arcs: None,
            old_voices: None,
            old_plan: None,
        }
    }
}

/// Resolve a port address against a graph, validating both halves.
pub(super) fn resolve(graph: &Graph, addr: PortAddr) -> Result<Endpoint> {
    let block = graph
        .block(addr.block)
        .ok_or_else(|| Error::BlockNotFound(addr.block.to_string()))?;
    if addr.port as usize >= block.ports().len() {
        return Err(Error::PortNotFound(format!(
            "{}.{}",
            block.symbol(),
            addr.port
        )));
    }
    Ok(Endpoint {
        block,
        port: addr.port,
    })
}

impl GraphEvent for ConnectEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        let graph = engine.root.clone();
        let tail = resolve(&graph, self.tail)?;
        let head = resolve(&graph, self.head)?;
        graph.validate_connect(&tail, &head)?;

        let head_block = head.block.clone();
        let head_port = head.port;
        let conn = Arc::new(Connection::new(
            tail,
            head,
            engine.config.sequence_capacity,
        ));
        let arcs = graph.with_nodes(|nodes| {
            nodes.add_arc(conn);
            Arc::new(nodes.arcs_into(head_block.id(), head_port))
        });
        // Planned polyphony, so a poly change prepared ahead of this event
        // cannot leave the head bound to arrays it retires.
        let voices = head_block.port(head_port).plan_voices(
            head_block.planned_polyphony(),
            &engine.pool,
            &arcs,
        );
        let plan = graph.compile();
        self.staged = Some(Staged {
            graph,
            head_block,
            head_port,
            arcs,
            voices,
            plan,
        });
        Ok(())
    }

    fn execute(&mut self, _rt: &mut RtContext) {
        if let Some(staged) = self.staged.take() {
            let port = staged.head_block.port(staged.head_port);
            self.old_arcs = Some(port.swap_arcs(staged.arcs));
            self.old_voices = Some(port.swap_voices(staged.voices));
            self.old_plan = staged.graph.install_plan(staged.plan);
            // Remaining Arcs in `staged` are clones of state the graph still
            // owns, so dropping them here only decrements counts.
        }
    }
}
