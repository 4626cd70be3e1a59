//! Remove one connection, or every connection touching a block.

use super::connect::resolve;
use super::{GraphEvent, PortAddr};
use crate::block::{Block, BlockId};
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::{Error, Result};
use crate::graph::{CompiledGraph, Graph};
use crate::port::{ArcList, Voices};
use std::sync::Arc;

/// One input port whose bindings change, with its staged replacements.
pub(super) struct StagedPort {
    pub(super) block: Arc<Block>,
    pub(super) port: u32,
    pub(super) arcs: Arc<ArcList>,
    pub(super) voices: Arc<Voices>,
}

impl StagedPort {
    /// Swap the staged state in, returning what was displaced.
    pub(super) fn install(self) -> (Arc<ArcList>, Arc<Voices>) {
        let port = self.block.port(self.port);
        (port.swap_arcs(self.arcs), port.swap_voices(self.voices))
    }
}

pub(crate) struct DisconnectEvent {
    tail: PortAddr,
    head: PortAddr,
    staged: Option<(Arc<Graph>, StagedPort, Arc<CompiledGraph>)>,
    old: Vec<(Arc<ArcList>, Arc<Voices>)>,
    old_plan: Option<Arc<CompiledGraph>>,
}

impl DisconnectEvent {
    pub(crate) fn new(tail: PortAddr, head: PortAddr) -> Self {
        Self {
            tail,
            head,
            staged: None,
            old: Vec::new(),
            old_plan: None,
        }
    }
}

impl GraphEvent for DisconnectEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        let graph = engine.root.clone();
        let tail = resolve(&graph, self.tail)?;
        let head = resolve(&graph, self.head)?;
        let removed = graph.with_nodes(|nodes| {
            nodes.remove_arc(
                self.tail.block,
                self.tail.port,
                self.head.block,
                self.head.port,
            )
        });
        if removed.is_none() {
            return Err(Error::ConnectionNotFound {
                tail: format!("{}.{}", tail.block.symbol(), tail.port().symbol()),
                head: format!("{}.{}", head.block.symbol(), head.port().symbol()),
            });
        }
        let arcs =
            graph.with_nodes(|nodes| Arc::new(nodes.arcs_into(self.head.block, self.head.port)));
        let voices = head
            .block
            .port(self.head.port)
            .plan_voices(head.block.planned_polyphony(), &engine.pool, &arcs);
        let plan = graph.compile();
        self.staged = Some((
            graph,
            StagedPort {
                block: head.block,
                port: self.head.port,
                arcs,
                voices,
            },
            plan,
        ));
        Ok(())
    }

    fn execute(&mut self, _rt: &mut RtContext) {
        if let Some((graph, staged, plan)) = self.staged.take() {
            self.old.push(staged.install());
            self.old_plan = graph.install_plan(plan);
        }
    }
}

/// Remove every connection touching a block, typically ahead of deletion.
pub(crate) struct DisconnectAllEvent {
    block: BlockId,
    staged: Option<(Arc<Graph>, Vec<StagedPort>, Arc<CompiledGraph>)>,
    old: Vec<(Arc<ArcList>, Arc<Voices>)>,
    old_plan: Option<Arc<CompiledGraph>>,
}

impl DisconnectAllEvent {
    pub(crate) fn new(block: BlockId) -> Self {
        Self {
            block,
            staged: None,
            old: Vec::new(),
            old_plan: None,
        }
    }
}

/// Remove all arcs touching `block` and stage rebuilt bindings for every
/// affected head port, this block's own inputs included. Shared with
/// deletion.
pub(super) fn stage_detach(engine: &EngineShared, block: BlockId) -> Vec<StagedPort> {
    let graph = &engine.root;
    let touching = graph.with_nodes(|nodes| {
        let touching = nodes.arcs_touching(block);
        for arc in &touching {
            nodes.remove_arc(
                arc.tail().block.id(),
                arc.tail().port,
                arc.head().block.id(),
                arc.head().port,
            );
        }
        touching
    });

    let mut heads: Vec<(Arc<Block>, u32)> = Vec::new();
    for arc in &touching {
        let block = arc.head().block.clone();
        let port = arc.head().port;
        if !heads.iter().any(|(b, p)| b.id() == block.id() && *p == port) {
            heads.push((block, port));
        }
    }

    let mut staged = Vec::with_capacity(heads.len());
    for (head_block, head_port) in heads {
        let arcs =
            graph.with_nodes(|nodes| Arc::new(nodes.arcs_into(head_block.id(), head_port)));
        let voices = head_block
            .port(head_port)
            .plan_voices(head_block.planned_polyphony(), &engine.pool, &arcs);
        staged.push(StagedPort {
            block: head_block,
            port: head_port,
            arcs,
            voices,
        });
    }
    staged
}

impl GraphEvent for DisconnectAllEvent {
    fn prepare(&mut self, engine: &EngineShared) -> Result<()> {
        if engine.root.block(self.block).is_none() {
            return Err(Error::BlockNotFound(self.block.to_string()));
        }
        let staged = stage_detach(engine, self.block);
        let plan = engine.root.compile();
        self.staged = Some((engine.root.clone(), staged, plan));
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
}
