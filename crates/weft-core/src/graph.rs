//! The live graph and its compiled execution plans.
//!
//! The node set is owned by the pre-process side and mutated only under its
//! lock; the real-time side sees nothing but immutable [`CompiledGraph`]
//! snapshots, installed with an atomic swap and retired through deferred
//! reclamation once no cycle can still be reading them.

use crate::block::{Block, BlockId, Domain};
use crate::connection::{Connection, Endpoint};
use crate::error::{Error, Result};
use arc_swap::ArcSwapOption;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One node of a compiled plan: the block plus the dependency bookkeeping
/// the scheduler needs.
pub(crate) struct CompiledEntry {
    block: Arc<Block>,
    /// Number of distinct in-plan blocks feeding this one.
    providers: u32,
    /// Plan indexes of the blocks this one feeds.
    successors: Box<[u32]>,
    /// Single-winner claim for this cycle.
    claim: AtomicBool,
    /// Provider-completion signals received this cycle.
    ready: AtomicU32,
}

impl CompiledEntry {
    #[inline]
    pub(crate) fn block(&self) -> &Arc<Block> {
        &self.block
    }

    #[inline]
    pub(crate) fn successors(&self) -> &[u32] {
        &self.successors
    }

    /// Attempt to become this entry's single executor. Succeeds only when
    /// every provider has signaled; readiness never regresses within a
    /// cycle, so a successful claim implies the node is runnable at once.
    #[inline]
    pub(crate) fn try_claim(&self) -> bool {
        self.ready.load(Ordering::Acquire) >= self.providers
            && self
                .claim
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Record one provider completion.
    #[inline]
    pub(crate) fn signal_ready(&self) {
        self.ready.fetch_add(1, Ordering::AcqRel);
    }

    fn reset(&self) {
        self.claim.store(false, Ordering::Relaxed);
        self.ready.store(0, Ordering::Relaxed);
    }
}

/// Immutable execution plan: blocks in provider-before-dependent order plus
/// the cross-domain connections to drain at end of cycle.
pub(crate) struct CompiledGraph {
    entries: Box<[CompiledEntry]>,
    queued: Box<[Arc<Connection>]>,
}

impl CompiledGraph {
    #[inline]
    pub(crate) fn entries(&self) -> &[CompiledEntry] {
        &self.entries
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn queued(&self) -> &[Arc<Connection>] {
        &self.queued
    }

    /// Clear per-cycle scheduling state. Driver thread, before the whip.
    pub(crate) fn reset(&self) {
        for entry in self.entries.iter() {
            entry.reset();
        }
    }
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("nodes", &self.entries.len())
            .field("queued", &self.queued.len())
            .finish()
    }
}

/// Mutable node and edge sets, pre-process-side only.
pub(crate) struct GraphNodes {
    /// Registration order; compilation tie-breaks key off this.
    blocks: Vec<Arc<Block>>,
    arcs: Vec<Arc<Connection>>,
}

impl GraphNodes {
    pub(crate) fn find(&self, id: BlockId) -> Option<&Arc<Block>> {
        self.blocks.iter().find(|b| b.id() == id)
    }

    pub(crate) fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub(crate) fn add_block(&mut self, block: Arc<Block>) {
        self.blocks.push(block);
    }

    /// Unlink a block. Refused while any connection still touches it.
    pub(crate) fn remove_block(&mut self, id: BlockId) -> Result<Arc<Block>> {
        let touching = self.arcs.iter().any(|a| {
            a.tail().block.id() == id || a.head().block.id() == id
        });
        let pos = self
            .blocks
            .iter()
            .position(|b| b.id() == id)
            .ok_or_else(|| Error::BlockNotFound(id.to_string()))?;
        if touching {
            return Err(Error::BlockStillConnected(self.blocks[pos].symbol().into()));
        }
        Ok(self.blocks.remove(pos))
    }

    pub(crate) fn arcs(&self) -> &[Arc<Connection>] {
        &self.arcs
    }

    pub(crate) fn add_arc(&mut self, arc: Arc<Connection>) {
        self.arcs.push(arc);
    }

    pub(crate) fn remove_arc(
        &mut self,
        tail_block: BlockId,
        tail_port: u32,
        head_block: BlockId,
        head_port: u32,
    ) -> Option<Arc<Connection>> {
        let pos = self
            .arcs
            .iter()
            .position(|a| a.matches(tail_block, tail_port, head_block, head_port))?;
        Some(self.arcs.remove(pos))
    }

    /// Arcs whose head is the given port, establishment order.
    pub(crate) fn arcs_into(&self, block: BlockId, port: u32) -> Vec<Arc<Connection>> {
        self.arcs
            .iter()
            .filter(|a| a.head().block.id() == block && a.head().port == port)
            .cloned()
            .collect()
    }

    /// All arcs touching any port of the block.
    pub(crate) fn arcs_touching(&self, block: BlockId) -> Vec<Arc<Connection>> {
        self.arcs
            .iter()
            .filter(|a| a.tail().block.id() == block || a.head().block.id() == block)
            .cloned()
            .collect()
    }

    /// Whether adding tail -> head would close a same-domain cycle. Queued
    /// connections break cycles by construction.
    pub(crate) fn would_cycle(&self, tail: BlockId, head: BlockId) -> bool {
        // Follow existing non-queued edges from head; a path back to tail
        // plus the new edge is a cycle.
        let mut stack = vec![head];
        let mut seen = Vec::new();
        while let Some(id) = stack.pop() {
            if id == tail {
                return true;
            }
            if seen.contains(&id) {
                continue;
            }
            seen.push(id);
            for arc in &self.arcs {
                if !arc.must_queue() && arc.tail().block.id() == id {
                    stack.push(arc.head().block.id());
                }
            }
        }
        false
    }
}

pub struct Graph {
    nodes: Mutex<GraphNodes>,
    plan: ArcSwapOption<CompiledGraph>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(GraphNodes {
                blocks: Vec::new(),
                arcs: Vec::new(),
            }),
            plan: ArcSwapOption::empty(),
        }
    }

    /// Run `f` with exclusive access to the node set. Pre-process side only;
    /// never called with a real-time context in scope.
    pub(crate) fn with_nodes<R>(&self, f: impl FnOnce(&mut GraphNodes) -> R) -> R {
        f(&mut self.nodes.lock())
    }

    pub fn block(&self, id: BlockId) -> Option<Arc<Block>> {
        self.nodes.lock().find(id).cloned()
    }

    /// Snapshot of the block list in registration order.
    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.nodes.lock().blocks.clone()
    }

    pub(crate) fn current_plan(&self) -> Option<Arc<CompiledGraph>> {
        self.plan.load_full()
    }

    /// Install a freshly compiled plan; the previous one is returned for
    /// deferred disposal once the installing event finalizes.
    pub(crate) fn install_plan(
        &self,
        plan: Arc<CompiledGraph>,
    ) -> Option<Arc<CompiledGraph>> {
        self.plan.swap(Some(plan))
    }

    /// Validate a connection request without mutating anything. All §-level
    /// structural failures surface here, before any state change.
    pub(crate) fn validate_connect(
        &self,
        tail: &Endpoint,
        head: &Endpoint,
    ) -> Result<()> {
        use crate::buffer::BufferKind;
        use crate::port::Direction;

        let tail_path = format!("{}.{}", tail.block.symbol(), tail.port().symbol());
        let head_path = format!("{}.{}", head.block.symbol(), head.port().symbol());

        if tail.port().direction() != Direction::Output
            || head.port().direction() != Direction::Input
        {
            return Err(Error::BadDirection {
                tail: tail_path,
                head: head_path,
            });
        }
        if tail.block.id() == head.block.id() {
            return Err(Error::SelfConnection(tail.block.symbol().into()));
        }
        // Frame-rate and scalar kinds coerce at mix time; sequences only
        // carry to sequences.
        let seq_tail = tail.port().kind() == BufferKind::Sequence;
        let seq_head = head.port().kind() == BufferKind::Sequence;
        if seq_tail != seq_head {
            return Err(Error::TypeMismatch {
                tail: tail_path,
                tail_kind: tail.port().kind(),
                head: head_path,
                head_kind: head.port().kind(),
            });
        }

        let nodes = self.nodes.lock();
        if nodes
            .arcs
            .iter()
            .any(|a| a.matches(tail.block.id(), tail.port, head.block.id(), head.port))
        {
            return Err(Error::DuplicateConnection {
                tail: tail_path,
                head: head_path,
            });
        }
        let crosses = tail.block.domain() != head.block.domain();
        if !crosses && nodes.would_cycle(tail.block.id(), head.block.id()) {
            return Err(Error::WouldCycle {
                tail: tail_path,
                head: head_path,
            });
        }
        Ok(())
    }

    /// Compile the current node set into an immutable plan.
    ///
    /// Depth-first from the sinks, visiting each node's providers before the
    /// node itself; ties and leftovers (disconnected remnants) follow block
    /// registration order, so identical graphs always compile identically.
    /// Message-domain blocks are excluded; they run on the message thread.
    /// Queued connections are gathered recursively, nested subgraphs
    /// included, for end-of-cycle draining by the driver.
    pub(crate) fn compile(&self) -> Arc<CompiledGraph> {
        let nodes = self.nodes.lock();

        let audio: Vec<&Arc<Block>> = nodes
            .blocks
            .iter()
            .filter(|b| b.domain() == Domain::Audio)
            .collect();
        let index: HashMap<BlockId, usize> = audio
            .iter()
            .enumerate()
            .map(|(i, b)| (b.id(), i))
            .collect();

        // Distinct providers and dependents per node, edge-establishment
        // order preserved.
        let mut providers: Vec<Vec<usize>> = vec![Vec::new(); audio.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); audio.len()];
        for arc in &nodes.arcs {
            if arc.must_queue() {
                continue;
            }
            let (Some(&t), Some(&h)) = (
                index.get(&arc.tail().block.id()),
                index.get(&arc.head().block.id()),
            ) else {
                continue;
            };
            if !providers[h].contains(&t) {
                providers[h].push(t);
                dependents[t].push(h);
            }
        }

        let mut visited = vec![false; audio.len()];
        let mut order: Vec<usize> = Vec::with_capacity(audio.len());
        fn visit(
            i: usize,
            providers: &[Vec<usize>],
            visited: &mut [bool],
            order: &mut Vec<usize>,
        ) {
            if visited[i] {
                return;
            }
            visited[i] = true;
            for &p in &providers[i] {
                visit(p, providers, visited, order);
            }
            order.push(i);
        }
        // Sinks first, in registration order.
        for i in 0..audio.len() {
            if dependents[i].is_empty() {
                visit(i, &providers, &mut visited, &mut order);
            }
        }
        // Disconnected or cyclic remnants, same stable order.
        for i in 0..audio.len() {
            visit(i, &providers, &mut visited, &mut order);
        }

        // Map original indexes to plan positions for successor lists.
        let mut position = vec![0u32; audio.len()];
        for (pos, &i) in order.iter().enumerate() {
            position[i] = pos as u32;
        }
        let entries: Box<[CompiledEntry]> = order
            .iter()
            .map(|&i| CompiledEntry {
                block: audio[i].clone(),
                providers: providers[i].len() as u32,
                successors: dependents[i].iter().map(|&d| position[d]).collect(),
                claim: AtomicBool::new(false),
                ready: AtomicU32::new(0),
            })
            .collect();

        let mut queued = Vec::new();
        Self::gather_queued(&nodes, &mut queued);
        drop(nodes);

        Arc::new(CompiledGraph {
            entries,
            queued: queued.into_boxed_slice(),
        })
    }

    fn gather_queued(nodes: &GraphNodes, out: &mut Vec<Arc<Connection>>) {
        for arc in &nodes.arcs {
            if arc.must_queue() {
                out.push(arc.clone());
            }
        }
        for block in &nodes.blocks {
            if let Some(sub) = block.subgraph() {
                let sub_nodes = sub.nodes.lock();
                Self::gather_queued(&sub_nodes, out);
            }
        }
    }

    /// Execute this graph's plan serially in compiled order. Used when the
    /// graph is nested as a block inside a parent plan; the claiming worker
    /// carries the real-time guarantee.
    pub(crate) fn run_inline(&self, frames: usize, start: u64, sample_rate: u32) {
        let Some(plan) = self.plan.load_full() else {
            return;
        };
        for entry in plan.entries() {
            entry.block().run_local(frames, start, sample_rate);
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.nodes.lock();
        f.debug_struct("Graph")
            .field("blocks", &nodes.blocks.len())
            .field("arcs", &nodes.arcs.len())
            .finish()
    }
}
