//! Graph mutation events.
//!
//! Every change a client can make travels through here as a value-typed
//! event with a three-stage lifecycle: `prepare` off the real-time thread
//! (lookups, allocation, validation, staging), `execute` on the real-time
//! thread at a cycle boundary (pointer swaps only), and `finalize` off the
//! real-time thread again (responses, deferred disposal). Execute happens
//! only after a successful prepare; finalize only after execute.

mod connect;
mod create;
mod delete;
mod disconnect;
mod enable;
mod set_poly;
mod set_value;

pub(crate) use connect::ConnectEvent;
pub(crate) use create::CreateBlockEvent;
pub(crate) use delete::DeleteBlockEvent;
pub(crate) use disconnect::{DisconnectAllEvent, DisconnectEvent};
pub(crate) use enable::EnableBlockEvent;
pub(crate) use set_poly::SetPolyphonyEvent;
pub(crate) use set_value::SetValueEvent;

use crate::block::BlockId;
use crate::context::RtContext;
use crate::engine::EngineShared;
use crate::error::Result;
use crate::lockfree::Semaphore;
use std::sync::Arc;

/// Address of a port: a block plus a port index on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortAddr {
    pub block: BlockId,
    pub port: u32,
}

impl PortAddr {
    pub fn new(block: BlockId, port: u32) -> Self {
        Self { block, port }
    }
}

/// Client-chosen identity tying responses back to requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RequestId(pub u64);

/// How the event participates in edit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventMode {
    #[default]
    Normal,
    Undo,
    Redo,
}

/// Per-submission options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOpts {
    /// Target frame time. `None` means "as soon as possible" (next cycle).
    pub time: Option<u64>,
    /// Pause event preparation until the real-time thread has executed this
    /// event. Guarantees strict ordering relative to the caller.
    pub blocking: bool,
    pub mode: EventMode,
}

/// A mutation's three-stage lifecycle. Implementations keep their staged
/// state in their own fields; whatever `execute` displaces is likewise
/// stashed there, so it is dropped off the real-time thread when the event
/// itself is destroyed after `finalize`.
pub(crate) trait GraphEvent: Send {
    /// Off the real-time thread: validate and stage. An `Err` here means
    /// `execute` will be skipped and the error reported to the requester.
    fn prepare(&mut self, engine: &EngineShared) -> Result<()>;

    /// On the real-time thread at a cycle boundary: atomic swaps only. Must
    /// not allocate, free, lock, or fail.
    fn execute(&mut self, rt: &mut RtContext);

    /// Off the real-time thread, after execution.
    fn finalize(&mut self, _engine: &EngineShared) {}
}

/// An event plus its routing metadata, moving through the pipeline.
pub(crate) struct EventEnvelope {
    pub(crate) event: Box<dyn GraphEvent>,
    /// Target frame time.
    pub(crate) time: u64,
    pub(crate) request: RequestId,
    pub(crate) mode: EventMode,
    pub(crate) blocking: bool,
    /// Posted twice by the real-time thread once the event has executed:
    /// once for the submitting caller, once for the pre-processor, both of
    /// which wait on it for blocking submissions.
    pub(crate) gate: Option<Arc<Semaphore>>,
    /// Outcome of `prepare`. Execution is skipped unless `Ok`.
    pub(crate) status: Result<()>,
}

impl EventEnvelope {
    pub(crate) fn new(
        event: Box<dyn GraphEvent>,
        request: RequestId,
        opts: SubmitOpts,
    ) -> Self {
        let gate = opts.blocking.then(|| Arc::new(Semaphore::new(0)));
        Self {
            event,
            time: opts.time.unwrap_or(0),
            request,
            mode: opts.mode,
            blocking: opts.blocking,
            gate,
            status: Ok(()),
        }
    }

    /// Release both waiters on a blocking submission: the submitting caller
    /// and the pre-processor.
    pub(crate) fn release_gate(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.post();
            gate.post();
        }
    }
}

impl Drop for EventEnvelope {
    fn drop(&mut self) {
        // An envelope destroyed before reaching the real-time thread (a
        // shutdown path) must still release its blocked waiters.
        self.release_gate();
    }
}
