//! Real-time signal-graph scheduling kernel.
//!
//! A graph of processing blocks, each carrying typed ports, is compiled
//! into an immutable execution plan and swept across a team of real-time
//! worker threads once per cycle. All mutation happens through a
//! three-stage event pipeline whose real-time stage is nothing but pointer
//! swaps; buffers come from pre-warmed lock-free pools, so a running cycle
//! never allocates, frees, or blocks.
//!
//! The pieces:
//!
//! - [`buffer`]: reference-counted typed buffers and the lock-free pools
//!   that recycle them.
//! - [`graph`]: the node set, connection validation, and the compiler that
//!   turns it into an immutable plan.
//! - [`events`]: prepare/execute/finalize graph mutations.
//! - [`engine`]: ties it together behind an [`Engine`] /
//!   [`EngineBackend`] pair.
//!
//! Cross-domain (audio to message) connections queue their tail's output
//! per cycle; a dedicated message thread drains them against a virtual
//! clock that the real-time driver advances at each cycle end.

pub mod block;
pub mod buffer;
pub mod config;
mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod internals;
mod lockfree;
mod messages;
mod mix;
pub mod pipeline;
pub mod port;
mod scheduler;

pub use block::{BlockId, BlockSpec, Domain, Unit, UnitCtor, UnitIo};
pub use buffer::{BufferKind, BufferRef, SeqEvent};
pub use config::{EngineConfig, PoolConfig, MAX_POLYPHONY};
pub use context::Notification;
pub use engine::{Engine, EngineBackend, EngineBuilder};
pub use error::{Error, Result};
pub use events::{EventMode, PortAddr, RequestId, SubmitOpts};
pub use pipeline::{LogResponder, Responder};
pub use port::{Direction, PortSpec};
