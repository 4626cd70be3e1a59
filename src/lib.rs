//! # Weft - Real-time Signal-Graph Engine
//!
//! Umbrella crate over the scheduling kernel.
//!
//! ## Architecture
//!
//! Weft coordinates:
//! - **weft-core** - Graph scheduling and real-time execution (buffer
//!   pools, plan compiler, parallel scheduler, event pipeline, message
//!   context)
//!
//! ## Quick Start
//!
//! ```ignore
//! use weft::prelude::*;
//!
//! let (engine, mut backend) = EngineBuilder::new().build()?;
//!
//! // Build the graph through events.
//! let osc = engine.create_block(my_osc_spec())?;
//! let out = engine.create_block(my_out_spec())?;
//! engine.connect(PortAddr::new(osc, 0), PortAddr::new(out, 0))?;
//! engine.activate()?;
//!
//! // Drive cycles from the audio callback.
//! backend.process(256);
//! ```

/// Re-export of weft-core for direct access
pub use weft_core as core;

pub use weft_core::{
    // Lock-free buffers
    BufferKind,
    BufferRef,
    SeqEvent,

    // Graph building
    BlockId,
    BlockSpec,
    Direction,
    Domain,
    PortSpec,
    Unit,
    UnitCtor,
    UnitIo,

    // Engine
    Engine,
    EngineBackend,
    EngineBuilder,
    EngineConfig,
    PoolConfig,
    MAX_POLYPHONY,

    // Events and responses
    EventMode,
    LogResponder,
    Notification,
    PortAddr,
    RequestId,
    Responder,
    SubmitOpts,

    // Errors
    Error,
    Result,
};

/// Common imports for typical use.
pub mod prelude {
    pub use weft_core::{
        BlockId, BlockSpec, BufferKind, BufferRef, Domain, Engine, EngineBackend,
        EngineBuilder, EngineConfig, Error, PortAddr, PortSpec, Result, SubmitOpts, Unit,
        UnitIo,
    };
}
