pub mod engine;
pub mod events;
pub mod graph;
pub mod messaging;
pub mod polyphony;
