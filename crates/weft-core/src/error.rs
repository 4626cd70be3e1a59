//! Error types for weft-core.

use crate::buffer::BufferKind;
use thiserror::Error;

/// Error type for weft-core operations.
///
/// Structural errors are reported synchronously, before any graph mutation.
/// Real-time failures are never surfaced through this type; the real-time
/// path only logs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Port type mismatch: {tail} ({tail_kind:?}) -> {head} ({head_kind:?})")]
    TypeMismatch {
        tail: String,
        tail_kind: BufferKind,
        head: String,
        head_kind: BufferKind,
    },

    #[error("Connection {tail} -> {head} would create a cycle")]
    WouldCycle { tail: String, head: String },

    #[error("Cannot connect {0} to itself")]
    SelfConnection(String),

    #[error("Connection {tail} -> {head} already exists")]
    DuplicateConnection { tail: String, head: String },

    #[error("Connection must go output -> input: {tail} -> {head}")]
    BadDirection { tail: String, head: String },

    #[error("No such block: {0}")]
    BlockNotFound(String),

    #[error("No such port: {0}")]
    PortNotFound(String),

    #[error("No such connection: {tail} -> {head}")]
    ConnectionNotFound { tail: String, head: String },

    #[error("Block {0} is still connected")]
    BlockStillConnected(String),

    #[error("Invalid polyphony: {0} (must be 1..={max})", max = crate::config::MAX_POLYPHONY)]
    InvalidPolyphony(u32),

    #[error("Port {0} does not accept set-value (frame-rate or sequence kind)")]
    PortNotSettable(String),

    #[error("Unit failed to instantiate: {0}")]
    UnitInstantiation(String),

    #[error("Unit failed to activate: {0}")]
    UnitActivation(String),

    #[error("Engine is not activated")]
    NotActivated,

    #[error("Engine is already activated")]
    AlreadyActivated,

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Failed to spawn engine thread: {0}")]
    ThreadSpawn(String),

    #[error("Message context re-entered from within itself")]
    MessageReentry,
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SelfConnection("osc/out".into());
        assert_eq!(err.to_string(), "Cannot connect osc/out to itself");

        let err = Error::TypeMismatch {
            tail: "osc/out".into(),
            tail_kind: BufferKind::Audio,
            head: "seq/in".into(),
            head_kind: BufferKind::Sequence,
        };
        assert!(err.to_string().contains("osc/out"));
        assert!(err.to_string().contains("Sequence"));
    }
}
