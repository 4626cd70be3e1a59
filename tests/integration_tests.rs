//! Integration tests for the weft engine.
//!
//! All tests drive the backend by hand, one cycle at a time, against the
//! built-in units; no audio hardware is involved. Synchronization with the
//! event pipeline goes through a capturing responder rather than sleeps
//! where possible.
//!
//! Test categories:
//! - Engine: lifecycle, configuration, cleanup
//! - Graph: routing, mixing, silence, structural validation
//! - Events: ordering, timing, blocking submission, deletion
//! - Polyphony: voice changes and mixing across mismatched counts
//! - Messaging: cross-domain queued delivery
//!
//! Run with:
//! ```bash
//! cargo test -p weft --test integration_tests
//! ```

mod helpers;
mod integration;

pub use integration::*;
