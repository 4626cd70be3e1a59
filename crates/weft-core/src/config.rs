//! Engine configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Hard upper bound on per-block polyphony.
pub const MAX_POLYPHONY: u32 = 128;

/// Engine configuration.
///
/// All queue capacities are fixed at build time; the real-time path never
/// grows a queue. Pools are pre-warmed during activation according to
/// [`PoolConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Maximum frames per cycle. The silence buffer and all audio buffers
    /// are sized for this.
    pub max_cycle_frames: usize,
    /// Total real-time threads (driver thread + workers). Minimum 1.
    pub threads: usize,
    /// Capacity of the event submission and prepared queues.
    pub event_queue_size: usize,
    /// Maximum events executed per cycle; the rest wait for the next cycle.
    pub max_events_per_cycle: usize,
    /// Capacity of each per-thread real-time notification ring.
    pub notification_ring_size: usize,
    /// Capacity of the message-context submission ring.
    pub message_queue_size: usize,
    /// Capacity (in events) of sequence buffers and cross-domain rings.
    pub sequence_capacity: usize,
    /// Buffers pre-allocated per kind during activation.
    pub pool: PoolConfig,
}

/// Per-kind pre-warm counts for the buffer pool.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolConfig {
    pub control: usize,
    pub audio: usize,
    pub cv: usize,
    pub sequence: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            control: 32,
            audio: 64,
            cv: 16,
            sequence: 16,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            max_cycle_frames: 1024,
            threads: 2,
            event_queue_size: 256,
            max_events_per_cycle: 64,
            notification_ring_size: 512,
            message_queue_size: 128,
            sequence_capacity: 256,
            pool: PoolConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidConfig("sample_rate must be non-zero".into()));
        }
        if self.max_cycle_frames == 0 {
            return Err(Error::InvalidConfig(
                "max_cycle_frames must be non-zero".into(),
            ));
        }
        if self.threads == 0 {
            return Err(Error::InvalidConfig("threads must be at least 1".into()));
        }
        if self.event_queue_size == 0 || self.max_events_per_cycle == 0 {
            return Err(Error::InvalidConfig(
                "event queue sizes must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
