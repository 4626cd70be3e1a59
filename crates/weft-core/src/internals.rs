//! Built-in processing units.
//!
//! Small host-provided blocks: constants, gain, pass-through, and a probe
//! sink. They exercise the same plugin boundary external units go through
//! and double as fixtures in the engine's own tests.

use crate::block::{BlockSpec, Unit, UnitCtor, UnitIo};
use crate::buffer::BufferKind;
use crate::port::PortSpec;
use atomic_float::AtomicF32;
use std::sync::Arc;

/// Writes a fixed value to every output frame.
struct Constant {
    value: f32,
}

impl Unit for Constant {
    fn run(&mut self, io: &mut UnitIo<'_>) {
        for out in io.outputs {
            out.samples_mut().fill(self.value);
            out.set_control(self.value);
        }
    }
}

/// Audio constant source: one audio output, no inputs.
pub fn constant_spec(symbol: impl Into<String>, value: f32) -> BlockSpec {
    let ctor: UnitCtor = Arc::new(move || Ok(Box::new(Constant { value }) as Box<dyn Unit>));
    BlockSpec::new(
        symbol,
        vec![PortSpec::output("out", BufferKind::Audio)],
        ctor,
    )
}

/// Multiplies its audio input by a control gain.
struct Gain;

impl Unit for Gain {
    fn run(&mut self, io: &mut UnitIo<'_>) {
        let (Some(input), Some(gain)) = (io.inputs.first(), io.inputs.get(1)) else {
            return;
        };
        let Some(out) = io.outputs.first() else {
            return;
        };
        let g = gain.control();
        let inp = input.samples();
        let dst = out.samples_mut();
        let n = dst.len().min(inp.len());
        for (o, i) in dst[..n].iter_mut().zip(&inp[..n]) {
            *o = *i * g;
        }
        out.set_control(dst.first().copied().unwrap_or(0.0));
    }
}

/// Gain stage: audio in, control "gain" (default 1.0), audio out.
pub fn gain_spec(symbol: impl Into<String>) -> BlockSpec {
    let ctor: UnitCtor = Arc::new(|| Ok(Box::new(Gain) as Box<dyn Unit>));
    BlockSpec::new(
        symbol,
        vec![
            PortSpec::input("in", BufferKind::Audio),
            PortSpec::input("gain", BufferKind::Control).with_default(1.0),
            PortSpec::output("out", BufferKind::Audio),
        ],
        ctor,
    )
}

/// Copies input frames to the output unchanged.
struct Pass;

impl Unit for Pass {
    fn run(&mut self, io: &mut UnitIo<'_>) {
        if let (Some(input), Some(out)) = (io.inputs.first(), io.outputs.first()) {
            out.copy_from(input);
        }
    }
}

/// Audio pass-through: one input, one output.
pub fn pass_spec(symbol: impl Into<String>) -> BlockSpec {
    let ctor: UnitCtor = Arc::new(|| Ok(Box::new(Pass) as Box<dyn Unit>));
    BlockSpec::new(
        symbol,
        vec![
            PortSpec::input("in", BufferKind::Audio),
            PortSpec::output("out", BufferKind::Audio),
        ],
        ctor,
    )
}

/// Records the last value seen on its control input. Readable from any
/// thread through the shared handle.
struct Probe {
    seen: Arc<AtomicF32>,
}

impl Unit for Probe {
    fn run(&mut self, io: &mut UnitIo<'_>) {
        if let Some(input) = io.inputs.first() {
            self.seen
                .store(input.control(), std::sync::atomic::Ordering::Release);
        }
    }
}

/// Control sink plus a handle to observe what it received.
pub fn probe_spec(symbol: impl Into<String>) -> (BlockSpec, Arc<AtomicF32>) {
    let seen = Arc::new(AtomicF32::new(0.0));
    let handle = seen.clone();
    let ctor: UnitCtor = Arc::new(move || {
        Ok(Box::new(Probe { seen: seen.clone() }) as Box<dyn Unit>)
    });
    (
        BlockSpec::new(
            symbol,
            vec![PortSpec::input("in", BufferKind::Control)],
            ctor,
        ),
        handle,
    )
}
