//! Buffer mixing for multiply-connected inputs.
//!
//! When an input port has more than one feeding connection, its local buffer
//! is cleared and every source is accumulated into it before the block runs.
//! Kind coercion happens here: a control source feeding a frame-rate input is
//! broadcast across the cycle, a frame-rate source feeding a control input
//! contributes its first frame.

use crate::buffer::{BufferKind, BufferRef, SeqEvent};
use smallvec::SmallVec;

/// Accumulate one source into an already-cleared destination.
fn accumulate(dst: &BufferRef, src: &BufferRef) {
    match dst.kind() {
        BufferKind::Audio | BufferKind::Cv => {
            let out = dst.samples_mut();
            if src.kind().is_frame_rate() {
                let inp = src.samples();
                let n = out.len().min(inp.len());
                for (o, i) in out[..n].iter_mut().zip(&inp[..n]) {
                    *o += *i;
                }
            } else {
                let v = src.control();
                for o in out.iter_mut() {
                    *o += v;
                }
            }
        }
        BufferKind::Control => {
            let v = if src.kind().is_frame_rate() {
                src.samples().first().copied().unwrap_or(0.0)
            } else {
                src.control()
            };
            dst.set_control(dst.control() + v);
        }
        // Sequences merge, they do not sum; handled by mix_into.
        BufferKind::Sequence => {}
    }
}

/// Merge sequence sources into `dst` in time order.
///
/// Stable across sources: items with equal timestamps keep the order of the
/// source list, which itself follows connection establishment order. Never
/// allocates for eight or fewer sources.
fn merge_sequences(dst: &BufferRef, srcs: &[BufferRef]) {
    let mut cursors: SmallVec<[usize; 8]> = SmallVec::from_elem(0, srcs.len());
    loop {
        let mut best: Option<(usize, SeqEvent)> = None;
        for (i, src) in srcs.iter().enumerate() {
            if let Some(ev) = src.events().get(cursors[i]) {
                match best {
                    Some((_, b)) if b.frame <= ev.frame => {}
                    _ => best = Some((i, *ev)),
                }
            }
        }
        let Some((i, ev)) = best else { break };
        cursors[i] += 1;
        if !dst.push_event(ev) {
            // Destination is full; later items would be out of order anyway.
            break;
        }
    }
}

/// Mix `srcs` into `dst`, clearing it first.
pub(crate) fn mix_into(dst: &BufferRef, srcs: &[BufferRef]) {
    dst.clear();
    if dst.kind() == BufferKind::Sequence {
        merge_sequences(dst, srcs);
        return;
    }
    for src in srcs {
        accumulate(dst, src);
    }
    if dst.kind().is_frame_rate() {
        // Keep the scalar view coherent with the frames.
        dst.set_control(dst.samples().first().copied().unwrap_or(0.0));
    }
}
