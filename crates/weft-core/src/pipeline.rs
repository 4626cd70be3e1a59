//! The event pipeline's thread plumbing.
//!
//! Three stations: a pre-processor thread prepares submitted events in
//! arrival order, the real-time thread drains prepared events at each cycle
//! start and executes them, and a post-processor thread finalizes executed
//! events, sends responses, and drains the workers' notification rings.

use crate::context::{Notification, RtContext};
use crate::engine::EngineShared;
use crate::error::Result;
use crate::events::{EventEnvelope, RequestId};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where responses and real-time notifications go. Implemented by whatever
/// control front-end drives the engine.
pub trait Responder: Send + Sync {
    fn respond(&self, request: RequestId, status: &Result<()>);

    /// A value change or similar observation produced inside a cycle.
    fn notify(&self, _note: Notification) {}
}

/// Default responder: errors to the log, successes at debug level.
pub struct LogResponder;

impl Responder for LogResponder {
    fn respond(&self, request: RequestId, status: &Result<()>) {
        match status {
            Ok(()) => debug!(request = request.0, "event ok"),
            Err(e) => info!(request = request.0, "event failed: {e}"),
        }
    }
}

/// Non-real-time submission handle. Cloneable; all clones feed the same
/// pre-processor.
#[derive(Clone)]
pub(crate) struct EventSubmitter {
    tx: Sender<EventEnvelope>,
}

impl EventSubmitter {
    /// Queue an event for preparation. A full queue degrades to a blocking
    /// send with a warning rather than dropping the event.
    pub(crate) fn submit(&self, envelope: EventEnvelope) -> Result<()> {
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(envelope)) => {
                warn!("event submission queue full, blocking");
                self.tx
                    .send(envelope)
                    .map_err(|_| crate::error::Error::ShuttingDown)
            }
            Err(TrySendError::Disconnected(_)) => Err(crate::error::Error::ShuttingDown),
        }
    }
}

/// The real-time station: prepared events in, executed events out.
pub(crate) struct RtEventQueue {
    prepared_rx: Receiver<EventEnvelope>,
    executed_tx: Sender<EventEnvelope>,
    /// Head event whose target time lies beyond the current cycle.
    stash: Option<EventEnvelope>,
    max_per_cycle: usize,
}

impl RtEventQueue {
    /// Drain and execute prepared events for this cycle, in arrival order.
    ///
    /// Events aimed past the cycle window stay stashed; late events are
    /// clamped to the cycle start with a warning; a per-cycle cap bounds
    /// worst-case cost. Blocking submitters are released here.
    pub(crate) fn run_cycle(&mut self, rt: &mut RtContext) {
        let start = rt.start();
        let end = rt.end();
        for _ in 0..self.max_per_cycle {
            let Some(mut envelope) = self
                .stash
                .take()
                .or_else(|| self.prepared_rx.try_recv().ok())
            else {
                break;
            };
            if envelope.time >= end {
                self.stash = Some(envelope);
                break;
            }
            if envelope.time != 0 && envelope.time < start {
                warn!(
                    target_time = envelope.time,
                    cycle_start = start,
                    "event missed its target time, clamping to cycle start"
                );
                envelope.time = start;
            }
            if envelope.status.is_ok() {
                envelope.event.execute(rt);
            }
            envelope.release_gate();
            if self.executed_tx.try_send(envelope).is_err() {
                // Post-processor has fallen far behind; dropping preserves
                // the cycle deadline.
                warn!("executed-event queue full, dropping envelope");
            }
        }
    }
}

pub(crate) struct PipelineThreads {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for PipelineThreads {
    fn drop(&mut self) {
        // Both loops poll the flag on their receive timeout, so the joins
        // complete regardless of which channel ends disconnect first.
        self.running.store(false, Ordering::Release);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn pre_process_loop(
    submit_rx: Receiver<EventEnvelope>,
    prepared_tx: Sender<EventEnvelope>,
    engine: Arc<EngineShared>,
    running: Arc<AtomicBool>,
) {
    loop {
        let mut envelope = match submit_rx.recv_timeout(Duration::from_millis(10)) {
            Ok(envelope) => envelope,
            Err(RecvTimeoutError::Timeout) => {
                if running.load(Ordering::Acquire) {
                    continue;
                }
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        envelope.status = envelope.event.prepare(&engine);
        let gate = envelope.gate.clone();
        if prepared_tx.send(envelope).is_err() {
            break;
        }
        if let Some(gate) = gate {
            // Strict ordering: nothing further is prepared until the
            // real-time thread has executed this event.
            gate.wait();
        }
    }
    debug!("event pre-processor exiting");
}

fn post_process_loop(
    executed_rx: Receiver<EventEnvelope>,
    engine: Arc<EngineShared>,
    responder: Arc<dyn Responder>,
    mut rings: Vec<crate::context::NotificationRx>,
    running: Arc<AtomicBool>,
) {
    loop {
        match executed_rx.recv_timeout(Duration::from_millis(10)) {
            Ok(mut envelope) => {
                envelope.event.finalize(&engine);
                debug!(
                    request = envelope.request.0,
                    mode = ?envelope.mode,
                    "event finalized"
                );
                responder.respond(envelope.request, &envelope.status);
            }
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        for ring in &mut rings {
            ring.drain(|note| responder.notify(note));
        }
    }
    debug!("event post-processor exiting");
}

/// Wire up the pipeline and spawn its two background threads.
pub(crate) fn spawn(
    engine: Arc<EngineShared>,
    responder: Arc<dyn Responder>,
    rings: Vec<crate::context::NotificationRx>,
) -> std::io::Result<(EventSubmitter, RtEventQueue, PipelineThreads)> {
    let queue_size = engine.config.event_queue_size;
    let (submit_tx, submit_rx) = bounded(queue_size);
    let (prepared_tx, prepared_rx) = bounded(queue_size);
    // Sized past the sum of upstream bounds so overflow means the
    // post-processor is badly stalled, not normal backpressure.
    let (executed_tx, executed_rx) = bounded(queue_size * 4);

    let max_per_cycle = engine.config.max_events_per_cycle;
    let running = Arc::new(AtomicBool::new(true));
    let pre_engine = engine.clone();
    let pre_running = running.clone();
    let post_running = running.clone();
    let pre = std::thread::Builder::new()
        .name("weft-pre".into())
        .spawn(move || pre_process_loop(submit_rx, prepared_tx, pre_engine, pre_running))?;
    let post = std::thread::Builder::new()
        .name("weft-post".into())
        .spawn(move || post_process_loop(executed_rx, engine, responder, rings, post_running))?;
    Ok((
        EventSubmitter { tx: submit_tx },
        RtEventQueue {
            prepared_rx,
            executed_tx,
            stash: None,
            max_per_cycle,
        },
        PipelineThreads {
            running,
            handles: vec![pre, post],
        },
    ))
}
