//! Test helpers and fixtures for weft integration tests.
//!
//! The engine is driven manually: every test owns the backend and calls
//! `process` itself, so cycle boundaries are deterministic. Event
//! completion is observed through [`CaptureResponder`] instead of timing
//! assumptions.

use std::sync::Arc;
use std::time::{Duration, Instant};
use weft::core::internals;
use weft::prelude::*;
use weft::{Notification, RequestId, Responder};

use parking_lot::Mutex;

/// Cycle length used by most tests. Small, so timed events land quickly.
pub const TEST_CYCLE: usize = 64;

pub fn test_config() -> EngineConfig {
    EngineConfig {
        threads: 2,
        ..EngineConfig::default()
    }
}

/// Records every response and notification the engine sends back.
#[derive(Default)]
pub struct CaptureResponder {
    responses: Mutex<Vec<(RequestId, Result<()>)>>,
    notes: Mutex<Vec<Notification>>,
}

impl CaptureResponder {
    pub fn response(&self, request: RequestId) -> Option<Result<()>> {
        self.responses
            .lock()
            .iter()
            .find(|(r, _)| *r == request)
            .map(|(_, s)| s.clone())
    }

    pub fn responses(&self) -> Vec<(RequestId, Result<()>)> {
        self.responses.lock().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notes.lock().clone()
    }
}

impl Responder for CaptureResponder {
    fn respond(&self, request: RequestId, status: &Result<()>) {
        self.responses.lock().push((request, status.clone()));
    }

    fn notify(&self, note: Notification) {
        self.notes.lock().push(note);
    }
}

/// An activated engine with a capturing responder.
pub fn test_engine() -> (Engine, EngineBackend, Arc<CaptureResponder>) {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
    let responder = Arc::new(CaptureResponder::default());
    let (engine, backend) = EngineBuilder::new()
        .config(test_config())
        .responder(responder.clone())
        .build()
        .expect("engine build failed");
    engine.activate().expect("activation failed");
    (engine, backend, responder)
}

pub fn blocking() -> SubmitOpts {
    SubmitOpts {
        blocking: true,
        ..SubmitOpts::default()
    }
}

/// Run cycles until the condition holds or two seconds pass. The event
/// pipeline's threads are asynchronous, so observable effects may lag the
/// submitting call by a few cycles.
pub fn pump_until(backend: &mut EngineBackend, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if cond() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        backend.process(TEST_CYCLE);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Run cycles until the engine has responded to `request`.
pub fn pump_until_done(
    backend: &mut EngineBackend,
    responder: &CaptureResponder,
    request: RequestId,
) -> Result<()> {
    if !pump_until(backend, || responder.response(request).is_some()) {
        panic!("no response to {request:?} within the deadline");
    }
    responder.response(request).unwrap_or(Err(Error::ShuttingDown))
}

/// Standard fixture: constant -> gain -> probe, fully connected.
pub struct Chain {
    pub constant: BlockId,
    pub gain: BlockId,
    pub probe: BlockId,
    pub seen: Arc<atomic_float::AtomicF32>,
}

pub fn build_chain(
    engine: &Engine,
    backend: &mut EngineBackend,
    responder: &CaptureResponder,
    value: f32,
) -> Chain {
    let constant = engine
        .create_block(internals::constant_spec("const", value))
        .unwrap();
    let gain = engine.create_block(internals::gain_spec("gain")).unwrap();
    let (probe_spec, seen) = internals::probe_spec("probe");
    let probe = engine.create_block(probe_spec).unwrap();

    engine
        .connect(PortAddr::new(constant, 0), PortAddr::new(gain, 0))
        .unwrap();
    let done = engine
        .connect(PortAddr::new(gain, 2), PortAddr::new(probe, 0))
        .unwrap();
    pump_until_done(backend, responder, done).unwrap();
    Chain {
        constant,
        gain,
        probe,
        seen,
    }
}
