//! Polyphony-change integration tests.

use std::sync::atomic::Ordering;
use weft::core::internals;
use weft::prelude::*;
use weft::MAX_POLYPHONY;

use crate::helpers::*;

/// Raising and lowering polyphony mid-stream keeps the chain producing.
///
/// With the gain at four voices fed by a single-voice constant, each gain
/// voice reads the same source; the single-voice probe then collapses all
/// four output voices into its one input, so it sees the sum.
#[test]
fn test_poly_mismatch_replicates_and_collapses() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.2);
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.2).abs() < 1e-6
    }));

    let done = engine.set_polyphony(chain.gain, 4).unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.8).abs() < 1e-5
    }));

    let done = engine.set_polyphony(chain.gain, 1).unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.2).abs() < 1e-5
    }));
}

#[test]
fn test_polyphony_bounds_rejected() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.2);

    let zero = engine.set_polyphony(chain.gain, 0).unwrap();
    assert!(matches!(
        pump_until_done(&mut backend, &responder, zero),
        Err(Error::InvalidPolyphony(0))
    ));

    let over = engine
        .set_polyphony(chain.gain, MAX_POLYPHONY as usize + 1)
        .unwrap();
    assert!(matches!(
        pump_until_done(&mut backend, &responder, over),
        Err(Error::InvalidPolyphony(_))
    ));
}

/// The polyphony change takes effect atomically: values set before the
/// change survive it.
#[test]
fn test_values_survive_polyphony_change() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.2);

    let set = engine.set_value(PortAddr::new(chain.gain, 1), 0.5).unwrap();
    pump_until_done(&mut backend, &responder, set).unwrap();
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.1).abs() < 1e-6
    }));

    let done = engine.set_polyphony(chain.gain, 2).unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();
    // Two voices, each 0.2 * 0.5, collapsed at the probe.
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.2).abs() < 1e-5
    }));
}

/// A connect prepared while a polyphony change is still in flight binds
/// against the buffers that change will install, not the ones it retires.
#[test]
fn test_connect_during_inflight_poly_change() {
    let (engine, mut backend, responder) = test_engine();
    let constant = engine
        .create_block(internals::constant_spec("const", 0.3))
        .unwrap();
    let gain = engine.create_block(internals::gain_spec("gain")).unwrap();
    let (probe_spec, seen) = internals::probe_spec("probe");
    let probe = engine.create_block(probe_spec).unwrap();
    let done = engine
        .connect(PortAddr::new(gain, 2), PortAddr::new(probe, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();

    // Back to back, no cycles in between: the connect is prepared while
    // the polyphony change is queued but not yet executed.
    engine.set_polyphony(constant, 2).unwrap();
    let done = engine
        .connect(PortAddr::new(constant, 0), PortAddr::new(gain, 0))
        .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));
    pump_until_done(&mut backend, &responder, done).unwrap();

    // Both constant voices collapse into the gain's single input.
    assert!(pump_until(&mut backend, || {
        (seen.load(Ordering::Acquire) - 0.6).abs() < 1e-5
    }));
}
