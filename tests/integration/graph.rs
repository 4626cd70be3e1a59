//! Graph routing and signal-flow integration tests.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use weft::prelude::*;
use weft::core::internals;

use crate::helpers::*;

#[test]
fn test_signal_flows_through_chain() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.8);

    let done = engine.set_value(PortAddr::new(chain.gain, 1), 0.5).unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();

    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.4).abs() < 1e-6
    }));
}

/// Disconnecting the source rebinds the gain's input to shared silence.
#[test]
fn test_disconnect_restores_silence() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.8);
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.8).abs() < 1e-6
    }));

    let done = engine
        .disconnect(PortAddr::new(chain.constant, 0), PortAddr::new(chain.gain, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();

    assert!(pump_until(&mut backend, || {
        chain.seen.load(Ordering::Acquire).abs() < 1e-6
    }));
}

/// Two sources into one input sum.
#[test]
fn test_mixing_sums_sources() {
    let (engine, mut backend, responder) = test_engine();
    let a = engine
        .create_block(internals::constant_spec("a", 0.3))
        .unwrap();
    let b = engine
        .create_block(internals::constant_spec("b", 0.5))
        .unwrap();
    let gain = engine.create_block(internals::gain_spec("gain")).unwrap();
    let (probe_spec, seen) = internals::probe_spec("probe");
    let probe = engine.create_block(probe_spec).unwrap();

    engine
        .connect(PortAddr::new(a, 0), PortAddr::new(gain, 0))
        .unwrap();
    engine
        .connect(PortAddr::new(b, 0), PortAddr::new(gain, 0))
        .unwrap();
    let done = engine
        .connect(PortAddr::new(gain, 2), PortAddr::new(probe, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();

    assert!(pump_until(&mut backend, || {
        (seen.load(Ordering::Acquire) - 0.8).abs() < 1e-6
    }));
}

#[test]
fn test_duplicate_connection_rejected() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.1);

    let dup = engine
        .connect(PortAddr::new(chain.constant, 0), PortAddr::new(chain.gain, 0))
        .unwrap();
    let status = pump_until_done(&mut backend, &responder, dup);
    assert!(matches!(status, Err(Error::DuplicateConnection { .. })));
}

#[test]
fn test_cycle_rejected() {
    let (engine, mut backend, responder) = test_engine();
    let a = engine.create_block(internals::pass_spec("a")).unwrap();
    let b = engine.create_block(internals::pass_spec("b")).unwrap();

    let first = engine
        .connect(PortAddr::new(a, 1), PortAddr::new(b, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, first).unwrap();

    let back = engine
        .connect(PortAddr::new(b, 1), PortAddr::new(a, 0))
        .unwrap();
    let status = pump_until_done(&mut backend, &responder, back);
    assert!(matches!(status, Err(Error::WouldCycle { .. })));
}

#[test]
fn test_self_connection_rejected() {
    let (engine, mut backend, responder) = test_engine();
    let a = engine.create_block(internals::pass_spec("a")).unwrap();

    let request = engine
        .connect(PortAddr::new(a, 1), PortAddr::new(a, 0))
        .unwrap();
    let status = pump_until_done(&mut backend, &responder, request);
    assert!(matches!(status, Err(Error::SelfConnection(_))));
}

#[test]
fn test_bad_direction_rejected() {
    let (engine, mut backend, responder) = test_engine();
    let a = engine.create_block(internals::pass_spec("a")).unwrap();
    let b = engine.create_block(internals::pass_spec("b")).unwrap();

    // Input as tail.
    let request = engine
        .connect(PortAddr::new(a, 0), PortAddr::new(b, 0))
        .unwrap();
    let status = pump_until_done(&mut backend, &responder, request);
    assert!(matches!(status, Err(Error::BadDirection { .. })));
}

struct Inert;

impl Unit for Inert {
    fn run(&mut self, _io: &mut UnitIo<'_>) {}
}

/// Sequence ports only connect to sequence ports.
#[test]
fn test_sequence_type_mismatch_rejected() {
    let (engine, mut backend, responder) = test_engine();
    let a = engine
        .create_block(internals::constant_spec("a", 1.0))
        .unwrap();

    let ctor: weft::UnitCtor = Arc::new(|| Ok(Box::new(Inert) as Box<dyn Unit>));
    let seq_sink = BlockSpec::new(
        "seq-sink",
        vec![PortSpec::input("in", BufferKind::Sequence)],
        ctor,
    );
    let sink = engine.create_block(seq_sink).unwrap();

    let request = engine
        .connect(PortAddr::new(a, 0), PortAddr::new(sink, 0))
        .unwrap();
    let status = pump_until_done(&mut backend, &responder, request);
    assert!(matches!(status, Err(Error::TypeMismatch { .. })));
}

/// Deleting a connected block detaches it first, then removes it. A control
/// input whose source disappears keeps its last value.
#[test]
fn test_delete_connected_block() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.8);
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.8).abs() < 1e-6
    }));

    let done = engine.delete_block(chain.gain).unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();

    assert!(matches!(
        engine.value(PortAddr::new(chain.gain, 0)),
        Err(Error::BlockNotFound(_))
    ));
    for _ in 0..4 {
        backend.process(TEST_CYCLE);
    }
    assert!((chain.seen.load(Ordering::Acquire) - 0.8).abs() < 1e-6);
}

/// A disabled block emits silence; re-enabling restores the signal.
#[test]
fn test_disable_and_reenable() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.8);
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.8).abs() < 1e-6
    }));

    let done = engine.set_enabled(chain.gain, false).unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();
    assert!(pump_until(&mut backend, || {
        chain.seen.load(Ordering::Acquire).abs() < 1e-6
    }));

    let done = engine.set_enabled(chain.gain, true).unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();
    assert!(pump_until(&mut backend, || {
        (chain.seen.load(Ordering::Acquire) - 0.8).abs() < 1e-6
    }));
}
