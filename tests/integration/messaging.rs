//! Cross-domain (queued) delivery integration tests.
//!
//! An audio-domain tail feeding a message-domain head never shares buffers
//! with it; the driver snapshots the tail's cycle output into a lock-free
//! ring, and the message thread delivers it and runs the head block against
//! its virtual clock.

use std::sync::atomic::Ordering;
use weft::core::internals;
use weft::prelude::*;

use crate::helpers::*;

#[test]
fn test_queued_delivery_to_message_block() {
    let (engine, mut backend, responder) = test_engine();
    let constant = engine
        .create_block(internals::constant_spec("const", 0.7))
        .unwrap();
    let (probe_spec, seen) = internals::probe_spec("mprobe");
    let probe = engine
        .create_block(probe_spec.in_domain(Domain::Message))
        .unwrap();

    let done = engine
        .connect(PortAddr::new(constant, 0), PortAddr::new(probe, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();

    assert!(pump_until(&mut backend, || {
        (seen.load(Ordering::Acquire) - 0.7).abs() < 1e-6
    }));
}

/// Scalar values cross the boundary on change; a new value shows up after
/// the cycle that produced it.
#[test]
fn test_scalar_change_propagates() {
    let (engine, mut backend, responder) = test_engine();
    let chain = build_chain(&engine, &mut backend, &responder, 0.4);
    let (probe_spec, seen) = internals::probe_spec("mprobe");
    let probe = engine
        .create_block(probe_spec.in_domain(Domain::Message))
        .unwrap();

    let done = engine
        .connect(PortAddr::new(chain.gain, 2), PortAddr::new(probe, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, done).unwrap();
    assert!(pump_until(&mut backend, || {
        (seen.load(Ordering::Acquire) - 0.4).abs() < 1e-6
    }));

    let set = engine.set_value(PortAddr::new(chain.gain, 1), 0.5).unwrap();
    pump_until_done(&mut backend, &responder, set).unwrap();
    assert!(pump_until(&mut backend, || {
        (seen.load(Ordering::Acquire) - 0.2).abs() < 1e-6
    }));
}

/// Queued connections never feed the audio-side compiler a dependency, so
/// a loop that crosses the domain boundary in both directions is legal.
#[test]
fn test_cross_domain_loop_allowed() {
    let (engine, mut backend, responder) = test_engine();
    let audio = engine.create_block(internals::pass_spec("a")).unwrap();
    let message = engine
        .create_block(internals::pass_spec("m").in_domain(Domain::Message))
        .unwrap();

    let forward = engine
        .connect(PortAddr::new(audio, 1), PortAddr::new(message, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, forward).unwrap();

    let back = engine
        .connect(PortAddr::new(message, 1), PortAddr::new(audio, 0))
        .unwrap();
    pump_until_done(&mut backend, &responder, back).unwrap();
    for _ in 0..8 {
        backend.process(TEST_CYCLE);
    }
}
