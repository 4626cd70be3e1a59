//! Engine lifecycle integration tests.

use weft::prelude::*;

use crate::helpers::*;

#[test]
fn test_build_activate_deactivate() {
    let (engine, _backend, _responder) = test_engine();
    assert!(matches!(engine.activate(), Err(Error::AlreadyActivated)));
    engine.deactivate().unwrap();
    assert!(matches!(engine.deactivate(), Err(Error::NotActivated)));
}

#[test]
fn test_invalid_config_rejected() {
    let bad = EngineConfig {
        sample_rate: 0,
        ..EngineConfig::default()
    };
    let result = EngineBuilder::new().config(bad).build();
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}

/// Cycles before activation are harmless no-ops: no plan is installed yet,
/// but events still drain and the frame clock still advances.
#[test]
fn test_process_before_activate() {
    let (_engine, mut backend) = EngineBuilder::new()
        .config(test_config())
        .build()
        .unwrap();
    for _ in 0..4 {
        backend.process(TEST_CYCLE);
    }
    assert_eq!(backend.now(), 4 * TEST_CYCLE as u64);
}

/// Several engines can coexist; nothing in the kernel is global.
#[test]
fn test_independent_engines() {
    let (a, mut backend_a, _ra) = test_engine();
    let (b, mut backend_b, _rb) = test_engine();
    backend_a.process(TEST_CYCLE);
    backend_b.process(128);
    assert_eq!(backend_a.now(), TEST_CYCLE as u64);
    assert_eq!(backend_b.now(), 128);
    drop(a);
    drop(b);
}

/// Oversized cycles are truncated to the configured maximum instead of
/// overrunning buffer capacity.
#[test]
fn test_cycle_truncated_to_maximum() {
    let (_engine, mut backend, _responder) = test_engine();
    let max = test_config().max_cycle_frames;
    backend.process(max * 4);
    assert_eq!(backend.now(), max as u64);
}

/// Dropping the control handle first, or the backend first, must both shut
/// down cleanly without hanging a join.
#[test]
fn test_shutdown_either_order() {
    {
        let (engine, backend, _r) = test_engine();
        drop(engine);
        drop(backend);
    }
    {
        let (engine, backend, _r) = test_engine();
        drop(backend);
        drop(engine);
    }
}
