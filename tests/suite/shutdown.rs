//! Engine shutdown: drain, drop, abandon.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hostbridge_engine::{BridgeEngine, CallError, EngineConfig, ThreadTarget};
use serde_json::json;

use crate::common::{WAIT, collect_envelopes, collecting_engine};

#[test]
fn queued_tasks_drain_before_shutdown_returns() {
    let config = EngineConfig {
        worker_threads: 1,
        ..EngineConfig::default()
    };
    let (engine, rx) = collecting_engine(config);

    // Hold the only worker so everything after it stays queued.
    let (release_tx, release_rx) = mpsc::channel::<()>();
    engine.submit(0, move || {
        release_rx.recv_timeout(WAIT)?;
        Ok(())
    });
    for task_id in 1..=5 {
        engine.submit(task_id, move || {
            thread::sleep(Duration::from_millis(2));
            Ok(task_id)
        });
    }

    release_tx.send(()).unwrap();
    engine.shutdown();

    // All envelopes were delivered before shutdown returned.
    let envelopes: Vec<_> = rx.try_iter().collect();
    assert_eq!(envelopes.len(), 6);
    assert!(envelopes.iter().all(|envelope| envelope.status()));
}

#[test]
fn work_after_shutdown_is_dropped() {
    let (engine, rx) = collecting_engine(EngineConfig::default());
    engine.shutdown();
    engine.shutdown();

    engine.submit(1, || Ok(1));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(engine.stats().tasks_dropped, 1);
    assert!(engine.dispatch_to_main_thread(|| ()).is_err());
}

#[test]
fn shutdown_abandons_calls_the_host_never_answered() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let first = engine.call_host(|_| {}, ThreadTarget::Worker);
    let second = engine.call_host(|_| {}, ThreadTarget::Main);
    let (first_id, second_id) = (first.id(), second.id());

    let waiter = thread::spawn(move || first.wait());
    engine.shutdown();

    assert_eq!(waiter.join().unwrap(), Err(CallError::Abandoned(first_id)));
    assert_eq!(second.wait(), Err(CallError::Abandoned(second_id)));
    assert_eq!(engine.pending_calls(), 0);
    assert_eq!(engine.stats().calls_abandoned, 2);

    // The host answering afterwards is harmless.
    engine.completion_port().on_success(first_id, json!("late"));
}

#[test]
fn dropping_engine_flushes_in_flight_tasks() {
    let (engine, rx) = collecting_engine(EngineConfig::default());
    for task_id in 0..4 {
        engine.submit(task_id, move || Ok(task_id));
    }
    drop(engine);

    let envelopes = collect_envelopes(&rx, 4);
    let ids: Vec<i64> = envelopes
        .iter()
        .map(|envelope| envelope.task_id().value())
        .collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}
