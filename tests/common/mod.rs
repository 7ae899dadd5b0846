//! Shared test utilities and fixtures

#![allow(dead_code)]

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use hostbridge_engine::{BridgeEngine, BridgeEngineBuilder, EngineConfig, EventLoop, ResultEnvelope};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Attach a channel-backed result sink to `builder`.
pub fn with_collecting_sink(
    builder: BridgeEngineBuilder,
) -> (BridgeEngineBuilder, Receiver<ResultEnvelope>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let builder = builder.result_sink(move |envelope: ResultEnvelope| {
        let _ = tx.lock().unwrap().send(envelope);
    });
    (builder, rx)
}

/// Engine with its own main loop and a collecting sink.
pub fn collecting_engine(config: EngineConfig) -> (BridgeEngine, Receiver<ResultEnvelope>) {
    let (builder, rx) = with_collecting_sink(BridgeEngine::builder().config(config));
    (builder.build().unwrap(), rx)
}

/// Receive `count` envelopes, ordered by task id.
pub fn collect_envelopes(rx: &Receiver<ResultEnvelope>, count: usize) -> Vec<ResultEnvelope> {
    let mut envelopes: Vec<ResultEnvelope> =
        (0..count).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
    envelopes.sort_by_key(|envelope| envelope.task_id().value());
    envelopes
}

/// Pump a host-owned loop on the current thread until `done` holds.
pub fn pump_until(event_loop: &EventLoop, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !done() {
        assert!(Instant::now() < deadline, "timed out pumping '{}'", event_loop.name());
        if event_loop.run_pending() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
}
