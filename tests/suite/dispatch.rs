//! Thread-targeted work, including a host that owns and pumps its own loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;

use hostbridge_engine::{
    BridgeEngine, EngineConfig, EventLoop, LoopThread, ThreadTarget, current_thread_handle,
};
use serde_json::json;

use crate::common::{WAIT, collecting_engine, pump_until, with_collecting_sink};

#[test]
fn host_owned_loop_runs_starters_and_envelopes() {
    let (event_loop, host) = EventLoop::new("embedded-host");
    let (builder, rx) = with_collecting_sink(BridgeEngine::builder().main_thread(host.clone()));
    let engine = builder.build().unwrap();
    assert_eq!(engine.main_thread(), &host);

    let started_on_host = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started_on_host);
    let probe = host.clone();
    let port = engine.completion_port();
    let mut reply = engine.call_host(
        move |id| {
            flag.store(probe.is_current(), Ordering::SeqCst);
            port.on_success(id, json!("from host"));
        },
        ThreadTarget::Main,
    );
    engine.submit(5, || Ok("done"));

    let mut envelope = None;
    pump_until(&event_loop, || {
        if envelope.is_none() {
            envelope = rx.try_recv().ok();
        }
        envelope.is_some()
    });

    assert!(started_on_host.load(Ordering::SeqCst));
    assert_eq!(reply.try_take().unwrap().unwrap(), json!("from host"));
    let envelope = envelope.unwrap();
    assert_eq!(envelope.task_id().value(), 5);
}

#[test]
fn dispatch_to_named_thread_blocks_for_result() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let storage = LoopThread::spawn("storage").unwrap();

    let seen = engine
        .dispatch_to_thread(
            || current_thread_handle().map(|handle| handle.name().to_string()),
            storage.handle(),
        )
        .unwrap();
    assert_eq!(seen.as_deref(), Some("storage"));
}

#[test]
fn dispatch_from_target_thread_runs_inline() {
    let engine = Arc::new(BridgeEngine::new(EngineConfig::default()).unwrap());
    let inner = Arc::clone(&engine);
    let nested = engine
        .dispatch_to_main_thread(move || {
            // Already on main: must not hop or block.
            inner
                .dispatch_to_main_thread(|| thread::current().name().map(String::from))
                .unwrap()
        })
        .unwrap();
    assert_eq!(nested.as_deref(), Some("host-main"));
}

#[test]
fn task_waits_on_bridged_call_mid_computation() {
    let (engine, rx) = collecting_engine(EngineConfig::default());
    let engine = Arc::new(engine);

    let issuer = Arc::clone(&engine);
    engine.submit(11, move || {
        let partial = 20;
        let port = issuer.completion_port();
        let reply = issuer.call_host(
            move |id| {
                port.on_success(id, json!(22));
            },
            ThreadTarget::Main,
        );
        let remote: i64 = reply.wait_as()?;
        Ok(partial + remote)
    });

    let envelope = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(envelope.result(), Some(&json!(42)));
}

#[test]
fn post_to_thread_does_not_wait() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let (tx, rx) = mpsc::channel();
    engine
        .post_to_thread(
            move || {
                let _ = tx.send(thread::current().name().map(String::from));
            },
            ThreadTarget::Worker,
        )
        .unwrap();
    assert_eq!(
        rx.recv_timeout(WAIT).unwrap().as_deref(),
        Some("task-manager")
    );
}
