//! Bridged calls: correlation, at-most-once completion, unknown ids.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hostbridge_engine::{
    BridgeEngine, CallError, CallId, EngineConfig, Settlement, ThreadTarget,
};
use serde::Deserialize;
use serde_json::json;

use crate::common::WAIT;

#[test]
fn synchronous_success_reply_resolves_future() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let port = engine.completion_port();
    let reply = engine.call_host(
        move |id| {
            port.on_success(id, json!("42"));
        },
        ThreadTarget::Worker,
    );
    assert_eq!(reply.wait().unwrap(), json!("42"));
}

#[test]
fn host_rejection_keeps_raw_value() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let port = engine.completion_port();
    let reply = engine.call_host(
        move |id| {
            port.on_error(id, json!({ "status": -1, "message": "boom" }));
        },
        ThreadTarget::Main,
    );
    match reply.wait() {
        Err(CallError::Host { message, value }) => {
            assert_eq!(message, "boom");
            assert_eq!(value["status"], -1);
        }
        other => panic!("expected host rejection, got {other:?}"),
    }
}

#[test]
fn concurrent_calls_each_get_their_own_reply() {
    let engine = Arc::new(BridgeEngine::new(EngineConfig::default()).unwrap());

    let callers: Vec<_> = (0..8)
        .map(|caller| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for n in 0..25 {
                    let port = engine.completion_port();
                    let expected = caller * 100 + n;
                    let reply = engine.call_host(
                        move |id| {
                            // Reply from an unrelated thread, after a short delay.
                            thread::spawn(move || {
                                thread::sleep(Duration::from_micros(200));
                                port.on_success(id, json!(expected));
                            });
                        },
                        ThreadTarget::Worker,
                    );
                    assert_eq!(reply.wait().unwrap(), json!(expected));
                }
            })
        })
        .collect();
    for caller in callers {
        caller.join().unwrap();
    }

    let stats = engine.stats();
    assert_eq!(stats.calls_started, 200);
    assert_eq!(stats.calls_resolved, 200);
    assert_eq!(engine.pending_calls(), 0);
}

#[test]
fn ids_are_distinct_across_threads() {
    let engine = Arc::new(BridgeEngine::new(EngineConfig::default()).unwrap());
    let issuers: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                (0..50)
                    .map(|_| engine.call_host(|_| {}, ThreadTarget::Worker).id())
                    .collect::<Vec<CallId>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for issuer in issuers {
        let ids = issuer.join().unwrap();
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
        for id in ids {
            assert!(seen.insert(id), "id {id} issued twice");
        }
    }
    assert_eq!(engine.pending_calls(), 200);
}

#[test]
fn double_completion_resolves_once() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let reply = engine.call_host(|_| {}, ThreadTarget::Worker);
    let id = reply.id();

    assert_eq!(engine.on_error(id, json!("first")), Settlement::Delivered);
    assert_eq!(engine.on_success(id, json!("second")), Settlement::AlreadySettled);
    assert_eq!(reply.wait().unwrap_err().to_string(), "first");
    assert_eq!(engine.stats().duplicate_completions, 1);
}

#[test]
fn unknown_id_does_not_disturb_pending_calls() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let mut waiting = engine.call_host(|_| {}, ThreadTarget::Worker);

    assert_eq!(
        engine.on_success(CallId::new(999), json!("x")),
        Settlement::NeverIssued
    );
    assert!(waiting.try_take().is_none());
    assert_eq!(engine.pending_calls(), 1);
    assert_eq!(engine.stats().unmatched_completions(), 1);
}

#[test]
fn reply_decodes_into_typed_value() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Fetched {
        status: u16,
        body: String,
    }

    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let port = engine.completion_port();
    let reply = engine.call_host(
        move |id| {
            port.on_success(id, json!({ "status": 200, "body": "ok" }));
        },
        ThreadTarget::Worker,
    );
    assert_eq!(
        reply.wait_as::<Fetched>().unwrap(),
        Fetched {
            status: 200,
            body: "ok".to_string()
        }
    );
}

#[tokio::test]
async fn replies_can_be_awaited_concurrently() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();
    let slow_port = engine.completion_port();
    let fast_port = engine.completion_port();

    let slow = engine.call_host(
        move |id| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                slow_port.on_success(id, json!("slow"));
            });
        },
        ThreadTarget::Main,
    );
    let fast = engine.call_host(
        move |id| {
            fast_port.on_success(id, json!("fast"));
        },
        ThreadTarget::Main,
    );

    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
}

#[test]
fn replies_awaited_on_the_issuing_main_loop() {
    let engine = Arc::new(BridgeEngine::new(EngineConfig::default()).unwrap());
    let issuer = Arc::clone(&engine);
    let (slow, fast) = engine
        .dispatch_to_main_thread(move || {
            let slow_port = issuer.completion_port();
            let fast_port = issuer.completion_port();
            // Both starters are queued behind this job on the same loop.
            let slow = issuer.call_host(
                move |id| {
                    thread::spawn(move || {
                        thread::sleep(Duration::from_millis(30));
                        slow_port.on_success(id, json!("slow"));
                    });
                },
                ThreadTarget::Main,
            );
            let fast = issuer.call_host(
                move |id| {
                    fast_port.on_success(id, json!("fast"));
                },
                ThreadTarget::Main,
            );
            tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap()
                .block_on(async {
                    tokio::time::timeout(WAIT, async { tokio::join!(slow, fast) }).await
                })
        })
        .unwrap()
        .expect("awaiting on the main loop stalled");
    assert_eq!(slow.unwrap(), json!("slow"));
    assert_eq!(fast.unwrap(), json!("fast"));
    assert_eq!(engine.pending_calls(), 0);
}
