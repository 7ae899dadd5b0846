//! Background tasks and their result envelopes.

use std::io::Write;
use std::panic;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use hostbridge_engine::{
    BridgeEngine, ConcurrencyLimit, EndpointError, EndpointErrorClassifier, EngineConfig,
    ResultEnvelope, StructuredError, TaskFailure,
};
use hostbridge_types::TaskError;
use serde_json::json;
use tempfile::NamedTempFile;

use crate::common::{WAIT, collect_envelopes, collecting_engine, with_collecting_sink};

#[test]
fn submitted_task_reports_exactly_once() {
    let (engine, rx) = collecting_engine(EngineConfig::default());
    engine.submit(7, || Ok(5));

    let envelope = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(
        envelope.to_value(),
        json!({ "taskId": 7, "status": true, "result": 5 })
    );

    engine.shutdown();
    assert!(rx.try_recv().is_err());
}

#[test]
fn single_worker_preserves_submission_order() {
    let config = EngineConfig {
        worker_threads: 1,
        ..EngineConfig::default()
    };
    let (engine, rx) = collecting_engine(config);
    for task_id in 0..20 {
        engine.submit(task_id, move || Ok(task_id * 2));
    }

    let order: Vec<i64> = (0..20)
        .map(|_| rx.recv_timeout(WAIT).unwrap().task_id().value())
        .collect();
    assert_eq!(order, (0..20).collect::<Vec<_>>());
}

#[test]
fn failures_never_escape_the_envelope() {
    let (engine, rx) = collecting_engine(EngineConfig::default());
    engine.submit(1, || -> anyhow::Result<()> { anyhow::bail!("disk full") });
    engine.submit(2, || -> anyhow::Result<()> { panic!("worker bug") });
    engine.submit(3, || -> anyhow::Result<()> { panic::panic_any(17_u8) });
    engine.submit(4, || Ok("still running"));

    let envelopes = collect_envelopes(&rx, 4);
    assert_eq!(
        envelopes[0].to_value(),
        json!({ "taskId": 1, "status": false, "error": "disk full" })
    );
    assert_eq!(envelopes[1].error(), Some(&TaskError::message("worker bug")));
    assert_eq!(envelopes[2].error(), Some(&TaskError::message("Unknown Error")));
    assert!(envelopes[3].status());

    let stats = engine.stats();
    assert_eq!(stats.tasks_failed, 3);
    assert_eq!(stats.tasks_succeeded, 1);
}

#[test]
fn endpoint_errors_become_structured() {
    let (builder, rx) =
        with_collecting_sink(BridgeEngine::builder().error_classifier(EndpointErrorClassifier));
    let engine = builder.build().unwrap();

    engine.submit(9, || -> anyhow::Result<()> {
        Err(EndpointError::new(0x0007_0001, "StoreNotFound", "Store", "no such store").into())
    });

    let envelope = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(
        envelope.to_value(),
        json!({
            "taskId": 9,
            "status": false,
            "error": {
                "code": 0x0007_0001,
                "name": "StoreNotFound",
                "scope": "Store",
                "description": "no such store",
                "full": "[Store] StoreNotFound (0x00070001): no such store",
            }
        })
    );
}

#[test]
fn classifier_in_effect_at_submit_is_used() {
    let (engine, rx) = collecting_engine(EngineConfig::default());
    let classifier = |_: &TaskFailure| -> Option<StructuredError> {
        Some(StructuredError {
            code: 1,
            name: "Custom".to_string(),
            scope: "Test".to_string(),
            description: "classified".to_string(),
            full: "classified".to_string(),
        })
    };
    engine.set_error_classifier(classifier);
    engine.submit(1, || -> anyhow::Result<()> { anyhow::bail!("raw") });

    let envelope = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(envelope.error().map(TaskError::summary), Some("classified"));
}

#[test]
fn sink_can_be_installed_later() {
    let engine = BridgeEngine::new(EngineConfig::default()).unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    engine.set_result_sink(move |envelope: ResultEnvelope| {
        let _ = tx.lock().unwrap().send(envelope.task_id().value());
    });
    engine.submit(2, || Ok(2));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);

    // The sink is looked up at delivery time.
    engine.clear_result_sink();
    engine.submit(3, || Ok(3));
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn bounded_config_from_file_limits_concurrency() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "worker_threads = 3\n\n[concurrency]\nmode = \"bounded\"\nslots = 2\n"
    )
    .unwrap();
    let config = EngineConfig::load_from(file.path()).unwrap();
    assert_eq!(config.concurrency, ConcurrencyLimit::Bounded { slots: 2 });

    let (engine, rx) = collecting_engine(config);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    for task_id in 0..6 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        engine.submit(task_id, move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(15));
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let envelopes = collect_envelopes(&rx, 6);
    assert!(envelopes.iter().all(|envelope| envelope.status()));
    assert!(peak.load(Ordering::SeqCst) <= 2);
}
