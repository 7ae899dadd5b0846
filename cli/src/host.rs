//! A stand-in for the single-threaded host.
//!
//! Operations accept the call id, return at once, and answer later from a
//! helper thread through the process-wide completion callbacks.

use std::thread;
use std::time::Duration;

use hostbridge_engine::CallId;
use serde_json::json;

use crate::{on_error, on_success};

/// Simulated fetch. `https://` URLs succeed, anything else is rejected.
pub fn start_fetch(id: CallId, url: &str, delay: Duration) {
    tracing::info!("Host: fetch {url} (call {id})");
    let url = url.to_string();
    let spawned = thread::Builder::new()
        .name(format!("host-io-{id}"))
        .spawn(move || {
            thread::sleep(delay);
            match url.strip_prefix("https://") {
                Some(path) => on_success(
                    id.value(),
                    json!({ "status": 200, "url": url, "body": format!("contents of {path}") }),
                ),
                None => on_error(
                    id.value(),
                    json!({ "status": -1, "message": format!("unsupported scheme in {url}") }),
                ),
            }
        });
    if let Err(err) = spawned {
        on_error(id.value(), json!(format!("host could not start fetch: {err}")));
    }
}

/// Accepts the request and never answers it.
pub fn start_silent(id: CallId) {
    tracing::info!("Host: accepted call {id}; no reply will follow");
}
