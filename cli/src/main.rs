//! hostbridge - composition root and demo host.
//!
//! The process main thread plays the host: it adopts the engine's main event
//! loop and runs every starter dispatched to it. A separate native thread
//! drives the engine the way a compiled core would:
//!
//! ```text
//! native thread                  main thread (host)          host-io threads
//! -------------                  ------------------          ---------------
//! submit(task)  -> pool -> envelope ------> result sink
//! call_host(starter) ------------> starter(id) -------------> reply later
//!   .await / wait() <--------------------------------------- on_success(id, v)
//! ```

mod host;

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use std::{env, io, thread};

use anyhow::{Context, Result, anyhow, bail};
use hostbridge_engine::{
    BridgeEngine, CallId, CallOptions, CallResult, EndpointError, EndpointErrorClassifier,
    EngineConfig, EventLoop, HostValue, ResultEnvelope, ThreadHandle, ThreadTarget,
};
use serde_json::json;
use tokio::runtime::Builder;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const USAGE: &str = "\
Usage: hostbridge [--config <path>]

Options:
  --config <path>  Engine config file (default: $HOSTBRIDGE_CONFIG or ~/.hostbridge/config.toml)
  -h, --help       Print this help
";

/// Process-wide default engine, reachable from the host callbacks.
static ENGINE: OnceLock<BridgeEngine> = OnceLock::new();

/// Host success callback.
pub fn on_success(id: u64, value: HostValue) {
    match ENGINE.get() {
        Some(engine) => {
            engine.on_success(CallId::new(id), value);
        }
        None => tracing::warn!("Completion for call {id} arrived before the engine started"),
    }
}

/// Host error callback.
pub fn on_error(id: u64, value: HostValue) {
    match ENGINE.get() {
        Some(engine) => {
            engine.on_error(CallId::new(id), value);
        }
        None => tracing::warn!("Completion for call {id} arrived before the engine started"),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // stdout carries the envelopes; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
}

enum Command {
    Run { config: Option<PathBuf> },
    Help,
}

fn parse_args() -> Result<Command> {
    let mut args = env::args_os().skip(1);
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--config") => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            Some("-h" | "--help") => return Ok(Command::Help),
            _ => bail!("unexpected argument: {}\n\n{USAGE}", arg.to_string_lossy()),
        }
    }
    Ok(Command::Run { config })
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?.unwrap_or_default(),
    };
    Ok(config)
}

fn print_envelope(envelope: ResultEnvelope) {
    println!("{}", envelope.to_value());
}

/// Shuts the engine down, then lets the host loop exit. The stop marker
/// queues behind the envelopes that the shutdown flushed.
struct HostShutdown {
    engine: &'static BridgeEngine,
    host: ThreadHandle,
}

impl Drop for HostShutdown {
    fn drop(&mut self) {
        self.engine.shutdown();
        if let Err(err) = self.host.request_stop() {
            tracing::warn!("Host loop already gone: {err}");
        }
    }
}

fn main() -> Result<()> {
    init_tracing();

    let config = match parse_args()? {
        Command::Help => {
            print!("{USAGE}");
            return Ok(());
        }
        Command::Run { config } => load_config(config.as_deref())?,
    };

    let (host_loop, host_handle) = EventLoop::new(&config.threads.main);
    let engine = BridgeEngine::builder()
        .config(config)
        .main_thread(host_handle.clone())
        .result_sink(print_envelope)
        .error_classifier(EndpointErrorClassifier)
        .build()?;
    if ENGINE.set(engine).is_err() {
        bail!("default engine initialized twice");
    }
    let engine = ENGINE.get().context("default engine missing")?;

    let native = thread::Builder::new()
        .name("native".to_string())
        .spawn(move || {
            let _shutdown = HostShutdown {
                engine,
                host: host_handle,
            };
            run_native(engine)
        })?;

    host_loop.run();

    native
        .join()
        .map_err(|_| anyhow!("native thread panicked"))??;
    eprintln!("{}", serde_json::to_string_pretty(&engine.stats())?);
    Ok(())
}

fn run_native(engine: &BridgeEngine) -> Result<()> {
    engine.submit(1, || Ok(fibonacci(64)));
    engine.submit(2, || -> Result<()> {
        Err(EndpointError::new(
            0x0007_0001,
            "StoreNotFound",
            "Store",
            "no store with the given id",
        ))
        .context("loading store")
    });
    engine.submit(3, || -> Result<u64> { bail!("quota exceeded") });

    let main_name = engine.dispatch_to_main_thread(|| thread::current().name().map(String::from))?;
    tracing::info!("Host main thread: {}", main_name.as_deref().unwrap_or("<unnamed>"));

    // Two calls in flight at once; replies arrive out of order.
    let runtime = Builder::new_current_thread().build()?;
    let (first, second) = runtime.block_on(async {
        let first = engine.call_host(
            |id| host::start_fetch(id, "https://example.com/a", Duration::from_millis(40)),
            ThreadTarget::Main,
        );
        let second = engine.call_host(
            |id| host::start_fetch(id, "ftp://example.com/b", Duration::from_millis(10)),
            ThreadTarget::Main,
        );
        tokio::join!(first, second)
    });
    report("fetch https", first);
    report("fetch ftp", second);

    let silent = engine.call_host_with(
        host::start_silent,
        ThreadTarget::Worker,
        CallOptions::default().with_timeout(Duration::from_millis(50)),
    );
    let silent_id = silent.id();
    report("silent call", silent.wait());

    // A misbehaving host: late, and never issued.
    on_success(silent_id.value(), json!("too late"));
    on_success(999, json!("x"));
    Ok(())
}

fn report(label: &str, outcome: CallResult) {
    match outcome {
        Ok(value) => tracing::info!("{label}: {value}"),
        Err(err) => tracing::warn!("{label} failed: {err}"),
    }
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 0..n {
        (a, b) = (b, a.wrapping_add(b));
    }
    a
}
