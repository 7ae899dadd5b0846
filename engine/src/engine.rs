//! The orchestrator: background tasks, bridged host calls, and thread
//! dispatch behind one handle.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use hostbridge_types::{CallId, HostValue, ResultEnvelope, TaskId, ThreadTarget};
use serde::Serialize;

use crate::cancel::CancellationToken;
use crate::classify::{ErrorClassifier, TaskFailure, describe_failure};
use crate::config::{ConcurrencyLimit, EngineConfig};
use crate::deadline::DeadlineWatcher;
use crate::dispatch::{LoopThread, ThreadHandle};
use crate::error::{CallError, DispatchError, EngineError};
use crate::panic_message;
use crate::pending::{PendingCallTable, PendingReply, Settlement};
use crate::pool::{SlotGate, WorkerPool};
use crate::stats::{EngineStats, StatsSnapshot, bump};

const WORKER_POOL_NAME: &str = "worker";
const DEADLINE_THREAD_NAME: &str = "call-deadlines";

/// Consumer of background task envelopes. Always invoked on the main thread.
pub trait ResultSink: Send + Sync {
    fn deliver(&self, envelope: ResultEnvelope);
}

impl<F> ResultSink for F
where
    F: Fn(ResultEnvelope) + Send + Sync,
{
    fn deliver(&self, envelope: ResultEnvelope) {
        self(envelope);
    }
}

/// Per-call overrides for [`BridgeEngine::call_host_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
    pub cancellation: Option<CancellationToken>,
}

impl CallOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// State shared with pool jobs, loop jobs, and completion ports.
struct Shared {
    config: EngineConfig,
    main: ThreadHandle,
    task_manager: ThreadHandle,
    pool: WorkerPool,
    slots: Option<Arc<SlotGate>>,
    calls: PendingCallTable,
    sink: Mutex<Option<Arc<dyn ResultSink>>>,
    classifier: Mutex<Option<Arc<dyn ErrorClassifier>>>,
    stats: EngineStats,
    stopped: AtomicBool,
}

impl Shared {
    fn target(&self, target: ThreadTarget) -> &ThreadHandle {
        match target {
            ThreadTarget::Main => &self.main,
            ThreadTarget::Worker => &self.task_manager,
        }
    }

    fn complete(&self, id: CallId, outcome: Result<HostValue, HostValue>) -> Settlement {
        let success = outcome.is_ok();
        let settlement = match outcome {
            Ok(value) => self.calls.take_and_resolve(id, value),
            Err(value) => self.calls.take_and_reject(id, CallError::from_host(value)),
        };

        match settlement {
            Settlement::Delivered if success => bump(&self.stats.calls_resolved),
            Settlement::Delivered => bump(&self.stats.calls_rejected),
            Settlement::AlreadySettled => {
                bump(&self.stats.duplicate_completions);
                tracing::warn!("Dropping completion for call {id}: already settled");
            }
            Settlement::Expired => {
                bump(&self.stats.late_completions);
                tracing::debug!("Dropping late completion for call {id}: timed out or cancelled");
            }
            Settlement::NeverIssued => {
                bump(&self.stats.never_issued_completions);
                tracing::warn!("Dropping completion for call {id}: id was never issued");
                debug_assert!(
                    !self.config.strict_completion,
                    "host completed call {id}, which was never issued"
                );
            }
        }
        settlement
    }

    /// Settle a call on the engine's initiative.
    fn expire(&self, id: CallId, error: CallError) -> Settlement {
        let counter = match error {
            CallError::TimedOut(_) => &self.stats.calls_timed_out,
            CallError::Cancelled(_) => &self.stats.calls_cancelled,
            CallError::Abandoned(_) => &self.stats.calls_abandoned,
            _ => &self.stats.calls_rejected,
        };
        let settlement = self.calls.expire(id, error);
        if settlement.is_delivered() {
            bump(counter);
            tracing::debug!("Call {id} expired before the host replied");
        }
        settlement
    }

    fn reject(&self, id: CallId, error: CallError) {
        if self.calls.take_and_reject(id, error).is_delivered() {
            bump(&self.stats.calls_rejected);
        }
    }

    fn current_classifier(&self) -> Option<Arc<dyn ErrorClassifier>> {
        self.classifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn run_task<T, F>(
        &self,
        task_id: TaskId,
        classifier: Option<&dyn ErrorClassifier>,
        task: F,
    ) -> ResultEnvelope
    where
        T: Serialize,
        F: FnOnce() -> anyhow::Result<T>,
    {
        let failure = match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Ok(value)) => match serde_json::to_value(value) {
                Ok(value) => {
                    bump(&self.stats.tasks_succeeded);
                    return ResultEnvelope::success(task_id, value);
                }
                Err(err) => TaskFailure::Error(
                    anyhow::Error::new(err).context("failed to encode task result"),
                ),
            },
            Ok(Err(err)) => TaskFailure::Error(err),
            Err(payload) => {
                TaskFailure::Panic(panic_message(payload.as_ref()).map(str::to_string))
            }
        };

        bump(&self.stats.tasks_failed);
        tracing::debug!("Task {task_id} failed: {}", failure.message().unwrap_or_default());
        ResultEnvelope::failure(task_id, describe_failure(classifier, &failure))
    }

    /// Post `envelope` to the main thread, where the current sink gets it.
    fn post_envelope(self: &Arc<Self>, envelope: ResultEnvelope) {
        let task_id = envelope.task_id();
        let shared = Arc::clone(self);
        if let Err(err) = self.main.run_async(move || shared.hand_to_sink(envelope)) {
            tracing::warn!("Dropping result of task {task_id}: {err}");
        }
    }

    fn hand_to_sink(&self, envelope: ResultEnvelope) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(sink) = sink else {
            tracing::debug!(
                "No result sink installed; dropping result of task {}",
                envelope.task_id()
            );
            return;
        };
        let task_id = envelope.task_id();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(envelope))) {
            tracing::error!(
                "Result sink panicked on task {task_id}: {}",
                panic_message(payload.as_ref()).unwrap_or("unknown panic")
            );
        }
    }
}

/// Host-facing completion entry points.
///
/// Cheap to clone; safe to call from any thread. Holding one does not keep
/// the engine's threads alive.
#[derive(Clone)]
pub struct CompletionPort {
    shared: Arc<Shared>,
}

impl fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPort")
            .field("pending", &self.shared.calls.len())
            .finish()
    }
}

impl CompletionPort {
    /// The host's success callback for call `id`.
    pub fn on_success(&self, id: CallId, value: HostValue) -> Settlement {
        self.shared.complete(id, Ok(value))
    }

    /// The host's error callback for call `id`.
    pub fn on_error(&self, id: CallId, value: HostValue) -> Settlement {
        self.shared.complete(id, Err(value))
    }
}

pub struct BridgeEngineBuilder {
    config: EngineConfig,
    main_thread: Option<ThreadHandle>,
    sink: Option<Arc<dyn ResultSink>>,
    classifier: Option<Arc<dyn ErrorClassifier>>,
}

impl BridgeEngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a host-owned loop as the main thread instead of spawning one.
    #[must_use]
    pub fn main_thread(mut self, handle: ThreadHandle) -> Self {
        self.main_thread = Some(handle);
        self
    }

    #[must_use]
    pub fn result_sink(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    #[must_use]
    pub fn error_classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn build(self) -> Result<BridgeEngine, EngineError> {
        let Self {
            config,
            main_thread,
            sink,
            classifier,
        } = self;
        config.validate()?;

        let spawn_loop = |name: &str| {
            LoopThread::spawn(name).map_err(|source| EngineError::Spawn {
                name: name.to_string(),
                source,
            })
        };

        let (main, owned_main) = match main_thread {
            Some(handle) => (handle, None),
            None => {
                let thread = spawn_loop(&config.threads.main)?;
                (thread.handle().clone(), Some(thread))
            }
        };
        let task_manager_thread = spawn_loop(&config.threads.task_manager)?;
        let pool = WorkerPool::new(WORKER_POOL_NAME, config.worker_threads).map_err(|source| {
            EngineError::Spawn {
                name: WORKER_POOL_NAME.to_string(),
                source,
            }
        })?;
        let slots = match config.concurrency {
            ConcurrencyLimit::Unbounded => None,
            ConcurrencyLimit::Bounded { slots } => Some(SlotGate::new(slots)),
        };

        let shared = Arc::new(Shared {
            main,
            task_manager: task_manager_thread.handle().clone(),
            pool,
            slots,
            calls: PendingCallTable::new(),
            sink: Mutex::new(sink),
            classifier: Mutex::new(classifier),
            stats: EngineStats::default(),
            stopped: AtomicBool::new(false),
            config,
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let deadlines = DeadlineWatcher::spawn(
            DEADLINE_THREAD_NAME,
            Box::new(move |id: CallId| {
                if let Some(shared) = weak.upgrade() {
                    shared.expire(id, CallError::TimedOut(id));
                }
            }),
        )
        .map_err(|source| EngineError::Spawn {
            name: DEADLINE_THREAD_NAME.to_string(),
            source,
        })?;

        tracing::debug!(
            "Bridge engine started (main: '{}', workers: {}, concurrency: {:?})",
            shared.main.name(),
            shared.config.worker_threads,
            shared.config.concurrency
        );

        Ok(BridgeEngine {
            shared,
            task_manager: Mutex::new(Some(task_manager_thread)),
            deadlines: Mutex::new(Some(deadlines)),
            owned_main: Mutex::new(owned_main),
        })
    }
}

/// The async call-correlation and dispatch engine.
///
/// Owns a task-manager loop thread, a worker pool, a deadline watcher, and
/// (unless the host supplies one) the main loop thread. Dropping it shuts
/// everything down; see [`shutdown`](Self::shutdown).
pub struct BridgeEngine {
    shared: Arc<Shared>,
    task_manager: Mutex<Option<LoopThread>>,
    deadlines: Mutex<Option<DeadlineWatcher>>,
    owned_main: Mutex<Option<LoopThread>>,
}

impl fmt::Debug for BridgeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeEngine")
            .field("main", &self.shared.main)
            .field("task_manager", &self.shared.task_manager)
            .field("pending", &self.shared.calls.len())
            .finish_non_exhaustive()
    }
}

impl BridgeEngine {
    #[must_use]
    pub fn builder() -> BridgeEngineBuilder {
        BridgeEngineBuilder {
            config: EngineConfig::default(),
            main_thread: None,
            sink: None,
            classifier: None,
        }
    }

    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder().config(config).build()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn main_thread(&self) -> &ThreadHandle {
        &self.shared.main
    }

    #[must_use]
    pub fn task_manager_thread(&self) -> &ThreadHandle {
        &self.shared.task_manager
    }

    #[must_use]
    pub fn thread(&self, target: ThreadTarget) -> &ThreadHandle {
        self.shared.target(target)
    }

    #[must_use]
    pub fn completion_port(&self) -> CompletionPort {
        CompletionPort {
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Bridged calls still waiting for the host.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.calls.len()
    }

    /// Ids of bridged calls that have waited at least `age`.
    #[must_use]
    pub fn stale_calls(&self, age: Duration) -> Vec<CallId> {
        self.shared.calls.older_than(age)
    }

    pub fn set_result_sink(&self, sink: impl ResultSink + 'static) {
        *self.shared.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(sink));
    }

    pub fn clear_result_sink(&self) {
        *self.shared.sink.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Applies to tasks submitted from now on.
    pub fn set_error_classifier(&self, classifier: impl ErrorClassifier + 'static) {
        *self
            .shared
            .classifier
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(classifier));
    }

    /// Run `task` on the worker pool and post its envelope to the result
    /// sink on the main thread.
    ///
    /// Failures (an `Err`, a panic, an unserializable result) become a
    /// failed envelope; nothing propagates to the caller. In bounded mode
    /// this blocks until a slot is free, so calling it from inside a task
    /// can stall once every slot is held by a waiting task.
    pub fn submit<T, F>(&self, task_id: i64, task: F)
    where
        T: Serialize + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let task_id = TaskId::new(task_id);
        bump(&self.shared.stats.tasks_submitted);

        let classifier = self.shared.current_classifier();
        let permit = self.shared.slots.as_ref().map(SlotGate::acquire);
        let shared = Arc::clone(&self.shared);
        let job = move || {
            let envelope = shared.run_task(task_id, classifier.as_deref(), task);
            shared.post_envelope(envelope);
            drop(permit);
        };

        let shared = Arc::clone(&self.shared);
        let handoff = self.shared.task_manager.run_async(move || {
            if !shared.pool.enqueue(job) {
                bump(&shared.stats.tasks_dropped);
                tracing::warn!("Worker pool is stopping; dropped task {task_id}");
            }
        });
        if let Err(err) = handoff {
            bump(&self.shared.stats.tasks_dropped);
            tracing::warn!("Dropped task {task_id}: {err}");
        }
    }

    /// Start a bridged call with the configured default timeout.
    ///
    /// See [`call_host_with`](Self::call_host_with).
    pub fn call_host<S>(&self, starter: S, target: ThreadTarget) -> PendingReply
    where
        S: FnOnce(CallId) + Send + 'static,
    {
        self.call_host_with(starter, target, CallOptions::default())
    }

    /// Register a call, then run `starter(id)` on `target` without waiting
    /// for it.
    ///
    /// The starter is expected to kick off the host operation, which later
    /// reports through [`CompletionPort::on_success`] or
    /// [`CompletionPort::on_error`] with the same id. The returned reply
    /// resolves on the thread that issued the call.
    pub fn call_host_with<S>(
        &self,
        starter: S,
        target: ThreadTarget,
        options: CallOptions,
    ) -> PendingReply
    where
        S: FnOnce(CallId) + Send + 'static,
    {
        let (id, reply) = self.shared.calls.register();
        bump(&self.shared.stats.calls_started);

        if self.shared.stopped.load(Ordering::Acquire) {
            self.shared.expire(id, CallError::Abandoned(id));
            return reply;
        }

        if let Some(timeout) = options.timeout.or_else(|| self.shared.config.call_timeout()) {
            if let Some(deadlines) = self
                .deadlines
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
            {
                deadlines.watch(id, Instant::now() + timeout);
            }
        }

        if let Some(token) = options.cancellation {
            let weak = Arc::downgrade(&self.shared);
            let key = token.on_cancel(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.expire(id, CallError::Cancelled(id));
                }
            });
            let Some(key) = key else {
                return reply;
            };
            // A long-lived token must not keep one callback per settled call.
            let registered = token.clone();
            self.shared.calls.on_settle(id, move || registered.forget(key));
            if token.is_cancelled() {
                return reply;
            }
        }

        let shared = Arc::clone(&self.shared);
        let dispatched = self.shared.target(target).run_async(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| starter(id))) {
                let message = panic_message(payload.as_ref())
                    .unwrap_or("Unknown Error")
                    .to_string();
                tracing::error!("Starter for call {id} panicked: {message}");
                shared.reject(id, CallError::StarterPanicked { id, message });
            }
        });
        if let Err(err) = dispatched {
            tracing::warn!("Could not dispatch starter for call {id}: {err}");
            self.shared.reject(id, CallError::Dispatch(err));
        }
        reply
    }

    /// Reject call `id` with [`CallError::Cancelled`]. A later host reply
    /// for it is dropped.
    pub fn cancel_call(&self, id: CallId) -> Settlement {
        self.shared.expire(id, CallError::Cancelled(id))
    }

    pub fn on_success(&self, id: CallId, value: HostValue) -> Settlement {
        self.shared.complete(id, Ok(value))
    }

    pub fn on_error(&self, id: CallId, value: HostValue) -> Settlement {
        self.shared.complete(id, Err(value))
    }

    /// Run `f` on the main thread and wait for its result.
    pub fn dispatch_to_main_thread<F, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.shared.main.run_sync(f)
    }

    /// Run `f` on the thread behind `handle` and wait for its result.
    pub fn dispatch_to_thread<F, R>(&self, f: F, handle: &ThreadHandle) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        handle.run_sync(f)
    }

    /// Queue `f` on `target` without waiting.
    pub fn post_to_thread<F>(&self, f: F, target: ThreadTarget) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.target(target).run_async(f)
    }

    /// Stop the engine. Idempotent.
    ///
    /// Tasks already submitted still run and their envelopes are still
    /// delivered (to a host-owned main loop, only if the host keeps pumping
    /// it). Bridged calls still waiting are rejected with
    /// [`CallError::Abandoned`].
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Bridge engine shutting down");

        if let Some(mut task_manager) = self
            .task_manager
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task_manager.stop();
        }
        self.shared.pool.shutdown();
        if let Some(mut deadlines) = self
            .deadlines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            deadlines.stop();
        }

        let abandoned = self.shared.calls.abandon_all();
        if abandoned > 0 {
            EngineStats::add(&self.shared.stats.calls_abandoned, abandoned);
            tracing::warn!("Abandoned {abandoned} bridged calls still waiting for the host");
        }

        if let Some(mut main) = self
            .owned_main
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            main.stop();
        }
        tracing::debug!("Bridge engine stopped");
    }
}

impl Drop for BridgeEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
