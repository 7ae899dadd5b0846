//! Run work on a specific, named thread.
//!
//! Every targetable thread runs an [`EventLoop`]: a FIFO mailbox of jobs
//! drained one at a time. A [`ThreadHandle`] posts into that mailbox from
//! anywhere. The loop either adopts the calling thread ([`EventLoop::run`],
//! for hosts that own their thread) or gets a dedicated one
//! ([`LoopThread::spawn`]).
//!
//! A loop thread that waits on a reply routed to itself keeps draining its
//! own mailbox in the meantime, so work that hops back onto it can still
//! run. That holds both for a blocking [`wait`](ReplyReceiver::wait) and for
//! a reply polled as a future (for example under `block_on`) on that loop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};

use crate::error::DispatchError;
use crate::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum LoopMessage {
    Run(Job),
    Stop,
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE: RefCell<Option<Rc<ActiveLoop>>> = const { RefCell::new(None) };
}

fn current_loop() -> Option<Rc<ActiveLoop>> {
    ACTIVE.with(|active| active.borrow().clone())
}

/// Handle of the loop running on the calling thread, if any.
#[must_use]
pub fn current_thread_handle() -> Option<ThreadHandle> {
    current_loop().and_then(|active| active.handle())
}

/// Cloneable address of an event loop.
#[derive(Clone)]
pub struct ThreadHandle {
    id: u64,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadHandle {}

impl ThreadHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the calling thread is currently running this loop.
    #[must_use]
    pub fn is_current(&self) -> bool {
        ACTIVE.with(|active| {
            active
                .borrow()
                .as_ref()
                .is_some_and(|running| running.id == self.id)
        })
    }

    /// Whether the loop has stopped accepting work.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue `f` on the loop and return immediately.
    ///
    /// A panic inside `f` is logged by the loop and otherwise lost; report
    /// outcomes from inside `f`.
    pub fn run_async<F>(&self, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(LoopMessage::Run(Box::new(f)))
            .map_err(|_| DispatchError::closed(&self.name))
    }

    /// Run `f` on the loop and block until it returns.
    ///
    /// Runs inline when already on the target loop. A panic inside `f` is
    /// resumed on the caller.
    pub fn run_sync<F, R>(&self, f: F) -> Result<R, DispatchError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(f());
        }

        let (completion, reply) = completion_pair();
        self.run_async(move || {
            completion.complete(panic::catch_unwind(AssertUnwindSafe(f)));
        })?;

        match reply.wait() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(Disconnected) => Err(DispatchError::closed(&self.name)),
        }
    }

    /// Ask the loop to exit once the work queued so far has run.
    pub fn request_stop(&self) -> Result<(), DispatchError> {
        self.tx
            .send(LoopMessage::Stop)
            .map_err(|_| DispatchError::closed(&self.name))
    }
}

struct ActiveLoop {
    id: u64,
    name: Arc<str>,
    rx: RefCell<mpsc::UnboundedReceiver<LoopMessage>>,
    // Weak so that a loop whose handles are all gone can exit.
    weak_tx: mpsc::WeakUnboundedSender<LoopMessage>,
    stop_requested: Cell<bool>,
}

impl ActiveLoop {
    fn handle(&self) -> Option<ThreadHandle> {
        self.weak_tx.upgrade().map(|tx| ThreadHandle {
            id: self.id,
            name: Arc::clone(&self.name),
            tx,
        })
    }

    fn recv(&self, block: bool) -> Option<LoopMessage> {
        let mut rx = self.rx.borrow_mut();
        if block {
            rx.blocking_recv()
        } else {
            rx.try_recv().ok()
        }
    }

    /// Handle one message. Returns `false` when the mailbox is closed and
    /// empty.
    fn turn(&self, block: bool) -> bool {
        match self.recv(block) {
            Some(LoopMessage::Run(job)) => {
                run_job(&self.name, job);
                true
            }
            Some(LoopMessage::Stop) => {
                self.stop_requested.set(true);
                true
            }
            None => false,
        }
    }
}

fn run_job(thread: &str, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(
            "Job on thread '{thread}' panicked: {}",
            panic_message(payload.as_ref()).unwrap_or("unknown panic")
        );
    }
}

struct Activation {
    previous: Option<Rc<ActiveLoop>>,
}

impl Activation {
    fn enter(active: &Rc<ActiveLoop>) -> Self {
        let previous = ACTIVE.with(|slot| slot.replace(Some(Rc::clone(active))));
        Self { previous }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE.with(|slot| {
            slot.replace(previous);
        });
    }
}

/// Sendable pieces of a loop that has not started yet.
struct LoopParts {
    id: u64,
    name: Arc<str>,
    rx: mpsc::UnboundedReceiver<LoopMessage>,
    weak_tx: mpsc::WeakUnboundedSender<LoopMessage>,
}

impl LoopParts {
    fn new(name: &str) -> (Self, ThreadHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = Arc::from(name);
        let parts = Self {
            id,
            name: Arc::clone(&name),
            rx,
            weak_tx: tx.downgrade(),
        };
        (parts, ThreadHandle { id, name, tx })
    }
}

/// An event loop bound to the thread that runs it.
///
/// Not `Send`: create it on the thread that will drive it.
pub struct EventLoop {
    active: Rc<ActiveLoop>,
}

impl EventLoop {
    #[must_use]
    pub fn new(name: &str) -> (Self, ThreadHandle) {
        let (parts, handle) = LoopParts::new(name);
        (Self::from_parts(parts), handle)
    }

    fn from_parts(parts: LoopParts) -> Self {
        Self {
            active: Rc::new(ActiveLoop {
                id: parts.id,
                name: parts.name,
                rx: RefCell::new(parts.rx),
                weak_tx: parts.weak_tx,
                stop_requested: Cell::new(false),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.active.name
    }

    /// A new handle, unless every handle has already been dropped.
    #[must_use]
    pub fn handle(&self) -> Option<ThreadHandle> {
        self.active.handle()
    }

    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.active.stop_requested.get()
    }

    /// Drive the loop on the current thread until a stop is requested or
    /// every handle is dropped. Work queued before the stop still runs.
    pub fn run(self) {
        let _activation = Activation::enter(&self.active);
        tracing::debug!("Event loop '{}' running", self.active.name);

        while !self.active.stop_requested.get() {
            if !self.active.turn(true) {
                break;
            }
        }

        self.active.rx.borrow_mut().close();
        while let Some(message) = self.active.recv(false) {
            if let LoopMessage::Run(job) = message {
                run_job(&self.active.name, job);
            }
        }
        tracing::debug!("Event loop '{}' stopped", self.active.name);
    }

    /// Run whatever is queued right now without blocking. Returns the
    /// number of messages handled.
    pub fn run_pending(&self) -> usize {
        let _activation = Activation::enter(&self.active);
        let mut handled = 0;
        while self.active.turn(false) {
            handled += 1;
        }
        handled
    }
}

/// A dedicated, named OS thread running an [`EventLoop`].
///
/// Dropping it stops the loop (after queued work drains) and joins.
pub struct LoopThread {
    handle: ThreadHandle,
    join: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn spawn(name: &str) -> std::io::Result<Self> {
        let (parts, handle) = LoopParts::new(name);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || EventLoop::from_parts(parts).run())?;
        Ok(Self {
            handle,
            join: Some(join),
        })
    }

    #[must_use]
    pub fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    /// Stop the loop and join its thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        // Already closed means the loop exited on its own.
        let _ = self.handle.request_stop();
        if join.thread().id() == thread::current().id() {
            return;
        }
        if join.join().is_err() {
            tracing::error!("Loop thread '{}' exited by panic", self.handle.name());
        }
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Sender half of a single-assignment completion slot.
///
/// Remembers the loop it was created on; completing it from anywhere else
/// delivers the value on that loop. Dropping it unfulfilled disconnects the
/// receiver.
pub(crate) struct Completion<T> {
    tx: oneshot::Sender<T>,
    owner: Option<ThreadHandle>,
    poller: Arc<PollerSlot>,
}

/// Receiver half of a completion slot.
pub(crate) struct ReplyReceiver<T> {
    rx: oneshot::Receiver<T>,
    owner: Option<u64>,
    poller: Arc<PollerSlot>,
}

/// Waker of a receiver polled on its owner loop. Woken when a delivery is
/// queued on that loop, since the oneshot itself only fires once the
/// delivery job runs.
type PollerSlot = Mutex<Option<Waker>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Disconnected;

pub(crate) fn completion_pair<T>() -> (Completion<T>, ReplyReceiver<T>)
where
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let owner = current_thread_handle();
    let owner_id = owner.as_ref().map(|handle| handle.id);
    let poller = Arc::new(Mutex::new(None));
    (
        Completion {
            tx,
            owner,
            poller: Arc::clone(&poller),
        },
        ReplyReceiver {
            rx,
            owner: owner_id,
            poller,
        },
    )
}

type Delivery<T> = Mutex<Option<(oneshot::Sender<T>, T)>>;

fn deliver<T>(slot: &Delivery<T>) {
    let taken = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some((tx, value)) = taken {
        // Receiver gone means nobody is waiting any more.
        let _ = tx.send(value);
    }
}

impl<T> Completion<T>
where
    T: Send + 'static,
{
    pub(crate) fn owner(&self) -> Option<&ThreadHandle> {
        self.owner.as_ref()
    }

    pub(crate) fn complete(self, value: T) {
        let Self { tx, owner, poller } = self;
        match owner {
            Some(owner) if !owner.is_current() => {
                let slot: Arc<Delivery<T>> = Arc::new(Mutex::new(Some((tx, value))));
                let remote = Arc::clone(&slot);
                if owner.run_async(move || deliver(&remote)).is_err() {
                    // Owner loop is gone; hand the value over from here.
                    deliver(&slot);
                    return;
                }
                let waker = poller.lock().unwrap_or_else(PoisonError::into_inner).take();
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
            _ => {
                let _ = tx.send(value);
            }
        }
    }
}

impl<T> ReplyReceiver<T> {
    /// The owner loop, when the calling thread is currently running it.
    fn owner_loop(&self) -> Option<Rc<ActiveLoop>> {
        current_loop().filter(|active| Some(active.id) == self.owner)
    }

    /// Block until the value arrives.
    ///
    /// On the owning loop thread, keeps running that loop's jobs while
    /// waiting. Elsewhere it is a plain blocking receive, which must not be
    /// called from inside an async runtime.
    pub(crate) fn wait(mut self) -> Result<T, Disconnected> {
        let Some(active) = self.owner_loop() else {
            return self.rx.blocking_recv().map_err(|_| Disconnected);
        };

        loop {
            match self.rx.try_recv() {
                Ok(value) => return Ok(value),
                Err(oneshot::error::TryRecvError::Closed) => return Err(Disconnected),
                Err(oneshot::error::TryRecvError::Empty) => {}
            }
            if !active.turn(true) {
                return self.rx.blocking_recv().map_err(|_| Disconnected);
            }
        }
    }

    pub(crate) fn try_take(&mut self) -> Option<Result<T, Disconnected>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Disconnected)),
        }
    }
}

/// Polled on the owning loop thread, each poll first runs the jobs already
/// queued on that loop (which includes the delivery hop), and a queued
/// delivery wakes the task. Awaiting a reply on the loop that issued the
/// call is therefore supported.
impl<T> Future for ReplyReceiver<T> {
    type Output = Result<T, Disconnected>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(active) = self.owner_loop() {
            // Register before draining so a delivery queued after the drain
            // still finds the waker.
            {
                let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
                match poller.as_ref() {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    _ => *poller = Some(cx.waker().clone()),
                }
            }
            while active.turn(false) {}
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| Disconnected))
    }
}
