//! Call-id correlation: which outstanding bridged call a host reply
//! belongs to.
//!
//! Registration (id allocation + insertion) happens under the table lock;
//! fulfilling a slot happens after the entry has been removed and the lock
//! released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use hostbridge_types::{CallId, HostValue};
use serde::de::DeserializeOwned;

use crate::dispatch::{Completion, Disconnected, ReplyReceiver, ThreadHandle, completion_pair};
use crate::error::CallError;

pub type CallResult = Result<HostValue, CallError>;

/// How many timed-out or cancelled ids are remembered for telling a late
/// reply apart from a duplicate. Older ones fall back to
/// [`Settlement::AlreadySettled`].
pub const EXPIRED_MEMORY: usize = 4096;

type SettleHook = Box<dyn FnOnce() + Send + 'static>;

/// What happened to a completion handed to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The waiting call was found and fulfilled.
    Delivered,
    /// The id was issued but its call had already been settled by the host.
    AlreadySettled,
    /// The id's call had already timed out or been cancelled.
    Expired,
    /// The id was never issued by this table.
    NeverIssued,
}

impl Settlement {
    #[must_use]
    pub fn is_delivered(self) -> bool {
        self == Self::Delivered
    }
}

struct PendingCall {
    completion: Completion<CallResult>,
    registered_at: Instant,
    on_settle: Vec<SettleHook>,
}

impl PendingCall {
    /// Hooks run before the waiter can observe the outcome.
    fn fulfil(self, outcome: CallResult) {
        for hook in self.on_settle {
            hook();
        }
        self.completion.complete(outcome);
    }
}

/// Recently expired ids, oldest first, capped at [`EXPIRED_MEMORY`].
#[derive(Default)]
struct ExpiredIds {
    ids: HashSet<CallId>,
    order: VecDeque<CallId>,
}

impl ExpiredIds {
    fn insert(&mut self, id: CallId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > EXPIRED_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, id: CallId) -> bool {
        if !self.ids.remove(&id) {
            return false;
        }
        if let Some(at) = self.order.iter().position(|queued| *queued == id) {
            self.order.remove(at);
        }
        true
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

struct TableState {
    next_id: u64,
    calls: HashMap<CallId, PendingCall>,
    expired: ExpiredIds,
}

pub struct PendingCallTable {
    state: Mutex<TableState>,
}

impl Default for PendingCallTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCallTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                next_id: 1,
                calls: HashMap::new(),
                expired: ExpiredIds::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next id and park a fresh completion slot under it.
    ///
    /// The slot remembers the calling loop thread (if any) so the reply is
    /// delivered there.
    pub fn register(&self) -> (CallId, PendingReply) {
        let (completion, receiver) = completion_pair();
        let mut state = self.lock();
        let id = CallId::new(state.next_id);
        state.next_id += 1;
        state.calls.insert(
            id,
            PendingCall {
                completion,
                registered_at: Instant::now(),
                on_settle: Vec::new(),
            },
        );
        drop(state);

        tracing::trace!("Registered call {id}");
        (id, PendingReply { id, receiver })
    }

    /// Run `hook` once call `id` settles, however it settles. Runs it right
    /// away when the call is no longer pending.
    pub(crate) fn on_settle<F>(&self, id: CallId, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.lock();
            if let Some(call) = state.calls.get_mut(&id) {
                call.on_settle.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    pub fn take_and_resolve(&self, id: CallId, value: HostValue) -> Settlement {
        self.settle(id, Ok(value), false)
    }

    pub fn take_and_reject(&self, id: CallId, error: CallError) -> Settlement {
        self.settle(id, Err(error), false)
    }

    /// Reject a call on the engine's own initiative (timeout, cancellation).
    /// A later host reply for the id reports [`Settlement::Expired`].
    pub fn expire(&self, id: CallId, error: CallError) -> Settlement {
        self.settle(id, Err(error), true)
    }

    fn settle(&self, id: CallId, outcome: CallResult, expiring: bool) -> Settlement {
        let (call, settlement) = {
            let mut state = self.lock();
            match state.calls.remove(&id) {
                Some(call) => {
                    if expiring {
                        state.expired.insert(id);
                    }
                    (Some(call), Settlement::Delivered)
                }
                // Only a host reply consumes the late-reply marker.
                None if !expiring && state.expired.remove(id) => (None, Settlement::Expired),
                None if id.value() > 0 && id.value() < state.next_id => {
                    (None, Settlement::AlreadySettled)
                }
                None => (None, Settlement::NeverIssued),
            }
        };

        if let Some(call) = call {
            tracing::trace!(
                "Settling call {id} after {:?} (owner: {})",
                call.registered_at.elapsed(),
                call.completion.owner().map_or("-", ThreadHandle::name)
            );
            call.fulfil(outcome);
        }
        settlement
    }

    /// Reject every outstanding call with [`CallError::Abandoned`].
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<(CallId, PendingCall)> = self.lock().calls.drain().collect();
        let count = drained.len();
        for (id, call) in drained {
            call.fulfil(Err(CallError::Abandoned(id)));
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, id: CallId) -> bool {
        self.lock().calls.contains_key(&id)
    }

    /// Ids of calls older than `age`, oldest first.
    #[must_use]
    pub fn older_than(&self, age: Duration) -> Vec<CallId> {
        let state = self.lock();
        let mut stale: Vec<(Instant, CallId)> = state
            .calls
            .iter()
            .filter(|(_, call)| call.registered_at.elapsed() >= age)
            .map(|(id, call)| (call.registered_at, *id))
            .collect();
        stale.sort();
        stale.into_iter().map(|(_, id)| id).collect()
    }
}

/// The caller's side of a bridged call.
///
/// Block with [`wait`](Self::wait) from ordinary threads, or `.await` it,
/// including on the loop thread that issued the call.
#[must_use = "a bridged call's reply is only observable through its PendingReply"]
pub struct PendingReply {
    id: CallId,
    receiver: ReplyReceiver<CallResult>,
}

impl fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingReply")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PendingReply {
    #[must_use]
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Block until the host replies (or the call times out, is cancelled,
    /// or is abandoned).
    ///
    /// Must not be called from inside an async runtime; `.await` instead.
    pub fn wait(self) -> CallResult {
        let id = self.id;
        self.receiver
            .wait()
            .unwrap_or_else(|Disconnected| Err(CallError::Abandoned(id)))
    }

    /// [`wait`](Self::wait), then decode the reply.
    pub fn wait_as<T: DeserializeOwned>(self) -> Result<T, CallError> {
        let value = self.wait()?;
        serde_json::from_value(value).map_err(|e| CallError::Decode(e.to_string()))
    }

    /// The outcome, if it has already arrived.
    pub fn try_take(&mut self) -> Option<CallResult> {
        let id = self.id;
        self.receiver
            .try_take()
            .map(|outcome| outcome.unwrap_or_else(|Disconnected| Err(CallError::Abandoned(id))))
    }
}

impl Future for PendingReply {
    type Output = CallResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|Disconnected| Err(CallError::Abandoned(id))))
    }
}
