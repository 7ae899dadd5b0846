use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies one registered callback so it can be withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct CancelKey(u64);

#[derive(Default)]
struct Callbacks {
    next_key: u64,
    pending: BTreeMap<CancelKey, Callback>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

/// Shared cancellation flag for one or more bridged calls.
///
/// Cloning shares the flag. Cancelling rejects every call the token was
/// passed to that has not settled yet.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn callbacks(&self) -> MutexGuard<'_, Callbacks> {
        self.inner
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cancel(&self) {
        let callbacks = {
            let mut callbacks = self.callbacks();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut callbacks.pending)
        };
        for callback in callbacks.into_values() {
            callback();
        }
    }

    /// Run `callback` on cancellation; immediately if already cancelled, in
    /// which case no key is returned.
    pub(crate) fn on_cancel<F>(&self, callback: F) -> Option<CancelKey>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut callbacks = self.callbacks();
            if !self.inner.cancelled.load(Ordering::Acquire) {
                let key = CancelKey(callbacks.next_key);
                callbacks.next_key += 1;
                callbacks.pending.insert(key, Box::new(callback));
                return Some(key);
            }
        }
        callback();
        None
    }

    /// Withdraw a callback that is no longer needed. No-op once it has run.
    pub(crate) fn forget(&self, key: CancelKey) {
        let removed = self.callbacks().pending.remove(&key);
        // Dropped outside the lock.
        drop(removed);
    }

    /// Callbacks still waiting for a cancel.
    #[cfg(test)]
    pub(crate) fn registered(&self) -> usize {
        self.callbacks().pending.len()
    }
}
