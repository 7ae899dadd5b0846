//! Timeouts for bridged calls: one thread sleeping until the earliest
//! deadline.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use hostbridge_types::CallId;

type ExpireFn = Box<dyn Fn(CallId) + Send + 'static>;

struct WatchState {
    deadlines: BinaryHeap<Reverse<(Instant, CallId)>>,
    stopping: bool,
}

struct Shared {
    state: Mutex<WatchState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct DeadlineWatcher {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl DeadlineWatcher {
    /// `on_expire` runs on the watcher thread, without the watcher lock held.
    pub(crate) fn spawn(name: &str, on_expire: ExpireFn) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(WatchState {
                deadlines: BinaryHeap::new(),
                stopping: false,
            }),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || watch_loop(&worker, &on_expire))?;
        Ok(Self {
            shared,
            join: Some(join),
        })
    }

    pub(crate) fn watch(&self, id: CallId, deadline: Instant) {
        {
            let mut state = self.shared.lock();
            if state.stopping {
                return;
            }
            state.deadlines.push(Reverse((deadline, id)));
        }
        self.shared.changed.notify_one();
    }

    #[cfg(test)]
    fn watched(&self) -> usize {
        self.shared.lock().deadlines.len()
    }

    /// Stop without firing the remaining deadlines.
    pub(crate) fn stop(&mut self) {
        let Some(join) = self.join.take() else {
            return;
        };
        {
            let mut state = self.shared.lock();
            state.stopping = true;
            state.deadlines.clear();
        }
        self.shared.changed.notify_all();
        if join.thread().id() != thread::current().id() && join.join().is_err() {
            tracing::error!("Deadline watcher exited by panic");
        }
    }
}

impl Drop for DeadlineWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(shared: &Shared, on_expire: &ExpireFn) {
    let mut state = shared.lock();
    loop {
        if state.stopping {
            return;
        }
        let now = Instant::now();
        match state.deadlines.peek().copied() {
            None => {
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(Reverse((deadline, id))) if deadline <= now => {
                state.deadlines.pop();
                drop(state);
                on_expire(id);
                state = shared.lock();
            }
            Some(Reverse((deadline, _))) => {
                state = shared
                    .changed
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }
}
