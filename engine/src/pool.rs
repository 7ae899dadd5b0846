//! Fixed-size worker pool over a shared FIFO queue.
//!
//! The pool knows nothing about call correlation or envelopes. Jobs report
//! their own outcome; a panicking job is logged and swallowed here so a
//! worker thread never dies with it.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queue {
    jobs: VecDeque<Job>,
    stopping: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers named `{name}-{index}`.
    pub fn new(name: &str, threads: usize) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                jobs: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
        });

        let pool = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(threads)),
            size: threads,
        };

        for index in 0..threads {
            let shared = Arc::clone(&pool.shared);
            // On spawn failure `pool` drops here, which stops and joins the
            // workers already started.
            let handle = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&shared))?;
            pool.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }

        tracing::debug!("Worker pool '{name}' started with {threads} threads");
        Ok(pool)
    }

    /// Queue a job. Returns `false` (and drops the job) once shutdown has
    /// been requested.
    pub fn enqueue<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.shared.lock();
            if queue.stopping {
                tracing::debug!("Worker pool is stopping; dropping job");
                return false;
            }
            queue.jobs.push_back(Box::new(job));
        }
        self.shared.available.notify_one();
        true
    }

    /// Stop accepting jobs, let the workers drain the queue, and join them.
    ///
    /// Idempotent. Called from a worker thread, that worker is not joined.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            queue.stopping = true;
        }
        self.shared.available.notify_all();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("Worker thread exited by panic");
            }
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs waiting for a worker (not counting running ones).
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.lock().stopping
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut queue = shared.lock();
            while !queue.stopping && queue.jobs.is_empty() {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            match queue.jobs.pop_front() {
                Some(job) => job,
                // stopping and drained
                None => return,
            }
        };

        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::error!(
                "Worker job panicked: {}",
                panic_message(payload.as_ref()).unwrap_or("unknown panic")
            );
        }
    }
}

/// Counting gate for the bounded concurrency mode.
pub(crate) struct SlotGate {
    free: Mutex<usize>,
    released: Condvar,
    capacity: usize,
}

impl SlotGate {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(capacity),
            released: Condvar::new(),
            capacity,
        })
    }

    /// Block until a slot is free and claim it.
    pub(crate) fn acquire(self: &Arc<Self>) -> SlotPermit {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        while *free == 0 {
            free = self
                .released
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *free -= 1;
        SlotPermit {
            gate: Arc::clone(self),
        }
    }

    pub(crate) fn in_use(&self) -> usize {
        self.capacity - *self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A claimed slot; released on drop.
pub(crate) struct SlotPermit {
    gate: Arc<SlotGate>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        {
            let mut free = self.gate.free.lock().unwrap_or_else(PoisonError::into_inner);
            *free += 1;
        }
        self.gate.released.notify_one();
    }
}
