// src/pool.rs
//! Fixed-size worker pool over one bounded FIFO queue.
//!
//! The reactor is the only producer; worker threads are the only consumers.
//! A mutex guards the queue and a counting semaphore tracks how many tasks
//! are waiting, so an idle worker sleeps until there is something to pop.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{SkiffError, SkiffResult};
use crate::sync::Semaphore;

/// A unit of work executed on a pool thread.
pub trait Task: Send + 'static {
    fn run(self);
}

struct Shared<T> {
    queue: Mutex<VecDeque<T>>,
    pending: Semaphore,
    stop: AtomicBool,
    max_queue: usize,
}

pub struct WorkerPool<T: Task> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Task> WorkerPool<T> {
    pub fn new(workers: usize, max_queue: usize) -> SkiffResult<Self> {
        if workers == 0 || max_queue == 0 {
            return Err(SkiffError::Config(format!(
                "worker pool needs at least one thread and one queue slot (got {workers} threads, {max_queue} slots)"
            )));
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(max_queue)),
            pending: Semaphore::new(0),
            stop: AtomicBool::new(false),
            max_queue,
        });

        // Built incrementally so a failed spawn still stops the threads
        // already running when `pool` is dropped.
        let mut pool = Self {
            shared,
            handles: Vec::with_capacity(workers),
        };

        for i in 0..workers {
            let shared = pool.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("skiff-worker-{}", i))
                .spawn(move || work(i, shared))?;
            pool.handles.push(handle);
        }

        Ok(pool)
    }

    /// Queue a task. When the queue is at its bound the task is handed back.
    pub fn submit(&self, task: T) -> Result<(), T> {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.max_queue {
            return Err(task);
        }
        queue.push_back(task);
        drop(queue);
        self.shared.pending.release(1);
        Ok(())
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Tasks waiting to be picked up.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

fn work<T: Task>(id: usize, shared: Arc<Shared<T>>) {
    debug!(worker = id, "worker started");
    loop {
        shared.pending.acquire();
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        let Some(task) = shared.queue.lock().pop_front() else {
            continue;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!(worker = id, "task panicked");
        }
    }
    debug!(worker = id, "worker exiting");
}

impl<T: Task> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.pending.release(self.handles.len());
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
