//! Fixed-size worker pool executing submitted closures.
//!
//! Workers hold only the shared queue endpoint and the closed flag; there is
//! no back-pointer to the pool. Tasks must be independent — per-connection
//! serialization is the reactor's job, not the pool's.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolShared {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    closed: AtomicBool,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(VecDeque::with_capacity(workers * 2)),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let shared = Arc::clone(&shared);
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let handle = thread::Builder::new()
                .name(format!("satie-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            debug!(worker = i, core = id.id, "worker pinned");
                        }
                    }
                    loop {
                        let job: Job = {
                            let mut queue = shared.queue.lock().unwrap();
                            while queue.is_empty() && !shared.closed.load(Ordering::Acquire) {
                                queue = shared.available.wait(queue).unwrap();
                            }
                            match queue.pop_front() {
                                Some(job) => job,
                                // Closed and drained.
                                None => return,
                            }
                        };
                        job();
                    }
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self { shared, handles }
    }

    /// Queue a closure for the next free worker. Returns false once the pool
    /// is shut down.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.push_back(Box::new(job));
        }
        self.shared.available.notify_one();
        true
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Cooperative shutdown: workers finish the queued backlog, then exit.
    pub fn shutdown(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.available.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
