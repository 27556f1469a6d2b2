//! Execution substrate for reconciliation runs.
//!
//! The engine hands each run to an [`Executor`] and never waits on it.
//! [`WorkerPool`] is the production implementation: a fixed set of named
//! threads draining an unbounded queue.

use std::sync::Mutex;
use std::thread;

use crossbeam::channel::{Sender, unbounded};
use thiserror::Error;
use tracing::{debug, info};

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The executor has been shut down.
    #[error("executor is shut down")]
    ShutDown,
}

/// Fire-and-forget job submission.
pub trait Executor: Send + Sync {
    fn submit(&self, job: Job) -> Result<(), SubmitError>;
}

/// Holds the queue sender and worker handles.
/// Taken (`Option::take`) on shutdown to ensure single cleanup.
struct Workers {
    sender: Sender<Job>,
    handles: Vec<thread::JoinHandle<()>>,
}

pub struct WorkerPool {
    inner: Mutex<Option<Workers>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns `threads` workers named `vcfsync-reconcile-{n}`.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a thread.
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();

        let mut handles = Vec::with_capacity(threads);
        for id in 0..threads {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("vcfsync-reconcile-{id}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn reconcile worker");
            handles.push(handle);
        }
        // Workers hold their own receiver clones; drop ours.
        drop(receiver);

        debug!(threads, "worker pool started");
        Self {
            inner: Mutex::new(Some(Workers { sender, handles })),
        }
    }

    /// Stops accepting jobs, lets the workers drain the queue, and joins
    /// them. Calling it again is harmless.
    pub fn shutdown(&self) {
        let workers = match self.inner.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(workers) = workers {
            drop(workers.sender);
            let count = workers.handles.len();
            let current = thread::current().id();
            for handle in workers.handles {
                // A worker dropping the last reference to the pool cannot join itself.
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
            info!(threads = count, "worker pool stopped");
        }
    }
}

impl Executor for WorkerPool {
    fn submit(&self, job: Job) -> Result<(), SubmitError> {
        let guard = self.inner.lock().map_err(|_| SubmitError::ShutDown)?;
        let workers = guard.as_ref().ok_or(SubmitError::ShutDown)?;
        workers.sender.send(job).map_err(|_| SubmitError::ShutDown)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_jobs_and_drains_on_shutdown() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.submit(Box::new(|| {})), Err(SubmitError::ShutDown));
    }

    #[test]
    fn workers_are_named() {
        let pool = WorkerPool::new(1);
        let (tx, rx) = crossbeam::channel::bounded(1);
        pool.submit(Box::new(move || {
            let _ = tx.send(thread::current().name().map(str::to_string));
        }))
        .unwrap();
        assert_eq!(rx.recv().unwrap().as_deref(), Some("vcfsync-reconcile-0"));
    }
}
