//! Serial execution queues that contexts are confined to.
//!
//! # Responsibility
//! - Run jobs for one confinement domain (UI queue, writer queue, one queue
//!   per background context) in submission order.
//! - Answer whether the calling thread is inside that domain.
//!
//! # Invariants
//! - A `QueuedExecutor` owns exactly one worker thread; jobs never overlap.
//! - `execute_and_wait` on the executor's own thread runs inline, so nested
//!   waits cannot deadlock.
//! - A `SynchronousExecutor` runs everything inline on the caller and treats
//!   every thread as current; it is the test-mode executor.

use crate::fatal::fatal;
use log::debug;
use parking_lot::Mutex;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, ThreadId};

/// Unit of work scheduled on an executor.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// One serial confinement domain.
pub trait Executor: Send + Sync {
    fn label(&self) -> &str;
    /// Schedules `job` without waiting for it.
    fn execute(&self, job: Job);
    /// Runs `job` and returns once it has finished.
    fn execute_and_wait(&self, job: Job);
    /// Returns whether the calling thread is inside this domain.
    fn is_current(&self) -> bool;
}

/// Runs every job inline on the calling thread.
#[derive(Debug, Clone)]
pub struct SynchronousExecutor {
    label: String,
}

impl SynchronousExecutor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Executor for SynchronousExecutor {
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(&self, job: Job) {
        job();
    }

    fn execute_and_wait(&self, job: Job) {
        job();
    }

    fn is_current(&self) -> bool {
        true
    }
}

/// Serial queue backed by one dedicated worker thread.
///
/// The worker exits once the executor is dropped and queued jobs have run.
pub struct QueuedExecutor {
    label: String,
    sender: Mutex<Sender<Job>>,
    worker: ThreadId,
}

impl QueuedExecutor {
    /// Spawns the worker thread, named after `label`.
    ///
    /// # Panics
    /// - Panics (fatal) when the OS refuses to spawn a thread.
    pub fn spawn(label: impl Into<String>) -> Self {
        let label = label.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker_label = label.clone();
        let handle = thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                for job in receiver {
                    job();
                }
                debug!("event=queue_stop module=executor status=ok queue={worker_label}");
            });

        let worker = match handle {
            Ok(handle) => handle.thread().id(),
            Err(err) => fatal(
                "queue_spawn",
                format!("failed to spawn serial queue `{label}`: {err}"),
            ),
        };
        debug!("event=queue_start module=executor status=ok queue={label}");

        Self {
            label,
            sender: Mutex::new(sender),
            worker,
        }
    }
}

impl Executor for QueuedExecutor {
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(&self, job: Job) {
        if self.sender.lock().send(job).is_err() {
            fatal(
                "queue_execute",
                format!("serial queue `{}` is no longer running", self.label),
            );
        }
    }

    fn execute_and_wait(&self, job: Job) {
        if self.is_current() {
            job();
            return;
        }

        let (done_tx, done_rx) = mpsc::channel::<()>();
        self.execute(Box::new(move || {
            job();
            let _ = done_tx.send(());
        }));
        if done_rx.recv().is_err() {
            fatal(
                "queue_wait",
                format!("serial queue `{}` stopped before finishing a job", self.label),
            );
        }
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.worker
    }
}

impl std::fmt::Debug for QueuedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedExecutor")
            .field("label", &self.label)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Executor, QueuedExecutor, SynchronousExecutor};
    use parking_lot::Mutex;
    use std::sync::mpsc;
    use std::sync::Arc;

    #[test]
    fn synchronous_executor_runs_inline() {
        let executor = SynchronousExecutor::new("sync");
        let ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&ran);
        executor.execute(Box::new(move || *flag.lock() = true));
        assert!(*ran.lock());
        assert!(executor.is_current());
    }

    #[test]
    fn queued_executor_preserves_submission_order() {
        let executor = QueuedExecutor::spawn("datastack.test.order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        for index in 0..32 {
            let seen = Arc::clone(&seen);
            executor.execute(Box::new(move || seen.lock().push(index)));
        }
        executor.execute_and_wait(Box::new(|| {}));

        assert_eq!(*seen.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn queued_executor_knows_its_own_thread() {
        let executor = Arc::new(QueuedExecutor::spawn("datastack.test.current"));
        assert!(!executor.is_current());

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&executor);
        executor.execute_and_wait(Box::new(move || {
            tx.send(inner.is_current()).unwrap();
        }));
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn nested_wait_on_own_queue_runs_inline() {
        let executor = Arc::new(QueuedExecutor::spawn("datastack.test.nested"));
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&executor);
        executor.execute_and_wait(Box::new(move || {
            let tx = tx.clone();
            inner.execute_and_wait(Box::new(move || tx.send("nested").unwrap()));
        }));
        assert_eq!(rx.recv().unwrap(), "nested");
    }
}
