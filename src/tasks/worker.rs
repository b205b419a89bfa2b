//! Background Worker
//!
//! A dedicated thread draining a bounded job queue. Producers never block:
//! a full or closed queue hands the job back to the caller.

use std::io;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Owner side of a worker thread and its queue.
pub(crate) struct Worker<J> {
    sender: Mutex<Option<mpsc::Sender<J>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: Mutex<Option<ThreadId>>,
}

impl<J: Send + 'static> Worker<J> {
    /// Creates the queue. The thread is started separately with [`Worker::start`]
    /// so the handler can refer back to whatever owns this worker.
    pub(crate) fn new(capacity: usize) -> (Self, mpsc::Receiver<J>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let worker = Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(None),
            thread_id: Mutex::new(None),
        };
        (worker, receiver)
    }

    /// Spawns the thread. It runs `handler` for every job until the queue is
    /// closed and drained.
    pub(crate) fn start<F>(&self, name: &str, mut receiver: mpsc::Receiver<J>, mut handler: F) -> io::Result<()>
    where
        F: FnMut(J) + Send + 'static,
    {
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            debug!(worker = %thread_name, "background worker started");
            while let Some(job) = receiver.blocking_recv() {
                handler(job);
            }
            debug!(worker = %thread_name, "background worker drained and stopped");
        })?;

        *self.thread_id.lock() = Some(handle.thread().id());
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Queues a job without blocking. Returns the job if it could not be queued.
    pub(crate) fn try_submit(&self, job: J) -> Result<(), J> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.try_send(job).map_err(|e| match e {
                TrySendError::Full(job) | TrySendError::Closed(job) => job,
            }),
            None => Err(job),
        }
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        *self.thread_id.lock() == Some(thread::current().id())
    }

    /// Closes the queue and waits for queued jobs to finish.
    ///
    /// Called from the worker thread itself, only closes the queue.
    pub(crate) fn shutdown(&self) {
        drop(self.sender.lock().take());

        if self.is_worker_thread() {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("background worker panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_worker_drains_queue_on_shutdown() {
        let (worker, receiver) = Worker::new(16);
        let processed = Arc::new(AtomicUsize::new(0));

        let counter = processed.clone();
        worker
            .start("test-worker", receiver, move |n: usize| {
                counter.fetch_add(n, Ordering::SeqCst);
            })
            .unwrap();

        for n in 1..=4 {
            assert!(worker.try_submit(n).is_ok());
        }
        worker.shutdown();

        assert_eq!(processed.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_submit_after_shutdown_returns_job() {
        let (worker, receiver) = Worker::new(4);
        worker.start("test-worker", receiver, |_: u8| {}).unwrap();
        worker.shutdown();
        worker.shutdown();

        assert_eq!(worker.try_submit(7), Err(7));
    }

    #[test]
    fn test_full_queue_returns_job() {
        let (worker, _receiver) = Worker::new(1);
        assert!(worker.try_submit(1u8).is_ok());
        assert_eq!(worker.try_submit(2u8), Err(2));
    }
}
