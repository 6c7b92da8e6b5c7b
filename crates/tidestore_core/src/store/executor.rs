//! Foreground job queue and the background writer thread.
//!
//! # Invariants
//! - Foreground jobs run only on the thread that created the queue.
//! - Background jobs run FIFO on a single worker thread.

use super::handle::StoreInner;
use super::{StoreError, StoreResult};
use log::{error, info};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

const WORKER_THREAD_NAME: &str = "tidestore-writer";

/// Job delivered to the foreground; receives the store it was posted on.
pub(crate) type ForegroundJob = Box<dyn FnOnce(&StoreInner) + Send + 'static>;
pub(crate) type BackgroundJob = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct ForegroundQueue {
    thread: ThreadId,
    sender: Sender<ForegroundJob>,
    receiver: Mutex<Receiver<ForegroundJob>>,
}

impl ForegroundQueue {
    /// Binds the foreground to the calling thread.
    pub(crate) fn bind_current() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            thread: thread::current().id(),
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn post(&self, job: ForegroundJob) {
        // The receiver lives as long as `self`, so sending cannot fail here.
        let _ = self.sender.send(job);
    }

    /// Runs every queued job without waiting. Returns the number run.
    pub(crate) fn drain(&self, store: &StoreInner) -> StoreResult<usize> {
        self.ensure_current("process_foreground")?;
        let mut ran = 0;
        while let Some(job) = self.try_next() {
            job(store);
            ran += 1;
        }
        Ok(ran)
    }

    /// Waits up to `timeout` for the first job, then drains the rest.
    pub(crate) fn drain_timeout(&self, store: &StoreInner, timeout: Duration) -> StoreResult<usize> {
        self.ensure_current("process_foreground_timeout")?;
        let deadline = Instant::now() + timeout;
        let first = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = self
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(remaining);
            match received {
                Ok(job) => break Some(job),
                Err(RecvTimeoutError::Timeout) if Instant::now() < deadline => continue,
                Err(_) => break None,
            }
        };

        let Some(first) = first else {
            return Ok(0);
        };
        first(store);
        Ok(1 + self.drain(store)?)
    }

    fn try_next(&self) -> Option<ForegroundJob> {
        self.receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    fn ensure_current(&self, operation: &'static str) -> StoreResult<()> {
        if self.is_current() {
            return Ok(());
        }
        Err(StoreError::WrongExecutionContext(operation))
    }
}

pub(crate) struct BackgroundWorker {
    sender: Option<Sender<BackgroundJob>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWorker {
    pub(crate) fn spawn() -> StoreResult<Self> {
        let (sender, receiver) = mpsc::channel::<BackgroundJob>();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    job();
                }
            })
            .map_err(StoreError::Worker)?;

        info!(
            "event=worker_start module=store status=ok thread={}",
            WORKER_THREAD_NAME
        );
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queues `job`; returns it back when the worker is gone.
    pub(crate) fn submit(&self, job: BackgroundJob) -> Result<(), BackgroundJob> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|err| err.0),
            None => Err(job),
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        drop(self.sender.take());
        let Some(handle) = self.handle.take() else {
            return;
        };
        // The last store reference may be released by a job on the worker
        // itself; joining there would wait on the current thread.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!(
                "event=worker_stop module=store status=error error_code=worker_panicked thread={}",
                WORKER_THREAD_NAME
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BackgroundWorker, ForegroundQueue, WORKER_THREAD_NAME};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn worker_runs_jobs_in_order_on_named_thread() {
        let worker = BackgroundWorker::spawn().unwrap();
        let (sender, receiver) = mpsc::channel();

        for index in 0..5 {
            let sender = sender.clone();
            let submitted = worker.submit(Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                sender.send((index, name)).unwrap();
            }));
            assert!(submitted.is_ok());
        }

        for expected in 0..5 {
            let (index, name) = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(index, expected);
            assert_eq!(name.as_deref(), Some(WORKER_THREAD_NAME));
        }
    }

    #[test]
    fn queue_is_bound_to_creating_thread() {
        let queue = Arc::new(ForegroundQueue::bind_current());
        assert!(queue.is_current());

        let remote = Arc::clone(&queue);
        let on_other_thread = thread::spawn(move || remote.is_current()).join().unwrap();
        assert!(!on_other_thread);
    }
}
