// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-worker command executor (C3): exactly one TPM command may be in
//! flight at a time. Jobs are handed to the worker over a channel; a
//! `busy` flag plus condition variable remains the completion signal so
//! callers on arbitrary threads can block-wait on it without holding onto
//! a receiver.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{VtpmError, VtpmResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded wait per poll cycle, tolerating a lost wakeup rather than
/// blocking `wait_done` forever.
const WAIT_POLL: Duration = Duration::from_secs(1);

struct Shared {
    busy: Mutex<bool>,
    done: Condvar,
}

/// The dedicated worker thread plus its busy/idle handshake.
pub struct WorkerExecutor {
    shared: Arc<Shared>,
    sender: mpsc::Sender<Job>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerExecutor {
    /// Spawn the single worker thread.
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            busy: Mutex::new(false),
            done: Condvar::new(),
        });
        let (sender, receiver) = mpsc::channel::<Job>();

        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("vtpm-worker".into())
            .spawn(move || {
                for job in receiver {
                    job();
                    let mut busy = worker_shared.busy.lock();
                    *busy = false;
                    worker_shared.done.notify_all();
                }
            })
            .expect("failed to spawn vtpm worker thread");

        Self {
            shared,
            sender,
            handle: Some(handle),
        }
    }

    /// Dispatch `job` to the worker. Fails with `Busy` if a command is
    /// already in flight.
    pub fn submit(&self, job: Job) -> VtpmResult<()> {
        let mut busy = self.shared.busy.lock();
        if *busy {
            return Err(VtpmError::Busy);
        }
        *busy = true;
        drop(busy);

        // The receiving end only goes away once the worker thread itself
        // has exited, which only happens from `shutdown`.
        self.sender.send(job).expect("vtpm worker thread exited unexpectedly");
        Ok(())
    }

    /// Block until the worker is idle, polling in bounded cycles to
    /// tolerate a lost wakeup.
    pub fn wait_done(&self) {
        let mut busy = self.shared.busy.lock();
        while *busy {
            let result = self.shared.done.wait_for(&mut busy, WAIT_POLL);
            let _ = result;
        }
    }

    /// Whether a command is currently in flight.
    pub fn is_busy(&self) -> bool {
        *self.shared.busy.lock()
    }

    /// Drain any in-flight command, then tear down the worker thread.
    pub fn shutdown(mut self) {
        self.wait_done();
        drop(self.sender);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_submitted_job_and_reports_idle() {
        let worker = WorkerExecutor::start();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        worker.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        worker.wait_done();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!worker.is_busy());
        worker.shutdown();
    }

    #[test]
    fn rejects_overlapping_submit() {
        let worker = WorkerExecutor::start();
        let (tx, rx) = mpsc::channel::<()>();
        worker
            .submit(Box::new(move || {
                let _ = rx.recv();
            }))
            .unwrap();

        // Worker is now blocked inside the job until we send on `tx`.
        let err = worker.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, VtpmError::Busy));

        tx.send(()).unwrap();
        worker.wait_done();
        worker.shutdown();
    }
}
