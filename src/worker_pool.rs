//! Fixed pool of persistent per-device worker threads
//!
//! [`WorkerPool`] owns exactly one thread per logical device index. Each
//! call to [`run_parallel`](WorkerPool::run_parallel) dispatches one task
//! instance per worker and blocks until every task has finished — siblings
//! are never cancelled early, so a failure report always describes a
//! settled state. The first failure (by device index) is returned wrapped
//! as [`Error::Worker`] with the owning device index attached.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Worker {
    job_tx: Option<Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

/// A fixed-size pool of persistent worker threads, one per device index.
pub struct WorkerPool {
    workers: Vec<Worker>,
    done_rx: Receiver<(usize, Result<()>)>,
}

impl WorkerPool {
    /// Spawn `size` persistent workers bound to indices `[0, size)`.
    ///
    /// # Errors
    /// Returns an error if a worker thread cannot be spawned.
    pub fn init(size: usize) -> Result<Self> {
        let (done_tx, done_rx) = mpsc::channel();
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let (job_tx, job_rx) = mpsc::channel::<Job>();
            let done_tx = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("device-worker-{index}"))
                .spawn(move || {
                    for job in job_rx.iter() {
                        // The job (and everything it captured) is dropped
                        // before the result is reported, so callers that see
                        // all results know no task still borrows shared state.
                        let result = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                            Err(Error::Other("worker task panicked".into()))
                        });
                        if done_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|e| Error::Other(format!("spawn device worker {index} failed: {e}")))?;

            workers.push(Worker {
                job_tx: Some(job_tx),
                handle: Some(handle),
            });
        }

        Ok(Self { workers, done_rx })
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Run one instance of `task` on every worker, passing each its own
    /// index, and block until all have finished.
    ///
    /// All task instances run to completion even if some fail. Failures are
    /// then reported in device-index order, wrapped as [`Error::Worker`].
    ///
    /// # Errors
    /// Returns the lowest-indexed task failure, if any.
    pub fn run_parallel<F>(&self, task: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Send + Sync + 'static,
    {
        let task = Arc::new(task);

        for (index, worker) in self.workers.iter().enumerate() {
            let task = Arc::clone(&task);
            let job: Job = Box::new(move || task(index));
            worker
                .job_tx
                .as_ref()
                .ok_or_else(|| Error::Other(format!("device worker {index} has shut down")))?
                .send(job)
                .map_err(|_| Error::Other(format!("device worker {index} has exited")))?;
        }

        let mut results: Vec<Option<Result<()>>> = (0..self.workers.len()).map(|_| None).collect();
        for _ in 0..self.workers.len() {
            match self.done_rx.recv() {
                Ok((index, result)) => results[index] = Some(result),
                // A worker died without reporting; the None slot below
                // turns into an error.
                Err(_) => break,
            }
        }

        for (device, slot) in results.into_iter().enumerate() {
            match slot {
                Some(Ok(())) => {}
                Some(Err(source)) => {
                    return Err(Error::Worker {
                        device,
                        source: Box::new(source),
                    })
                }
                None => {
                    return Err(Error::Worker {
                        device,
                        source: Box::new(Error::Other(
                            "worker exited without reporting a result".into(),
                        )),
                    })
                }
            }
        }
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing each job channel ends that worker's receive loop.
        for worker in &mut self.workers {
            worker.job_tx.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}
