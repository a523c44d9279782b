//! Fixed set of worker threads fed by a bounded queue

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, warn};

use crate::error::{Result, RteError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// `submit` blocks while the queue is full
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(capacity);
        let mut threads = Vec::with_capacity(workers);
        for id in 0..workers.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("rte-worker-{}", id))
                .spawn(move || {
                    for job in receiver.iter() {
                        debug!(worker = id, "running job");
                        job();
                    }
                    debug!(worker = id, "worker exiting");
                })?;
            threads.push(handle);
        }
        Ok(WorkerPool {
            sender: Some(sender),
            threads,
        })
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RteError::Internal("worker pool is shut down".to_string()))?;
        sender
            .send(Box::new(job))
            .map_err(|_| RteError::Internal("worker pool is shut down".to_string()))
    }

    /// Let queued jobs drain, then join every thread
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
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
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_every_job() {
        let mut pool = WorkerPool::new(3, 2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(done.load(Ordering::SeqCst), 20);
        assert!(pool.submit(|| {}).is_err());
    }
}
