//! Bounded lookup worker pool
//!
//! Upstream resolutions run on a fixed set of workers fed by a bounded
//! queue. When the queue is full the job runs on a directly spawned task
//! instead, so a burst of distinct lookups can never drop a request.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) struct WorkerPool {
    tx: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawn `workers` tasks sharing a queue of `2 * workers` slots.
    pub(crate) fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<Job>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for _ in 0..workers {
            let rx = Arc::clone(&rx);
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }

        Self { tx }
    }

    pub(crate) fn submit(&self, job: Job) {
        match self.tx.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job))
            | Err(mpsc::error::TrySendError::Closed(job)) => {
                tokio::spawn(job);
            }
        }
    }
}
