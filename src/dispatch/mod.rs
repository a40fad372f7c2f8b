#[cfg(test)]
mod dispatch_test;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const QUEUE_DEPTH: usize = 1024;

/// Bounded FIFO pool of workers draining submitted jobs.
///
/// Submission order is pick-up order; with more than one worker, completion
/// order is not guaranteed.
pub struct Dispatcher {
    job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let (job_tx, job_rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
        let job_rx = Arc::new(AsyncMutex::new(job_rx));

        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let job_rx = Arc::clone(&job_rx);
            workers.push(tokio::spawn(async move {
                log::trace!("Dispatch worker {id} started");
                loop {
                    let job = job_rx.lock().await.recv().await;
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
                log::trace!("Dispatch worker {id} exiting");
            }));
        }

        Arc::new(Dispatcher {
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Queues a job for the workers. Returns false once the pool is closed.
    pub async fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.job_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(Box::pin(job)).await.is_ok(),
            None => false,
        }
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn close(&self) {
        self.job_tx.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.job_tx.lock().is_none()
    }
}
