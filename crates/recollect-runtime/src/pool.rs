//! Bounded pool for background maintenance jobs

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use recollect_core::{MemoryError, Result};

use crate::config::WorkerConfig;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs submitted jobs with at most `concurrency` in flight.
///
/// `submit` never waits: jobs go into a bounded queue and a full queue is
/// reported as `MemoryError::QueueFull`, so the request path can drop the
/// maintenance for this turn and let the next turn retry it.
pub struct MaintenancePool {
    tx: mpsc::Sender<Job>,
    dispatcher: JoinHandle<()>,
    concurrency: usize,
}

impl MaintenancePool {
    /// Must be called from within a tokio runtime.
    pub fn new(concurrency: usize, queue_capacity: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(concurrency));
        let dispatcher = tokio::spawn(dispatch(rx, permits, concurrency));
        Self {
            tx,
            dispatcher,
            concurrency,
        }
    }

    /// Pool sized by the `workers` config section.
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.concurrency, config.queue_capacity)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn submit<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx.try_send(Box::pin(job)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MemoryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                MemoryError::Other("maintenance pool is shut down".to_string())
            }
        })
    }

    /// Stop accepting jobs and wait for queued and running ones to finish.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.dispatcher.await {
            warn!(error = %e, "Maintenance dispatcher ended abnormally");
        }
    }
}

async fn dispatch(mut rx: mpsc::Receiver<Job>, permits: Arc<Semaphore>, concurrency: usize) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }

    // drain: every permit back means every job has finished
    if permits.acquire_many(concurrency as u32).await.is_ok() {
        debug!("Maintenance pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_runs_jobs_with_bounded_concurrency() {
        let pool = MaintenancePool::new(2, 16);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let (running, peak, done) = (running.clone(), peak.clone(), done.clone());
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_workers_section_bounds_the_pool() {
        let yaml = "workers:\n  concurrency: 1\n  queue_capacity: 1\n";
        let config = crate::RecollectConfig::from_yaml_str(yaml).unwrap();
        let pool = MaintenancePool::from_config(&config.workers);
        assert_eq!(pool.concurrency(), 1);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());

        let (r, p, g) = (running.clone(), peak.clone(), gate.clone());
        pool.submit(async move {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            g.notified().await;
            r.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // one waiting on the dispatcher, one in the single queue slot
        let (r, p) = (running.clone(), peak.clone());
        pool.submit(async move {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            r.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.submit(async {}).unwrap();
        assert!(matches!(pool.submit(async {}), Err(MemoryError::QueueFull)));

        gate.notify_one();
        pool.shutdown().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_is_rejected_immediately() {
        let pool = MaintenancePool::new(1, 1);
        let gate = Arc::new(tokio::sync::Notify::new());

        // occupies the only worker
        let g = gate.clone();
        pool.submit(async move { g.notified().await }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the dispatcher holds this one while waiting for a permit
        pool.submit(async {}).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.submit(async {}).unwrap();
        let err = pool.submit(async {}).unwrap_err();
        assert!(matches!(err, MemoryError::QueueFull));

        gate.notify_one();
        pool.shutdown().await;
    }
}
