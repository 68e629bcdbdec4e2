use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// FIFO worker pool: jobs start in submission order, at most `limit` at a time.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl JobQueue {
    /// Spawns the dispatcher; must be called from within a tokio runtime.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let semaphore = Arc::new(Semaphore::new(limit));
        let permits = semaphore.clone();
        tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                tokio::spawn(async move {
                    job.await;
                    drop(permit);
                });
            }
            tracing::debug!("job queue dispatcher stopped");
        });
        Self {
            sender,
            semaphore,
            limit,
        }
    }

    /// Returns `false` when the dispatcher is gone and the job was dropped.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender.send(Box::pin(job)).is_ok()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn idle_slots(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn never_runs_more_than_limit() {
        let queue = JobQueue::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for _ in 0..6 {
            let active = active.clone();
            let peak = peak.clone();
            let done_tx = done_tx.clone();
            assert!(queue.submit(async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                let _ = done_tx.send(());
            }));
        }
        for _ in 0..6 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(queue.limit(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_start_in_submission_order() {
        let queue = JobQueue::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        for idx in 0..5 {
            let order = order.clone();
            let done_tx = done_tx.clone();
            queue.submit(async move {
                order.lock().unwrap().push(idx);
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = done_tx.send(());
            });
        }
        for _ in 0..5 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn zero_limit_is_clamped_to_one() {
        let queue = JobQueue::new(0);
        assert_eq!(queue.limit(), 1);
        assert_eq!(queue.idle_slots(), 1);
    }
}
