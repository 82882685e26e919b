//! The bundle of bounded queues connecting the pipeline stages.
//!
//! Every blocking wait is timed so a stage observes `graceful_stop` within
//! one poll interval. Each queue has one consuming stage in the pipeline
//! topology, but nothing here forbids extra producers.

use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use gridpilot_core::job::Job;

/// Default depth of each queue.
pub const QUEUE_CAPACITY: usize = 100;

/// How long a stage blocks on a queue before re-checking its flags.
pub const QUEUE_POLL: Duration = Duration::from_millis(500);

/// A bounded FIFO with timed gets.
pub struct Queue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T: Send> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Enqueue, waiting for space. Returns false only when the queue is
    /// closed, which does not happen while the bundle is alive.
    pub async fn put(&self, item: T) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Dequeue with a timeout; `None` on timeout.
    pub async fn get(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Non-blocking dequeue.
    pub fn try_get(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        rx.try_recv().ok()
    }
}

/// All queues of the pipeline, created once by the orchestrator.
pub struct Queues {
    /// Acquired jobs awaiting validation.
    pub jobs: Queue<Job>,
    /// Validated jobs awaiting stage-in.
    pub data_in: Queue<Job>,
    /// Jobs whose payload finished, awaiting stage-out.
    pub data_out: Queue<Job>,
    /// Jobs with inputs in place, awaiting the monitor stage.
    pub validated_jobs: Queue<Job>,
    /// Monitor-internal: payloads accepted for execution.
    pub monitored_payloads: Queue<Job>,
    /// Published successful jobs.
    pub finished_jobs: Queue<Job>,
    /// Stage-in completions (accounting trail).
    pub finished_data_in: Queue<Job>,
    /// Stage-out completions awaiting publication.
    pub finished_data_out: Queue<Job>,
    /// Published failed jobs.
    pub failed_jobs: Queue<Job>,
    /// Stage-in failures awaiting publication.
    pub failed_data_in: Queue<Job>,
    /// Stage-out failures awaiting publication.
    pub failed_data_out: Queue<Job>,
    /// Jobs whose terminal state reached the server.
    pub completed_jobs: Queue<Job>,
    pub completed_jobids: Queue<i64>,
}

impl Queues {
    pub fn new(capacity: usize) -> Self {
        Self {
            jobs: Queue::new(capacity),
            data_in: Queue::new(capacity),
            data_out: Queue::new(capacity),
            validated_jobs: Queue::new(capacity),
            monitored_payloads: Queue::new(capacity),
            finished_jobs: Queue::new(capacity),
            finished_data_in: Queue::new(capacity),
            finished_data_out: Queue::new(capacity),
            failed_jobs: Queue::new(capacity),
            failed_data_in: Queue::new(capacity),
            failed_data_out: Queue::new(capacity),
            completed_jobs: Queue::new(capacity),
            completed_jobids: Queue::new(capacity),
        }
    }
}

impl Default for Queues {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue: Queue<i64> = Queue::new(8);
        queue.put(1).await;
        queue.put(2).await;
        assert_eq!(queue.get(QUEUE_POLL).await, Some(1));
        assert_eq!(queue.try_get(), Some(2));
        assert_eq!(queue.try_get(), None);
    }

    #[tokio::test]
    async fn timed_get_returns_within_the_poll_interval() {
        let queue: Queue<i64> = Queue::new(1);
        let started = std::time::Instant::now();
        assert_eq!(queue.get(Duration::from_millis(50)).await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
