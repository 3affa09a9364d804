// Deferred task queue seam. Delivery is at-least-once and never before `eta`.
use crate::checkin::CheckInId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionTask {
    pub check_in_id: CheckInId,
    // attempt number this task intends to perform; stale tasks are dropped by the driver
    pub sequence: u32,
    pub eta: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue full")]
    Full,
}

#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    async fn enqueue(&self, task: SubmissionTask) -> Result<(), QueueError>;

    // Remove and return every task whose eta has been reached, earliest first
    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<SubmissionTask>, QueueError>;
}

#[derive(Debug)]
pub struct InMemoryTaskQueue {
    tasks: Mutex<Vec<SubmissionTask>>,
    capacity: usize,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn next_eta(&self) -> Option<DateTime<Utc>> {
        self.tasks.lock().iter().map(|t| t.eta).min()
    }

    pub fn pending(&self) -> Vec<SubmissionTask> {
        let mut tasks = self.tasks.lock().clone();
        tasks.sort_by(|a, b| a.eta.cmp(&b.eta));
        tasks
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: SubmissionTask) -> Result<(), QueueError> {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.capacity {
            return Err(QueueError::Full);
        }
        tracing::debug!(check_in_id = %task.check_in_id, sequence = task.sequence, eta = %task.eta, "task enqueued");
        tasks.push(task);
        Ok(())
    }

    async fn take_due(&self, now: DateTime<Utc>) -> Result<Vec<SubmissionTask>, QueueError> {
        let mut tasks = self.tasks.lock();
        let (mut due, waiting): (Vec<_>, Vec<_>) = tasks.drain(..).partition(|t| t.eta <= now);
        *tasks = waiting;
        due.sort_by(|a, b| a.eta.cmp(&b.eta));
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn task(id: &str, sequence: u32, eta: DateTime<Utc>) -> SubmissionTask {
        SubmissionTask {
            check_in_id: CheckInId::new(id),
            sequence,
            eta,
        }
    }

    #[tokio::test]
    async fn test_take_due_respects_eta() {
        let queue = InMemoryTaskQueue::new();
        let now = Utc::now();

        queue.enqueue(task("late", 1, now + TimeDelta::hours(1))).await.unwrap();
        queue.enqueue(task("b", 1, now)).await.unwrap();
        queue.enqueue(task("a", 1, now - TimeDelta::minutes(1))).await.unwrap();

        let due = queue.take_due(now).await.unwrap();
        let ids: Vec<&str> = due.iter().map(|t| t.check_in_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_eta(), Some(now + TimeDelta::hours(1)));

        assert!(queue.take_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let queue = InMemoryTaskQueue::with_capacity(1);
        let now = Utc::now();
        queue.enqueue(task("a", 1, now)).await.unwrap();
        assert!(matches!(
            queue.enqueue(task("b", 1, now)).await,
            Err(QueueError::Full)
        ));
    }
}
