//! Task Queue: priority-ordered intake with bounded concurrent execution.
//!
//! Keyed by `(-priority, createdAt)` via a max-heap over `Priority` (whose
//! `Ord` already runs `Urgent > ... > Low`) with `createdAt` reversed so that,
//! within one priority class, the oldest job wins ties.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;

use crate::job::{JobState, Priority};

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueueItem {
    priority: Priority,
    created_at: DateTime<Utc>,
    job_id: String,
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub queued: usize,
    pub running: usize,
    pub capacity: usize,
}

/// A priority queue feeding a bounded worker set. Doesn't own Job bodies —
/// just ordering keys plus a read-only view into the shared `state_of`
/// lookup the caller provides, so `next()` can implement the silent-skip
/// rule for jobs cancelled between enqueue and dequeue.
pub struct TaskQueue {
    heap: AsyncMutex<BinaryHeap<QueueItem>>,
    running: AtomicUsize,
    capacity: usize,
    states: DashMap<String, JobState>,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: AsyncMutex::new(BinaryHeap::new()),
            running: AtomicUsize::new(0),
            capacity,
            states: DashMap::new(),
        }
    }

    pub async fn submit(&self, job_id: &str, priority: Priority, created_at: DateTime<Utc>) {
        self.states.insert(job_id.to_string(), JobState::Pending);
        self.heap.lock().await.push(QueueItem {
            priority,
            created_at,
            job_id: job_id.to_string(),
        });
    }

    /// Called whenever the job's state is updated elsewhere (e.g. cancel),
    /// so `next()` can see it without reaching into the job table itself.
    pub fn note_state(&self, job_id: &str, state: JobState) {
        self.states.insert(job_id.to_string(), state);
    }

    /// Non-blocking: returns `None` if at capacity or the heap is empty.
    /// Silently skips (and drops) any dequeued job already `Cancelled`,
    /// continuing to the next candidate rather than surfacing it.
    pub async fn next(&self) -> Option<String> {
        if self.running.load(AtomicOrdering::SeqCst) >= self.capacity {
            return None;
        }
        let mut heap = self.heap.lock().await;
        while let Some(item) = heap.pop() {
            match self.states.get(&item.job_id).map(|s| *s) {
                Some(JobState::Cancelled) => continue,
                _ => return Some(item.job_id),
            }
        }
        None
    }

    pub fn mark_running(&self, job_id: &str) {
        self.running.fetch_add(1, AtomicOrdering::SeqCst);
        self.note_state(job_id, JobState::Uploading);
    }

    pub fn mark_done(&self, job_id: &str) {
        self.running.fetch_sub(1, AtomicOrdering::SeqCst);
        self.states.remove(job_id);
    }

    pub async fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.heap.lock().await.len(),
            running: self.running.load(AtomicOrdering::SeqCst),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn urgent_precedes_medium_precedes_low() {
        let queue = TaskQueue::new(1);
        let t0 = Utc::now();
        queue.submit("low", Priority::Low, t0).await;
        queue
            .submit("urgent", Priority::Urgent, t0 + ChronoDuration::seconds(1))
            .await;
        queue
            .submit("medium", Priority::Medium, t0 + ChronoDuration::seconds(2))
            .await;

        assert_eq!(queue.next().await, Some("urgent".to_string()));
        queue.mark_running("urgent");
        // At capacity (1) now; next() should return None until mark_done.
        assert_eq!(queue.next().await, None);
        queue.mark_done("urgent");
        assert_eq!(queue.next().await, Some("medium".to_string()));
        queue.mark_running("medium");
        queue.mark_done("medium");
        assert_eq!(queue.next().await, Some("low".to_string()));
    }

    #[tokio::test]
    async fn fifo_within_same_priority() {
        let queue = TaskQueue::new(1);
        let t0 = Utc::now();
        queue.submit("first", Priority::Medium, t0).await;
        queue
            .submit("second", Priority::Medium, t0 + ChronoDuration::seconds(5))
            .await;
        assert_eq!(queue.next().await, Some("first".to_string()));
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped_silently() {
        let queue = TaskQueue::new(1);
        let t0 = Utc::now();
        queue.submit("cancelled", Priority::Urgent, t0).await;
        queue
            .submit("ok", Priority::Low, t0 + ChronoDuration::seconds(1))
            .await;
        queue.note_state("cancelled", JobState::Cancelled);
        assert_eq!(queue.next().await, Some("ok".to_string()));
    }
}
