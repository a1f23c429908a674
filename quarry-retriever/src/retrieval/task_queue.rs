use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::pin::pin;
use std::time::Instant;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use crate::storage::{FileId, is_under};

/// Priority levels for indexing tasks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum TaskPriority {
    /// Cleanup of deleted files
    Background = 0,
    /// Files found by a scan or a watcher event
    #[default]
    Normal = 1,
    /// Retries and consistency repairs
    High = 2,
    /// User-triggered work
    Critical = 3,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskType {
    /// Run the indexing pipeline for one file
    IndexFile { path: String },
    /// Remove the vectors, chunks and row of a deleted file
    Cleanup { file_id: FileId, path: String },
}

/// A task in the indexing queue
#[derive(Debug, Clone)]
pub struct IndexingTask {
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub created_at: Instant,
    pub retry_count: u32,
}

impl IndexingTask {
    pub fn new(task_type: TaskType, priority: TaskPriority) -> Self {
        Self {
            task_type,
            priority,
            created_at: Instant::now(),
            retry_count: 0,
        }
    }

    pub fn index_file(path: impl Into<String>) -> Self {
        Self::new(
            TaskType::IndexFile { path: path.into() },
            TaskPriority::Normal,
        )
    }

    pub fn cleanup(file_id: FileId, path: impl Into<String>) -> Self {
        Self::new(
            TaskType::Cleanup {
                file_id,
                path: path.into(),
            },
            TaskPriority::Background,
        )
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// A copy of this task for the next attempt.
    pub fn retry(&self) -> Self {
        Self {
            task_type: self.task_type.clone(),
            priority: TaskPriority::High.max(self.priority),
            created_at: Instant::now(),
            retry_count: self.retry_count + 1,
        }
    }

    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    pub fn path(&self) -> &str {
        match &self.task_type {
            TaskType::IndexFile { path } | TaskType::Cleanup { path, .. } => path,
        }
    }

    pub fn description(&self) -> String {
        match &self.task_type {
            TaskType::IndexFile { path } => format!("Index file: {path}"),
            TaskType::Cleanup { file_id, path } => format!("Clean up file {file_id}: {path}"),
        }
    }
}

/// Heap entry: priority first, then submission order
#[derive(Debug)]
struct PriorityTask {
    task: IndexingTask,
    seq: u64,
}

impl PartialEq for PriorityTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.priority == other.task.priority && self.seq == other.seq
    }
}

impl Eq for PriorityTask {}

impl PartialOrd for PriorityTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityTask {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.task.priority.cmp(&other.task.priority) {
            // Earlier submissions pop first
            Ordering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
    #[error("task queue is full ({0} tasks)")]
    Full(usize),
}

#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    pub max_queue_size: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
        }
    }
}

/// Whether a submission created a new task or was absorbed by one already waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    Merged,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<PriorityTask>,
    // Index tasks waiting in the heap, by path
    queued_paths: HashSet<String>,
    next_seq: u64,
    closed: bool,
}

/// A priority queue shared by the indexing workers.
///
/// Waiting index tasks are keyed by path: submitting a path that is already queued is
/// a no-op, so bursts of work for one file collapse into a single run.
#[derive(Debug)]
pub struct TaskQueue {
    config: TaskQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(config: TaskQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub async fn submit(&self, task: IndexingTask) -> Result<Submitted, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }

        if let TaskType::IndexFile { path } = &task.task_type {
            if state.queued_paths.contains(path) {
                debug!("Already queued: {}", task.description());
                return Ok(Submitted::Merged);
            }
        }

        if state.heap.len() >= self.config.max_queue_size {
            warn!("Task queue is full, dropping task: {}", task.description());
            return Err(QueueError::Full(state.heap.len()));
        }

        debug!("Submitting task: {}", task.description());
        if let TaskType::IndexFile { path } = &task.task_type {
            state.queued_paths.insert(path.clone());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(PriorityTask { task, seq });
        drop(state);

        self.notify.notify_one();
        Ok(Submitted::Queued)
    }

    /// Wait for the next task. Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<IndexingTask> {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if let Some(entry) = state.heap.pop() {
                    if let TaskType::IndexFile { path } = &entry.task.task_type {
                        state.queued_paths.remove(path);
                    }
                    // Wake another worker if more work is waiting
                    if !state.heap.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(entry.task);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Drop queued index tasks whose path lies under `scope`; returns how many were
    /// removed. Cleanup tasks are kept.
    pub async fn remove_scope(&self, scope: &str) -> usize {
        let mut state = self.state.lock().await;
        let before = state.heap.len();
        state.heap.retain(|entry| {
            matches!(entry.task.task_type, TaskType::Cleanup { .. })
                || !is_under(entry.task.path(), scope)
        });
        state.queued_paths.retain(|path| !is_under(path, scope));
        let removed = before - state.heap.len();
        if removed > 0 {
            debug!("Removed {removed} queued tasks under {scope}");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.heap.is_empty()
    }

    /// Queued tasks under `scope`.
    pub async fn len_in_scope(&self, scope: &str) -> usize {
        self.state
            .lock()
            .await
            .heap
            .iter()
            .filter(|entry| is_under(entry.task.path(), scope))
            .count()
    }

    /// Stop accepting tasks and wake every waiting worker.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
        debug!("Task queue closed");
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = TaskQueue::new(TaskQueueConfig::default());

        queue.submit(IndexingTask::index_file("/a")).await.unwrap();
        queue.submit(IndexingTask::cleanup(7, "/gone")).await.unwrap();
        queue.submit(IndexingTask::index_file("/b")).await.unwrap();
        queue
            .submit(IndexingTask::index_file("/urgent").with_priority(TaskPriority::Critical))
            .await
            .unwrap();

        let order: Vec<String> = [
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
            queue.pop().await.unwrap(),
        ]
        .iter()
        .map(|t| t.path().to_string())
        .collect();
        assert_eq!(order, vec!["/urgent", "/a", "/b", "/gone"]);
    }

    #[tokio::test]
    async fn test_duplicate_paths_merge() {
        let queue = TaskQueue::new(TaskQueueConfig::default());

        assert_eq!(
            queue.submit(IndexingTask::index_file("/a")).await,
            Ok(Submitted::Queued)
        );
        assert_eq!(
            queue.submit(IndexingTask::index_file("/a")).await,
            Ok(Submitted::Merged)
        );
        assert_eq!(queue.len().await, 1);

        // Once popped, the path can be queued again
        queue.pop().await.unwrap();
        assert_eq!(
            queue.submit(IndexingTask::index_file("/a")).await,
            Ok(Submitted::Queued)
        );
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let queue = TaskQueue::new(TaskQueueConfig { max_queue_size: 1 });
        queue.submit(IndexingTask::index_file("/a")).await.unwrap();
        assert_eq!(
            queue.submit(IndexingTask::index_file("/b")).await,
            Err(QueueError::Full(1))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_scope() {
        let queue = TaskQueue::new(TaskQueueConfig::default());
        for path in ["/data/x/1.txt", "/data/x/sub/2.txt", "/data/xy/3.txt"] {
            queue.submit(IndexingTask::index_file(path)).await.unwrap();
        }
        queue
            .submit(IndexingTask::cleanup(9, "/data/x/old.txt"))
            .await
            .unwrap();

        assert_eq!(queue.len_in_scope("/data/x").await, 3);
        assert_eq!(queue.remove_scope("/data/x").await, 2);
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.pop().await.unwrap().path(), "/data/xy/3.txt");
        assert!(matches!(
            queue.pop().await.unwrap().task_type,
            TaskType::Cleanup { file_id: 9, .. }
        ));

        // Removed paths are no longer considered queued
        assert_eq!(
            queue.submit(IndexingTask::index_file("/data/x/1.txt")).await,
            Ok(Submitted::Queued)
        );
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_workers() {
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close().await;

        for waiter in waiters {
            let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(popped.is_none());
        }
        assert_eq!(
            queue.submit(IndexingTask::index_file("/late")).await,
            Err(QueueError::Closed)
        );
    }

    #[tokio::test]
    async fn test_waiting_worker_receives_task() {
        let queue = Arc::new(TaskQueue::new(TaskQueueConfig::default()));
        let worker = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.submit(IndexingTask::index_file("/a")).await.unwrap();

        let task = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(task.path(), "/a");
    }

    #[test]
    fn test_retry_escalates_priority() {
        let task = IndexingTask::index_file("/a");
        assert!(task.should_retry(3));

        let third = task.retry().retry().retry();
        assert_eq!(third.retry_count, 3);
        assert_eq!(third.priority, TaskPriority::High);
        assert!(!third.should_retry(3));
    }
}
