//! Task dispatch: the single seam between business logic and a queue.
//!
//! The orchestrator only ever calls [`TaskDispatcher::enqueue`]. Delivery is
//! assumed at-least-once with a per-task wall-clock limit, so every task
//! re-validates storage state before mutating anything.
//!
//! [`MemoryQueue`] + [`LocalWorker`] run the whole pipeline in-process; a
//! deployment would implement [`TaskDispatcher`] over its own broker and call
//! [`crate::orchestrator::Pipeline::run_task`] from its workers.

use crate::config::AltFormat;
use crate::error::StoreError;
use crate::orchestrator::Pipeline;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A unit of work, serialisable so any broker can carry it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    ProcessDocument {
        document_id: Uuid,
    },
    ProcessPages {
        document_id: Uuid,
        page_numbers: Vec<u32>,
        chunk_limit: usize,
    },
    ConvertFormat {
        document_id: Uuid,
        format: AltFormat,
        /// `None` converts every page of the document.
        page_numbers: Option<Vec<u32>>,
    },
    RotatePages {
        document_id: Uuid,
        page_numbers: Vec<u32>,
        angle: i32,
    },
    DetectTables {
        document_id: Uuid,
    },
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProcessDocument { .. } => "process_document",
            Self::ProcessPages { .. } => "process_pages",
            Self::ConvertFormat { .. } => "convert_format",
            Self::RotatePages { .. } => "rotate_pages",
            Self::DetectTables { .. } => "detect_tables",
        }
    }

    pub fn document_id(&self) -> Uuid {
        match self {
            Self::ProcessDocument { document_id }
            | Self::ProcessPages { document_id, .. }
            | Self::ConvertFormat { document_id, .. }
            | Self::RotatePages { document_id, .. }
            | Self::DetectTables { document_id } => *document_id,
        }
    }
}

/// Scheduling constraints attached to an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// The task is killed once it runs this long.
    pub time_limit: Duration,
    /// Earliest start, relative to now.
    pub delay: Duration,
}

impl EnqueueOptions {
    pub fn with_time_limit(time_limit: Duration) -> Self {
        Self {
            time_limit,
            delay: Duration::ZERO,
        }
    }
}

/// Fire-and-forget enqueue with at-least-once delivery.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn enqueue(&self, task: Task, options: EnqueueOptions) -> Result<(), StoreError>;
}

// ── In-process queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct QueuedTask {
    task: Task,
    options: EnqueueOptions,
    not_before: Instant,
    attempt: u32,
}

/// FIFO queue honouring enqueue delays.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    queue: Mutex<VecDeque<QueuedTask>>,
    history: Mutex<Vec<(Task, EnqueueOptions)>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Every task ever enqueued, in order, with its options.
    pub async fn history(&self) -> Vec<(Task, EnqueueOptions)> {
        self.history.lock().await.clone()
    }

    /// Tasks currently waiting.
    pub async fn pending_tasks(&self) -> Vec<Task> {
        self.queue.lock().await.iter().map(|q| q.task.clone()).collect()
    }

    /// Drop everything waiting; simulates a broker losing messages.
    pub async fn clear(&self) {
        self.queue.lock().await.clear();
    }

    async fn pop(&self) -> Option<QueuedTask> {
        self.queue.lock().await.pop_front()
    }

    async fn push_retry(&self, mut queued: QueuedTask) {
        queued.attempt += 1;
        queued.not_before = Instant::now();
        self.queue.lock().await.push_back(queued);
    }
}

#[async_trait]
impl TaskDispatcher for MemoryQueue {
    async fn enqueue(&self, task: Task, options: EnqueueOptions) -> Result<(), StoreError> {
        debug!(task = task.name(), document_id = %task.document_id(), "Enqueued task");
        self.history.lock().await.push((task.clone(), options));
        self.queue.lock().await.push_back(QueuedTask {
            task,
            options,
            not_before: Instant::now() + options.delay,
            attempt: 0,
        });
        Ok(())
    }
}

// ── Local worker ─────────────────────────────────────────────────────────

/// Outcome of draining a [`MemoryQueue`].
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub completed: Vec<Task>,
    /// Tasks that failed permanently, with the error text.
    pub failed: Vec<(Task, String)>,
    /// Transient failures that were re-queued.
    pub retried: usize,
}

/// Runs queued tasks one at a time under their time limits.
pub struct LocalWorker<'a> {
    pipeline: &'a Pipeline,
    queue: &'a MemoryQueue,
    max_attempts: u32,
    max_tasks: usize,
}

impl<'a> LocalWorker<'a> {
    pub fn new(pipeline: &'a Pipeline, queue: &'a MemoryQueue) -> Self {
        Self {
            pipeline,
            queue,
            max_attempts: 3,
            max_tasks: 10_000,
        }
    }

    /// Attempts per task before a transient failure becomes permanent.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Stop after this many task executions even if work remains.
    pub fn max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n;
        self
    }

    /// Run at most one task. Returns `false` when the queue was empty.
    pub async fn run_one(&self, report: &mut WorkerReport) -> bool {
        let Some(queued) = self.queue.pop().await else {
            return false;
        };
        tokio::time::sleep_until(queued.not_before).await;

        let task = queued.task.clone();
        let limit = queued.options.time_limit;
        let outcome = tokio::time::timeout(limit, self.pipeline.run_task(task.clone())).await;

        let (error, transient) = match outcome {
            Ok(Ok(())) => {
                report.completed.push(task);
                return true;
            }
            Ok(Err(e)) => {
                let transient = e.is_transient();
                (e.to_string(), transient)
            }
            // The future is dropped here; child processes die with it.
            Err(_) => (format!("time limit of {}s exceeded", limit.as_secs()), true),
        };

        if transient && queued.attempt + 1 < self.max_attempts {
            warn!(task = task.name(), attempt = queued.attempt + 1, %error, "Task failed, retrying");
            report.retried += 1;
            self.queue.push_retry(queued).await;
        } else {
            warn!(task = task.name(), %error, "Task failed permanently");
            report.failed.push((task, error));
        }
        true
    }

    /// Drain the queue, including tasks enqueued by the tasks themselves.
    pub async fn run_until_idle(&self) -> WorkerReport {
        let mut report = WorkerReport::default();
        let mut executed = 0;
        while executed < self.max_tasks && self.run_one(&mut report).await {
            executed += 1;
        }
        info!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            retried = report.retried,
            "Local worker idle"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_serialises_with_tag() {
        let id = Uuid::nil();
        let task = Task::ProcessPages {
            document_id: id,
            page_numbers: vec![3, 4],
            chunk_limit: 10,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "process_pages");
        assert_eq!(json["page_numbers"], serde_json::json!([3, 4]));
        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
        assert_eq!(back.name(), "process_pages");
    }

    #[tokio::test]
    async fn queue_records_history() {
        let queue = MemoryQueue::new();
        let opts = EnqueueOptions::with_time_limit(Duration::from_secs(5));
        queue
            .enqueue(Task::DetectTables { document_id: Uuid::nil() }, opts)
            .await
            .unwrap();
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.history().await.len(), 1);
        queue.clear().await;
        assert!(queue.is_empty().await);
        assert_eq!(queue.history().await[0].1, opts);
    }
}
