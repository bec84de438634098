//! Global injection queue.
//!
//! Unbounded MPMC queue for tasks submitted from outside the pool (or
//! overflowing a worker). Backed by a lock-free `SegQueue`.

use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::task::ParkableTask;

/// The pool-wide injection queue.
#[derive(Debug, Default)]
pub struct InjectorQueue {
    inner: SegQueue<Arc<ParkableTask>>,
}

impl InjectorQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task (FIFO).
    pub fn push(&self, task: Arc<ParkableTask>) {
        self.inner.push(task);
    }

    /// Dequeues the oldest task.
    #[must_use]
    pub fn pop(&self) -> Option<Arc<ParkableTask>> {
        self.inner.pop()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// True when no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
