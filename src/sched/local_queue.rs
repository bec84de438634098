//! Per-worker task queue.
//!
//! The owning worker pushes and pops at one end (LIFO keeps a just-woken
//! fiber cache-warm); thieves steal from the other end (FIFO takes the
//! oldest, least-warm work). A locked `VecDeque` provides both
//! disciplines within the crate's `unsafe` prohibition.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::task::ParkableTask;

/// A worker-owned deque of runnable tasks.
#[derive(Debug, Default)]
pub struct LocalQueue {
    inner: Arc<Mutex<VecDeque<Arc<ParkableTask>>>>,
}

impl LocalQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task at the owner's end.
    pub fn push(&self, task: Arc<ParkableTask>) {
        self.inner
            .lock()
            .expect("local queue lock poisoned")
            .push_back(task);
    }

    /// Dequeues from the owner's end (LIFO).
    #[must_use]
    pub fn pop(&self) -> Option<Arc<ParkableTask>> {
        self.inner
            .lock()
            .expect("local queue lock poisoned")
            .pop_back()
    }

    /// True when no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("local queue lock poisoned")
            .is_empty()
    }

    /// A handle other workers use to steal from this queue.
    #[must_use]
    pub fn stealer(&self) -> Stealer {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A thief-side handle to a [`LocalQueue`].
#[derive(Debug, Clone)]
pub struct Stealer {
    inner: Arc<Mutex<VecDeque<Arc<ParkableTask>>>>,
}

impl Stealer {
    /// Steals the oldest task (FIFO end).
    #[must_use]
    pub fn steal(&self) -> Option<Arc<ParkableTask>> {
        self.inner
            .lock()
            .expect("local queue lock poisoned")
            .pop_front()
    }
}
