//! Timed-wait service backing `park_timeout` and `sleep`.
//!
//! One long-lived background thread owns a min-heap of
//! `(deadline, task)` entries. When a deadline elapses the service
//! unconditionally unparks the task; the state word's idempotence makes
//! a late timeout after an early wake a harmless no-op, so entries are
//! never cancelled. Tasks are held weakly so a pending timeout never
//! keeps a terminated fiber alive.
//!
//! The process-wide instance starts lazily on first use. [`shutdown`]
//! exists for test hygiene; the next `schedule` after a shutdown starts
//! a fresh instance.
//!
//! [`shutdown`]: TimedWaitService::shutdown

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::task::ParkableTask;
use crate::tracing_compat::{debug, trace};

struct TimerEntry {
    deadline: Instant,
    task: Weak<ParkableTask>,
    generation: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.generation == other.generation
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering for min-heap (earliest deadline first);
        // generation breaks ties in insertion order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Shared {
    queue: Mutex<TimerQueue>,
    available: Condvar,
}

#[derive(Default)]
struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_generation: u64,
    shutdown: bool,
}

/// A single background scheduler delivering timed unparks.
pub struct TimedWaitService {
    shared: Arc<Shared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimedWaitService {
    /// Starts a new service with its own background thread.
    #[must_use]
    pub fn start() -> Arc<Self> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("fibril-timeout".to_string())
            .spawn(move || run_loop(&worker))
            .expect("failed to spawn timed-wait thread");
        Arc::new(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// The process-wide instance, started on first use.
    #[must_use]
    pub fn global() -> Arc<Self> {
        static GLOBAL: Mutex<Option<Arc<TimedWaitService>>> = Mutex::new(None);
        let mut slot = GLOBAL.lock();
        if let Some(service) = slot.as_ref() {
            if !service.shared.queue.lock().shutdown {
                return Arc::clone(service);
            }
        }
        let fresh = Self::start();
        *slot = Some(Arc::clone(&fresh));
        fresh
    }

    /// Schedules an unconditional unpark of `task` after `delay`.
    pub fn schedule(&self, task: &Arc<ParkableTask>, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return;
        }
        let generation = queue.next_generation;
        queue.next_generation += 1;
        queue.heap.push(TimerEntry {
            deadline,
            task: Arc::downgrade(task),
            generation,
        });
        trace!(task = task.id(), delay_ms = delay.as_millis() as u64, "timed wait scheduled");
        drop(queue);
        self.shared.available.notify_one();
    }

    /// Number of pending entries (expired-but-undelivered included).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Stops the background thread and drops pending entries.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.shutdown = true;
            queue.heap.clear();
        }
        self.shared.available.notify_one();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        debug!("timed-wait service stopped");
    }
}

fn run_loop(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }
        let now = Instant::now();
        match queue.heap.peek().map(|e| e.deadline) {
            None => {
                shared.available.wait(&mut queue);
            }
            Some(deadline) if deadline > now => {
                let _ = shared.available.wait_until(&mut queue, deadline);
            }
            Some(_) => {
                let entry = queue.heap.pop().expect("peeked entry vanished");
                // Deliver outside the lock; unpark may resubmit.
                drop(queue);
                if let Some(task) = entry.task.upgrade() {
                    trace!(task = task.id(), "timed wait expired");
                    task.unpark();
                }
                queue = shared.queue.lock();
            }
        }
    }
}

impl std::fmt::Debug for TimedWaitService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimedWaitService")
            .field("pending", &self.pending())
            .finish()
    }
}
