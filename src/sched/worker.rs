//! Worker thread loop and idle parking.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::sched::global_queue::InjectorQueue;
use crate::sched::local_queue::{LocalQueue, Stealer};
use crate::sched::stealing;
use crate::task::ParkableTask;
use crate::tracing_compat::{debug, error, trace};
use crate::util::DetRng;

thread_local! {
    /// Set while a pool worker runs on this thread: (pool id, its local
    /// queue). Lets `submit` from inside a slice land worker-affine.
    static CURRENT_WORKER: RefCell<Option<(u64, Arc<LocalQueue>)>> = const { RefCell::new(None) };
}

/// The local queue of the current thread's worker, when it belongs to
/// the given pool.
pub(crate) fn affine_queue(pool_id: u64) -> Option<Arc<LocalQueue>> {
    CURRENT_WORKER.with(|slot| {
        slot.borrow()
            .as_ref()
            .filter(|(id, _)| *id == pool_id)
            .map(|(_, queue)| Arc::clone(queue))
    })
}

/// One pool worker.
pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) pool_id: u64,
    pub(crate) local: Arc<LocalQueue>,
    pub(crate) stealers: Vec<Stealer>,
    pub(crate) injector: Arc<InjectorQueue>,
    pub(crate) parker: Parker,
    pub(crate) rng: DetRng,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) steal_attempts: usize,
    pub(crate) enable_parking: bool,
}

impl Worker {
    pub(crate) fn run_loop(mut self) {
        CURRENT_WORKER.with(|slot| {
            *slot.borrow_mut() = Some((self.pool_id, Arc::clone(&self.local)));
        });
        debug!(worker = self.id, "worker started");

        while !self.shutdown.load(Ordering::Acquire) {
            if let Some(task) = self.next_task() {
                self.execute(&task);
                continue;
            }
            if self.enable_parking {
                self.parker.park();
            } else {
                std::thread::yield_now();
            }
        }

        CURRENT_WORKER.with(|slot| slot.borrow_mut().take());
        debug!(worker = self.id, "worker stopped");
    }

    fn next_task(&mut self) -> Option<Arc<ParkableTask>> {
        self.local
            .pop()
            .or_else(|| self.injector.pop())
            .or_else(|| stealing::steal_task(&self.stealers, &mut self.rng, self.steal_attempts))
    }

    fn execute(&self, task: &Arc<ParkableTask>) {
        trace!(worker = self.id, task = task.id(), "executing task");
        // A fiber whose failure no handler consumed re-raises out of the
        // slice; isolate it so the worker survives.
        let run = catch_unwind(AssertUnwindSafe(|| task.execute()));
        if run.is_err() {
            error!(
                worker = self.id,
                task = task.id(),
                "unhandled fiber failure reached the pool"
            );
        }
    }
}

/// Sleep/notify cell for an idle worker.
///
/// A notification is level-triggered: `unpark` before `park` makes the
/// next `park` return immediately, so a submit racing a worker's descent
/// into sleep is never lost.
#[derive(Debug, Clone, Default)]
pub(crate) struct Parker {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks until notified; consumes the notification.
    pub(crate) fn park(&self) {
        let (lock, cvar) = &*self.inner;
        let mut notified = lock.lock().expect("parker lock poisoned");
        while !*notified {
            notified = cvar.wait(notified).expect("parker lock poisoned");
        }
        *notified = false;
    }

    /// Posts a notification and wakes the sleeper, if any.
    pub(crate) fn unpark(&self) {
        let (lock, cvar) = &*self.inner;
        {
            let mut notified = lock.lock().expect("parker lock poisoned");
            *notified = true;
        }
        cvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        parker.park(); // returns immediately
    }

    #[test]
    fn park_blocks_until_unparked() {
        let parker = Parker::new();
        let sleeper = parker.clone();
        let handle = thread::spawn(move || {
            sleeper.park();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished(), "park must block without a wake");
        parker.unpark();
        handle.join().expect("sleeper");
    }

    #[test]
    fn affine_queue_requires_matching_pool() {
        assert!(affine_queue(123).is_none());
        CURRENT_WORKER.with(|slot| {
            *slot.borrow_mut() = Some((7, Arc::new(LocalQueue::new())));
        });
        assert!(affine_queue(7).is_some());
        assert!(affine_queue(8).is_none());
        CURRENT_WORKER.with(|slot| slot.borrow_mut().take());
    }
}
