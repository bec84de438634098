//! The work-stealing pool fibers are scheduled on.
//!
//! - [`config`]: configuration and defaults
//! - [`local_queue`]: per-worker deques (owner LIFO, thief FIFO)
//! - [`global_queue`]: the injection queue for outside submissions
//! - [`stealing`]: randomized victim selection
//! - [`worker`]: the worker loop and idle parking
//!
//! The pool schedules [`ParkableTask`]s, not fibers directly: a task is
//! pushed when it becomes runnable, a worker claims it, runs one slice
//! of its fiber, and the task re-enters a queue only on the next
//! wake-up. Submission from inside a slice lands on the submitting
//! worker's own queue; everything else goes through the injector.

pub mod config;
pub mod global_queue;
pub mod local_queue;
pub mod stealing;
pub mod worker;

pub use config::SchedulerConfig;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::sched::global_queue::InjectorQueue;
use crate::sched::local_queue::LocalQueue;
use crate::sched::worker::{Parker, Worker};
use crate::task::ParkableTask;
use crate::tracing_compat::{debug, trace};
use crate::util::DetRng;

fn next_pool_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Builder for a [`FiberScheduler`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    /// Creates a builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads (0 = available parallelism).
    #[must_use]
    pub fn worker_threads(mut self, n: usize) -> Self {
        self.config.worker_threads = n;
        self
    }

    /// Sets the worker thread stack size.
    #[must_use]
    pub fn thread_stack_size(mut self, size: usize) -> Self {
        self.config.thread_stack_size = size;
        self
    }

    /// Sets the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Sets the maximum peer queues probed per steal pass.
    #[must_use]
    pub fn steal_attempts(mut self, attempts: usize) -> Self {
        self.config.steal_attempts = attempts;
        self
    }

    /// Enables or disables idle-worker parking.
    #[must_use]
    pub fn enable_parking(mut self, enable: bool) -> Self {
        self.config.enable_parking = enable;
        self
    }

    /// Sets the default continuation-stack capacity for new fibers.
    #[must_use]
    pub fn default_fiber_stack(mut self, frames: usize) -> Self {
        self.config.default_fiber_stack = frames;
        self
    }

    /// Starts the pool.
    #[must_use]
    pub fn build(self) -> Arc<FiberScheduler> {
        FiberScheduler::with_config(self.config)
    }
}

/// A work-stealing pool of worker threads executing fiber slices.
pub struct FiberScheduler {
    id: u64,
    config: SchedulerConfig,
    injector: Arc<InjectorQueue>,
    parkers: Vec<Parker>,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl FiberScheduler {
    /// Starts a pool with default configuration.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Starts a pool with the given configuration.
    #[must_use]
    pub fn with_config(mut config: SchedulerConfig) -> Arc<Self> {
        config.normalize();
        let pool_id = next_pool_id();
        let injector = Arc::new(InjectorQueue::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let locals: Vec<Arc<LocalQueue>> = (0..config.worker_threads)
            .map(|_| Arc::new(LocalQueue::new()))
            .collect();
        let parkers: Vec<Parker> = (0..config.worker_threads).map(|_| Parker::new()).collect();

        let mut threads = Vec::with_capacity(config.worker_threads);
        for (index, local) in locals.iter().enumerate() {
            let stealers = locals
                .iter()
                .enumerate()
                .filter(|(peer, _)| *peer != index)
                .map(|(_, queue)| queue.stealer())
                .collect();
            let worker = Worker {
                id: index,
                pool_id,
                local: Arc::clone(local),
                stealers,
                injector: Arc::clone(&injector),
                parker: parkers[index].clone(),
                rng: DetRng::new(pool_id.wrapping_mul(31).wrapping_add(index as u64 + 1)),
                shutdown: Arc::clone(&shutdown),
                steal_attempts: config.steal_attempts,
                enable_parking: config.enable_parking,
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name_prefix))
                .stack_size(config.thread_stack_size)
                .spawn(move || worker.run_loop())
                .expect("failed to spawn pool worker");
            threads.push(handle);
        }

        debug!(pool = pool_id, workers = config.worker_threads, "pool started");
        Arc::new(Self {
            id: pool_id,
            config,
            injector,
            parkers,
            shutdown,
            threads: Mutex::new(threads),
        })
    }

    /// Makes a task eligible to run on any worker.
    ///
    /// Called from inside one of this pool's slices, the task lands on
    /// the submitting worker's own queue; otherwise it goes through the
    /// injector. Either way one idle worker is woken.
    pub fn submit(&self, task: Arc<ParkableTask>) {
        if self.shutdown.load(Ordering::Acquire) {
            debug!(task = task.id(), "submit after shutdown dropped");
            return;
        }
        trace!(pool = self.id, task = task.id(), "task submitted");
        if let Some(local) = worker::affine_queue(self.id) {
            local.push(task);
        } else {
            self.injector.push(task);
        }
        for parker in &self.parkers {
            parker.unpark();
        }
    }

    /// The pool's configuration after normalization.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// True once [`shutdown`](Self::shutdown) ran.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stops the workers and joins their threads. Queued tasks that
    /// never ran stay queued and are dropped with the pool.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for parker in &self.parkers {
            parker.unpark();
        }
        let threads = {
            let mut guard = self.threads.lock().expect("pool thread list poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in threads {
            let _ = handle.join();
        }
        debug!(pool = self.id, "pool stopped");
    }
}

impl std::fmt::Debug for FiberScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberScheduler")
            .field("id", &self.id)
            .field("workers", &self.config.worker_threads)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
