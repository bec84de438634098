//! The parkable unit submitted to the worker pool.
//!
//! A [`ParkableTask`] mediates every park/unpark of one fiber through a
//! single atomic state word. The phases are:
//!
//! - **Runnable**: eligible for execution; sitting in (or headed for) a
//!   pool queue.
//! - **Leased**: a worker claimed it and is running a slice.
//! - **Parking**: the slice has signalled suspension; the park is not
//!   yet committed.
//! - **Parked**: committed; waiting for an unpark.
//!
//! A wake-up that arrives while the task is Leased or Parking cannot be
//! acted on yet, so it is latched into a flag bit of the same word; the
//! park path observes the latch and converts its intended Parked into
//! Runnable. This is what makes the pair safe against the lost-wakeup
//! race where a wake linearizes between the suspension signal and the
//! park commit. All transitions are CAS with acquire/release ordering,
//! which also establishes the happens-before edge between writes made
//! before a park and reads made after the matching unpark.
//!
//! The commit deliberately does not resubmit on the raced path; the
//! slice finishes its post-park bookkeeping and releases the task back
//! to the pool itself (see [`CommitOutcome`]).

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::fiber::Fiber;
use crate::sched::FiberScheduler;
use crate::tracing_compat::trace;

/// What a fiber is waiting on: an opaque identity handle used by
/// diagnostics and targeted wake-ups. Compared by pointer identity.
pub type Blocker = Arc<dyn Any + Send + Sync>;

const PHASE_MASK: u32 = 0b011;
const WAKE: u32 = 0b100;

const RUNNABLE: u32 = 0;
const LEASED: u32 = 1;
const PARKING: u32 = 2;
const PARKED: u32 = 3;

/// Diagnostic view of the task state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkState {
    /// Eligible to execute.
    Runnable,
    /// Claimed by a worker for a slice.
    Leased,
    /// Suspension signalled, commit pending.
    Parking,
    /// Waiting for an unpark.
    Parked,
}

/// Result of a park commit, acted on by the slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitOutcome {
    /// The park committed; the task stays suspended until unparked.
    Parked,
    /// A wake-up was latched during the park window; the slice must
    /// resubmit the task once its bookkeeping is done.
    WakePending,
}

fn next_task_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// The pool-submittable unit binding one fiber to the scheduler.
pub struct ParkableTask {
    id: u64,
    state: AtomicU32,
    done: AtomicBool,
    blocker: Mutex<Option<Blocker>>,
    fiber: OnceLock<Weak<Fiber>>,
    scheduler: OnceLock<Weak<FiberScheduler>>,
}

impl ParkableTask {
    pub(crate) fn new() -> Self {
        Self {
            id: next_task_id(),
            state: AtomicU32::new(RUNNABLE),
            done: AtomicBool::new(false),
            blocker: Mutex::new(None),
            fiber: OnceLock::new(),
            scheduler: OnceLock::new(),
        }
    }

    pub(crate) fn bind(&self, fiber: Weak<Fiber>, scheduler: Weak<FiberScheduler>) {
        self.fiber.set(fiber).ok().expect("task already bound");
        self.scheduler
            .set(scheduler)
            .ok()
            .expect("task already bound");
    }

    /// A small identifier for logs and diagnostics.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current phase of the state word.
    #[must_use]
    pub fn state(&self) -> ParkState {
        match self.state.load(Ordering::Acquire) & PHASE_MASK {
            RUNNABLE => ParkState::Runnable,
            LEASED => ParkState::Leased,
            PARKING => ParkState::Parking,
            _ => ParkState::Parked,
        }
    }

    /// True if a wake-up is latched behind a Leased/Parking phase.
    #[must_use]
    pub fn wake_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) & WAKE != 0
    }

    /// True once the fiber has terminated; the task never runs again.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// The blocker the fiber registered at its last park, if any.
    #[must_use]
    pub fn blocker(&self) -> Option<Blocker> {
        self.blocker.lock().clone()
    }

    /// Replaces the registered blocker.
    pub fn set_blocker(&self, blocker: Option<Blocker>) {
        *self.blocker.lock() = blocker;
    }

    /// Claims the task for a slice: Runnable → Leased.
    ///
    /// Returns false when the task is not currently eligible (a stale
    /// queue entry, or another worker won the claim).
    pub(crate) fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(RUNNABLE, LEASED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Opens the park window: Leased → Parking, preserving a latched
    /// wake. Called by the suspension primitive before it raises the
    /// signal.
    ///
    /// # Panics
    ///
    /// Panics when the task is not Leased; parking outside a slice is a
    /// structural bug.
    pub(crate) fn begin_park(&self, blocker: Option<Blocker>) {
        *self.blocker.lock() = blocker;
        loop {
            let s = self.state.load(Ordering::Acquire);
            assert!(
                s & PHASE_MASK == LEASED,
                "park signalled while task {} is not leased",
                self.id
            );
            let target = PARKING | (s & WAKE);
            if self
                .state
                .compare_exchange(s, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!(task = self.id, "park window opened");
                return;
            }
        }
    }

    /// Commits the park: Parking → Parked, unless a wake-up latched (or
    /// landed) during the window, in which case the task returns to
    /// Runnable and the caller resubmits it after its bookkeeping.
    pub(crate) fn commit_park(&self) -> CommitOutcome {
        loop {
            let s = self.state.load(Ordering::Acquire);
            debug_assert_eq!(s & PHASE_MASK, PARKING, "commit outside a park window");
            if s & WAKE == 0 {
                if self
                    .state
                    .compare_exchange(s, PARKED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    trace!(task = self.id, "park committed");
                    return CommitOutcome::Parked;
                }
            } else if self
                .state
                .compare_exchange(s, RUNNABLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!(task = self.id, "park elided by latched wake");
                return CommitOutcome::WakePending;
            }
        }
    }

    /// Collapses the park window back to Runnable for a yield; the
    /// caller resubmits after its bookkeeping.
    pub(crate) fn commit_yield(&self) {
        loop {
            let s = self.state.load(Ordering::Acquire);
            debug_assert_eq!(s & PHASE_MASK, PARKING, "yield outside a park window");
            if self
                .state
                .compare_exchange(s, RUNNABLE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Normal slice return: Leased → Runnable; `done` gates any further
    /// execution when the fiber terminated.
    pub(crate) fn finish(&self, done: bool) {
        if done {
            self.done.store(true, Ordering::Release);
        }
        self.state.store(RUNNABLE, Ordering::Release);
    }

    /// Delivers a wake-up.
    ///
    /// Parked tasks become Runnable and are resubmitted to the pool;
    /// wake-ups hitting the Leased or Parking window are latched so the
    /// park path converts its intended Parked into Runnable. Waking a
    /// Runnable task is a no-op, which is what makes timer expiry after
    /// an early wake harmless.
    ///
    /// Returns true if this call latched or delivered the wake.
    pub fn unpark(self: &Arc<Self>) -> bool {
        loop {
            let s = self.state.load(Ordering::Acquire);
            match s & PHASE_MASK {
                RUNNABLE => return false,
                PARKED => {
                    if self
                        .state
                        .compare_exchange(s, RUNNABLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        trace!(task = self.id, "unparked");
                        self.submit();
                        return true;
                    }
                }
                _ => {
                    // Leased or Parking: latch the wake.
                    if s & WAKE != 0 {
                        return false;
                    }
                    if self
                        .state
                        .compare_exchange(s, s | WAKE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        trace!(task = self.id, "wake latched");
                        return true;
                    }
                }
            }
        }
    }

    /// Moves the task from Parked to Runnable without resubmitting.
    ///
    /// Returns true iff this call performed that transition. Used by
    /// synchronization primitives that must know whether they were the
    /// wake, and by the inline-resume path.
    #[must_use]
    pub fn try_unpark(&self) -> bool {
        self.state
            .compare_exchange(PARKED, RUNNABLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Pushes the task to its pool; detached tasks (no scheduler) are
    /// driven manually and this is a no-op for them.
    pub(crate) fn submit(self: &Arc<Self>) {
        if let Some(sched) = self.scheduler.get().and_then(Weak::upgrade) {
            sched.submit(Arc::clone(self));
        }
    }

    /// Worker entry: claim the task and run one slice of its fiber.
    pub(crate) fn execute(self: &Arc<Self>) {
        if self.is_done() || !self.try_claim() {
            return;
        }
        let Some(fiber) = self.fiber.get().and_then(Weak::upgrade) else {
            // Fiber dropped; retire the task.
            self.finish(true);
            return;
        };
        fiber.exec1();
    }
}

impl std::fmt::Debug for ParkableTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkableTask")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("wake_pending", &self.wake_pending())
            .field("done", &self.is_done())
            .finish()
    }
}
