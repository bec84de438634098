//! Fiber lifecycle and slice execution.
//!
//! A [`Fiber`] is a lightweight, cooperatively scheduled computation.
//! Its lifecycle is `New → Started → Running ⇄ Waiting → Terminated`;
//! the `New → Started` edge happens exactly once, by compare-and-swap,
//! in [`Fiber::start`]. Each *slice* — one uninterrupted run between
//! entering user code and either returning or suspending — is executed
//! by at most one worker.
//!
//! A slice installs the fiber as the worker's current fiber, swaps in
//! its fiber-local views, and invokes the target through the
//! [`Fiber::run_target`] trampoline. Three outcomes exist: normal return
//! (result stored, fiber terminated), the suspension signal (the
//! continuation stack is now populated; the park is committed and the
//! slice reports "not done"), or a panic (the fiber terminates and the
//! error runs the uncaught-handler chain). The worker's own view and
//! current-fiber slot are restored on every path.
//!
//! Suspension primitives are free functions resolving the current fiber
//! through the worker slot: [`park`], [`park_timeout`], [`park_with`],
//! [`yield_now`], [`sleep`]. Called outside a fiber they fail fast.
//! Instrumented user code reaches the continuation stack with
//! [`with_stack`].

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, panic_any, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, ErrorKind, Result};
use crate::instrument;
use crate::local::{self, InheritableMap, LocalMap};
use crate::sched::FiberScheduler;
use crate::stack::{ContinuationStack, Frame};
use crate::suspend::{FiberInterrupt, Suspend};
use crate::task::{Blocker, CommitOutcome, ParkableTask};
use crate::timer::TimedWaitService;
use crate::tracing_compat::{debug, trace};

/// High-level fiber lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed, not yet started.
    New = 0,
    /// Started and submitted; no slice has run yet.
    Started = 1,
    /// A worker is executing a slice right now.
    Running = 2,
    /// Suspended at a park point.
    Waiting = 3,
    /// Finished, by result, error, or interrupt. Terminal.
    Terminated = 4,
}

/// Atomic lifecycle cell for cross-thread reads.
#[derive(Debug)]
struct StateCell {
    inner: AtomicU8,
}

impl StateCell {
    fn new(state: FiberState) -> Self {
        Self {
            inner: AtomicU8::new(state as u8),
        }
    }

    fn load(&self) -> FiberState {
        match self.inner.load(Ordering::Acquire) {
            0 => FiberState::New,
            1 => FiberState::Started,
            2 => FiberState::Running,
            3 => FiberState::Waiting,
            _ => FiberState::Terminated,
        }
    }

    fn store(&self, state: FiberState) {
        self.inner.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: FiberState, to: FiberState) -> bool {
        self.inner
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// A suspendable computation.
///
/// Implementors are *instrumented by hand*: the body cooperates with the
/// continuation stack through [`with_stack`], and the type must be
/// registered with [`instrument::register_type`] before a fiber can be
/// built from it. The hook methods default to no-ops and may be
/// overridden by specializations.
pub trait Suspendable: Send + 'static {
    /// The value produced on successful termination.
    type Output: Send + 'static;

    /// One cooperative execution; returns the suspension signal when the
    /// computation parks.
    fn run(&mut self) -> core::result::Result<Self::Output, Suspend>;

    /// Called once per committed park, after the post-park action slot
    /// is armed but before the task returns to the pool.
    fn on_parked(&mut self, fiber: &Arc<Fiber>) {
        let _ = fiber;
    }

    /// Called at slice entry on the resume path, after the interrupt
    /// check.
    fn on_resume(&mut self, fiber: &Arc<Fiber>) {
        let _ = fiber;
    }

    /// Called once on successful termination.
    fn on_completion(&mut self, fiber: &Arc<Fiber>) {
        let _ = fiber;
    }

    /// Called when the fiber terminates with an error; return true to
    /// consume it before the uncaught-handler chain runs.
    fn on_exception(&mut self, fiber: &Arc<Fiber>, error: &Error) -> bool {
        let _ = (fiber, error);
        false
    }
}

/// Object-safe adapter over [`Suspendable`].
trait ErasedTarget: Send {
    fn run_erased(&mut self) -> core::result::Result<Box<dyn Any + Send>, Suspend>;
    fn parked_hook(&mut self, fiber: &Arc<Fiber>);
    fn resume_hook(&mut self, fiber: &Arc<Fiber>);
    fn completion_hook(&mut self, fiber: &Arc<Fiber>);
    fn exception_hook(&mut self, fiber: &Arc<Fiber>, error: &Error) -> bool;
}

impl<T: Suspendable> ErasedTarget for T {
    fn run_erased(&mut self) -> core::result::Result<Box<dyn Any + Send>, Suspend> {
        self.run().map(|value| Box::new(value) as Box<dyn Any + Send>)
    }

    fn parked_hook(&mut self, fiber: &Arc<Fiber>) {
        self.on_parked(fiber);
    }

    fn resume_hook(&mut self, fiber: &Arc<Fiber>) {
        self.on_resume(fiber);
    }

    fn completion_hook(&mut self, fiber: &Arc<Fiber>) {
        self.on_completion(fiber);
    }

    fn exception_hook(&mut self, fiber: &Arc<Fiber>, error: &Error) -> bool {
        self.on_exception(fiber, error)
    }
}

/// One-shot callback executed after a park commits.
pub type PostParkAction = Box<dyn FnOnce(&Arc<Fiber>) + Send>;

/// Handler receiving errors no hook consumed.
pub type UncaughtHandler = Arc<dyn Fn(&Arc<Fiber>, &Error) + Send + Sync>;

static DEFAULT_UNCAUGHT: RwLock<Option<UncaughtHandler>> = RwLock::new(None);

/// Installs (or clears) the process-wide default uncaught-error handler.
pub fn set_default_uncaught_handler(handler: Option<UncaughtHandler>) {
    *DEFAULT_UNCAUGHT
        .write()
        .expect("default handler lock poisoned") = handler;
}

fn default_uncaught_handler() -> Option<UncaughtHandler> {
    DEFAULT_UNCAUGHT
        .read()
        .expect("default handler lock poisoned")
        .clone()
}

/// Error returned by [`FiberHandle::join`] and
/// [`FiberHandle::join_timeout`].
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// The timeout elapsed; the fiber is untouched and may still finish.
    #[error("join timed out")]
    Timeout,
    /// The fiber terminated by interrupt.
    #[error("fiber was interrupted")]
    Interrupted,
    /// The fiber terminated with an error.
    #[error("fiber failed: {0}")]
    Failed(Error),
    /// The result was already taken by an earlier join.
    #[error("fiber result already taken")]
    AlreadyJoined,
}

struct SavedViews {
    plain: LocalMap,
    inheritable: InheritableMap,
}

type FiberOutcome = core::result::Result<Box<dyn Any + Send>, Error>;

/// A lightweight, cooperatively scheduled computation.
pub struct Fiber {
    name: Option<String>,
    state: StateCell,
    interrupted: AtomicBool,
    pending_yield: AtomicBool,
    parent: Option<Weak<Fiber>>,
    task: Arc<ParkableTask>,
    stack: Mutex<ContinuationStack>,
    target: Mutex<Option<Box<dyn ErasedTarget>>>,
    views: Mutex<SavedViews>,
    post_park: Mutex<Option<PostParkAction>>,
    pending_timeout: Mutex<Option<Duration>>,
    sleep_anchor: Mutex<Option<Instant>>,
    result: Mutex<Option<FiberOutcome>>,
    completed: Mutex<bool>,
    completion: Condvar,
    uncaught: Mutex<Option<UncaughtHandler>>,
}

/// Builder for [`Fiber`]s.
///
/// Without a scheduler the fiber is *detached*: nothing resubmits it and
/// its slices are driven manually with [`FiberHandle::exec`], the shape
/// unit tests use.
#[derive(Default)]
pub struct FiberBuilder {
    name: Option<String>,
    stack_capacity: Option<usize>,
    scheduler: Option<Arc<FiberScheduler>>,
}

impl FiberBuilder {
    /// Creates a builder with no name, default stack capacity, and no
    /// scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the fiber (diagnostics only).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the initial continuation-stack frame capacity.
    #[must_use]
    pub fn stack_capacity(mut self, frames: usize) -> Self {
        self.stack_capacity = Some(frames);
        self
    }

    /// Binds the fiber to a pool; `start` submits there and unparks
    /// resubmit there.
    #[must_use]
    pub fn scheduler(mut self, scheduler: &Arc<FiberScheduler>) -> Self {
        self.scheduler = Some(Arc::clone(scheduler));
        self
    }

    /// Constructs the fiber.
    ///
    /// Fails with [`ErrorKind::NotInstrumented`] when `T` was never
    /// registered. The parent link and the inheritable-local snapshot
    /// are captured here, from the constructing context.
    pub fn build<T: Suspendable>(self, target: T) -> Result<FiberHandle<T::Output>> {
        if !instrument::is_instrumented_type::<T>() {
            return Err(Error::new(ErrorKind::NotInstrumented)
                .with_context(std::any::type_name::<T>()));
        }

        let capacity = self
            .stack_capacity
            .filter(|c| *c > 0)
            .or_else(|| {
                self.scheduler
                    .as_ref()
                    .map(|s| s.config().default_fiber_stack)
            })
            .unwrap_or(16);

        let parent = local::current_fiber().map(|f| Arc::downgrade(&f));
        let fiber = Arc::new(Fiber {
            name: self.name,
            state: StateCell::new(FiberState::New),
            interrupted: AtomicBool::new(false),
            pending_yield: AtomicBool::new(false),
            parent,
            task: Arc::new(ParkableTask::new()),
            stack: Mutex::new(ContinuationStack::with_capacity(capacity)),
            target: Mutex::new(Some(Box::new(target))),
            views: Mutex::new(SavedViews {
                plain: LocalMap::new(),
                inheritable: local::snapshot_inheritable(),
            }),
            post_park: Mutex::new(None),
            pending_timeout: Mutex::new(None),
            sleep_anchor: Mutex::new(None),
            result: Mutex::new(None),
            completed: Mutex::new(false),
            completion: Condvar::new(),
            uncaught: Mutex::new(None),
        });

        let scheduler = self
            .scheduler
            .as_ref()
            .map_or_else(Weak::new, Arc::downgrade);
        fiber.task.bind(Arc::downgrade(&fiber), scheduler);

        debug!(
            task = fiber.task.id(),
            name = fiber.name.as_deref().unwrap_or(""),
            "fiber created"
        );
        Ok(FiberHandle {
            fiber,
            _output: PhantomData,
        })
    }
}

/// Typed facade over an erased [`Fiber`], carrying its output type.
pub struct FiberHandle<V> {
    fiber: Arc<Fiber>,
    _output: PhantomData<fn() -> V>,
}

impl<V: Send + 'static> FiberHandle<V> {
    /// The underlying fiber.
    #[must_use]
    pub fn fiber(&self) -> &Arc<Fiber> {
        &self.fiber
    }

    /// Starts the fiber: `New → Started` plus submission to its pool.
    pub fn start(&self) -> Result<()> {
        self.fiber.start()
    }

    /// Drives one slice on the calling thread (detached-fiber driver).
    ///
    /// A parked fiber is woken by the call itself. Returns true when the
    /// fiber terminated.
    ///
    /// # Panics
    ///
    /// Panics when no slice is permitted: the fiber already terminated,
    /// or a slice is in flight elsewhere.
    pub fn exec(&self) -> bool {
        let task = &self.fiber.task;
        assert!(!task.is_done(), "fiber has already terminated");
        let claimed = task.try_claim() || (task.try_unpark() && task.try_claim());
        assert!(
            claimed,
            "slice not permitted while task is {:?}",
            task.state()
        );
        self.fiber.exec1()
    }

    /// Waits for termination and takes the result.
    pub fn join(mut self) -> core::result::Result<V, JoinError> {
        self.join_inner(None)
    }

    /// Waits up to `timeout` for termination.
    ///
    /// On [`JoinError::Timeout`] the fiber is unaffected and the handle
    /// remains usable.
    pub fn join_timeout(&mut self, timeout: Duration) -> core::result::Result<V, JoinError> {
        self.join_inner(Some(Instant::now() + timeout))
    }

    fn join_inner(&mut self, deadline: Option<Instant>) -> core::result::Result<V, JoinError> {
        if !self.fiber.wait_completed(deadline) {
            return Err(JoinError::Timeout);
        }
        match self.fiber.take_result() {
            None => Err(JoinError::AlreadyJoined),
            Some(Ok(boxed)) => boxed.downcast::<V>().map(|value| *value).map_err(|_| {
                JoinError::Failed(
                    Error::new(ErrorKind::Internal).with_context("result type mismatch"),
                )
            }),
            Some(Err(error)) if error.is_interrupt() => Err(JoinError::Interrupted),
            Some(Err(error)) => Err(JoinError::Failed(error)),
        }
    }
}

impl<V> fmt::Debug for FiberHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("fiber", &self.fiber)
            .finish()
    }
}

impl Fiber {
    /// The fiber's name, if it was given one.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> FiberState {
        self.state.load()
    }

    /// The fiber that was current when this one was constructed.
    /// Non-owning; `None` once the parent is dropped.
    #[must_use]
    pub fn parent(&self) -> Option<Arc<Fiber>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// The parkable task binding this fiber to the pool.
    #[must_use]
    pub fn task(&self) -> &Arc<ParkableTask> {
        &self.task
    }

    /// What the fiber is parked on, if registered.
    #[must_use]
    pub fn blocker(&self) -> Option<Blocker> {
        self.task.blocker()
    }

    /// Replaces the registered blocker.
    pub fn set_blocker(&self, blocker: Option<Blocker>) {
        self.task.set_blocker(blocker);
    }

    /// True once [`interrupt`](Self::interrupt) was called and the flag
    /// has not been consumed by termination.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// True once the fiber reached `Terminated`.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.load() == FiberState::Terminated
    }

    /// Started and not yet terminated.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.state.load() != FiberState::New && !self.task.is_done()
    }

    /// Requests termination: sets the interrupted flag and delivers an
    /// unpark. The interrupt is observed at the next resume, keeping
    /// non-suspending regions atomic.
    pub fn interrupt(self: &Arc<Self>) {
        self.interrupted.store(true, Ordering::Release);
        debug!(task = self.task.id(), "fiber interrupted");
        self.task.unpark();
    }

    /// Delivers a wake-up to the fiber's task.
    pub fn unpark(self: &Arc<Self>) -> bool {
        self.task.unpark()
    }

    /// Parked → Runnable without resubmission; true iff this call won.
    #[must_use]
    pub fn try_unpark(&self) -> bool {
        self.task.try_unpark()
    }

    /// Installs (or clears) this fiber's uncaught-error handler.
    pub fn set_uncaught_handler(&self, handler: Option<UncaughtHandler>) {
        *self.uncaught.lock() = handler;
    }

    /// Starts the fiber.
    ///
    /// Fails with [`ErrorKind::InvalidStateTransition`] unless the fiber
    /// is `New`; the transition happens exactly once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.state.transition(FiberState::New, FiberState::Started) {
            return Err(Error::new(ErrorKind::InvalidStateTransition)
                .with_context(format!("start from {:?}", self.state())));
        }
        debug!(task = self.task.id(), "fiber started");
        self.task.submit();
        Ok(())
    }

    /// Inline resume: runs the fiber on the calling thread once it is
    /// confirmed parked on `blocker`.
    ///
    /// Spins a small bounded number of attempts; each requires blocker
    /// identity and a winning [`try_unpark`](Self::try_unpark). Returns
    /// true when the slice ran here.
    pub fn exec(self: &Arc<Self>, blocker: &Blocker) -> bool {
        for _ in 0..30 {
            let matched = self
                .task
                .blocker()
                .is_some_and(|current| Arc::ptr_eq(&current, blocker));
            if matched && self.task.try_unpark() {
                if !self.task.try_claim() {
                    return false;
                }
                trace!(task = self.task.id(), "inline resume");
                self.exec1();
                return true;
            }
            std::hint::spin_loop();
        }
        false
    }

    /// Runs `f` while holding the continuation stack.
    pub(crate) fn with_stack_mut<R>(&self, f: impl FnOnce(&mut ContinuationStack) -> R) -> R {
        f(&mut self.stack.lock())
    }

    fn swap_views(&self) {
        let mut views = self.views.lock();
        let views = &mut *views;
        local::swap_views(&mut views.plain, &mut views.inheritable);
    }

    fn raise_if_interrupted(&self) {
        if self.interrupted.load(Ordering::Acquire) {
            panic_any(FiberInterrupt);
        }
    }

    /// The trampoline between the slice and user code; it appears in
    /// every fiber execution and anchors instrumentation verification.
    fn run_target(
        &self,
        target: &mut dyn ErasedTarget,
    ) -> core::result::Result<Box<dyn Any + Send>, Suspend> {
        target.run_erased()
    }

    /// Executes one slice. Returns true when the task is done (the
    /// fiber terminated), false when it suspended.
    ///
    /// Caller holds the task lease.
    pub(crate) fn exec1(self: &Arc<Self>) -> bool {
        let prior = self.state.load();
        assert!(
            !self.task.is_done() && prior != FiberState::Running,
            "slice not permitted from {prior:?}"
        );
        let resuming = prior == FiberState::Waiting;

        let mut target = self
            .target
            .lock()
            .take()
            .expect("fiber target missing at slice entry");

        local::install_current(self);
        self.swap_views();
        self.state.store(FiberState::Running);
        trace!(task = self.task.id(), resuming, "slice entered");

        let run = catch_unwind(AssertUnwindSafe(|| {
            if resuming {
                self.raise_if_interrupted();
                target.resume_hook(self);
            }
            self.run_target(target.as_mut())
        }));

        match run {
            Ok(Ok(value)) => {
                self.state.store(FiberState::Terminated);
                self.swap_views();
                local::clear_current();
                self.stack.lock().clear();
                trace!(task = self.task.id(), "slice finished");

                target.completion_hook(self);
                *self.target.lock() = Some(target);
                self.complete(Ok(value));
                self.task.finish(true);
                true
            }
            Ok(Err(_signal)) => {
                // The unwind populated the continuation stack.
                let post_park = self.post_park.lock().take();
                let timeout = self.pending_timeout.lock().take();
                self.stack.lock().finish_capture();
                self.state.store(FiberState::Waiting);
                self.swap_views();
                local::clear_current();

                let yielding = self.pending_yield.swap(false, Ordering::AcqRel);
                let outcome = if yielding {
                    self.task.commit_yield();
                    CommitOutcome::WakePending
                } else {
                    self.task.commit_park()
                };
                trace!(task = self.task.id(), ?outcome, yielding, "slice parked");

                // A timeout only matters for a park that actually held;
                // an elided park resumes right away regardless.
                if outcome == CommitOutcome::Parked {
                    if let Some(delay) = timeout {
                        TimedWaitService::global().schedule(&self.task, delay);
                    }
                }

                target.parked_hook(self);
                *self.target.lock() = Some(target);
                if let Some(action) = post_park {
                    action(self);
                }
                if outcome == CommitOutcome::WakePending {
                    self.task.submit();
                }
                false
            }
            Err(payload) => {
                self.state.store(FiberState::Terminated);
                self.swap_views();
                local::clear_current();
                self.stack.lock().clear();

                let error = if payload.is::<FiberInterrupt>() {
                    Error::new(ErrorKind::Interrupted)
                } else {
                    Error::new(ErrorKind::User).with_context(panic_message(payload.as_ref()))
                };
                debug!(task = self.task.id(), %error, "slice failed");

                let handled =
                    target.exception_hook(self, &error) || self.dispatch_uncaught(&error);
                *self.target.lock() = Some(target);
                let interrupted = error.is_interrupt();
                self.complete(Err(error));
                self.task.finish(true);
                if !handled && !interrupted {
                    resume_unwind(payload);
                }
                true
            }
        }
    }

    fn dispatch_uncaught(self: &Arc<Self>, error: &Error) -> bool {
        if let Some(handler) = self.uncaught.lock().clone() {
            handler(self, error);
            return true;
        }
        if let Some(handler) = default_uncaught_handler() {
            handler(self, error);
            return true;
        }
        false
    }

    fn complete(&self, outcome: FiberOutcome) {
        *self.result.lock() = Some(outcome);
        let mut done = self.completed.lock();
        *done = true;
        drop(done);
        self.completion.notify_all();
    }

    fn wait_completed(&self, deadline: Option<Instant>) -> bool {
        let mut done = self.completed.lock();
        while !*done {
            match deadline {
                None => self.completion.wait(&mut done),
                Some(instant) => {
                    if self.completion.wait_until(&mut done, instant).timed_out() {
                        return *done;
                    }
                }
            }
        }
        true
    }

    fn take_result(&self) -> Option<FiberOutcome> {
        self.result.lock().take()
    }

    pub(crate) fn verify_instrumentation(&self) {
        let stack = self.stack.lock();
        instrument::verify_frames(stack.frames().map(Frame::label));
    }

    pub(crate) fn set_post_park(&self, action: Option<PostParkAction>) {
        *self.post_park.lock() = action;
    }

    pub(crate) fn sleep_anchor(&self) -> &Mutex<Option<Instant>> {
        &self.sleep_anchor
    }

    pub(crate) fn arm_yield(&self) {
        self.pending_yield.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("task", &self.task)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload.downcast_ref::<&'static str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "opaque panic payload".to_string())
        },
        |s| (*s).to_string(),
    )
}

/// The fiber running on this thread, if any.
#[must_use]
pub fn current() -> Option<Arc<Fiber>> {
    local::current_fiber()
}

fn current_required(what: &str) -> Arc<Fiber> {
    current().unwrap_or_else(|| panic!("{what} called outside a fiber"))
}

/// Runs `f` with the current fiber's continuation stack; the entry point
/// for hand-instrumented code. Calls must not nest.
///
/// # Panics
///
/// Panics when called outside a fiber.
pub fn with_stack<R>(f: impl FnOnce(&mut ContinuationStack) -> R) -> R {
    current_required("with_stack").with_stack_mut(f)
}

/// Checks and clears the current fiber's interrupted flag.
///
/// # Panics
///
/// Panics when called outside a fiber (structural error).
#[must_use]
pub fn interrupted() -> bool {
    let fiber = current_required("interrupted");
    fiber.interrupted.swap(false, Ordering::AcqRel)
}

/// Suspends the current fiber until an unpark.
pub fn park() -> core::result::Result<(), Suspend> {
    park_with(None, None, None)
}

/// Suspends the current fiber until an unpark or until `timeout`
/// elapses, whichever is first.
pub fn park_timeout(timeout: Duration) -> core::result::Result<(), Suspend> {
    park_with(None, None, Some(timeout))
}

/// Full-form park for synchronization primitives.
///
/// Registers `blocker` as what the fiber waits on, arms the one-shot
/// `post_park` action (run exactly once after the park commits, the
/// point where enqueueing on a wait queue is lost-wakeup-safe), and
/// arms a timed unpark when `timeout` is given; the slice registers it
/// with the timed-wait service once the park has committed.
///
/// Always returns the suspension signal; the instrumented caller saves
/// its locals and propagates it. Control re-enters past this call on
/// the next slice.
///
/// # Panics
///
/// Panics when called outside a fiber (structural error).
pub fn park_with(
    blocker: Option<Blocker>,
    post_park: Option<PostParkAction>,
    timeout: Option<Duration>,
) -> core::result::Result<(), Suspend> {
    let fiber = current_required("park");
    if instrument::verify_enabled() {
        fiber.verify_instrumentation();
    }
    fiber.set_post_park(post_park);
    *fiber.pending_timeout.lock() = timeout;
    fiber.task().begin_park(blocker);
    trace!(task = fiber.task().id(), "park signalled");
    Err(Suspend::new())
}

/// Relinquishes the worker without waiting on anything; the fiber is
/// immediately runnable again.
///
/// # Panics
///
/// Panics when called outside a fiber (structural error).
pub fn yield_now() -> core::result::Result<(), Suspend> {
    let fiber = current_required("yield_now");
    fiber.arm_yield();
    fiber.task().begin_park(None);
    trace!(task = fiber.task().id(), "yield signalled");
    Err(Suspend::new())
}

/// Suspends the current fiber for at least `duration`.
///
/// Not an instrumented frame: the caller's resume index points at this
/// call, so each wake re-executes it from the top. The deadline is
/// anchored on the fiber at the first invocation; re-execution (a
/// spurious early unpark included) recomputes the remainder from the
/// anchor and parks again until the deadline passes.
///
/// # Panics
///
/// Panics when called outside a fiber (structural error).
pub fn sleep(duration: Duration) -> core::result::Result<(), Suspend> {
    let fiber = current_required("sleep");
    if fiber.is_interrupted() {
        *fiber.sleep_anchor().lock() = None;
        panic_any(FiberInterrupt);
    }
    let now = Instant::now();
    let anchor = *fiber.sleep_anchor().lock().get_or_insert(now);
    let deadline = anchor + duration;
    if now >= deadline {
        *fiber.sleep_anchor().lock() = None;
        return Ok(());
    }
    park_with(None, None, Some(deadline - now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Once;

    fn register_test_sites() {
        static ONCE: Once = Once::new();
        ONCE.call_once(|| {
            instrument::register_type::<Double>();
            instrument::register_site("double::run");
            instrument::register_type::<NullThrough>();
            instrument::register_site("null_through::run");
            instrument::register_site("null_through::fetch");
            instrument::register_site("null_through::fetch_named");
            instrument::register_type::<SelfWake>();
            instrument::register_site("self_wake::run");
            instrument::register_type::<ParkOnce>();
            instrument::register_site("park_once::run");
            instrument::register_type::<Failing>();
            instrument::register_type::<FlagPoller>();
        });
    }

    /// `t = cos(0); park(); result = t`: the single-park round trip.
    struct Double {
        result: Arc<Mutex<f64>>,
    }

    impl Suspendable for Double {
        type Output = ();

        fn run(&mut self) -> core::result::Result<(), Suspend> {
            let resume = with_stack(|s| s.enter("double::run", 1, 0));
            let temp;
            match resume {
                0 => {
                    temp = (0.0_f64).cos();
                    if let Err(signal) = park() {
                        with_stack(|s| s.save(1).put_f64(0, temp));
                        return Err(signal);
                    }
                }
                _ => temp = with_stack(|s| s.restored().get_f64(0)),
            }
            *self.result.lock() = temp;
            with_stack(ContinuationStack::leave);
            Ok(())
        }
    }

    /// A suspendable helper parks and returns its argument; the caller
    /// null-checks and assigns.
    struct NullThrough {
        result: Arc<Mutex<Option<String>>>,
    }

    impl NullThrough {
        fn fetch(&self) -> core::result::Result<Option<String>, Suspend> {
            // Single call site; fresh entry and replay both re-invoke it.
            let _resume = with_stack(|s| s.enter("null_through::fetch", 0, 0));
            let mut x = None;
            let y = match self.fetch_named("a") {
                Ok(value) => value,
                Err(signal) => {
                    with_stack(|s| {
                        s.save(1);
                    });
                    return Err(signal);
                }
            };
            if let Some(value) = y {
                x = Some(value);
            }
            with_stack(ContinuationStack::leave);
            Ok(x)
        }

        fn fetch_named(&self, value: &str) -> core::result::Result<Option<String>, Suspend> {
            let resume = with_stack(|s| s.enter("null_through::fetch_named", 0, 1));
            let out = if resume == 0 {
                if let Err(signal) = park() {
                    with_stack(|s| s.save(1).put_ref(0, value.to_string()));
                    return Err(signal);
                }
                Some(value.to_string())
            } else {
                with_stack(|s| s.restored().take_ref::<String>(0))
            };
            with_stack(ContinuationStack::leave);
            Ok(out)
        }
    }

    impl Suspendable for NullThrough {
        type Output = ();

        fn run(&mut self) -> core::result::Result<(), Suspend> {
            let _resume = with_stack(|s| s.enter("null_through::run", 0, 0));
            let value = match self.fetch() {
                Ok(value) => value,
                Err(signal) => {
                    with_stack(|s| {
                        s.save(1);
                    });
                    return Err(signal);
                }
            };
            *self.result.lock() = value;
            with_stack(ContinuationStack::leave);
            Ok(())
        }
    }

    /// Unparks itself mid-unwind, while its task sits in the parking
    /// window.
    struct SelfWake {
        slices: Arc<AtomicUsize>,
    }

    impl Suspendable for SelfWake {
        type Output = ();

        fn run(&mut self) -> core::result::Result<(), Suspend> {
            let resume = with_stack(|s| s.enter("self_wake::run", 0, 0));
            self.slices.fetch_add(1, Ordering::SeqCst);
            if resume == 0 {
                if let Err(signal) = park() {
                    // The wake races the commit: deliver it before the
                    // signal reaches the slice entry.
                    current().expect("in slice").unpark();
                    with_stack(|s| {
                        s.save(1);
                    });
                    return Err(signal);
                }
            }
            with_stack(ContinuationStack::leave);
            Ok(())
        }
    }

    /// Parks once, then completes.
    struct ParkOnce;

    impl Suspendable for ParkOnce {
        type Output = u32;

        fn run(&mut self) -> core::result::Result<u32, Suspend> {
            let resume = with_stack(|s| s.enter("park_once::run", 0, 0));
            if resume == 0 {
                if let Err(signal) = park() {
                    with_stack(|s| {
                        s.save(1);
                    });
                    return Err(signal);
                }
            }
            with_stack(ContinuationStack::leave);
            Ok(7)
        }
    }

    /// Panics immediately (registered, never suspends).
    struct Failing;

    impl Suspendable for Failing {
        type Output = ();

        fn run(&mut self) -> core::result::Result<(), Suspend> {
            panic!("boom");
        }
    }

    struct NotRegistered;

    impl Suspendable for NotRegistered {
        type Output = ();

        fn run(&mut self) -> core::result::Result<(), Suspend> {
            Ok(())
        }
    }

    /// Polls the check-and-clear interrupt accessor twice.
    struct FlagPoller {
        seen: Arc<Mutex<Vec<bool>>>,
    }

    impl Suspendable for FlagPoller {
        type Output = ();

        fn run(&mut self) -> core::result::Result<(), Suspend> {
            let mut seen = self.seen.lock();
            seen.push(interrupted());
            seen.push(interrupted());
            Ok(())
        }
    }

    #[test]
    fn single_park_round_trip() {
        register_test_sites();
        let result = Arc::new(Mutex::new(0.0));
        let handle = FiberBuilder::new()
            .build(Double {
                result: Arc::clone(&result),
            })
            .expect("build");

        assert!(!handle.exec(), "first slice suspends");
        assert!((*result.lock() - 0.0).abs() < 1e-8, "result untouched");
        assert_eq!(handle.fiber().state(), FiberState::Waiting);

        assert!(handle.exec(), "second slice completes");
        assert!((*result.lock() - 1.0).abs() < 1e-8);
        assert_eq!(handle.fiber().state(), FiberState::Terminated);
    }

    #[test]
    fn value_threads_through_nested_park() {
        register_test_sites();
        let result = Arc::new(Mutex::new(None));
        let handle = FiberBuilder::new()
            .build(NullThrough {
                result: Arc::clone(&result),
            })
            .expect("build");

        let mut slices = 1;
        while !handle.exec() {
            slices += 1;
        }
        assert_eq!(slices, 2, "exactly two slices");
        assert_eq!(result.lock().as_deref(), Some("a"));
    }

    #[test]
    fn unpark_during_parking_window_skips_no_slice() {
        register_test_sites();
        let slices = Arc::new(AtomicUsize::new(0));
        let handle = FiberBuilder::new()
            .build(SelfWake {
                slices: Arc::clone(&slices),
            })
            .expect("build");

        assert!(!handle.exec(), "first slice suspends");
        // The latched wake elided the park: immediately runnable again.
        assert_eq!(handle.fiber().task().state(), crate::task::ParkState::Runnable);
        assert_eq!(handle.fiber().state(), FiberState::Waiting);

        assert!(handle.exec(), "next cycle runs the second slice");
        assert_eq!(slices.load(Ordering::SeqCst), 2);
        assert_eq!(handle.fiber().state(), FiberState::Terminated);
    }

    #[test]
    fn interrupt_across_park_terminates_with_interrupt_error() {
        register_test_sites();
        let handle = FiberBuilder::new().build(ParkOnce).expect("build");
        let seen: Arc<Mutex<Option<ErrorKind>>> = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            handle.fiber().set_uncaught_handler(Some(Arc::new(
                move |_fiber: &Arc<Fiber>, error: &Error| {
                    *seen.lock() = Some(error.kind());
                },
            )));
        }

        assert!(!handle.exec(), "first slice parks");
        handle.fiber().interrupt();
        assert!(handle.fiber().is_interrupted());

        assert!(handle.exec(), "interrupted slice terminates");
        assert_eq!(handle.fiber().state(), FiberState::Terminated);
        assert_eq!(*seen.lock(), Some(ErrorKind::Interrupted));
        assert!(matches!(handle.join(), Err(JoinError::Interrupted)));
    }

    #[test]
    fn uninstrumented_target_fails_at_construction() {
        register_test_sites();
        let err = FiberBuilder::new()
            .build(NotRegistered)
            .expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::NotInstrumented);
        assert!(err.is_structural());
    }

    #[test]
    fn start_transitions_exactly_once() {
        register_test_sites();
        let handle = FiberBuilder::new().build(ParkOnce).expect("build");
        assert_eq!(handle.fiber().state(), FiberState::New);
        handle.start().expect("first start");
        assert_eq!(handle.fiber().state(), FiberState::Started);
        let err = handle.start().expect_err("second start must fail");
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[test]
    fn join_returns_the_result() {
        register_test_sites();
        let handle = FiberBuilder::new().build(ParkOnce).expect("build");
        assert!(!handle.exec());
        assert!(handle.exec());
        assert_eq!(handle.join().expect("joined"), 7);
    }

    #[test]
    fn join_timeout_leaves_the_fiber_alone() {
        register_test_sites();
        let mut handle = FiberBuilder::new().build(ParkOnce).expect("build");
        assert!(!handle.exec(), "parked");

        let err = handle
            .join_timeout(Duration::from_millis(10))
            .expect_err("still parked");
        assert!(matches!(err, JoinError::Timeout));
        assert_eq!(handle.fiber().state(), FiberState::Waiting);

        assert!(handle.exec());
        assert_eq!(
            handle.join_timeout(Duration::from_millis(10)).expect("done"),
            7
        );
    }

    #[test]
    fn unhandled_panic_reraises_out_of_the_slice() {
        register_test_sites();
        let handle = FiberBuilder::new().build(Failing).expect("build");
        let outcome = catch_unwind(AssertUnwindSafe(|| handle.exec()));
        assert!(outcome.is_err(), "panic must re-raise without a handler");
        assert_eq!(handle.fiber().state(), FiberState::Terminated);
        assert!(matches!(handle.join(), Err(JoinError::Failed(e)) if e.kind() == ErrorKind::User));
    }

    #[test]
    fn handled_panic_is_swallowed() {
        register_test_sites();
        let handle = FiberBuilder::new().build(Failing).expect("build");
        let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        {
            let seen = Arc::clone(&seen);
            handle.fiber().set_uncaught_handler(Some(Arc::new(
                move |_fiber: &Arc<Fiber>, error: &Error| {
                    *seen.lock() = Some(error.to_string());
                },
            )));
        }
        assert!(handle.exec(), "handled failure still terminates");
        assert_eq!(seen.lock().as_deref(), Some("User: boom"));
    }

    #[test]
    fn inline_exec_requires_matching_blocker() {
        register_test_sites();
        let handle = FiberBuilder::new().build(ParkOnce).expect("build");
        assert!(!handle.exec(), "parked");

        let registered: Blocker = Arc::new("the-queue");
        handle.fiber().set_blocker(Some(Arc::clone(&registered)));

        let wrong: Blocker = Arc::new("other-queue");
        assert!(
            !handle.fiber().exec(&wrong),
            "mismatched blocker must not resume"
        );
        assert_eq!(handle.fiber().state(), FiberState::Waiting);

        assert!(handle.fiber().exec(&registered), "matching blocker resumes inline");
        assert_eq!(handle.fiber().state(), FiberState::Terminated);
    }

    #[test]
    fn interrupted_accessor_checks_and_clears() {
        register_test_sites();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = FiberBuilder::new()
            .build(FlagPoller {
                seen: Arc::clone(&seen),
            })
            .expect("build");

        // Interrupt before the first slice: the flag is pending but no
        // resume hook runs, so user code observes and clears it.
        handle.fiber().interrupt();
        assert!(handle.exec(), "single slice completes");
        assert_eq!(*seen.lock(), vec![true, false]);
        assert!(!handle.fiber().is_interrupted(), "flag was consumed");
    }

    #[test]
    fn parent_link_is_captured_and_non_owning() {
        register_test_sites();
        let handle = FiberBuilder::new()
            .name("parent")
            .build(ParkOnce)
            .expect("build");
        assert!(handle.fiber().parent().is_none(), "built outside any fiber");
    }
}
