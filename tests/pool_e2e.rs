//! End-to-end scenarios on the work-stealing pool.
//!
//! Covers:
//!   - completion of a batch of yielding fibers across workers
//!   - timed sleep with a spurious early unpark
//!   - fiber-local isolation across slices and inheritable seeding
//!   - unpark handshakes from outside the pool
//!   - inline resume on the caller's thread via a matching blocker

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fibril::{
    current, instrument, park_with, sleep, task::ParkState, with_stack, yield_now, Blocker,
    ContinuationStack, Fiber, FiberBuilder, FiberScheduler, FiberState, InheritableFiberLocal,
    FiberLocal, SchedulerBuilder, Suspend, Suspendable,
};

static SLICE_LOCAL: FiberLocal<u64> = FiberLocal::new(|| 0);
static TRACE_ID: InheritableFiberLocal<u64> = InheritableFiberLocal::new(|| 0);

fn register() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        instrument::register_type::<Yielder>();
        instrument::register_site("e2e::yielder");
        instrument::register_type::<Sleeper>();
        instrument::register_site("e2e::sleeper");
        instrument::register_type::<LocalWriter>();
        instrument::register_site("e2e::local_writer");
        instrument::register_type::<Parent>();
        instrument::register_site("e2e::parent");
        instrument::register_type::<Child>();
        instrument::register_type::<BlockerParker>();
        instrument::register_site("e2e::blocker_parker");
    });
}

fn pool(workers: usize) -> Arc<FiberScheduler> {
    SchedulerBuilder::new()
        .worker_threads(workers)
        .thread_name_prefix("e2e-worker")
        .build()
}

fn wait_for(condition: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Yields twice, then completes with its slice count.
struct Yielder {
    slices: Arc<AtomicUsize>,
}

impl Suspendable for Yielder {
    type Output = usize;

    fn run(&mut self) -> Result<usize, Suspend> {
        let resume = with_stack(|s| s.enter("e2e::yielder", 0, 0));
        self.slices.fetch_add(1, Ordering::SeqCst);
        if resume < 1 {
            if let Err(signal) = yield_now() {
                with_stack(|s| {
                    s.save(1);
                });
                return Err(signal);
            }
        }
        if resume < 2 {
            if let Err(signal) = yield_now() {
                with_stack(|s| {
                    s.save(2);
                });
                return Err(signal);
            }
        }
        with_stack(ContinuationStack::leave);
        Ok(self.slices.load(Ordering::SeqCst))
    }
}

/// Sleeps 50 ms; the sleep call is re-executed on every resume.
struct Sleeper;

impl Suspendable for Sleeper {
    type Output = ();

    fn run(&mut self) -> Result<(), Suspend> {
        let _resume = with_stack(|s| s.enter("e2e::sleeper", 0, 0));
        if let Err(signal) = sleep(Duration::from_millis(50)) {
            with_stack(|s| {
                s.save(1);
            });
            return Err(signal);
        }
        with_stack(ContinuationStack::leave);
        Ok(())
    }
}

/// Writes a fiber-local before parking, reads it back after the resume
/// (possibly on another worker).
struct LocalWriter;

impl Suspendable for LocalWriter {
    type Output = u64;

    fn run(&mut self) -> Result<u64, Suspend> {
        let resume = with_stack(|s| s.enter("e2e::local_writer", 0, 0));
        if resume == 0 {
            SLICE_LOCAL.set(77);
            if let Err(signal) = yield_now() {
                with_stack(|s| {
                    s.save(1);
                });
                return Err(signal);
            }
        }
        let seen = SLICE_LOCAL.get();
        with_stack(ContinuationStack::leave);
        Ok(seen)
    }
}

/// Seeds an inheritable local, then constructs and starts a child fiber
/// from inside its own slice.
struct Parent {
    pool: Arc<FiberScheduler>,
    child_seen: Arc<Mutex<Option<(u64, Option<String>)>>>,
}

impl Suspendable for Parent {
    type Output = ();

    fn run(&mut self) -> Result<(), Suspend> {
        let _resume = with_stack(|s| s.enter("e2e::parent", 0, 0));
        TRACE_ID.set(42);
        let child = FiberBuilder::new()
            .name("child")
            .scheduler(&self.pool)
            .build(Child {
                seen: Arc::clone(&self.child_seen),
            })
            .expect("child build");
        child.start().expect("child start");
        with_stack(ContinuationStack::leave);
        Ok(())
    }
}

/// Reports the inherited trace id and its parent's name.
struct Child {
    seen: Arc<Mutex<Option<(u64, Option<String>)>>>,
}

impl Suspendable for Child {
    type Output = ();

    fn run(&mut self) -> Result<(), Suspend> {
        let me = current().expect("in slice");
        let parent_name = me
            .parent()
            .and_then(|p| p.name().map(str::to_string));
        *self.seen.lock() = Some((TRACE_ID.get(), parent_name));
        Ok(())
    }
}

/// Parks on a named blocker until an external wake.
struct BlockerParker {
    blocker: Blocker,
}

impl Suspendable for BlockerParker {
    type Output = u32;

    fn run(&mut self) -> Result<u32, Suspend> {
        let resume = with_stack(|s| s.enter("e2e::blocker_parker", 0, 0));
        if resume == 0 {
            if let Err(signal) = park_with(Some(Arc::clone(&self.blocker)), None, None) {
                with_stack(|s| {
                    s.save(1);
                });
                return Err(signal);
            }
        }
        with_stack(ContinuationStack::leave);
        Ok(11)
    }
}

#[test]
fn yielding_fibers_complete_across_workers() {
    register();
    let pool = pool(3);
    let handles: Vec<_> = (0..16)
        .map(|i| {
            let handle = FiberBuilder::new()
                .name(format!("yielder-{i}"))
                .scheduler(&pool)
                .build(Yielder {
                    slices: Arc::new(AtomicUsize::new(0)),
                })
                .expect("build");
            handle.start().expect("start");
            handle
        })
        .collect();

    for mut handle in handles {
        let slices = handle
            .join_timeout(Duration::from_secs(5))
            .expect("fiber finished");
        assert_eq!(slices, 3, "two yields make three slices");
    }
    pool.shutdown();
}

#[test]
fn timed_sleep_respects_the_deadline_through_a_spurious_wake() {
    register();
    let pool = pool(2);
    let started = Instant::now();
    let handle = FiberBuilder::new()
        .scheduler(&pool)
        .build(Sleeper)
        .expect("build");
    handle.start().expect("start");

    let fiber = Arc::clone(handle.fiber());
    wait_for(
        || fiber.state() == FiberState::Waiting,
        "sleeper to park",
    );

    // Spurious wake well before the deadline: the sleeper recomputes
    // the remainder and parks again.
    thread::sleep(Duration::from_millis(20).saturating_sub(started.elapsed()));
    fiber.unpark();
    thread::sleep(Duration::from_millis(10));
    if started.elapsed() < Duration::from_millis(45) {
        assert!(!fiber.is_done(), "spurious wake must not end the sleep");
    }

    let mut handle = handle;
    handle
        .join_timeout(Duration::from_secs(5))
        .expect("sleeper finished");
    assert!(
        started.elapsed() >= Duration::from_millis(50),
        "woke after {:?}",
        started.elapsed()
    );
    pool.shutdown();
}

#[test]
fn fiber_locals_survive_a_worker_migration() {
    register();
    let pool = pool(3);
    let mut handle = FiberBuilder::new()
        .scheduler(&pool)
        .build(LocalWriter)
        .expect("build");
    handle.start().expect("start");
    let seen = handle
        .join_timeout(Duration::from_secs(5))
        .expect("finished");
    assert_eq!(seen, 77, "fiber-local value must follow the fiber");
    pool.shutdown();
}

#[test]
fn children_inherit_the_inheritable_view_and_parent_link() {
    register();
    let pool = pool(2);
    let child_seen = Arc::new(Mutex::new(None));
    let handle = FiberBuilder::new()
        .name("parent")
        .scheduler(&pool)
        .build(Parent {
            pool: Arc::clone(&pool),
            child_seen: Arc::clone(&child_seen),
        })
        .expect("build");
    handle.start().expect("start");

    wait_for(|| child_seen.lock().is_some(), "child to report");
    let (trace, parent_name) = child_seen.lock().clone().expect("reported");
    assert_eq!(trace, 42, "inheritable view is seeded at construction");
    assert_eq!(parent_name.as_deref(), Some("parent"));
    pool.shutdown();
}

#[test]
fn external_unpark_resumes_a_blocked_fiber() {
    register();
    let pool = pool(2);
    let blocker: Blocker = Arc::new("wait-queue");
    let handle = FiberBuilder::new()
        .scheduler(&pool)
        .build(BlockerParker {
            blocker: Arc::clone(&blocker),
        })
        .expect("build");
    handle.start().expect("start");

    let fiber = Arc::clone(handle.fiber());
    wait_for(
        || fiber.task().state() == ParkState::Parked,
        "fiber to park",
    );
    let registered = fiber.blocker().expect("blocker registered");
    assert!(Arc::ptr_eq(&registered, &blocker));

    fiber.unpark();
    assert_eq!(handle.join().expect("finished"), 11);
    pool.shutdown();
}

#[test]
fn inline_resume_runs_the_slice_on_the_caller() {
    register();
    let pool = pool(2);
    let blocker: Blocker = Arc::new("handoff");
    let handle = FiberBuilder::new()
        .scheduler(&pool)
        .build(BlockerParker {
            blocker: Arc::clone(&blocker),
        })
        .expect("build");
    handle.start().expect("start");

    let fiber: Arc<Fiber> = Arc::clone(handle.fiber());
    wait_for(
        || fiber.task().state() == ParkState::Parked,
        "fiber to park",
    );

    assert!(fiber.exec(&blocker), "inline resume on this thread");
    assert_eq!(fiber.state(), FiberState::Terminated);
    assert_eq!(handle.join().expect("finished"), 11);
    pool.shutdown();
}
