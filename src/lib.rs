//! Fibril: a cooperative fiber runtime on a work-stealing pool.
//!
//! # Overview
//!
//! A fiber is a lightweight, cooperatively scheduled computation. It runs
//! on an ordinary worker thread until it voluntarily suspends at a
//! designated point; its logical call stack is then captured into a
//! heap-resident continuation and the worker moves on. A later wake-up
//! makes the fiber runnable again, and the next slice — possibly on a
//! different worker — replays the captured frames to re-enter the code
//! transparently at the former suspension point.
//!
//! # Core guarantees
//!
//! - **No lost wake-ups**: `unpark` racing against an in-progress park is
//!   latched by the task state word; the fiber always resumes exactly once.
//! - **Transparent resumption**: a computation that suspends any number of
//!   times produces the same result as one that never suspends.
//! - **Thread-local transparency**: fiber-local state is swapped in for
//!   the duration of a slice, so lookups inside a fiber address the
//!   fiber's view and the worker's own view is untouched across slices.
//! - **No silent failures**: user panics terminate the fiber and flow
//!   through an opt-in handler chain; unhandled ones are re-raised.
//!
//! # Module structure
//!
//! - [`stack`]: heap-resident continuation stack (capture and replay)
//! - [`task`]: the parkable unit submitted to the pool; park/unpark CAS
//! - [`fiber`]: fiber lifecycle, slice execution, suspension primitives
//! - [`local`]: fiber-local storage and the worker context switch
//! - [`timer`]: timed-wait service backing `park_timeout` and `sleep`
//! - [`sched`]: the work-stealing pool fibers are scheduled on
//! - [`instrument`]: instrumentation registry and verification
//! - [`suspend`]: the control-transfer signal raised at suspension
//! - [`frozen`]: serialized image of a non-running fiber
//! - [`error`]: error types
//! - [`util`]: internal utilities

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod fiber;
pub mod frozen;
pub mod instrument;
pub mod local;
pub mod sched;
pub mod stack;
pub mod suspend;
pub mod task;
pub mod timer;
pub mod tracing_compat;
pub mod util;

pub use error::{Error, ErrorKind, Result, ResultExt};
pub use fiber::{
    current, interrupted, park, park_timeout, park_with, set_default_uncaught_handler, sleep,
    with_stack, yield_now, Fiber, FiberBuilder, FiberHandle, FiberState, JoinError,
    PostParkAction, Suspendable, UncaughtHandler,
};
pub use frozen::FrozenFiber;
pub use local::{FiberLocal, InheritableFiberLocal};
pub use sched::{FiberScheduler, SchedulerBuilder, SchedulerConfig};
pub use stack::ContinuationStack;
pub use suspend::Suspend;
pub use task::{Blocker, ParkState, ParkableTask};
pub use timer::TimedWaitService;
