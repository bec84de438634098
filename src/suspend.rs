//! The control-transfer signal raised at suspension points.
//!
//! When a fiber invokes a suspension primitive, the primitive arranges
//! the park and then returns [`Suspend`] in the error position. Every
//! instrumented frame on the logical call path propagates it outward
//! with `?` after writing its live locals into the continuation stack;
//! the slice entry consumes it and commits the park. The signal is never
//! a user-visible error: it implements neither `std::error::Error` nor
//! any conversion into [`crate::Error`], and user code must not swallow
//! it.

use core::fmt;

/// The suspension signal.
///
/// Carried in the `Err` position of `Result<T, Suspend>` purely for
/// control transfer. Constructed only by the suspension primitives.
#[must_use = "the suspension signal must be propagated to the slice entry"]
pub struct Suspend {
    _private: (),
}

impl Suspend {
    pub(crate) const fn new() -> Self {
        Self { _private: () }
    }
}

impl fmt::Debug for Suspend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Suspend")
    }
}

/// Panic payload marking termination by interrupt.
///
/// Raised at the resume hook when the interrupted flag is set; the slice
/// boundary recognizes it and records an
/// [`ErrorKind::Interrupted`](crate::ErrorKind::Interrupted) outcome
/// instead of treating it as an ordinary user panic.
#[derive(Debug, Clone, Copy)]
pub struct FiberInterrupt;

impl fmt::Display for FiberInterrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fiber interrupted")
    }
}
