//! Structured-logging compatibility layer.
//!
//! Runtime events (slice entry, park commit, unpark, timer expiry, worker
//! lifecycle) are logged through the macros re-exported here. With the
//! `tracing-integration` feature enabled they come from the `tracing`
//! crate; without it they compile to nothing, so the hot paths carry no
//! logging cost in the default build.
//!
//! ```toml
//! fibril = { version = "0.1", features = ["tracing-integration"] }
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op macro bodies for the default build.

    /// No-op trace-level logging macro.
    #[macro_export]
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    #[macro_export]
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    #[macro_export]
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    #[macro_export]
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    #[macro_export]
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    pub use crate::{debug, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub use noop::*;

#[cfg(test)]
mod tests {
    #[allow(unused_imports)]
    use super::*;

    #[test]
    fn macros_compile_with_fields() {
        trace!("trace message");
        debug!(task = 7u64, "claimed");
        info!("info message");
        warn!(worker = 2usize, "queue empty");
        error!(reason = "test", "error message");
    }
}
