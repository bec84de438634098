//! Error types and error handling strategy.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - The control-transfer signal ([`Suspend`](crate::suspend::Suspend))
//!   is not an error and never appears here
//! - User panics are isolated at the slice boundary and surfaced with
//!   [`ErrorKind::User`]; structural misuse fails fast

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Structural ===
    /// The computation type was not registered as instrumented.
    NotInstrumented,
    /// A fiber-only operation was invoked outside any fiber.
    NotInFiber,
    /// A lifecycle transition was attempted from the wrong state.
    InvalidStateTransition,
    /// The operation is not permitted on a running fiber.
    RunningFiber,
    /// The fiber's captured state cannot be serialized.
    Unserializable,

    // === Outcomes ===
    /// The fiber was terminated by an interrupt.
    Interrupted,
    /// User code failed (panicked) during a slice.
    User,

    // === Internal ===
    /// Internal runtime error (bug).
    Internal,
}

/// The main error type for fiber operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents an interrupt.
    #[must_use]
    pub const fn is_interrupt(&self) -> bool {
        matches!(self.kind, ErrorKind::Interrupted)
    }

    /// Returns true if this error is a structural (misuse) error.
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::NotInstrumented
                | ErrorKind::NotInFiber
                | ErrorKind::InvalidStateTransition
                | ErrorKind::RunningFiber
                | ErrorKind::Unserializable
        )
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the context text, if any.
    #[must_use]
    pub fn context_str(&self) -> Option<&str> {
        self.context.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for fiber operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::NotInFiber).with_context("park() on a plain thread");
        assert_eq!(err.to_string(), "NotInFiber: park() on a plain thread");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::User)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn structural_predicate_matches_kinds() {
        assert!(Error::new(ErrorKind::NotInstrumented).is_structural());
        assert!(Error::new(ErrorKind::RunningFiber).is_structural());
        assert!(!Error::new(ErrorKind::Interrupted).is_structural());
        assert!(Error::new(ErrorKind::Interrupted).is_interrupt());
        assert!(!Error::new(ErrorKind::User).is_interrupt());
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), Error> = Err(Error::new(ErrorKind::Internal));
        let err = res.context("commit failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal: commit failed");
    }
}
