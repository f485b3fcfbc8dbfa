//! Error handling foundation for the flowcore platform.
//!
//! This module provides the `Result` type alias using rootcause, plus the
//! shared `ErrorKind` taxonomy every subsystem error maps onto. Each crate
//! still defines its own domain-specific error enums in their own error
//! modules (hand-rolled `Display`/`Error` impls, the same layering style used
//! throughout this codebase); `ErrorKind` just gives callers and tests a
//! common, small vocabulary to match on without naming every variant.

use rootcause::Report;

/// A Result type alias using rootcause's Report for error handling.
///
/// Each layer adds its own context via `.context()` as errors propagate.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

/// The small set of error categories every subsystem error maps onto.
///
/// A subsystem error enum exposes a `kind() -> ErrorKind` method so
/// integration boundaries (and tests) can branch on category without
/// depending on every crate's concrete error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Unknown workflow id, unknown init id, empty queue.
    NotFound,
    /// Invalid trigger config, malformed resource/action string, attempt to
    /// mutate an immutable workflow field.
    Validation,
    /// A workflow already exists for the target dataset; two commits in one run.
    Conflict,
    /// Surfaced unchanged from an external policy layer.
    AccessDenied,
    /// Scope cancelled during a run.
    Canceled,
    /// Error raised by the script engine for a single step.
    TransformError,
    /// Publish attempted after the bus's controlling scope closed.
    BusClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_is_small_and_comparable() {
        assert_eq!(ErrorKind::NotFound, ErrorKind::NotFound);
        assert_ne!(ErrorKind::NotFound, ErrorKind::Conflict);
    }
}
