//! Error types returned by the public API.
//!
//! Configuration mistakes are reported through [`ExecutorError`] at
//! construction time. A user callable that panics, or (with the `cuda`
//! feature) a GPU launch that fails, surfaces through [`RunError`] on the
//! topology's completion future. Everything else the executor enforces is a
//! contract (see module docs on `crate::node`) and is reported via
//! `assert!`/`debug_assert!`, not a `Result`.

use crate::panic_boundary::PanicError;
use thiserror::Error;

/// Errors returned when building an [`crate::Executor`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A domain was enabled but given zero workers.
    #[error("domain {domain} requires at least one worker, got {requested}")]
    Configuration { domain: String, requested: usize },
}

/// Errors surfaced on a topology's completion future.
#[derive(Debug, Error)]
pub enum RunError {
    /// A `Static`, `Dynamic`, `Condition`, or `Module` callable panicked.
    #[error("task callable panicked: {0}")]
    CallablePanicked(#[from] PanicError),

    /// A GPU-domain flow failed to launch or synchronize.
    #[cfg(feature = "cuda")]
    #[error("gpu flow failed: {0}")]
    GpuLaunchFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_message() {
        let err = ExecutorError::Configuration {
            domain: "host".to_string(),
            requested: 0,
        };
        assert_eq!(
            err.to_string(),
            "domain host requires at least one worker, got 0"
        );
    }

    #[test]
    fn run_error_wraps_panic() {
        let panic = PanicError::new("boom");
        let err: RunError = panic.into();
        assert!(err.to_string().contains("boom"));
    }
}
