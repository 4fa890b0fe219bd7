use std::time::Duration;

use crate::hooks::HookPhase;

/// Enum to represent errors produced while managing a fixture's lifecycle.
#[derive(thiserror::Error, Debug)]
pub enum FixtureError {
    /// Indicates that the resource request was malformed (empty image,
    /// unparsable port spec, empty network name).
    #[error("invalid request: {0}")]
    Validation(String),

    /// Indicates that a lifecycle hook failed, identifying the phase and the
    /// hook's registration position within that phase.
    #[error("{phase} hook #{index} failed: {cause}")]
    Hook {
        /// The phase the failing hook was bound to.
        phase: HookPhase,
        /// The hook's registration index within its phase.
        index: usize,
        /// The underlying failure reported by the hook.
        cause: anyhow::Error,
    },

    /// Indicates that the readiness condition was not met before the
    /// configured deadline.
    #[error("resource not ready within {timeout:?}")]
    ReadinessTimeout {
        /// The startup timeout that was exceeded.
        timeout: Duration,
    },

    /// Represents a failure in the underlying container runtime or network
    /// substrate, wrapping the collaborator's error.
    #[error("runtime operation failed: {0:#}")]
    Runtime(#[from] anyhow::Error),

    /// Indicates that a caller-supplied cancellation signal fired during
    /// provisioning or readiness polling.
    #[error("fixture creation cancelled by caller")]
    Cancelled,
}
