//! Error types for buffer pooling and frame selection.
//!
//! `CaptureError` mirrors the failure classes a capture pipeline has to tell
//! apart:
//!
//! - **`InvalidArgument`**: bad configuration values (out-of-range counts,
//!   zero-size planes). Surfaced synchronously, never retried.
//! - **`AllocationFailed`**: the allocation backend could not produce memory.
//!   Any partially completed allocation has already been rolled back.
//! - **`NoBufferAvailable`**: transient exhaustion. The caller may retry.
//! - **`BufferInUse`**: an attempt to free or shrink a slot that is still
//!   `IN_PROCESS`.
//! - **`SelectionTimedOut`**: a selection wait ran out of budget. Callers are
//!   expected to treat this as a normal branch (fall back or retry).
//! - **`InvalidOperation`**: programmer error, such as using an unconfigured
//!   pool. Fatal and logged at error severity by the component that raises it.
//! - **`Backend`**: the allocator collaborator failed for a reason other than
//!   running out of memory.

use thiserror::Error;

/// Convenience alias for results using [`CaptureError`].
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Primary error type for the capture crates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// A configuration value is out of range or inconsistent.
    ///
    /// Raised before any state is mutated.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend could not allocate memory for a slot.
    ///
    /// The pool rolls back every allocation made by the failing call before
    /// returning this error, so no slot is left half-initialized.
    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    /// Every slot is in use and the pool may not (or could not) grow.
    #[error("No buffer available in pool '{pool}' (allocated {allocated}, max {allowed_max})")]
    NoBufferAvailable {
        /// Pool name.
        pool: String,
        /// Slots materialized at the time of the request.
        allocated: usize,
        /// Upper bound on materialized slots.
        allowed_max: usize,
    },

    /// The slot is still held by a consumer.
    #[error("Buffer {index} is still in process")]
    BufferInUse {
        /// Slot index.
        index: usize,
    },

    /// A blocking selection exhausted its retry budget without a frame.
    #[error("Frame selection timed out after {attempts} attempt(s)")]
    SelectionTimedOut {
        /// Number of bounded waits performed.
        attempts: u32,
    },

    /// The operation is not valid in the component's current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The allocation or surface backend reported a failure.
    #[error("Backend '{backend}' error: {message}")]
    Backend {
        /// Backend name.
        backend: String,
        /// Backend-provided detail.
        message: String,
    },
}

impl CaptureError {
    /// Build a [`CaptureError::Backend`].
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// True for transient conditions the caller may retry.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CaptureError::NoBufferAvailable { .. } | CaptureError::SelectionTimedOut { .. }
        )
    }
}
