//! Error types for gpurt.

use thiserror::Error;

/// Result type alias for gpurt operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Errors raised by the selection and execution layers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    // ===== Autotuning =====
    /// No algorithm candidates were supplied.
    #[error("{0}")]
    NoCandidates(String),

    /// Every candidate failed with a disqualifying failure.
    #[error("{0}")]
    AllCandidatesFailed(String),

    // ===== Execution lifecycle =====
    /// A thunk was executed before it was initialized on the executor.
    #[error("Lifecycle violation: {kind} '{annotation}' executed before initialization on {device}")]
    LifecycleViolation {
        /// Stable kind name of the thunk.
        kind: String,
        /// Profile annotation of the thunk.
        annotation: String,
        /// Device the execution was attempted on.
        device: String,
    },

    /// An async Start was issued twice without its Done, or a Done ran
    /// without a pending Start.
    #[error("Async pairing violation: {0}")]
    AsyncPairing(String),

    /// The engine has no handler for this kind of work.
    #[error("Unsupported kind: {0}")]
    UnsupportedKind(String),

    // ===== Device layer =====
    /// A buffer slice does not fit inside its allocation.
    #[error("Buffer slice out of range: allocation {allocation}, offset {offset}, size {size}, allocation size {allocation_size}")]
    BufferOutOfRange {
        /// Allocation index.
        allocation: usize,
        /// Slice offset in bytes.
        offset: usize,
        /// Slice size in bytes.
        size: usize,
        /// Size of the allocation in bytes.
        allocation_size: usize,
    },

    /// Invalid argument passed to a device operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A kernel could not be found in the executable source.
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// A stream waited on a completion handle that was never recorded.
    #[error("Event not recorded: {0}")]
    EventNotRecorded(String),

    /// Collective communication failed.
    #[error("Collective error: {0}")]
    Collective(String),

    /// Host transfer (infeed, outfeed, send, recv) failed.
    #[error("Host transfer error: {0}")]
    HostTransfer(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Returns true for errors that indicate a programming error in the
    /// producer of the work rather than a device-side failure.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::LifecycleViolation { .. }
                | RuntimeError::AsyncPairing(_)
                | RuntimeError::UnsupportedKind(_)
                | RuntimeError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::BufferOutOfRange {
            allocation: 3,
            offset: 16,
            size: 32,
            allocation_size: 40,
        };
        let msg = err.to_string();
        assert!(msg.contains("allocation 3"));
        assert!(msg.contains("allocation size 40"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(RuntimeError::UnsupportedKind("convolution".into()).is_fatal());
        assert!(RuntimeError::AsyncPairing("done without start".into()).is_fatal());
        assert!(!RuntimeError::Collective("peer lost".into()).is_fatal());
    }
}
