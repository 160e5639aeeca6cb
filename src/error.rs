//! Failure model for distributed verification.
//!
//! # Error Classification Hierarchy
//!
//! ```text
//! WorkerError
//! ├── Retryable
//! │   ├── stream open failure     - worker unreachable right now
//! │   ├── stream broken mid-call  - network fault or worker crash
//! │   └── worker-reported Retry   - worker asks for a re-run
//! └── Permanent
//!     ├── worker-reported Failed  - application error inside the check run
//!     ├── unsupported data request- worker asked for the schema sub-protocol
//!     └── cancelled               - cooperative stop, not an error
//! ```
//!
//! Retryable failures are handled locally by re-queuing the sub-verification
//! (bounded by the retry cap). Only two conditions escalate to aborting the
//! whole job: exceeding the retry cap, and total pool exhaustion.

use std::fmt;

// ============================================================================
// Error Classification
// ============================================================================

/// Classification of a worker-call failure for retry decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient - worth re-queuing the sub-verification.
    Retryable,
    /// Permanent - re-running the same shard cannot help.
    Permanent,
}

// ============================================================================
// Worker errors
// ============================================================================

/// Failure of one streamed worker call.
///
/// Carries its own classification so the coordinator never needs to inspect
/// transport-specific detail: client implementations classify at the edge
/// (the network layer knows whether a fault was a timeout or an auth error).
#[derive(Clone, Debug)]
pub struct WorkerError {
    class: ErrorClass,
    message: String,
}

impl WorkerError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    #[inline]
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            ErrorClass::Retryable => write!(f, "transient worker failure: {}", self.message),
            ErrorClass::Permanent => write!(f, "permanent worker failure: {}", self.message),
        }
    }
}

impl std::error::Error for WorkerError {}

// ============================================================================
// Pool errors
// ============================================================================

/// Fatal worker-pool condition.
///
/// "All slots busy" is NOT an error (acquire returns `None` and the
/// coordinator tries again next tick); this type exists for the
/// configuration-level failure where no configured endpoint responds at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolError {
    /// Every configured worker failed its health probe.
    AllWorkersUnhealthy {
        /// Number of configured worker endpoints.
        configured: usize,
    },
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::AllWorkersUnhealthy { configured } => write!(
                f,
                "all {} configured workers are unhealthy or unreachable",
                configured
            ),
        }
    }
}

impl std::error::Error for PoolError {}

// ============================================================================
// Job-level errors
// ============================================================================

/// Abort conditions for a whole verification run.
///
/// User cancellation and per-shard failures are NOT represented here: they
/// complete the run with the `cancelled` flag set on the overall record.
#[derive(Clone, Debug)]
pub enum VerificationError {
    /// The first dispatch round could not start a single sub-verification.
    CouldNotStart,
    /// The pool reported total exhaustion mid-run.
    Pool(PoolError),
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationError::CouldNotStart => {
                write!(f, "could not start any sub-verification")
            }
            VerificationError::Pool(e) => write!(f, "worker pool failure: {}", e),
        }
    }
}

impl std::error::Error for VerificationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VerificationError::Pool(e) => Some(e),
            VerificationError::CouldNotStart => None,
        }
    }
}

impl From<PoolError> for VerificationError {
    fn from(e: PoolError) -> Self {
        VerificationError::Pool(e)
    }
}

// ============================================================================
// Tests
// ============================================================================
