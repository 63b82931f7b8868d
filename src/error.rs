//! Error types for staging and transfer operations
//!
//! Every failure names the driver call that reported it so a caller can tell
//! an allocation problem from a copy problem without parsing messages.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::bracket::EventBracket;

/// Raw status code reported by the device runtime
///
/// Values follow the CUDA driver numbering so statuses read the same whether
/// they come from the real driver or from the software driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverStatus(pub i32);

impl DriverStatus {
    /// Call succeeded
    pub const SUCCESS: Self = Self(0);
    /// An argument was out of range
    pub const INVALID_VALUE: Self = Self(1);
    /// Allocation failed
    pub const OUT_OF_MEMORY: Self = Self(2);
    /// Handle does not name a live object
    pub const INVALID_HANDLE: Self = Self(400);
    /// Asynchronous work has not completed yet
    pub const NOT_READY: Self = Self(600);
    /// Operation not permitted in the current state
    pub const NOT_PERMITTED: Self = Self(800);
    /// Unclassified failure
    pub const UNKNOWN: Self = Self(999);

    /// Numeric code
    #[must_use]
    pub fn code(self) -> i32 {
        self.0
    }

    /// Whether this status means success
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Symbolic name for well-known codes
    #[must_use]
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "SUCCESS",
            1 => "INVALID_VALUE",
            2 => "OUT_OF_MEMORY",
            400 => "INVALID_HANDLE",
            600 => "NOT_READY",
            800 => "NOT_PERMITTED",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Error type for pool, stream and transfer operations
#[derive(Debug, Error)]
pub enum StagingError {
    /// Pinned host allocation, free or reallocation failed
    #[error("pinned allocation failure in {call}: {status}")]
    Allocation {
        /// Driver call that failed
        call: &'static str,
        /// Status it returned
        status: DriverStatus,
    },

    /// Copy, event or stream call reported a non-success status
    #[error("device operation failure in {call}: {status}")]
    Device {
        /// Driver call that failed
        call: &'static str,
        /// Status it returned
        status: DriverStatus,
    },

    /// Caller broke the pool or stream contract
    #[error("lifecycle misuse: {0}")]
    LifecycleMisuse(String),

    /// Region cap reached and no region was released in time
    #[error("staging pool exhausted: {limit} regions live, waited {waited:?}")]
    PoolExhausted {
        /// Configured region cap
        limit: usize,
        /// Time spent waiting for a release
        waited: Duration,
    },

    /// Configuration rejected
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StagingError {
    /// Name of the driver call that failed, when a driver call failed
    #[must_use]
    pub fn driver_call(&self) -> Option<&'static str> {
        match self {
            Self::Allocation { call, .. } | Self::Device { call, .. } => Some(call),
            _ => None,
        }
    }

    /// Driver status, when a driver call failed
    #[must_use]
    pub fn driver_status(&self) -> Option<DriverStatus> {
        match self {
            Self::Allocation { status, .. } | Self::Device { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this is an allocation failure
    #[must_use]
    pub fn is_allocation(&self) -> bool {
        matches!(self, Self::Allocation { .. })
    }
}

/// Result alias for staging operations
pub type Result<T> = std::result::Result<T, StagingError>;

/// Failure of a single transfer
///
/// Carries the event bracket recorded before the failure, if any, so timing
/// data already captured on the device is not lost.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct TransferError {
    /// What went wrong
    #[source]
    pub error: StagingError,
    /// Bracket recorded before the failure
    pub bracket: Option<EventBracket>,
}

impl TransferError {
    /// Failure that happened before any marker was recorded
    #[must_use]
    pub fn bare(error: StagingError) -> Self {
        Self {
            error,
            bracket: None,
        }
    }

    /// Failure with the bracket recorded so far
    #[must_use]
    pub fn with_bracket(error: StagingError, bracket: EventBracket) -> Self {
        Self {
            error,
            bracket: Some(bracket),
        }
    }

    /// Underlying error
    #[must_use]
    pub fn kind(&self) -> &StagingError {
        &self.error
    }

    /// Split into error and bracket
    #[must_use]
    pub fn into_parts(self) -> (StagingError, Option<EventBracket>) {
        (self.error, self.bracket)
    }
}

impl From<StagingError> for TransferError {
    fn from(error: StagingError) -> Self {
        Self::bare(error)
    }
}
