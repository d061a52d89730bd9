//! Error types for the rotation lock operations.
//!
//! Each operation gets its own small error enum so callers can match on
//! exactly the failures that operation can produce. All validation errors
//! carry the offending value.

use core::fmt;

/// A degree or range argument outside its valid domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentError {
    /// Degree outside `[0, 360)`.
    Degree(i32),
    /// Arc half-width outside `(0, 180)`.
    Range(i32),
}

impl fmt::Display for ArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Degree(d) => write!(f, "degree {d} outside [0, 360)"),
            Self::Range(r) => write!(f, "range {r} outside (0, 180)"),
        }
    }
}

impl std::error::Error for ArgumentError {}

/// Error returned when a blocking acquisition fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Degree or range out of domain. The request was never enqueued.
    InvalidArgument(ArgumentError),
    /// The request was removed by owner cleanup while waiting.
    Cancelled,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => write!(f, "invalid lock request: {e}"),
            Self::Cancelled => write!(f, "lock request cancelled"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidArgument(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

impl From<ArgumentError> for LockError {
    fn from(e: ArgumentError) -> Self {
        Self::InvalidArgument(e)
    }
}

/// Error returned when trying to acquire without waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockError {
    /// Degree or range out of domain.
    InvalidArgument(ArgumentError),
    /// The request would have to wait; nothing was enqueued.
    Contended,
}

impl fmt::Display for TryLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => write!(f, "invalid lock request: {e}"),
            Self::Contended => write!(f, "lock not immediately available"),
        }
    }
}

impl std::error::Error for TryLockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidArgument(e) => Some(e),
            Self::Contended => None,
        }
    }
}

impl From<ArgumentError> for TryLockError {
    fn from(e: ArgumentError) -> Self {
        Self::InvalidArgument(e)
    }
}

/// Error returned when a release fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockError {
    /// Degree or range out of domain.
    InvalidArgument(ArgumentError),
    /// No assigned lock matches this owner, degree and range. Covers both
    /// double-unlock and unlock-without-lock; the registry is unmodified.
    NotFound,
}

impl fmt::Display for UnlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(e) => write!(f, "invalid unlock request: {e}"),
            Self::NotFound => write!(f, "no matching assigned lock"),
        }
    }
}

impl std::error::Error for UnlockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidArgument(e) => Some(e),
            Self::NotFound => None,
        }
    }
}

impl From<ArgumentError> for UnlockError {
    fn from(e: ArgumentError) -> Self {
        Self::InvalidArgument(e)
    }
}
