//! Error type for admission outside the HTTP layers.
use std::fmt;
use std::time::Duration;

/// Unified error returned by [`ConcurrencyThrottle::execute`](crate::ConcurrencyThrottle::execute).
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// No serving or backlog slot was free.
    CapacityExceeded { admitted: usize, max: usize },
    /// The operation waited in the backlog longer than the backlog timeout.
    TimedOut { waited: Duration, timeout: Duration },
    /// The caller gave up while the operation was waiting.
    Canceled,
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CapacityExceeded { admitted, max } => {
                write!(f, "server capacity exceeded ({} admitted, max {})", admitted, max)
            }
            Self::TimedOut { waited, timeout } => write!(
                f,
                "timed out while waiting for a pending request to complete (waited {:?}, limit {:?})",
                waited, timeout
            ),
            Self::Canceled => f.write_str("context was canceled"),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if the throttle had no free slot
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
    /// Check if the backlog wait timed out
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
    /// Check if the wait was canceled
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }
    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
    /// Whether the throttle rejected the operation before it ran.
    pub fn is_rejection(&self) -> bool {
        !self.is_inner()
    }
}
