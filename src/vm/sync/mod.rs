//! Lock outcomes, timeouts and the general-purpose runtime lock.
//!
//! Everything here sits next to the GIL rather than on top of it: a
//! [`ThreadLock`] is built from the same backend wait primitive the GIL parks
//! on, but it supports bounded and interruptible waits, which the GIL never
//! does.
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

mod lock;

pub use lock::{ThreadLock, ThreadLockGuard};

// Re-export basic sync primitives from utils::sync
// This allows code to keep using vm::sync::Arc, etc.
pub use crate::utils::sync::*;

/// Outcome of a blocking or timed acquire.
///
/// The discriminants are the values the C-level thread layer has always used,
/// so they can cross an FFI boundary unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockStatus {
    /// The timeout elapsed before the lock became free. Expected, not an error.
    Failure = 0,
    Acquired = 1,
    /// The wait was cut short by an external interruption. The caller decides
    /// whether to retry with the remaining time or give up.
    Interrupted = 2,
}

impl LockStatus {
    pub fn is_acquired(self) -> bool {
        self == LockStatus::Acquired
    }
}

/// Signed microsecond wait bound.
///
/// Negative values wait forever ([`Timeout::INFINITE`] is the canonical one),
/// zero never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timeout(i64);

impl Timeout {
    pub const INFINITE: Timeout = Timeout(-1);
    pub const NON_BLOCKING: Timeout = Timeout(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            Self::INFINITE
        } else {
            Self(millis.saturating_mul(1_000))
        }
    }

    /// Durations too large for an `i64` of microseconds saturate to the
    /// largest finite timeout.
    pub fn from_duration(duration: Duration) -> Self {
        Self(i64::try_from(duration.as_micros()).unwrap_or(i64::MAX))
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub const fn is_infinite(self) -> bool {
        self.0 < 0
    }

    pub const fn is_non_blocking(self) -> bool {
        self.0 == 0
    }

    /// `None` for an infinite wait.
    pub fn as_duration(self) -> Option<Duration> {
        if self.is_infinite() {
            None
        } else {
            Some(Duration::from_micros(self.0 as u64))
        }
    }

    /// Absolute deadline for a wait starting at `start`, `None` if unbounded
    /// or if the deadline is not representable.
    pub fn deadline_from(self, start: Instant) -> Option<Instant> {
        self.as_duration().and_then(|d| start.checked_add(d))
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_match_c_layer() {
        assert_eq!(LockStatus::Failure as u8, 0);
        assert_eq!(LockStatus::Acquired as u8, 1);
        assert_eq!(LockStatus::Interrupted as u8, 2);
        assert!(LockStatus::Acquired.is_acquired());
        assert!(!LockStatus::Interrupted.is_acquired());
    }

    #[test]
    fn test_timeout_sentinels() {
        assert!(Timeout::INFINITE.is_infinite());
        assert!(Timeout::from_micros(-42).is_infinite());
        assert!(Timeout::NON_BLOCKING.is_non_blocking());
        assert_eq!(Timeout::INFINITE.as_duration(), None);
        assert_eq!(
            Timeout::from_millis(3).as_duration(),
            Some(Duration::from_millis(3))
        );
        assert_eq!(Timeout::from_millis(-1), Timeout::INFINITE);
    }

    #[test]
    fn test_timeout_saturates() {
        let huge = Timeout::from_duration(Duration::MAX);
        assert_eq!(huge.as_micros(), i64::MAX);
        assert!(!huge.is_infinite());
        // Far-future deadlines degrade to "unbounded" instead of overflowing.
        let _ = huge.deadline_from(Instant::now());
    }
}
