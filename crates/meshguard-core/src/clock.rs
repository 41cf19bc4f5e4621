//! Time sources.
//!
//! Every time-based decision in meshguard (cache TTL, isolation expiry,
//! circuit-breaker recovery) is a comparison against "now" at call time.
//! Components take an `Arc<dyn Clock>` so tests can drive time explicitly.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::types::Timestamp;

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Manually driven clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Timestamp>>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Timestamp::now())
    }

    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = current.plus(by);
    }

    pub fn set(&self, to: Timestamp) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance_is_shared() {
        let clock = ManualClock::new(Timestamp::from_seconds(1_000));
        let other = clock.clone();
        clock.advance(Duration::from_secs(30));
        assert_eq!(other.now().seconds_since_epoch, 1_030);
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::new(Timestamp::from_seconds(5));
        clock.set(Timestamp::from_seconds(50));
        assert_eq!(clock.now(), Timestamp::from_seconds(50));
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    fn _assert_object_safe(_: &dyn Clock) {}
}
