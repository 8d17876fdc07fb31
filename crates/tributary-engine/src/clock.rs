//! Injectable monotonic time source.
//!
//! Every timeout in the engine is measured against a [`Clock`] handed in at
//! construction, never against ambient wall-clock time, so tests can drive
//! time deterministically with [`MockClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Monotonic seconds since an arbitrary, per-clock origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

pub type SharedClock = Arc<dyn Clock>;

/// Real monotonic clock anchored at construction time.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Stores the current time as `f64` bits so it can be advanced through a
/// shared reference.
#[derive(Debug)]
pub struct MockClock {
    bits: AtomicU64,
}

impl MockClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    /// Move forward by `seconds`.
    pub fn advance(&self, seconds: f64) {
        let next = self.now() + seconds;
        self.set(next);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl Clock for MockClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_set_and_advance() {
        let clock = MockClock::new(100.0);
        assert_eq!(clock.now(), 100.0);
        clock.advance(2.5);
        assert_eq!(clock.now(), 102.5);
        clock.set(500.0);
        assert_eq!(clock.now(), 500.0);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a >= 0.0);
    }

    #[test]
    fn shared_mock_clock_advances_for_all_holders() {
        let clock = Arc::new(MockClock::new(0.0));
        let shared: SharedClock = clock.clone();
        clock.advance(31.0);
        assert_eq!(shared.now(), 31.0);
    }
}
