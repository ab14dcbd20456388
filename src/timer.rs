//! System time source
//!
//! The scheduler never reads hardware timers directly; it consumes ticks
//! through the [`Clock`] trait. The kernel wires a [`SystemClock`] advanced
//! by the periodic timer interrupt; tests advance one by hand to control
//! time exactly.

use core::sync::atomic::{AtomicU64, Ordering};

/// Default timer interrupt rate
pub const TICKS_PER_SECOND: u64 = 1000;

/// Tick source consumed by the scheduler
pub trait Clock {
    /// Current tick count since boot
    fn now_ticks(&self) -> u64;

    /// Tick rate of this clock
    fn ticks_per_second(&self) -> u64;
}

/// Monotonic tick counter advanced by the timer interrupt
pub struct SystemClock {
    ticks: AtomicU64,
    frequency: u64,
}

impl SystemClock {
    /// Create a clock at the default 1000 Hz rate
    pub const fn new() -> Self {
        Self::with_frequency(TICKS_PER_SECOND)
    }

    /// Create a clock with an explicit tick rate
    pub const fn with_frequency(frequency: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frequency,
        }
    }

    /// Advance by one tick; called once per timer interrupt
    pub fn advance(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Clock for SystemClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn ticks_per_second(&self) -> u64 {
        self.frequency
    }
}

/// Convert milliseconds to ticks at a given rate
pub const fn ms_to_ticks(ms: u64, ticks_per_second: u64) -> u64 {
    (ms * ticks_per_second) / 1000
}

/// Convert ticks to milliseconds at a given rate
pub const fn ticks_to_ms(ticks: u64, ticks_per_second: u64) -> u64 {
    (ticks * 1000) / ticks_per_second
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance() {
        let clock = SystemClock::new();
        assert_eq!(clock.now_ticks(), 0);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.now_ticks(), 2);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(ms_to_ticks(50, 1000), 50);
        assert_eq!(ms_to_ticks(50, 100), 5);
        assert_eq!(ticks_to_ms(5, 100), 50);
    }
}
