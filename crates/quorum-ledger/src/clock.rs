//! Injected time source.
//!
//! Every deadline check in the ledger reads time through [`Clock`], so tests
//! and simulations drive time explicitly with [`ManualClock`].

use crate::ledger_types::Timestamp;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn now(&self) -> Timestamp;
}

/// Wall-clock origin advanced by a monotonic timer, so time never runs backwards
#[derive(Debug)]
pub struct MonotonicClock {
    origin_secs: Timestamp,
    started: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin_secs: Utc::now().timestamp().max(0) as Timestamp,
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timestamp {
        self.origin_secs.saturating_add(self.started.elapsed().as_secs())
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        ManualClock {
            now: AtomicU64::new(start),
        }
    }

    /// Move to `at`. Earlier instants are ignored.
    pub fn set(&self, at: Timestamp) {
        self.now.fetch_max(at, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) -> Timestamp {
        let previous = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| Some(t.saturating_add(secs)))
            .unwrap_or_else(|t| t);
        previous.saturating_add(secs)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_forward() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.advance(5), 105);
        clock.set(50);
        assert_eq!(clock.now(), 105);
        clock.set(200);
        assert_eq!(clock.now(), 200);
    }

    #[test]
    fn test_monotonic_clock_starts_near_wall_time() {
        let clock = MonotonicClock::new();
        let wall = Utc::now().timestamp() as Timestamp;
        assert!(clock.now().abs_diff(wall) <= 1);
        assert!(clock.now() <= clock.now());
    }
}
