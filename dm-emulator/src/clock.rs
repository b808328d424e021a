//! Host stand-ins for the radio counter and the resync timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dm_core::scheduler::ResyncTimer;
use dm_core::time::{self, TickSource, Ticks};

/// 24-bit 32.768 kHz counter derived from the host's monotonic clock.
#[derive(Debug)]
pub struct HostTickSource {
    origin: Instant,
    offset: Ticks,
}

impl HostTickSource {
    pub fn new() -> Self {
        Self::with_offset(0)
    }

    /// Starts the counter at `offset`, e.g. just below the wrap point.
    pub fn with_offset(offset: Ticks) -> Self {
        Self {
            origin: Instant::now(),
            offset,
        }
    }
}

impl Default for HostTickSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for HostTickSource {
    fn now(&self) -> Ticks {
        let elapsed_us = u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX);
        let ticks = elapsed_us.saturating_mul(time::COUNTER_FREQUENCY_HZ) / 1_000_000;
        time::wrap(ticks.wrapping_add(u64::from(self.offset)))
    }
}

const DISARMED: u64 = u64::MAX;

/// One-shot deadline polled by the DM worker thread.
#[derive(Debug)]
pub struct HostResyncTimer {
    origin: Instant,
    deadline_us: AtomicU64,
}

impl HostResyncTimer {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            deadline_us: AtomicU64::new(DISARMED),
        }
    }

    fn elapsed_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }

    /// Time left until expiry, or `None` while disarmed.
    pub fn remaining(&self) -> Option<Duration> {
        let deadline = self.deadline_us.load(Ordering::Acquire);
        if deadline == DISARMED {
            return None;
        }
        Some(Duration::from_micros(
            deadline.saturating_sub(self.elapsed_us()),
        ))
    }

    /// Disarms the timer and returns `true` if it has expired.
    pub fn take_expired(&self) -> bool {
        let deadline = self.deadline_us.load(Ordering::Acquire);
        if deadline == DISARMED || self.elapsed_us() < deadline {
            return false;
        }
        self.deadline_us
            .compare_exchange(deadline, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for HostResyncTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResyncTimer for HostResyncTimer {
    fn arm(&self, period: Duration) {
        let period_us = u64::try_from(period.as_micros()).unwrap_or(u64::MAX);
        let deadline = self.elapsed_us().saturating_add(period_us).min(DISARMED - 1);
        self.deadline_us.store(deadline, Ordering::Release);
    }
}
