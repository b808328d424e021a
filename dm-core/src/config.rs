//! Scheduler tuning and window arithmetic.

use core::time::Duration;

use crate::error::DmError;
use crate::request::{RangingMode, RangingRequest, Role};
use crate::time::{self, HALF_RANGE};

/// Number of requests the timeslot queue can hold.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

/// Outstanding requests allowed for the same peer.
pub const DEFAULT_PEER_QUOTA: usize = 3;

/// Minimum spacing between two consecutive queued timeslots.
pub const DEFAULT_MIN_SLOT_GAP_US: u32 = 1_000;

/// Duration of a round-trip-timing exchange.
pub const RTT_RANGING_US: u32 = 2_500;

/// Duration of a multi-carrier phase-difference exchange.
pub const MCPD_RANGING_US: u32 = 28_000;

/// Fixed protocol overhead added to every ranging window.
pub const PROTOCOL_OVERHEAD_US: u32 = 1_500;

/// Fixed arbiter scheduling overhead added on top of the window.
pub const SCHEDULING_OVERHEAD_US: u32 = 750;

/// Length of the calibration window used to resynchronise with the arbiter.
pub const EARLY_WINDOW_LENGTH_US: u32 = 100;

/// Interval after which a fresh calibration window is required.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Arbiter failures retried straight away before backing off.
pub const DEFAULT_IMMEDIATE_RETRIES: u8 = 3;

/// Delay before retrying once the immediate retries are used up.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Largest offset the arbiter accepts between two consecutive window starts.
pub const MAX_NORMAL_DISTANCE_US: u32 = 128_000_000 - 1;

/// Longest window the arbiter grants.
pub const MAX_WINDOW_LENGTH_US: u32 = 100_000;

/// Per-mode durations and fixed overheads used to size a window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WindowTiming {
    pub rtt_us: u32,
    pub mcpd_us: u32,
    pub protocol_overhead_us: u32,
    pub scheduling_overhead_us: u32,
}

impl WindowTiming {
    pub const fn new() -> Self {
        Self {
            rtt_us: RTT_RANGING_US,
            mcpd_us: MCPD_RANGING_US,
            protocol_overhead_us: PROTOCOL_OVERHEAD_US,
            scheduling_overhead_us: SCHEDULING_OVERHEAD_US,
        }
    }

    /// Returns the ranging duration for `mode`.
    pub const fn ranging_us(&self, mode: RangingMode) -> u32 {
        match mode {
            RangingMode::Rtt => self.rtt_us,
            RangingMode::Mcpd => self.mcpd_us,
        }
    }
}

impl Default for WindowTiming {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration shared by the queue, the arbiter session, and the orchestrator.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SchedulerConfig {
    pub peer_quota: usize,
    pub min_slot_gap_us: u32,
    pub timing: WindowTiming,
    pub early_window_us: u32,
    pub resync_interval: Duration,
    pub immediate_retries: u8,
    pub retry_backoff: Duration,
    pub max_normal_distance_us: u32,
    pub max_window_us: u32,
    /// Re-queue each successfully completed request for another round.
    pub reschedule_completed: bool,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            peer_quota: DEFAULT_PEER_QUOTA,
            min_slot_gap_us: DEFAULT_MIN_SLOT_GAP_US,
            timing: WindowTiming::new(),
            early_window_us: EARLY_WINDOW_LENGTH_US,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            immediate_retries: DEFAULT_IMMEDIATE_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_normal_distance_us: MAX_NORMAL_DISTANCE_US,
            max_window_us: MAX_WINDOW_LENGTH_US,
            reschedule_completed: false,
        }
    }

    #[must_use]
    pub const fn with_peer_quota(mut self, quota: usize) -> Self {
        self.peer_quota = quota;
        self
    }

    #[must_use]
    pub const fn with_min_slot_gap_us(mut self, gap_us: u32) -> Self {
        self.min_slot_gap_us = gap_us;
        self
    }

    #[must_use]
    pub const fn with_timing(mut self, timing: WindowTiming) -> Self {
        self.timing = timing;
        self
    }

    #[must_use]
    pub const fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Number of back-to-back retries after an arbiter failure, then `backoff` between attempts.
    #[must_use]
    pub const fn with_retry_policy(mut self, immediate: u8, backoff: Duration) -> Self {
        self.immediate_retries = immediate;
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub const fn with_reschedule_completed(mut self, enabled: bool) -> Self {
        self.reschedule_completed = enabled;
        self
    }

    /// Length of the ranging window for `request`.
    ///
    /// Reflectors listen for twice the exchange because they cannot know the
    /// initiator's exact start.
    pub fn window_length_us(&self, request: &RangingRequest) -> Result<u32, DmError> {
        let exchange = self
            .timing
            .ranging_us(request.mode)
            .checked_add(self.timing.protocol_overhead_us)
            .ok_or(DmError::InvalidArgument)?;

        let base = match request.role {
            Role::Initiator => exchange,
            Role::Reflector => exchange.checked_mul(2).ok_or(DmError::InvalidArgument)?,
        };

        let window = base
            .checked_add(request.extra_window_us)
            .ok_or(DmError::InvalidArgument)?;

        if window > self.max_window_us {
            return Err(DmError::InvalidArgument);
        }

        Ok(window)
    }

    /// Length of the whole timeslot reserved for a window of `window_us`.
    pub const fn timeslot_length_us(&self, window_us: u32) -> u32 {
        window_us.saturating_add(self.timing.scheduling_overhead_us)
    }

    /// Rejects delays that cannot be told apart from the past on the wrapping counter.
    pub fn validate_start_delay(&self, request: &RangingRequest) -> Result<(), DmError> {
        if time::us_to_ticks(u64::from(request.start_delay_us)) > u64::from(HALF_RANGE) {
            Err(DmError::InvalidArgument)
        } else {
            Ok(())
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PeerAddress;

    const PEER: PeerAddress = PeerAddress::public([1, 2, 3, 4, 5, 6]);

    #[test]
    fn initiator_window_is_exchange_plus_overhead() {
        let config = SchedulerConfig::new();
        let request = RangingRequest::new(Role::Initiator, PEER, RangingMode::Rtt);

        assert_eq!(
            config.window_length_us(&request),
            Ok(RTT_RANGING_US + PROTOCOL_OVERHEAD_US)
        );
    }

    #[test]
    fn reflector_window_is_doubled_then_padded() {
        let config = SchedulerConfig::new();
        let request = RangingRequest::new(Role::Reflector, PEER, RangingMode::Mcpd)
            .with_extra_window_us(500);

        let window = config.window_length_us(&request).expect("window fits");
        assert_eq!(window, 2 * (MCPD_RANGING_US + PROTOCOL_OVERHEAD_US) + 500);
        assert_eq!(
            config.timeslot_length_us(window),
            window + SCHEDULING_OVERHEAD_US
        );
    }

    #[test]
    fn oversized_window_is_invalid() {
        let config = SchedulerConfig::new();
        let request = RangingRequest::new(Role::Initiator, PEER, RangingMode::Rtt)
            .with_extra_window_us(MAX_WINDOW_LENGTH_US);

        assert_eq!(
            config.window_length_us(&request),
            Err(DmError::InvalidArgument)
        );
    }

    #[test]
    fn start_delay_beyond_half_counter_is_invalid() {
        let config = SchedulerConfig::new();
        let near = RangingRequest::new(Role::Initiator, PEER, RangingMode::Rtt)
            .with_start_delay_us(200_000_000);
        let far = near.with_start_delay_us(300_000_000);

        assert_eq!(config.validate_start_delay(&near), Ok(()));
        assert_eq!(
            config.validate_start_delay(&far),
            Err(DmError::InvalidArgument)
        );
    }

    #[test]
    fn retry_policy_overrides_defaults() {
        let config = SchedulerConfig::new();
        assert_eq!(config.immediate_retries, DEFAULT_IMMEDIATE_RETRIES);
        assert_eq!(config.retry_backoff, DEFAULT_RETRY_BACKOFF);

        let config = config.with_retry_policy(0, Duration::from_millis(5));
        assert_eq!(config.immediate_retries, 0);
        assert_eq!(config.retry_backoff, Duration::from_millis(5));
    }
}
