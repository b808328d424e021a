//! Wraparound-safe arithmetic over the free-running radio timer.
//!
//! The scheduler timestamps everything with a 24-bit counter clocked at
//! 32.768 kHz. The counter overflows back to zero roughly every 512 seconds,
//! so ordinary comparisons between two samples are meaningless across the
//! overflow boundary. Every scheduling decision goes through [`distance`]
//! instead.

/// Raw counter sample.
pub type Ticks = u32;

/// Width of the hardware counter.
pub const COUNTER_BITS: u32 = 24;

/// Largest value the counter reports before wrapping to zero.
pub const COUNTER_MAX: Ticks = (1 << COUNTER_BITS) - 1;

/// Input frequency of the counter.
pub const COUNTER_FREQUENCY_HZ: u64 = 32_768;

/// Forward distances above this value are interpreted as "behind".
pub const HALF_RANGE: Ticks = COUNTER_MAX / 2;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Source of the current counter value.
pub trait TickSource {
    /// Returns the current counter value, already reduced to [`COUNTER_MAX`].
    fn now(&self) -> Ticks;
}

impl<T: TickSource + ?Sized> TickSource for &T {
    fn now(&self) -> Ticks {
        (**self).now()
    }
}

/// Reduces an arbitrary count to the counter range.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn wrap(ticks: u64) -> Ticks {
    (ticks & COUNTER_MAX as u64) as Ticks
}

/// Forward tick distance from `t1` to `t2`.
///
/// When `t1 > t2` the counter is assumed to have wrapped once in between.
#[must_use]
pub const fn distance(t1: Ticks, t2: Ticks) -> Ticks {
    let t1 = t1 & COUNTER_MAX;
    let t2 = t2 & COUNTER_MAX;

    if t1 > t2 {
        t2 + (COUNTER_MAX - t1) + 1
    } else {
        t2 - t1
    }
}

/// Advances `t` by `delta` ticks, wrapping at the counter boundary.
#[must_use]
pub const fn offset(t: Ticks, delta: u64) -> Ticks {
    wrap(t as u64 + delta)
}

/// Returns `true` when `to` lies at or after `from` within half the counter range.
#[must_use]
pub const fn is_at_or_after(from: Ticks, to: Ticks) -> bool {
    distance(from, to) <= HALF_RANGE
}

/// Converts microseconds to ticks, rounding up.
#[must_use]
pub const fn us_to_ticks(us: u64) -> u64 {
    (us * COUNTER_FREQUENCY_HZ).div_ceil(MICROS_PER_SECOND)
}

/// Converts ticks to microseconds, rounding down.
#[must_use]
pub const fn ticks_to_us(ticks: u64) -> u64 {
    ticks * MICROS_PER_SECOND / COUNTER_FREQUENCY_HZ
}
