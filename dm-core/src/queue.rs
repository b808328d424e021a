//! Admission-controlled queue of pending ranging windows.
//!
//! Entries execute in insertion order. Admission checks capacity first, then
//! the per-peer quota, then the spacing against the current tail, so a caller
//! always learns about the most fundamental limit it hit.

use core::fmt;

use heapless::Deque;

use crate::config::DEFAULT_QUEUE_CAPACITY;
use crate::request::{PeerAddress, RangingRequest};
use crate::time::{self, Ticks};

/// A request plus the scheduling data derived from it at admission.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueEntry {
    pub request: RangingRequest,
    /// Absolute counter value at which the window should open.
    pub start: Ticks,
    pub window_length_us: u32,
    pub timeslot_length_us: u32,
}

impl QueueEntry {
    /// Derives the entry for `request` relative to the `reference` tick.
    pub const fn new(
        request: RangingRequest,
        reference: Ticks,
        window_length_us: u32,
        timeslot_length_us: u32,
    ) -> Self {
        let delay = time::us_to_ticks(request.start_delay_us as u64);
        Self {
            request,
            start: time::offset(reference, delay),
            window_length_us,
            timeslot_length_us,
        }
    }

    /// Length of the reserved timeslot in counter ticks.
    pub const fn timeslot_ticks(&self) -> u64 {
        time::us_to_ticks(self.timeslot_length_us as u64)
    }
}

/// Reason an entry was refused by the queue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdmissionError {
    NoMemory,
    PeerQuotaExceeded,
    TimeConflict,
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Time-ordered FIFO of admitted timeslots.
#[derive(Clone, Debug)]
pub struct TimeslotQueue<const CAPACITY: usize = DEFAULT_QUEUE_CAPACITY> {
    entries: Deque<QueueEntry, CAPACITY>,
    peer_quota: usize,
    min_gap_ticks: u64,
}

impl<const CAPACITY: usize> TimeslotQueue<CAPACITY> {
    /// Creates an empty queue.
    pub const fn new(peer_quota: usize, min_gap_us: u32) -> Self {
        Self {
            entries: Deque::new(),
            peer_quota,
            min_gap_ticks: time::us_to_ticks(min_gap_us as u64),
        }
    }

    /// Appends `entry` if it passes every admission check.
    pub fn admit(&mut self, entry: QueueEntry) -> Result<(), AdmissionError> {
        if self.entries.is_full() {
            return Err(AdmissionError::NoMemory);
        }

        if self.count_for_peer(&entry.request.peer) >= self.peer_quota {
            return Err(AdmissionError::PeerQuotaExceeded);
        }

        self.check_spacing(&entry)?;

        self.entries
            .push_back(entry)
            .map_err(|_| AdmissionError::NoMemory)
    }

    fn check_spacing(&self, entry: &QueueEntry) -> Result<(), AdmissionError> {
        let Some(tail) = self.entries.back() else {
            return Ok(());
        };

        let required = tail.timeslot_ticks() + self.min_gap_ticks;
        let gap = time::distance(tail.start, entry.start);

        if !time::is_at_or_after(tail.start, entry.start) || u64::from(gap) < required {
            Err(AdmissionError::TimeConflict)
        } else {
            Ok(())
        }
    }

    /// Returns the entry that executes next.
    pub fn peek(&self) -> Option<&QueueEntry> {
        self.entries.front()
    }

    /// Removes and returns the entry that executes next.
    pub fn pop(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Number of queued entries targeting `peer`.
    pub fn count_for_peer(&self, peer: &PeerAddress) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.request.peer == *peer)
            .count()
    }

    /// Drops every queued entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        CAPACITY
    }
}
