//! Status codes surfaced to callers of the DM API.

use core::fmt;

use crate::queue::AdmissionError;

/// Error returned synchronously by the caller-facing API.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmError {
    /// The request cannot be scheduled with the configured limits.
    InvalidArgument,
    /// The timeslot queue (or a bounded command queue) is full.
    NoMemory,
    /// Too many outstanding requests already target the same peer.
    PeerQuotaExceeded,
    /// The request starts too close to the last queued timeslot.
    TimeConflict,
}

impl DmError {
    /// Small negative status code matching the errno values used on target.
    pub const fn code(self) -> i32 {
        match self {
            DmError::InvalidArgument => -22,
            DmError::NoMemory => -12,
            DmError::PeerQuotaExceeded => -16,
            DmError::TimeConflict => -11,
        }
    }
}

impl fmt::Display for DmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DmError::InvalidArgument => "invalid argument",
            DmError::NoMemory => "timeslot queue full",
            DmError::PeerQuotaExceeded => "peer quota exceeded",
            DmError::TimeConflict => "overlaps previous timeslot",
        };
        write!(f, "{text} ({})", self.code())
    }
}

impl core::error::Error for DmError {}

impl From<AdmissionError> for DmError {
    fn from(value: AdmissionError) -> Self {
        match value {
            AdmissionError::NoMemory => DmError::NoMemory,
            AdmissionError::PeerQuotaExceeded => DmError::PeerQuotaExceeded,
            AdmissionError::TimeConflict => DmError::TimeConflict,
        }
    }
}
