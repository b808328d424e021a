//! Interface to the ranging engine that performs the actual measurement.

use core::fmt;

use crate::request::{PeerAddress, RangingMode, RangingRequest, RangingResult, Role};

/// Parameters handed to the engine before a window's measurement.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MeasurementConfig {
    pub role: Role,
    pub peer: PeerAddress,
    pub mode: RangingMode,
    pub nonce: u32,
    pub window_length_us: u32,
}

impl MeasurementConfig {
    pub const fn for_request(request: &RangingRequest, window_length_us: u32) -> Self {
        Self {
            role: request.role,
            peer: request.peer,
            mode: request.mode,
            nonce: request.nonce,
            window_length_us,
        }
    }
}

/// Reason a measurement did not complete.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MeasurementError {
    Configuration,
    Timeout,
    Aborted,
}

impl fmt::Display for MeasurementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Radio measurement engine driven inside granted windows.
///
/// `configure` and `execute` run from the arbiter's signal context and must
/// finish within the window. `populate_report` and `calculate` run later on
/// the DM worker thread. Every call is made with the platform's
/// [`EngineLock`](crate::scheduler::Platform::EngineLock) held.
pub trait RangingEngine {
    /// Raw data captured during a window.
    type Report;

    fn configure(&mut self, config: &MeasurementConfig) -> Result<(), MeasurementError>;

    fn execute(&mut self, window_length_us: u32) -> Result<(), MeasurementError>;

    fn populate_report(&mut self) -> Self::Report;

    fn calculate(&mut self, report: &Self::Report) -> RangingResult;
}
