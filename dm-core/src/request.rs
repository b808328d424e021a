//! Ranging requests submitted by callers and the results delivered back.

use core::fmt;

/// Part this device plays in a ranging exchange.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    Initiator,
    Reflector,
}

/// Measurement technique used during the window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RangingMode {
    /// Round-trip timing.
    Rtt,
    /// Multi-carrier phase difference.
    Mcpd,
}

/// Link-layer address type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressKind {
    Public,
    Random,
}

/// Link-layer identity of the remote device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerAddress {
    pub kind: AddressKind,
    /// Address bytes, most significant first.
    pub bytes: [u8; 6],
}

impl PeerAddress {
    pub const fn public(bytes: [u8; 6]) -> Self {
        Self {
            kind: AddressKind::Public,
            bytes,
        }
    }

    pub const fn random(bytes: [u8; 6]) -> Self {
        Self {
            kind: AddressKind::Random,
            bytes,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.bytes;
        let kind = match self.kind {
            AddressKind::Public => "public",
            AddressKind::Random => "random",
        };
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X} ({kind})")
    }
}

/// Caller intent for a single ranging exchange.
///
/// The request is copied into the timeslot queue on admission; only the
/// `nonce` changes afterwards, and only when the scheduler re-queues the
/// request for periodic re-ranging.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RangingRequest {
    pub role: Role,
    pub peer: PeerAddress,
    pub mode: RangingMode,
    /// Delay between admission and the start of the window.
    pub start_delay_us: u32,
    /// Padding added to the computed window length.
    pub extra_window_us: u32,
    /// Seed shared with the peer; incremented on every re-queue.
    pub nonce: u32,
}

impl RangingRequest {
    /// Creates a request that starts as soon as possible with no padding.
    pub const fn new(role: Role, peer: PeerAddress, mode: RangingMode) -> Self {
        Self {
            role,
            peer,
            mode,
            start_delay_us: 0,
            extra_window_us: 0,
            nonce: 0,
        }
    }

    #[must_use]
    pub const fn with_start_delay_us(mut self, delay_us: u32) -> Self {
        self.start_delay_us = delay_us;
        self
    }

    #[must_use]
    pub const fn with_extra_window_us(mut self, extra_us: u32) -> Self {
        self.extra_window_us = extra_us;
        self
    }

    #[must_use]
    pub const fn with_nonce(mut self, nonce: u32) -> Self {
        self.nonce = nonce;
        self
    }

    /// Returns the copy that is re-queued after a completed window.
    #[must_use]
    pub const fn next_round(mut self) -> Self {
        self.nonce = self.nonce.wrapping_add(1);
        self
    }
}

/// Classification of a measurement as reported by the ranging engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Quality {
    Ok,
    Poor,
    DoNotUse,
    CrcFail,
    None,
}

/// Mode-specific distance estimates in metres.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DistanceEstimates {
    Rtt {
        rtt: f32,
    },
    Mcpd {
        ifft: f32,
        phase_slope: f32,
        rssi_openspace: f32,
        best: f32,
    },
}

impl DistanceEstimates {
    /// Returns the estimate the engine considers most reliable.
    pub const fn best(&self) -> f32 {
        match self {
            DistanceEstimates::Rtt { rtt } => *rtt,
            DistanceEstimates::Mcpd { best, .. } => *best,
        }
    }
}

/// Outcome of one successfully completed ranging window.
#[derive(Copy, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RangingResult {
    pub status: bool,
    pub quality: Quality,
    pub peer: PeerAddress,
    pub mode: RangingMode,
    pub estimates: DistanceEstimates,
}
