//! Session with the external time-division radio arbiter.
//!
//! The arbiter grants exclusive radio windows. Its request API must never be
//! called from inside its own signal callback, so every call is expressed as
//! a [`SessionCommand`] that a dedicated thread replays through
//! [`ArbiterClient`]. Signals flow the other way through [`SignalHandler`].

use core::fmt;

use portable_atomic::{AtomicU8, Ordering};

/// Lifecycle of the arbiter session as tracked by the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ArbiterState {
    /// No session has been opened yet.
    Init = 0,
    /// A calibration window must be requested before normal windows.
    NeedEarlyWindow = 1,
    /// A calibration window has been requested.
    EarlyWindowPending = 2,
    /// Calibrated; ready to request the next normal window.
    Idle = 3,
    /// A normal window has been requested.
    WindowPending = 4,
}

impl ArbiterState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => ArbiterState::NeedEarlyWindow,
            2 => ArbiterState::EarlyWindowPending,
            3 => ArbiterState::Idle,
            4 => ArbiterState::WindowPending,
            _ => ArbiterState::Init,
        }
    }

    /// Returns `true` while a window request is outstanding.
    pub const fn is_pending(self) -> bool {
        matches!(
            self,
            ArbiterState::EarlyWindowPending | ArbiterState::WindowPending
        )
    }
}

/// Atomically updated [`ArbiterState`] readable from every context.
#[derive(Debug)]
pub struct SessionState {
    raw: AtomicU8,
}

impl SessionState {
    pub const fn new() -> Self {
        Self {
            raw: AtomicU8::new(ArbiterState::Init as u8),
        }
    }

    pub fn get(&self) -> ArbiterState {
        ArbiterState::from_raw(self.raw.load(Ordering::Acquire))
    }

    /// Unconditionally moves to `next`.
    pub fn force(&self, next: ArbiterState) {
        self.raw.store(next as u8, Ordering::Release);
    }

    /// Moves from `from` to `to` if no other context changed the state first.
    ///
    /// Returns the observed state on failure.
    pub fn transition(&self, from: ArbiterState, to: ArbiterState) -> Result<(), ArbiterState> {
        self.raw
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ArbiterState::from_raw)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Purpose of a requested window.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WindowKind {
    /// Calibration window; no measurement is performed.
    Early,
    /// Window carrying one ranging exchange.
    Normal,
}

/// Window request forwarded to the arbiter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WindowRequest {
    /// Earliest possible window of `length_us`.
    Earliest { length_us: u32 },
    /// Window starting `distance_us` after the start of the previous window.
    Normal { distance_us: u32, length_us: u32 },
}

impl WindowRequest {
    pub const fn kind(&self) -> WindowKind {
        match self {
            WindowRequest::Earliest { .. } => WindowKind::Early,
            WindowRequest::Normal { .. } => WindowKind::Normal,
        }
    }
}

/// Work item consumed by the arbiter-call thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionCommand {
    Open,
    Request(WindowRequest),
}

/// Asynchronous notification delivered by the arbiter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArbiterSignal {
    WindowStart,
    SessionIdle,
    Blocked,
    Cancelled,
    InvalidReturn,
    SessionClosed,
}

/// Action returned synchronously from a signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SignalAction {
    None,
    EndWindow,
}

/// Identifier assigned by the arbiter to an open session.
pub type SessionId = u8;

/// Failure reported by the arbiter API.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArbiterError {
    /// The arbiter refused the call.
    Rejected,
    /// A window was requested before a session was opened.
    SessionNotOpen,
}

impl fmt::Display for ArbiterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Receives arbiter signals, possibly from interrupt context.
pub trait SignalHandler {
    fn on_signal(&self, signal: ArbiterSignal) -> SignalAction;
}

impl<T: SignalHandler + ?Sized> SignalHandler for &T {
    fn on_signal(&self, signal: ArbiterSignal) -> SignalAction {
        (**self).on_signal(signal)
    }
}

/// External time-division radio arbiter.
///
/// Implementations are not reentrant: they must only be called from the
/// arbiter-call thread, never from inside a signal callback.
pub trait RadioArbiter<H: SignalHandler> {
    /// Opens a session whose signals are delivered to `handler`.
    fn open_session(&mut self, handler: H) -> Result<SessionId, ArbiterError>;

    /// Requests a window inside an open session.
    fn request_window(
        &mut self,
        session: SessionId,
        request: WindowRequest,
    ) -> Result<(), ArbiterError>;
}

/// Outcomes of arbiter calls reported back to the scheduler.
pub trait SessionEvents {
    fn session_opened(&self);
    fn session_open_failed(&self, error: ArbiterError);
    fn window_request_failed(&self, kind: WindowKind, error: ArbiterError);
}

impl<T: SessionEvents + ?Sized> SessionEvents for &T {
    fn session_opened(&self) {
        (**self).session_opened();
    }

    fn session_open_failed(&self, error: ArbiterError) {
        (**self).session_open_failed(error);
    }

    fn window_request_failed(&self, kind: WindowKind, error: ArbiterError) {
        (**self).window_request_failed(kind, error);
    }
}

/// Replays [`SessionCommand`]s against the arbiter on the arbiter-call thread.
pub struct ArbiterClient<A, H> {
    arbiter: A,
    handler: H,
    session: Option<SessionId>,
}

impl<A, H> ArbiterClient<A, H>
where
    H: SignalHandler + Clone,
    A: RadioArbiter<H>,
{
    pub const fn new(arbiter: A, handler: H) -> Self {
        Self {
            arbiter,
            handler,
            session: None,
        }
    }

    /// Returns the open session, if any.
    pub const fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn arbiter(&self) -> &A {
        &self.arbiter
    }

    pub fn arbiter_mut(&mut self) -> &mut A {
        &mut self.arbiter
    }

    /// Executes one command and reports its outcome to `events`.
    pub fn execute<E: SessionEvents>(&mut self, command: SessionCommand, events: &E) {
        match command {
            SessionCommand::Open => match self.arbiter.open_session(self.handler.clone()) {
                Ok(session) => {
                    self.session = Some(session);
                    events.session_opened();
                }
                Err(error) => events.session_open_failed(error),
            },
            SessionCommand::Request(request) => {
                let result = match self.session {
                    Some(session) => self.arbiter.request_window(session, request),
                    None => Err(ArbiterError::SessionNotOpen),
                };

                if let Err(error) = result {
                    events.window_request_failed(request.kind(), error);
                }
            }
        }
    }
}
