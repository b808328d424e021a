//! Seams between the scheduler and the embedding runtime.
//!
//! The scheduler never blocks on a queue and never owns a thread. Firmware
//! and host runtimes provide bounded queues, a tick source, a resync timer,
//! and result callbacks that satisfy these traits.

use core::time::Duration;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::engine::RangingEngine;
use crate::request::RangingResult;
use crate::session::SessionCommand;
use crate::time::TickSource;

/// Work item consumed by the DM worker thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DmEvent {
    /// The arbiter went idle after a started window.
    WindowEnded,
    /// The outstanding request was blocked, cancelled, or rejected.
    Reschedule,
    /// The resync timer fired.
    ResyncExpired,
    /// An arbiter call failed; queued requests still need a window.
    Retry,
}

/// Error surfaced when an item cannot be enqueued.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnqueueError {
    /// Queue has reached its maximum capacity.
    QueueFull,
    /// Queue has been disconnected from its consumer.
    Disconnected,
}

/// Non-blocking producer side of a bounded queue.
pub trait QueueProducer<T> {
    /// Attempts to enqueue `item` without blocking.
    fn try_enqueue(&self, item: T) -> Result<(), EnqueueError>;

    /// Returns the queue capacity if it is known.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// One-shot timer that requests re-calibration when it expires.
///
/// The embedding runtime reports expiry by handing
/// [`DmEvent::ResyncExpired`] to the scheduler. The scheduler also arms it
/// with a short period to back off after repeated arbiter failures; it is only
/// armed from the DM worker thread.
pub trait ResyncTimer {
    /// (Re)arms the timer to fire once after `period`.
    fn arm(&self, period: Duration);
}

/// Result delivery table supplied at initialisation.
pub trait DmCallbacks {
    /// Invoked from the DM worker thread once per successful window.
    fn data_ready(&self, result: &RangingResult);
}

impl<F> DmCallbacks for F
where
    F: Fn(&RangingResult),
{
    fn data_ready(&self, result: &RangingResult) {
        self(result);
    }
}

/// Bundle of collaborator types used by a [`Scheduler`](super::Scheduler).
pub trait Platform {
    type Engine: RangingEngine;
    type Commands: QueueProducer<SessionCommand>;
    type Events: QueueProducer<DmEvent>;
    type Clock: TickSource;
    type Timer: ResyncTimer;
    type Callbacks: DmCallbacks;
    /// Raw mutex held around every engine call, including the measurement
    /// itself in the arbiter's signal context. It must exclude that context
    /// from the DM worker thread. A critical-section mutex keeps interrupts
    /// masked for the whole measurement on single-core targets.
    type EngineLock: RawMutex;
}

/// Concrete collaborator instances handed to [`Scheduler::new`](super::Scheduler::new).
pub struct Ports<P: Platform> {
    pub engine: P::Engine,
    pub commands: P::Commands,
    pub events: P::Events,
    pub clock: P::Clock,
    pub timer: P::Timer,
    pub callbacks: P::Callbacks,
}
