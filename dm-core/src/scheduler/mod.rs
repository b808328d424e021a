//! DM orchestrator.
//!
//! [`Scheduler`] owns the timeslot queue, the arbiter session state, and the
//! single in-flight execution context. It is driven from three directions:
//!
//! * callers, through [`Scheduler::add_request`];
//! * the arbiter's signal context, through [`SignalHandler::on_signal`];
//! * the DM worker thread, through [`Scheduler::handle_event`], and the
//!   arbiter-call thread, through [`SessionEvents`].
//!
//! Nothing here blocks on a queue or calls the arbiter directly. Arbiter calls
//! are posted as [`SessionCommand`]s and window completions are posted as
//! [`DmEvent`]s so that neither runs on the signal-delivery stack.

use core::cell::RefCell;
use core::mem;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use portable_atomic::{AtomicBool, AtomicU8, Ordering};

use crate::config::{DEFAULT_QUEUE_CAPACITY, SchedulerConfig};
use crate::engine::{MeasurementConfig, RangingEngine};
use crate::error::DmError;
use crate::queue::{QueueEntry, TimeslotQueue};
use crate::request::RangingRequest;
use crate::session::{
    ArbiterError, ArbiterSignal, ArbiterState, SessionCommand, SessionEvents, SessionState,
    SignalAction, SignalHandler, WindowKind, WindowRequest,
};
use crate::time::{self, TickSource, Ticks};

pub mod ports;

pub use ports::{
    DmCallbacks, DmEvent, EnqueueError, Platform, Ports, QueueProducer, ResyncTimer,
};

type DmMutex = CriticalSectionRawMutex;

/// The window currently requested from, or granted by, the arbiter.
#[derive(Copy, Clone, Debug, Default)]
struct ExecutionContext {
    /// Working copy of the dequeued entry; never a reference into the queue.
    working: Option<QueueEntry>,
    window: Option<WindowKind>,
    started: bool,
    measurement_ok: bool,
    last_window_start: Option<Ticks>,
    last_timeslot_us: u32,
}

struct Shared<const CAPACITY: usize> {
    queue: TimeslotQueue<CAPACITY>,
    exec: ExecutionContext,
}

enum NormalPlan {
    Nothing,
    Recalibrate,
    Window { entry: QueueEntry, distance_us: u32 },
}

/// Point-in-time view of the scheduler.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SchedulerStatus {
    pub state: ArbiterState,
    pub queued: usize,
    pub pending_window: Option<WindowKind>,
    pub last_window_start: Option<Ticks>,
}

/// Serialises ranging windows through the external radio arbiter.
pub struct Scheduler<P: Platform, const CAPACITY: usize = DEFAULT_QUEUE_CAPACITY> {
    config: SchedulerConfig,
    state: SessionState,
    opening: AtomicBool,
    resync_expired: AtomicBool,
    /// Arbiter failures since the last window started.
    failures: AtomicU8,
    shared: Mutex<DmMutex, RefCell<Shared<CAPACITY>>>,
    engine: Mutex<P::EngineLock, RefCell<P::Engine>>,
    commands: P::Commands,
    events: P::Events,
    clock: P::Clock,
    timer: P::Timer,
    callbacks: P::Callbacks,
}

impl<P: Platform, const CAPACITY: usize> Scheduler<P, CAPACITY> {
    /// Creates a scheduler in the [`ArbiterState::Init`] state with an empty queue.
    pub fn new(config: SchedulerConfig, ports: Ports<P>) -> Self {
        let Ports {
            engine,
            commands,
            events,
            clock,
            timer,
            callbacks,
        } = ports;

        Self {
            shared: Mutex::new(RefCell::new(Shared {
                queue: TimeslotQueue::new(config.peer_quota, config.min_slot_gap_us),
                exec: ExecutionContext::default(),
            })),
            engine: Mutex::new(RefCell::new(engine)),
            config,
            state: SessionState::new(),
            opening: AtomicBool::new(false),
            resync_expired: AtomicBool::new(false),
            failures: AtomicU8::new(0),
            commands,
            events,
            clock,
            timer,
            callbacks,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> ArbiterState {
        self.state.get()
    }

    #[must_use]
    pub fn clock(&self) -> &P::Clock {
        &self.clock
    }

    #[must_use]
    pub fn timer(&self) -> &P::Timer {
        &self.timer
    }

    #[must_use]
    pub fn callbacks(&self) -> &P::Callbacks {
        &self.callbacks
    }

    #[must_use]
    pub fn commands(&self) -> &P::Commands {
        &self.commands
    }

    #[must_use]
    pub fn events(&self) -> &P::Events {
        &self.events
    }

    /// Number of admitted requests still waiting for a window.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.lock(|cell| cell.borrow().queue.len())
    }

    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.get();
        self.shared.lock(|cell| {
            let shared = cell.borrow();
            SchedulerStatus {
                state,
                queued: shared.queue.len(),
                pending_window: shared.exec.window,
                last_window_start: shared.exec.last_window_start,
            }
        })
    }

    /// Posts the session-open command unless a session exists or is being opened.
    pub fn open_session(&self) -> Result<(), DmError> {
        if self.state.get() != ArbiterState::Init || self.opening.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.commands
            .try_enqueue(SessionCommand::Open)
            .map_err(|error| {
                self.opening.store(false, Ordering::Release);
                warn!("session open not queued: {:?}", error);
                DmError::NoMemory
            })
    }

    /// Admits `request` and tries to start it right away.
    pub fn add_request(&self, request: RangingRequest) -> Result<(), DmError> {
        self.admit(request)?;
        self.attempt_start();
        Ok(())
    }

    fn admit(&self, request: RangingRequest) -> Result<(), DmError> {
        self.config.validate_start_delay(&request)?;
        let window_us = self.config.window_length_us(&request)?;
        let timeslot_us = self.config.timeslot_length_us(window_us);
        let entry = QueueEntry::new(request, self.clock.now(), window_us, timeslot_us);

        self.shared.lock(|cell| {
            cell.borrow_mut()
                .queue
                .admit(entry)
                .map_err(DmError::from)
        })
    }

    /// Drops every queued request and the in-flight working copy.
    pub fn reset(&self) {
        self.shared.lock(|cell| {
            let mut shared = cell.borrow_mut();
            shared.queue.clear();
            shared.exec.working = None;
        });
    }

    /// Drives the session one step forward if nothing is pending.
    pub fn attempt_start(&self) {
        if self.state.get().is_pending() {
            return;
        }

        self.shared.lock(|cell| {
            let mut shared = cell.borrow_mut();
            self.apply_resync_expiry();

            loop {
                match self.state.get() {
                    ArbiterState::Init => {
                        // Failures are logged by open_session and retried on the next attempt.
                        let _ = self.open_session();
                        break;
                    }
                    ArbiterState::NeedEarlyWindow => {
                        self.request_early(&mut shared.exec);
                        break;
                    }
                    ArbiterState::Idle => match self.plan_normal(&shared) {
                        NormalPlan::Nothing => break,
                        NormalPlan::Recalibrate => {
                            if self
                                .state
                                .transition(ArbiterState::Idle, ArbiterState::NeedEarlyWindow)
                                .is_ok()
                            {
                                debug!("recalibrating before next window");
                            }
                        }
                        NormalPlan::Window { entry, distance_us } => {
                            self.request_normal(&mut shared, entry, distance_us);
                            break;
                        }
                    },
                    ArbiterState::EarlyWindowPending | ArbiterState::WindowPending => break,
                }
            }
        });
    }

    fn apply_resync_expiry(&self) {
        if !self.resync_expired.load(Ordering::Acquire) {
            return;
        }

        match self.state.get() {
            ArbiterState::Idle => {
                if self
                    .state
                    .transition(ArbiterState::Idle, ArbiterState::NeedEarlyWindow)
                    .is_ok()
                {
                    self.resync_expired.store(false, Ordering::Release);
                    info!("resync interval elapsed; recalibrating");
                }
            }
            ArbiterState::Init | ArbiterState::NeedEarlyWindow => {
                self.resync_expired.store(false, Ordering::Release);
            }
            // Applied once the pending window completes.
            ArbiterState::EarlyWindowPending | ArbiterState::WindowPending => {}
        }
    }

    fn request_early(&self, exec: &mut ExecutionContext) {
        if self
            .state
            .transition(ArbiterState::NeedEarlyWindow, ArbiterState::EarlyWindowPending)
            .is_err()
        {
            return;
        }

        exec.window = Some(WindowKind::Early);
        exec.started = false;

        let request = WindowRequest::Earliest {
            length_us: self.config.early_window_us,
        };
        match self.commands.try_enqueue(SessionCommand::Request(request)) {
            Ok(()) => debug!("calibration window requested"),
            Err(error) => {
                exec.window = None;
                let _ = self.state.transition(
                    ArbiterState::EarlyWindowPending,
                    ArbiterState::NeedEarlyWindow,
                );
                warn!("calibration request not queued: {:?}", error);
            }
        }
    }

    fn plan_normal(&self, shared: &Shared<CAPACITY>) -> NormalPlan {
        let Some(entry) = shared.queue.peek().copied() else {
            return NormalPlan::Nothing;
        };
        let Some(last_start) = shared.exec.last_window_start else {
            return NormalPlan::Recalibrate;
        };

        let now = self.clock.now();
        if !time::is_at_or_after(last_start, now) {
            return NormalPlan::Recalibrate;
        }

        let lead = time::us_to_ticks(u64::from(self.config.timing.scheduling_overhead_us));
        let earliest = time::offset(now, lead);
        let start = if time::is_at_or_after(earliest, entry.start) {
            entry.start
        } else {
            earliest
        };

        let offset_us = time::ticks_to_us(u64::from(time::distance(last_start, start)));
        let min_us = shared
            .exec
            .last_timeslot_us
            .saturating_add(self.config.min_slot_gap_us);
        let distance_us = offset_us.max(u64::from(min_us));

        match u32::try_from(distance_us) {
            Ok(distance_us) if distance_us <= self.config.max_normal_distance_us => {
                NormalPlan::Window { entry, distance_us }
            }
            _ => NormalPlan::Recalibrate,
        }
    }

    fn request_normal(&self, shared: &mut Shared<CAPACITY>, entry: QueueEntry, distance_us: u32) {
        if self
            .state
            .transition(ArbiterState::Idle, ArbiterState::WindowPending)
            .is_err()
        {
            return;
        }

        let exec = &mut shared.exec;
        exec.working = Some(entry);
        exec.window = Some(WindowKind::Normal);
        exec.started = false;
        exec.measurement_ok = false;

        let request = WindowRequest::Normal {
            distance_us,
            length_us: entry.timeslot_length_us,
        };
        match self.commands.try_enqueue(SessionCommand::Request(request)) {
            Ok(()) => {
                shared.queue.pop();
                info!(
                    "window for {} requested {} us after last start ({} us)",
                    entry.request.peer,
                    distance_us,
                    entry.timeslot_length_us
                );
            }
            Err(error) => {
                exec.working = None;
                exec.window = None;
                let _ = self
                    .state
                    .transition(ArbiterState::WindowPending, ArbiterState::Idle);
                warn!("window request not queued: {:?}", error);
            }
        }
    }

    /// Processes one event on the DM worker thread.
    pub fn handle_event(&self, event: DmEvent) {
        match event {
            DmEvent::WindowEnded => self.complete_window(),
            DmEvent::Reschedule => {
                if self.state.get() != ArbiterState::Init {
                    self.state.force(ArbiterState::Idle);
                }
            }
            DmEvent::ResyncExpired => {
                self.resync_expired.store(true, Ordering::Release);
                debug!("resync timer expired");
            }
            DmEvent::Retry => {
                if !self.retry_now() {
                    return;
                }
            }
        }

        self.attempt_start();
    }

    /// Decides whether a failed arbiter call is retried straight away.
    ///
    /// Nothing is retried for an empty queue; the next admission drives it.
    /// Past the immediate retry budget the resync timer is armed with the
    /// back-off period and its expiry drives the next attempt.
    fn retry_now(&self) -> bool {
        if self.queued() == 0 {
            return false;
        }

        let previous = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_add(1)))
            .unwrap_or_else(|n| n);
        if previous < self.config.immediate_retries {
            return true;
        }

        self.timer.arm(self.config.retry_backoff);
        warn!("arbiter keeps failing; retrying after back-off");
        false
    }

    fn complete_window(&self) {
        let (kind, entry, measurement_ok) = self.shared.lock(|cell| {
            let mut shared = cell.borrow_mut();
            let exec = &mut shared.exec;
            (
                exec.window.take(),
                exec.working.take(),
                mem::take(&mut exec.measurement_ok),
            )
        });

        match kind {
            Some(WindowKind::Early) => {
                match self
                    .state
                    .transition(ArbiterState::EarlyWindowPending, ArbiterState::Idle)
                {
                    Ok(()) => {
                        self.timer.arm(self.config.resync_interval);
                        info!("calibrated with arbiter");
                    }
                    Err(actual) => debug!("calibration window ended in {:?}", actual),
                }
            }
            Some(WindowKind::Normal) => {
                if let Some(entry) = entry {
                    self.finish_measurement(&entry, measurement_ok);
                }
                if let Err(actual) = self
                    .state
                    .transition(ArbiterState::WindowPending, ArbiterState::Idle)
                {
                    debug!("window ended in {:?}", actual);
                }
            }
            None => debug!("arbiter idle without a pending window"),
        }
    }

    fn finish_measurement(&self, entry: &QueueEntry, measurement_ok: bool) {
        // Failed measurements produce neither a result nor an error for the caller.
        if !measurement_ok {
            debug!("no result for {}: measurement failed", entry.request.peer);
            return;
        }

        if self.config.reschedule_completed {
            let next = entry.request.next_round();
            match self.admit(next) {
                Ok(()) => debug!("re-ranging {} queued (nonce {})", next.peer, next.nonce),
                Err(error) => debug!("re-ranging {} not queued: {:?}", next.peer, error),
            }
        }

        let result = self.engine.lock(|cell| {
            let mut engine = cell.borrow_mut();
            let report = engine.populate_report();
            engine.calculate(&report)
        });
        self.callbacks.data_ready(&result);
    }

    fn window_started(&self) -> SignalAction {
        let now = self.clock.now();
        self.failures.store(0, Ordering::Release);
        let job = self.shared.lock(|cell| {
            let mut shared = cell.borrow_mut();
            let exec = &mut shared.exec;
            exec.started = true;
            exec.measurement_ok = false;
            exec.last_window_start = Some(now);

            if exec.window == Some(WindowKind::Normal) {
                exec.last_timeslot_us = exec.working.map_or(0, |entry| entry.timeslot_length_us);
                exec.working
            } else {
                exec.last_timeslot_us = self.config.early_window_us;
                None
            }
        });

        if let Some(entry) = job {
            let outcome = self.engine.lock(|cell| {
                let mut engine = cell.borrow_mut();
                let config = MeasurementConfig::for_request(&entry.request, entry.window_length_us);
                engine.configure(&config)?;
                engine.execute(entry.window_length_us)
            });

            if let Err(error) = outcome {
                debug!("measurement with {} failed: {:?}", entry.request.peer, error);
            }
            let measurement_ok = outcome.is_ok();
            self.shared
                .lock(|cell| cell.borrow_mut().exec.measurement_ok = measurement_ok);
        }

        SignalAction::EndWindow
    }

    fn session_idle(&self) {
        let ended = self
            .shared
            .lock(|cell| mem::take(&mut cell.borrow_mut().exec.started));
        if ended {
            self.post_event(DmEvent::WindowEnded);
        }
    }

    fn window_aborted(&self, signal: ArbiterSignal) {
        let dropped = self.shared.lock(|cell| {
            let mut shared = cell.borrow_mut();
            let exec = &mut shared.exec;
            exec.started = false;
            exec.window = None;
            exec.measurement_ok = false;
            exec.working.take()
        });

        match dropped {
            Some(entry) => warn!(
                "window for {} aborted by {:?}; request dropped",
                entry.request.peer,
                signal
            ),
            None => debug!("arbiter signalled {:?}", signal),
        }
        self.post_event(DmEvent::Reschedule);
    }

    fn session_closed(&self) {
        self.shared
            .lock(|cell| cell.borrow_mut().exec = ExecutionContext::default());
        self.state.force(ArbiterState::Init);
        warn!("arbiter session closed; reopening");
        let _ = self.open_session();
    }

    fn post_event(&self, event: DmEvent) {
        if let Err(error) = self.events.try_enqueue(event) {
            warn!("dropped {:?}: {:?}", event, error);
        }
    }
}

impl<P: Platform, const CAPACITY: usize> SignalHandler for Scheduler<P, CAPACITY> {
    fn on_signal(&self, signal: ArbiterSignal) -> SignalAction {
        match signal {
            ArbiterSignal::WindowStart => self.window_started(),
            ArbiterSignal::SessionIdle => {
                self.session_idle();
                SignalAction::None
            }
            ArbiterSignal::Blocked | ArbiterSignal::Cancelled | ArbiterSignal::InvalidReturn => {
                self.window_aborted(signal);
                SignalAction::None
            }
            ArbiterSignal::SessionClosed => {
                self.session_closed();
                SignalAction::None
            }
        }
    }
}

impl<P: Platform, const CAPACITY: usize> SessionEvents for Scheduler<P, CAPACITY> {
    fn session_opened(&self) {
        self.opening.store(false, Ordering::Release);
        if self
            .state
            .transition(ArbiterState::Init, ArbiterState::NeedEarlyWindow)
            .is_ok()
        {
            info!("arbiter session opened");
        }
        self.attempt_start();
    }

    fn session_open_failed(&self, error: ArbiterError) {
        self.opening.store(false, Ordering::Release);
        warn!("arbiter session open failed: {:?}", error);
        self.post_event(DmEvent::Retry);
    }

    fn window_request_failed(&self, kind: WindowKind, error: ArbiterError) {
        let dropped = self.shared.lock(|cell| {
            let mut shared = cell.borrow_mut();
            let exec = &mut shared.exec;
            if exec.window == Some(kind) {
                exec.window = None;
                exec.started = false;
            }
            match kind {
                WindowKind::Normal => exec.working.take(),
                WindowKind::Early => None,
            }
        });

        let reverted = match kind {
            WindowKind::Early => self
                .state
                .transition(ArbiterState::EarlyWindowPending, ArbiterState::NeedEarlyWindow),
            WindowKind::Normal => self
                .state
                .transition(ArbiterState::WindowPending, ArbiterState::Idle),
        };

        warn!("{:?} window request failed: {:?}", kind, error);
        if let Some(entry) = dropped {
            debug!("request for {} dropped", entry.request.peer);
        }
        if let Err(actual) = reverted {
            debug!("request failure observed in {:?}", actual);
        }
        self.post_event(DmEvent::Retry);
    }
}
