#![allow(dead_code)]

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::rc::Rc;

use dm_core::config::SchedulerConfig;
use dm_core::engine::{MeasurementConfig, MeasurementError, RangingEngine};
use dm_core::request::{
    DistanceEstimates, PeerAddress, Quality, RangingMode, RangingRequest, RangingResult, Role,
};
use dm_core::scheduler::{
    DmCallbacks, DmEvent, EnqueueError, Platform, Ports, QueueProducer, ResyncTimer, Scheduler,
};
use dm_core::session::{
    ArbiterClient, ArbiterError, ArbiterSignal, ArbiterState, RadioArbiter, SessionCommand,
    SessionId, SignalAction, SignalHandler, WindowRequest,
};
use dm_core::time::{self, TickSource, Ticks};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use heapless::{Deque, Vec};

pub const MOCK_QUEUE_DEPTH: usize = 16;

/// Initiator RTT window: exchange plus protocol overhead.
pub const RTT_WINDOW_US: u32 = 4_000;
/// `RTT_WINDOW_US` plus scheduling overhead.
pub const RTT_TIMESLOT_US: u32 = 4_750;
/// Delay that keeps consecutive RTT requests clear of each other.
pub const SPACING_US: u32 = 6_000;

pub struct MockQueue<T> {
    items: RefCell<Deque<T, MOCK_QUEUE_DEPTH>>,
    limit: Cell<usize>,
}

impl<T> MockQueue<T> {
    pub fn new() -> Self {
        Self {
            items: RefCell::new(Deque::new()),
            limit: Cell::new(MOCK_QUEUE_DEPTH),
        }
    }

    /// Caps how many items the queue accepts before reporting `QueueFull`.
    pub fn set_limit(&self, limit: usize) {
        self.limit.set(limit);
    }

    pub fn pop(&self) -> Option<T> {
        self.items.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }
}

impl<T> QueueProducer<T> for MockQueue<T> {
    fn try_enqueue(&self, item: T) -> Result<(), EnqueueError> {
        let mut items = self.items.borrow_mut();
        if items.len() >= self.limit.get() {
            return Err(EnqueueError::QueueFull);
        }
        items.push_back(item).map_err(|_| EnqueueError::QueueFull)
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.limit.get())
    }
}

#[derive(Default)]
pub struct MockClock {
    now: Cell<Ticks>,
}

impl MockClock {
    pub fn set(&self, ticks: Ticks) {
        self.now.set(ticks);
    }

    pub fn advance_us(&self, us: u64) {
        self.now
            .set(time::offset(self.now.get(), time::us_to_ticks(us)));
    }
}

impl TickSource for MockClock {
    fn now(&self) -> Ticks {
        self.now.get()
    }
}

#[derive(Default)]
pub struct MockTimer {
    pub arms: Cell<usize>,
    pub period: Cell<Option<Duration>>,
}

impl ResyncTimer for MockTimer {
    fn arm(&self, period: Duration) {
        self.arms.set(self.arms.get() + 1);
        self.period.set(Some(period));
    }
}

/// Shared script for [`MockEngine`]; the engine itself lives inside the scheduler.
#[derive(Default)]
pub struct EngineScript {
    failures: Cell<usize>,
    configured: RefCell<Vec<MeasurementConfig, 16>>,
}

impl EngineScript {
    pub fn fail_next(&self, count: usize) {
        self.failures.set(count);
    }

    pub fn configured(&self) -> Vec<MeasurementConfig, 16> {
        self.configured.borrow().clone()
    }
}

pub struct MockEngine {
    script: Rc<EngineScript>,
    current: Option<MeasurementConfig>,
}

pub const MOCK_DISTANCE_M: f32 = 1.5;

impl RangingEngine for MockEngine {
    type Report = Option<MeasurementConfig>;

    fn configure(&mut self, config: &MeasurementConfig) -> Result<(), MeasurementError> {
        self.current = Some(*config);
        let _ = self.script.configured.borrow_mut().push(*config);
        Ok(())
    }

    fn execute(&mut self, _window_length_us: u32) -> Result<(), MeasurementError> {
        let remaining = self.script.failures.get();
        if remaining > 0 {
            self.script.failures.set(remaining - 1);
            return Err(MeasurementError::Timeout);
        }
        Ok(())
    }

    fn populate_report(&mut self) -> Self::Report {
        self.current.take()
    }

    fn calculate(&mut self, report: &Self::Report) -> RangingResult {
        match report {
            Some(config) => RangingResult {
                status: true,
                quality: Quality::Ok,
                peer: config.peer,
                mode: config.mode,
                estimates: DistanceEstimates::Rtt {
                    rtt: MOCK_DISTANCE_M,
                },
            },
            None => RangingResult {
                status: false,
                quality: Quality::None,
                peer: PeerAddress::public([0; 6]),
                mode: RangingMode::Rtt,
                estimates: DistanceEstimates::Rtt { rtt: 0.0 },
            },
        }
    }
}

#[derive(Default)]
pub struct RecordingCallbacks {
    pub results: RefCell<Vec<RangingResult, 16>>,
}

impl DmCallbacks for RecordingCallbacks {
    fn data_ready(&self, result: &RangingResult) {
        let _ = self.results.borrow_mut().push(*result);
    }
}

/// Arbiter that records accepted requests; signals are delivered by the test.
#[derive(Default)]
pub struct MockArbiter {
    pub open_attempts: usize,
    pub fail_opens: usize,
    pub fail_requests: usize,
    pub requests: Vec<WindowRequest, 32>,
}

impl<H: SignalHandler> RadioArbiter<H> for MockArbiter {
    fn open_session(&mut self, _handler: H) -> Result<SessionId, ArbiterError> {
        self.open_attempts += 1;
        if self.fail_opens > 0 {
            self.fail_opens -= 1;
            return Err(ArbiterError::Rejected);
        }
        Ok(1)
    }

    fn request_window(
        &mut self,
        _session: SessionId,
        request: WindowRequest,
    ) -> Result<(), ArbiterError> {
        if self.fail_requests > 0 {
            self.fail_requests -= 1;
            return Err(ArbiterError::Rejected);
        }
        self.requests
            .push(request)
            .map_err(|_| ArbiterError::Rejected)
    }
}

pub struct MockPlatform;

impl Platform for MockPlatform {
    type Engine = MockEngine;
    type Commands = MockQueue<SessionCommand>;
    type Events = MockQueue<DmEvent>;
    type Clock = MockClock;
    type Timer = MockTimer;
    type Callbacks = RecordingCallbacks;
    // Single-threaded: signals are delivered by the test itself.
    type EngineLock = NoopRawMutex;
}

pub type TestScheduler = Scheduler<MockPlatform>;
pub type TestClient<'a> = ArbiterClient<MockArbiter, &'a TestScheduler>;

/// Scheduler wired to mocks, driven synchronously by the test thread.
pub struct Rig {
    pub scheduler: TestScheduler,
    pub engine: Rc<EngineScript>,
}

impl Rig {
    pub fn new(config: SchedulerConfig) -> Self {
        let engine = Rc::new(EngineScript::default());
        let ports = Ports::<MockPlatform> {
            engine: MockEngine {
                script: Rc::clone(&engine),
                current: None,
            },
            commands: MockQueue::new(),
            events: MockQueue::new(),
            clock: MockClock::default(),
            timer: MockTimer::default(),
            callbacks: RecordingCallbacks::default(),
        };

        Self {
            scheduler: Scheduler::new(config, ports),
            engine,
        }
    }

    pub fn client(&self) -> TestClient<'_> {
        ArbiterClient::new(MockArbiter::default(), &self.scheduler)
    }

    pub fn clock(&self) -> &MockClock {
        self.scheduler.clock()
    }

    /// Replays queued arbiter commands and DM events until both queues are empty.
    pub fn settle(&self, client: &mut TestClient<'_>) {
        loop {
            let mut progressed = false;

            while let Some(command) = self.scheduler.commands().pop() {
                client.execute(command, &self.scheduler);
                progressed = true;
            }

            while let Some(event) = self.scheduler.events().pop() {
                self.scheduler.handle_event(event);
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
    }

    pub fn signal(&self, signal: ArbiterSignal) -> SignalAction {
        self.scheduler.on_signal(signal)
    }

    /// Grants the outstanding window and lets it run to completion.
    pub fn run_window(&self, client: &mut TestClient<'_>) {
        assert_eq!(self.signal(ArbiterSignal::WindowStart), SignalAction::EndWindow);
        assert_eq!(self.signal(ArbiterSignal::SessionIdle), SignalAction::None);
        self.settle(client);
    }

    /// Opens the session and completes the calibration window.
    pub fn calibrate(&self, client: &mut TestClient<'_>) {
        self.scheduler
            .open_session()
            .expect("open command queued");
        self.settle(client);
        assert_eq!(self.scheduler.state(), ArbiterState::EarlyWindowPending);
        self.run_window(client);
    }

    pub fn results(&self) -> Vec<RangingResult, 16> {
        self.scheduler.callbacks().results.borrow().clone()
    }
}

pub fn peer(id: u8) -> PeerAddress {
    PeerAddress::random([0xE5, 0x10, 0x00, 0x00, 0x00, id])
}

pub fn initiator(peer_id: u8, delay_us: u32) -> RangingRequest {
    RangingRequest::new(Role::Initiator, peer(peer_id), RangingMode::Rtt)
        .with_start_delay_us(delay_us)
}
