//! Simulated radio arbiter and ranging engine for host runs.
//!
//! [`SimArbiter`] grants windows on its own radio thread so that signals
//! arrive asynchronously, the way they do from the real arbiter's interrupt
//! context. Fault injection is driven through a shared [`SimControl`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, select};
use dm_core::engine::{MeasurementConfig, MeasurementError, RangingEngine};
use dm_core::request::{DistanceEstimates, Quality, RangingMode, RangingResult};
use dm_core::session::{
    ArbiterError, ArbiterSignal, RadioArbiter, SessionId, SignalAction, SignalHandler,
    WindowRequest,
};

/// Normal windows requested further than this in the past are blocked.
pub const LATE_START_TOLERANCE: Duration = Duration::from_millis(200);

const RADIO_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Default)]
struct ControlState {
    fail_requests: AtomicUsize,
    block_windows: AtomicUsize,
    close_session: AtomicBool,
    sessions_opened: AtomicUsize,
    windows_started: AtomicUsize,
}

/// Handle for injecting faults into a running [`SimArbiter`].
#[derive(Clone, Debug, Default)]
pub struct SimControl {
    state: Arc<ControlState>,
}

impl SimControl {
    /// Rejects the next `count` window requests synchronously.
    pub fn fail_next_requests(&self, count: usize) {
        self.state.fail_requests.store(count, Ordering::Release);
    }

    /// Answers the next `count` accepted requests with a blocked signal.
    pub fn block_next_windows(&self, count: usize) {
        self.state.block_windows.store(count, Ordering::Release);
    }

    /// Closes the session after the next completed window.
    pub fn close_session(&self) {
        self.state.close_session.store(true, Ordering::Release);
    }

    /// Injected request failures not yet consumed.
    pub fn pending_request_failures(&self) -> usize {
        self.state.fail_requests.load(Ordering::Acquire)
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::Acquire)
    }

    pub fn windows_started(&self) -> usize {
        self.state.windows_started.load(Ordering::Acquire)
    }
}

/// Decrements a pending fault counter; returns `true` if a fault was consumed.
fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        .is_ok()
}

struct RadioThread {
    jobs: Sender<WindowRequest>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for RadioThread {
    fn drop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                eprintln!("sim: radio thread panicked");
            }
        }
    }
}

/// Time-division arbiter that serves one session at a time.
#[derive(Default)]
pub struct SimArbiter {
    control: SimControl,
    radio: Option<RadioThread>,
    session_id: SessionId,
}

impl SimArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> SimControl {
        self.control.clone()
    }
}

impl<H> RadioArbiter<H> for SimArbiter
where
    H: SignalHandler + Send + 'static,
{
    fn open_session(&mut self, handler: H) -> Result<SessionId, ArbiterError> {
        // Joining the previous radio thread ends its session.
        self.radio = None;

        let (jobs, job_rx) = bounded(RADIO_QUEUE_DEPTH);
        let (stop, stop_rx) = bounded(0);
        let control = self.control.clone();
        let handler: Box<dyn SignalHandler + Send> = Box::new(handler);

        let handle = thread::Builder::new()
            .name("sim-radio".into())
            .spawn(move || run_radio(handler.as_ref(), &job_rx, &stop_rx, &control))
            .map_err(|_| ArbiterError::Rejected)?;

        self.radio = Some(RadioThread {
            jobs,
            stop: Some(stop),
            handle: Some(handle),
        });
        self.session_id = self.session_id.wrapping_add(1);
        self.control
            .state
            .sessions_opened
            .fetch_add(1, Ordering::AcqRel);
        Ok(self.session_id)
    }

    fn request_window(
        &mut self,
        _session: SessionId,
        request: WindowRequest,
    ) -> Result<(), ArbiterError> {
        if take_one(&self.control.state.fail_requests) {
            return Err(ArbiterError::Rejected);
        }

        let radio = self.radio.as_ref().ok_or(ArbiterError::SessionNotOpen)?;
        radio
            .jobs
            .try_send(request)
            .map_err(|_| ArbiterError::Rejected)
    }
}

fn run_radio(
    handler: &(dyn SignalHandler + Send),
    jobs: &Receiver<WindowRequest>,
    stop: &Receiver<()>,
    control: &SimControl,
) {
    let mut last_start: Option<Instant> = None;

    loop {
        let request = select! {
            recv(jobs) -> job => match job {
                Ok(request) => request,
                Err(_) => return,
            },
            recv(stop) -> _ => return,
        };

        let (start, length_us) = match request {
            WindowRequest::Earliest { length_us } => (Instant::now(), length_us),
            WindowRequest::Normal {
                distance_us,
                length_us,
            } => {
                let Some(previous) = last_start else {
                    handler.on_signal(ArbiterSignal::InvalidReturn);
                    continue;
                };
                (
                    previous + Duration::from_micros(u64::from(distance_us)),
                    length_us,
                )
            }
        };

        if Instant::now() > start + LATE_START_TOLERANCE
            || take_one(&control.state.block_windows)
        {
            handler.on_signal(ArbiterSignal::Blocked);
            continue;
        }

        if wait_until(start, stop) {
            return;
        }

        last_start = Some(start);
        control.state.windows_started.fetch_add(1, Ordering::AcqRel);

        let end = start + Duration::from_micros(u64::from(length_us));
        if handler.on_signal(ArbiterSignal::WindowStart) != SignalAction::EndWindow
            && wait_until(end, stop)
        {
            return;
        }
        handler.on_signal(ArbiterSignal::SessionIdle);

        if control.state.close_session.swap(false, Ordering::AcqRel) {
            last_start = None;
            handler.on_signal(ArbiterSignal::SessionClosed);
        }
    }
}

/// Sleeps until `deadline`; returns `true` if the radio was stopped meanwhile.
fn wait_until(deadline: Instant, stop: &Receiver<()>) -> bool {
    let timeout = deadline.saturating_duration_since(Instant::now());
    if timeout.is_zero() {
        return false;
    }

    select! {
        recv(stop) -> _ => true,
        default(timeout) => false,
    }
}

/// Raw data captured by [`SimEngine`] during a window.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SimReport {
    pub config: MeasurementConfig,
    pub distance_m: f32,
}

/// Handle for injecting measurement failures into a [`SimEngine`].
#[derive(Clone, Debug, Default)]
pub struct SimEngineControl {
    failures: Arc<AtomicUsize>,
}

impl SimEngineControl {
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::Release);
    }
}

/// Engine that reports a fixed distance per peer without touching a radio.
///
/// `execute` never sleeps: it runs with the scheduler's critical section held.
#[derive(Debug, Default)]
pub struct SimEngine {
    control: SimEngineControl,
    current: Option<MeasurementConfig>,
}

impl SimEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&self) -> SimEngineControl {
        self.control.clone()
    }

    /// Distance the simulation reports for a peer whose last address byte is `id`.
    pub fn distance_for(id: u8) -> f32 {
        1.0 + f32::from(id) * 0.5
    }
}

impl RangingEngine for SimEngine {
    type Report = Option<SimReport>;

    fn configure(&mut self, config: &MeasurementConfig) -> Result<(), MeasurementError> {
        if config.window_length_us == 0 {
            return Err(MeasurementError::Configuration);
        }
        self.current = Some(*config);
        Ok(())
    }

    fn execute(&mut self, _window_length_us: u32) -> Result<(), MeasurementError> {
        if take_one(&self.control.failures) {
            self.current = None;
            return Err(MeasurementError::Timeout);
        }
        Ok(())
    }

    fn populate_report(&mut self) -> Self::Report {
        self.current.take().map(|config| SimReport {
            config,
            distance_m: Self::distance_for(config.peer.bytes[5]),
        })
    }

    fn calculate(&mut self, report: &Self::Report) -> RangingResult {
        let Some(report) = report else {
            return RangingResult {
                status: false,
                quality: Quality::None,
                peer: dm_core::request::PeerAddress::public([0; 6]),
                mode: RangingMode::Rtt,
                estimates: DistanceEstimates::Rtt { rtt: 0.0 },
            };
        };

        let distance = report.distance_m;
        let estimates = match report.config.mode {
            RangingMode::Rtt => DistanceEstimates::Rtt { rtt: distance },
            RangingMode::Mcpd => DistanceEstimates::Mcpd {
                ifft: distance,
                phase_slope: distance + 0.25,
                rssi_openspace: distance * 1.5,
                best: distance,
            },
        };

        RangingResult {
            status: true,
            quality: Quality::Ok,
            peer: report.config.peer,
            mode: report.config.mode,
            estimates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dm_core::request::{PeerAddress, Role};

    fn config(mode: RangingMode) -> MeasurementConfig {
        MeasurementConfig {
            role: Role::Initiator,
            peer: PeerAddress::random([0, 0, 0, 0, 0, 4]),
            mode,
            nonce: 1,
            window_length_us: 4_000,
        }
    }

    #[test]
    fn engine_reports_distance_for_peer() {
        let mut engine = SimEngine::new();
        engine.configure(&config(RangingMode::Mcpd)).expect("configured");
        engine.execute(4_000).expect("measured");

        let report = engine.populate_report();
        let result = engine.calculate(&report);

        assert!(result.status);
        assert_eq!(result.mode, RangingMode::Mcpd);
        assert!((result.estimates.best() - SimEngine::distance_for(4)).abs() < f32::EPSILON);
    }

    #[test]
    fn injected_failure_consumes_one_measurement() {
        let mut engine = SimEngine::new();
        engine.control().fail_next(1);

        engine.configure(&config(RangingMode::Rtt)).expect("configured");
        assert_eq!(engine.execute(4_000), Err(MeasurementError::Timeout));
        assert_eq!(engine.populate_report(), None);

        engine.configure(&config(RangingMode::Rtt)).expect("configured");
        assert_eq!(engine.execute(4_000), Ok(()));
    }
}
