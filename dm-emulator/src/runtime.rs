//! Host runtime: the arbiter-call thread and the DM worker thread.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, after, bounded, never, select};
use dm_core::config::SchedulerConfig;
use dm_core::engine::RangingEngine;
use dm_core::error::DmError;
use dm_core::request::RangingRequest;
use dm_core::scheduler::{DmCallbacks, DmEvent, Platform, Ports, Scheduler, SchedulerStatus};
use dm_core::session::{
    ArbiterClient, ArbiterSignal, RadioArbiter, SessionCommand, SignalAction, SignalHandler,
};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::channels::{ChannelProducer, DM_EVENT_DEPTH, SESSION_COMMAND_DEPTH};
use crate::clock::{HostResyncTimer, HostTickSource};

/// Collaborator set used by [`DmRuntime`].
pub struct HostPlatform<E, C>(PhantomData<fn() -> (E, C)>);

impl<E: RangingEngine, C: DmCallbacks> Platform for HostPlatform<E, C> {
    type Engine = E;
    type Commands = ChannelProducer<SessionCommand>;
    type Events = ChannelProducer<DmEvent>;
    type Clock = HostTickSource;
    type Timer = HostResyncTimer;
    type Callbacks = C;
    type EngineLock = CriticalSectionRawMutex;
}

pub type HostScheduler<E, C> = Scheduler<HostPlatform<E, C>>;

/// Signal handler handed to the arbiter when the session is opened.
pub struct SignalHandle<E: RangingEngine, C: DmCallbacks> {
    scheduler: Arc<HostScheduler<E, C>>,
}

impl<E: RangingEngine, C: DmCallbacks> Clone for SignalHandle<E, C> {
    fn clone(&self) -> Self {
        Self {
            scheduler: Arc::clone(&self.scheduler),
        }
    }
}

impl<E: RangingEngine, C: DmCallbacks> SignalHandler for SignalHandle<E, C> {
    fn on_signal(&self, signal: ArbiterSignal) -> SignalAction {
        self.scheduler.on_signal(signal)
    }
}

/// Failure while bringing up the runtime.
#[derive(Debug)]
pub enum RuntimeError {
    /// A worker thread could not be spawned.
    Spawn(io::Error),
    /// The session-open command could not be queued.
    Session(DmError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Spawn(error) => write!(f, "failed to spawn DM thread: {error}"),
            RuntimeError::Session(error) => write!(f, "failed to open arbiter session: {error}"),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Spawn(error) => Some(error),
            RuntimeError::Session(error) => Some(error),
        }
    }
}

/// Running DM subsystem: scheduler plus its two dedicated threads.
///
/// Dropping the runtime stops and joins both threads.
pub struct DmRuntime<E: RangingEngine, C: DmCallbacks> {
    scheduler: Arc<HostScheduler<E, C>>,
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl<E, C> DmRuntime<E, C>
where
    E: RangingEngine + Send + 'static,
    C: DmCallbacks + Send + Sync + 'static,
{
    /// Builds the scheduler, spawns both threads, and opens the arbiter session.
    pub fn init<A>(
        config: SchedulerConfig,
        engine: E,
        arbiter: A,
        callbacks: C,
    ) -> Result<Self, RuntimeError>
    where
        A: RadioArbiter<SignalHandle<E, C>> + Send + 'static,
    {
        Self::init_with_clock(config, engine, arbiter, callbacks, HostTickSource::new())
    }

    /// Like [`DmRuntime::init`] with an explicit counter, e.g. one started near the wrap point.
    pub fn init_with_clock<A>(
        config: SchedulerConfig,
        engine: E,
        arbiter: A,
        callbacks: C,
        clock: HostTickSource,
    ) -> Result<Self, RuntimeError>
    where
        A: RadioArbiter<SignalHandle<E, C>> + Send + 'static,
    {
        let (command_tx, command_rx) = bounded(SESSION_COMMAND_DEPTH);
        let (event_tx, event_rx) = bounded(DM_EVENT_DEPTH);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let ports = Ports::<HostPlatform<E, C>> {
            engine,
            commands: ChannelProducer::new(command_tx),
            events: ChannelProducer::new(event_tx),
            clock,
            timer: HostResyncTimer::new(),
            callbacks,
        };
        let scheduler = Arc::new(Scheduler::new(config, ports));

        let mut runtime = Self {
            scheduler: Arc::clone(&scheduler),
            shutdown: Some(shutdown_tx),
            threads: Vec::with_capacity(2),
        };

        let arbiter_thread = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown = shutdown_rx.clone();
            thread::Builder::new()
                .name("dm-arbiter".into())
                .spawn(move || run_arbiter(&scheduler, arbiter, &command_rx, &shutdown))
                .map_err(RuntimeError::Spawn)?
        };
        runtime.threads.push(arbiter_thread);

        let worker_thread = thread::Builder::new()
            .name("dm-worker".into())
            .spawn(move || run_worker(&scheduler, &event_rx, &shutdown_rx))
            .map_err(RuntimeError::Spawn)?;
        runtime.threads.push(worker_thread);

        runtime
            .scheduler
            .open_session()
            .map_err(RuntimeError::Session)?;

        Ok(runtime)
    }

    /// Admits a ranging request; see [`Scheduler::add_request`].
    pub fn add_request(&self, request: RangingRequest) -> Result<(), DmError> {
        self.scheduler.add_request(request)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    pub fn scheduler(&self) -> &HostScheduler<E, C> {
        &self.scheduler
    }

    /// Stops both threads and waits for them to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }
}

impl<E: RangingEngine, C: DmCallbacks> DmRuntime<E, C> {
    fn stop(&mut self) {
        // Disconnecting the shutdown channel wakes both threads.
        self.shutdown.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                eprintln!("dm: runtime thread panicked");
            }
        }
    }
}

impl<E: RangingEngine, C: DmCallbacks> Drop for DmRuntime<E, C> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Replays session commands against the arbiter; never runs on the signal stack.
fn run_arbiter<E, C, A>(
    scheduler: &Arc<HostScheduler<E, C>>,
    arbiter: A,
    commands: &Receiver<SessionCommand>,
    shutdown: &Receiver<()>,
) where
    E: RangingEngine,
    C: DmCallbacks,
    A: RadioArbiter<SignalHandle<E, C>>,
{
    let handle = SignalHandle {
        scheduler: Arc::clone(scheduler),
    };
    let mut client = ArbiterClient::new(arbiter, handle);

    loop {
        select! {
            recv(commands) -> command => match command {
                Ok(command) => client.execute(command, scheduler.as_ref()),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
        }
    }
}

/// Consumes DM events and polls the resync timer.
fn run_worker<E, C>(
    scheduler: &HostScheduler<E, C>,
    events: &Receiver<DmEvent>,
    shutdown: &Receiver<()>,
) where
    E: RangingEngine,
    C: DmCallbacks,
{
    loop {
        let resync: Receiver<Instant> = match scheduler.timer().remaining() {
            Some(remaining) => after(remaining),
            None => never(),
        };

        select! {
            recv(events) -> event => match event {
                Ok(event) => scheduler.handle_event(event),
                Err(_) => break,
            },
            recv(shutdown) -> _ => break,
            recv(resync) -> _ => {}
        }

        if scheduler.timer().take_expired() {
            scheduler.handle_event(DmEvent::ResyncExpired);
        }
    }
}
