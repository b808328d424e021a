//! Host runtime and simulation harness for the DM scheduler.

pub mod channels;
pub mod clock;
pub mod runtime;
pub mod sim;

pub use runtime::{DmRuntime, HostPlatform, HostScheduler, RuntimeError, SignalHandle};
pub use sim::{SimArbiter, SimControl, SimEngine, SimEngineControl};
