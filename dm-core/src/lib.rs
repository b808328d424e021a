#![no_std]

#[cfg(feature = "std")]
extern crate std;

// Distance-measurement timeslot scheduling shared by firmware and host runtimes.
//
// This crate avoids the Rust standard library so the same admission control,
// arbiter session state machine, and orchestration logic can run inside MCU
// firmware and inside the host-side emulator. Threads, channels, and the radio
// arbiter itself are supplied by the embedding crate through the traits in
// `scheduler::ports`, `session`, and `engine`.

#[macro_use]
mod fmt;

pub mod config;
pub mod engine;
pub mod error;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod time;
