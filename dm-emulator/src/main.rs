use std::env;
use std::error::Error;
use std::process;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, bounded};
use dm_core::config::SchedulerConfig;
use dm_core::request::{
    DistanceEstimates, PeerAddress, RangingMode, RangingRequest, RangingResult, Role,
};
use dm_emulator::{DmRuntime, SimArbiter, SimEngine};

const USAGE: &str = "Usage: dm-emulator [--peers <n>] [--rounds <n>] [--mode <rtt|mcpd>] \
                     [--role <initiator|reflector>] [--delay-ms <n>] [--periodic]";

const RESULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
struct Scenario {
    peers: u8,
    rounds: u32,
    mode: RangingMode,
    role: Role,
    delay_ms: Option<u32>,
    periodic: bool,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            peers: 3,
            rounds: 1,
            mode: RangingMode::Rtt,
            role: Role::Initiator,
            delay_ms: None,
            periodic: false,
        }
    }
}

fn main() {
    let scenario = parse_scenario().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    if let Err(err) = run(scenario) {
        eprintln!("dm-emulator: {err}");
        process::exit(1);
    }
}

fn run(scenario: Scenario) -> Result<(), Box<dyn Error>> {
    let config = SchedulerConfig::new().with_reschedule_completed(scenario.periodic);
    let spacing_ms = match scenario.delay_ms {
        Some(delay_ms) => delay_ms,
        None => default_spacing_ms(&config, scenario)?,
    };

    let (result_tx, result_rx) = bounded::<RangingResult>(64);
    let callbacks = move |result: &RangingResult| {
        let _ = result_tx.try_send(*result);
    };

    let runtime = DmRuntime::init(config, SimEngine::new(), SimArbiter::new(), callbacks)?;
    println!(
        "DM emulator: {} peer(s), {:?} {:?}, {} ms apart",
        scenario.peers, scenario.role, scenario.mode, spacing_ms
    );

    // Periodic rounds re-queue each request with its own delay, so every peer
    // gets the full period as delay and admissions are staggered in real time.
    let period_ms = spacing_ms.saturating_mul(u32::from(scenario.peers));
    for index in 0..scenario.peers {
        let delay_ms = if scenario.periodic {
            if index > 0 {
                thread::sleep(Duration::from_millis(u64::from(spacing_ms)));
            }
            period_ms
        } else {
            u32::from(index).saturating_mul(spacing_ms)
        };
        let request = RangingRequest::new(scenario.role, peer_address(index), scenario.mode)
            .with_start_delay_us(delay_ms.saturating_mul(1_000))
            .with_nonce(u32::from(index) << 16);
        runtime.add_request(request)?;
    }

    let rounds = if scenario.periodic { scenario.rounds.max(1) } else { 1 };
    let expected = u32::from(scenario.peers).saturating_mul(rounds);
    let mut received = 0u32;
    while received < expected {
        match result_rx.recv_timeout(RESULT_TIMEOUT) {
            Ok(result) => {
                received += 1;
                print_result(&result);
            }
            Err(RecvTimeoutError::Timeout) => {
                eprintln!("timed out after {received} of {expected} result(s)");
                break;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = runtime.status();
    println!(
        "final state: {:?}, queued: {}",
        status.state, status.queued
    );
    runtime.shutdown();
    Ok(())
}

/// Smallest whole-millisecond spacing that keeps consecutive requests admissible.
fn default_spacing_ms(config: &SchedulerConfig, scenario: Scenario) -> Result<u32, Box<dyn Error>> {
    let probe = RangingRequest::new(scenario.role, peer_address(0), scenario.mode);
    let window_us = config.window_length_us(&probe)?;
    let spacing_us = config
        .timeslot_length_us(window_us)
        .saturating_add(config.min_slot_gap_us);
    Ok(spacing_us.div_ceil(1_000) + 1)
}

fn peer_address(index: u8) -> PeerAddress {
    PeerAddress::random([0xC0, 0xDE, 0x00, 0x00, 0x00, index])
}

fn print_result(result: &RangingResult) {
    match result.estimates {
        DistanceEstimates::Rtt { rtt } => {
            println!("{}: rtt {rtt:.2} m ({:?})", result.peer, result.quality);
        }
        DistanceEstimates::Mcpd {
            ifft,
            phase_slope,
            rssi_openspace,
            best,
        } => {
            println!(
                "{}: best {best:.2} m (ifft {ifft:.2}, phase slope {phase_slope:.2}, rssi {rssi_openspace:.2}) ({:?})",
                result.peer, result.quality
            );
        }
    }
}

fn parse_scenario() -> Result<Scenario, String> {
    let mut scenario = Scenario::default();
    let mut args = env::args().skip(1);

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg.clone(), None),
        };

        if flag == "--periodic" {
            scenario.periodic = true;
            continue;
        }

        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| format!("Expected value after {flag}"))?,
        };

        match flag.as_str() {
            "--peers" => scenario.peers = parse_number(&flag, &value)?,
            "--rounds" => scenario.rounds = parse_number(&flag, &value)?,
            "--delay-ms" => scenario.delay_ms = Some(parse_number(&flag, &value)?),
            "--mode" => scenario.mode = parse_mode(&value)?,
            "--role" => scenario.role = parse_role(&value)?,
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }

    Ok(scenario)
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("Invalid value `{value}` for {flag}"))
}

fn parse_mode(tag: &str) -> Result<RangingMode, String> {
    if tag.eq_ignore_ascii_case("rtt") {
        Ok(RangingMode::Rtt)
    } else if tag.eq_ignore_ascii_case("mcpd") {
        Ok(RangingMode::Mcpd)
    } else {
        Err(format!("Unknown ranging mode `{tag}`"))
    }
}

fn parse_role(tag: &str) -> Result<Role, String> {
    if tag.eq_ignore_ascii_case("initiator") {
        Ok(Role::Initiator)
    } else if tag.eq_ignore_ascii_case("reflector") {
        Ok(Role::Reflector)
    } else {
        Err(format!("Unknown role `{tag}`"))
    }
}
