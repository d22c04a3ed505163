//! Reactor Telemetry Simulation
//!
//! Generates power readings for the four simulated units and writes them to
//! stdout as JSON lines, one reading per unit per tick.
//! - `nominal`: Gaussian noise around nominal power
//! - `low-power`: every unit permanently at 90-95% of nominal
//! - `mixed`: nominal with random excursions below the band
//! - `burnup`: fuel burnup slowly drags efficiency and power down
//!
//! # Usage
//! ```bash
//! ./reactor-sim --scenario mixed --count 720 | ./reactor-saga --stdin --stdout-commands
//! ```

use std::collections::HashMap;
use std::io::{self, Write};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use rand::prelude::*;
use rand_distr::{Distribution, Normal};

use reactor_saga::config::defaults::{NOMINAL_POWER_MW, SIMULATED_DEVICES, SIMULATION_INTERVAL_MS};
use reactor_saga::types::{EventTime, TelemetryReading};

/// Standard deviation of nominal operating noise (MW)
const NOISE_STD_MW: f64 = 6.0;
/// Low-power band as a fraction of nominal
const LOW_POWER_RANGE: (f64, f64) = (0.90, 0.95);

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Nominal,
    LowPower,
    Mixed,
    Burnup,
}

#[derive(Parser, Debug)]
#[command(name = "reactor-sim")]
#[command(about = "Reactor power telemetry simulation for reactor-saga testing")]
#[command(version)]
struct Args {
    /// Scenario to simulate
    #[arg(long, value_enum, default_value = "mixed")]
    scenario: Scenario,

    /// Event-time step between ticks in milliseconds
    #[arg(long, default_value_t = SIMULATION_INTERVAL_MS)]
    interval_ms: u64,

    /// Number of ticks to emit (0 = run until interrupted)
    #[arg(long, default_value = "360")]
    count: u64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Event time of the first tick, seconds since the epoch (default: now)
    #[arg(long)]
    start: Option<f64>,

    /// Sleep `interval_ms` between ticks instead of emitting as fast as possible
    #[arg(long)]
    realtime: bool,

    /// Chance per unit and tick that an excursion starts (mixed scenario)
    #[arg(long, default_value = "0.02")]
    excursion_probability: f64,

    /// Excursion length in ticks (mixed scenario)
    #[arg(long, default_value = "12")]
    excursion_ticks: u32,
}

// ============================================================================
// Per-unit State
// ============================================================================

#[derive(Debug, Default)]
struct UnitState {
    /// Remaining ticks of the current excursion
    excursion_left: u32,
    /// Depth of the current excursion as a fraction of nominal
    excursion_depth: f64,
    burnup_pct: f64,
    efficiency_pct: f64,
}

struct Simulator {
    scenario: Scenario,
    rng: StdRng,
    noise: Normal<f64>,
    units: HashMap<&'static str, UnitState>,
    excursion_probability: f64,
    excursion_ticks: u32,
}

impl Simulator {
    fn new(args: &Args) -> Result<Self, rand_distr::NormalError> {
        let rng = match args.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let units = SIMULATED_DEVICES
            .iter()
            .map(|&id| {
                (
                    id,
                    UnitState {
                        efficiency_pct: 99.5,
                        ..UnitState::default()
                    },
                )
            })
            .collect();
        Ok(Self {
            scenario: args.scenario,
            rng,
            noise: Normal::new(0.0, NOISE_STD_MW)?,
            units,
            excursion_probability: args.excursion_probability.clamp(0.0, 1.0),
            excursion_ticks: args.excursion_ticks.max(1),
        })
    }

    fn power(&mut self, unit: &'static str) -> f64 {
        let noise = self.noise.sample(&mut self.rng);
        let Some(state) = self.units.get_mut(unit) else {
            return NOMINAL_POWER_MW + noise;
        };
        match self.scenario {
            Scenario::Nominal => NOMINAL_POWER_MW + noise,
            Scenario::LowPower => {
                self.rng.gen_range(LOW_POWER_RANGE.0..LOW_POWER_RANGE.1) * NOMINAL_POWER_MW
            }
            Scenario::Mixed => {
                if state.excursion_left == 0 && self.rng.gen_bool(self.excursion_probability) {
                    state.excursion_left = self.excursion_ticks;
                    state.excursion_depth = self.rng.gen_range(0.06..0.12);
                }
                if state.excursion_left > 0 {
                    state.excursion_left -= 1;
                    NOMINAL_POWER_MW * (1.0 - state.excursion_depth) + noise
                } else {
                    NOMINAL_POWER_MW + noise
                }
            }
            Scenario::Burnup => {
                state.burnup_pct = next_burnup(&mut self.rng, state.burnup_pct);
                state.efficiency_pct =
                    next_efficiency(&mut self.rng, state.efficiency_pct, state.burnup_pct);
                let base = self
                    .rng
                    .gen_range(NOMINAL_POWER_MW - 8.0..NOMINAL_POWER_MW + 4.0);
                base * state.efficiency_pct / 100.0
            }
        }
    }
}

/// Fast burnup early in the cycle, slowing near the end, dropping after a refuel.
fn next_burnup(rng: &mut StdRng, current: f64) -> f64 {
    let delta = match current {
        c if c < 70.0 => rng.gen_range(0.2..0.4),
        c if c < 90.0 => rng.gen_range(0.05..0.12),
        c if c < 100.0 => rng.gen_range(0.01..0.03),
        _ => rng.gen_range(-0.2..-0.05),
    };
    (current + delta).clamp(0.0, 102.0)
}

/// Efficiency drifts toward a burnup-dependent target with random inertia.
fn next_efficiency(rng: &mut StdRng, current: f64, burnup: f64) -> f64 {
    let target = match burnup {
        b if b < 70.0 => rng.gen_range(98.5..100.0),
        b if b < 90.0 => rng.gen_range(95.0..98.0),
        _ => rng.gen_range(92.0..96.0),
    };
    let inertia = rng.gen_range(0.05..0.15);
    current + (target - current) * inertia
}

fn start_millis(start: Option<f64>) -> EventTime {
    start.map_or_else(
        || chrono::Utc::now().timestamp_millis(),
        |secs| (secs * 1_000.0).round() as EventTime,
    )
}

fn main() -> io::Result<()> {
    let args = Args::parse();
    let mut sim = Simulator::new(&args)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let interval = EventTime::try_from(args.interval_ms).unwrap_or(EventTime::MAX);
    let mut event_time = start_millis(args.start);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    eprintln!(
        "reactor-sim: scenario={:?} units={} interval={}ms count={}",
        args.scenario,
        SIMULATED_DEVICES.len(),
        args.interval_ms,
        if args.count == 0 { "unbounded".to_string() } else { args.count.to_string() }
    );

    let mut tick = 0u64;
    while args.count == 0 || tick < args.count {
        for &unit in &SIMULATED_DEVICES {
            let reading = TelemetryReading::new(unit, sim.power(unit), event_time);
            let line = serde_json::to_string(&reading.to_message())?;
            if let Err(e) = writeln!(out, "{line}") {
                // downstream closed the pipe
                if e.kind() == io::ErrorKind::BrokenPipe {
                    return Ok(());
                }
                return Err(e);
            }
        }
        out.flush()?;

        tick += 1;
        event_time = event_time.saturating_add(interval);
        if args.realtime {
            std::thread::sleep(Duration::from_millis(args.interval_ms));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(scenario: Scenario) -> Args {
        Args::parse_from(["reactor-sim", "--seed", "7", "--scenario", scenario_name(scenario)])
    }

    fn scenario_name(s: Scenario) -> &'static str {
        match s {
            Scenario::Nominal => "nominal",
            Scenario::LowPower => "low-power",
            Scenario::Mixed => "mixed",
            Scenario::Burnup => "burnup",
        }
    }

    #[test]
    fn low_power_stays_below_band() {
        let mut sim = Simulator::new(&args(Scenario::LowPower)).unwrap();
        for _ in 0..500 {
            let p = sim.power("Rivne-3");
            assert!((NOMINAL_POWER_MW * 0.90..=NOMINAL_POWER_MW * 0.95).contains(&p));
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let mut a = Simulator::new(&args(Scenario::Mixed)).unwrap();
        let mut b = Simulator::new(&args(Scenario::Mixed)).unwrap();
        for _ in 0..100 {
            assert!((a.power("ZAP-5") - b.power("ZAP-5")).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn burnup_is_bounded() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut burnup = 0.0;
        for _ in 0..2_000 {
            burnup = next_burnup(&mut rng, burnup);
            assert!((0.0..=102.0).contains(&burnup));
        }
    }
}
