//! # Kerf Motion
//!
//! Demo binary for the motion engine: loads a machine configuration,
//! starts the paced pulse-tick thread over the simulation ports, runs a
//! short programmed path and prints tick statistics at exit.
//!
//! Realtime command bytes still work while the path runs: ctrl-c issues a
//! system reset through the same signal block a serial byte would.

use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::{Level, error, info};
use tracing_subscriber::EnvFilter;

use kerf_common::axis::MAX_AXES;
use kerf_motion::config::{MachineConfig, load_config};
use kerf_motion::engine::MotionEngine;
use kerf_motion::planner::{MoveData, SpindleState};
use kerf_motion::tick::{TickDriver, TickError, TickStats, rt_setup};

/// Kerf Motion — real-time step pulse engine
#[derive(Parser, Debug)]
#[command(name = "kerf_motion")]
#[command(version)]
#[command(about = "Trapezoidal step pulse engine with holds, parking and homing")]
struct Args {
    /// Path to the config directory (machine.toml). Built-in XYZ defaults
    /// are used when omitted.
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// CPU core to pin the tick thread to (rt feature only).
    #[arg(long, default_value_t = 1)]
    cpu_core: usize,

    /// SCHED_FIFO priority for the tick thread (rt feature only).
    #[arg(long, default_value_t = 80)]
    rt_priority: i32,

    /// Enable verbose logging (DEBUG level).
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format and print the final status snapshot as
    /// one JSON line instead of the report string.
    #[arg(long)]
    json: bool,

    /// Number of laps of the demo path to drive (0 skips motion).
    #[arg(long, default_value_t = 1)]
    demo_steps: u32,
}

fn main() {
    let args = Args::parse();
    setup_tracing(&args);

    info!("kerf_motion v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&args) {
        error!("FATAL: {e}");
        process::exit(1);
    }

    info!("kerf_motion shutdown complete");
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = match &args.config_dir {
        Some(dir) => {
            info!("loading config from {}", dir.display());
            load_config(dir)?
        }
        None => MachineConfig::default_xyz(),
    };
    info!(axes = config.axis_count(), "config OK");

    let (mut engine, _sim) = MotionEngine::with_sim(config)?;

    // Ctrl-c is just another realtime reset byte.
    let signals = engine.signals();
    ctrlc::set_handler(move || {
        signals.push_realtime(0x18);
    })?;

    // Tick thread: RT setup happens on the thread itself so the affinity
    // and scheduler apply to the right one.
    let driver = TickDriver::new(engine.isr_handle());
    let stop = driver.stop_flag();
    let (cpu_core, rt_priority) = (args.cpu_core, args.rt_priority);
    let tick_thread = std::thread::Builder::new()
        .name("pulse-tick".into())
        .spawn(move || -> Result<TickStats, TickError> {
            rt_setup(cpu_core, rt_priority)?;
            driver.run()
        })?;
    info!(cpu_core, rt_priority, "tick thread started");

    // Short demo path through the negative machine space.
    let feed = MoveData {
        feed_rate: 600.0,
        spindle: SpindleState::Cw,
        spindle_speed: 8000.0,
        ..MoveData::default()
    };
    let rapid = MoveData {
        motion: kerf_motion::planner::MotionFlags {
            rapid: true,
            ..Default::default()
        },
        ..MoveData::default()
    };
    for lap in 0..args.demo_steps {
        info!(lap, "demo lap");
        for mpos in [
            target(-20.0, 0.0, 0.0),
            target(-20.0, -20.0, -2.0),
            target(0.0, -20.0, -2.0),
        ] {
            engine.buffer_line(&mpos, &feed)?;
        }
        engine.buffer_line(&target(0.0, 0.0, 0.0), &rapid)?;

        engine.synchronize();
        if engine.signals().abort() {
            engine.reset();
            break;
        }
    }

    // Final status: one machine-readable line on the json path, the
    // regular report line otherwise.
    if args.json {
        println!("{}", serde_json::to_string(&engine.status_snapshot())?);
    } else {
        engine.rt_request(b'?');
        engine.exec_rt_system();
    }

    stop.store(false, Ordering::Release);
    let stats = tick_thread
        .join()
        .map_err(|_| "tick thread panicked")??;
    info!(
        ticks = stats.tick_count,
        avg_ns = stats.avg_tick_ns(),
        max_ns = stats.max_tick_ns,
        max_latency_ns = stats.max_latency_ns,
        overruns = stats.overruns,
        "tick stats"
    );
    Ok(())
}

fn target(x: f32, y: f32, z: f32) -> [f32; MAX_AXES] {
    let mut t = [0.0; MAX_AXES];
    t[0] = x;
    t[1] = y;
    t[2] = z;
    t
}

/// Setup tracing subscriber based on CLI arguments.
fn setup_tracing(args: &Args) {
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_parse_demo_and_json_flags() {
        let args = Args::try_parse_from([
            "kerf_motion",
            "--json",
            "--demo-steps",
            "3",
            "--cpu-core",
            "2",
        ])
        .unwrap();
        assert!(args.json);
        assert_eq!(args.demo_steps, 3);
        assert_eq!(args.cpu_core, 2);
        assert_eq!(args.rt_priority, 80);
        assert!(!args.verbose);
    }

    #[test]
    fn demo_steps_defaults_to_one_lap() {
        let args = Args::try_parse_from(["kerf_motion"]).unwrap();
        assert_eq!(args.demo_steps, 1);
        assert!(!args.json);
    }

    #[test]
    fn json_status_line_serializes() {
        let (engine, _sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
        let line = serde_json::to_string(&engine.status_snapshot()).unwrap();
        assert!(line.contains("\"state\":\"Idle\""));
    }
}
