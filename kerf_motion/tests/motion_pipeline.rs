//! End-to-end motion pipeline tests: queued moves through the planner,
//! preparer and pulse tick against the simulation ports.
//!
//! Single-threaded tests interleave executor passes with manual ticks so
//! the segment ring can never starve and every run is deterministic. The
//! door and homing tests need real concurrency and pace a tick thread
//! slowly enough that the hot engine loops always keep the ring fed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use kerf_common::alarm::Alarm;
use kerf_common::axis::MAX_AXES;
use kerf_common::state::MachineState;
use kerf_motion::config::MachineConfig;
use kerf_motion::engine::MotionEngine;
use kerf_motion::planner::{MotionFlags, MoveData, SpindleState};
use kerf_motion::stepper::IsrHandle;

const STEPS_PER_MM: f32 = 250.0;

fn target(x: f32, y: f32, z: f32) -> [f32; MAX_AXES] {
    let mut t = [0.0; MAX_AXES];
    t[0] = x;
    t[1] = y;
    t[2] = z;
    t
}

fn feed_move(rate: f32) -> MoveData {
    MoveData {
        feed_rate: rate,
        ..MoveData::default()
    }
}

fn jog_move(rate: f32) -> MoveData {
    MoveData {
        feed_rate: rate,
        motion: MotionFlags {
            jog: true,
            ..MotionFlags::default()
        },
        ..MoveData::default()
    }
}

/// Run executor passes interleaved with up to three ticks each until
/// `cond` holds. Panics when the iteration budget runs out.
fn run_until(
    engine: &mut MotionEngine,
    handle: &IsrHandle,
    what: &str,
    mut cond: impl FnMut(&MotionEngine) -> bool,
) {
    for _ in 0..2_000_000u32 {
        engine.exec_rt_system();
        for _ in 0..3 {
            handle.tick();
        }
        if cond(engine) {
            return;
        }
    }
    panic!("timed out waiting for: {what}");
}

/// Run until the engine is idle with nothing queued.
fn run_to_idle(engine: &mut MotionEngine, handle: &IsrHandle) {
    run_until(engine, handle, "idle with empty queue", |e| {
        e.state() == MachineState::Idle && !e.status_snapshot().queued_blocks
    });
}

/// Poll `cond` from an observer thread; false on timeout.
fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

// ─── Straight-line execution ────────────────────────────────────────

#[test]
fn programmed_path_executes_exact_step_counts() {
    let (mut engine, sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let handle = engine.isr_handle();

    engine.buffer_line(&target(-10.0, -4.0, 0.0), &feed_move(600.0)).unwrap();
    let rapid = MoveData {
        motion: MotionFlags {
            rapid: true,
            ..MotionFlags::default()
        },
        ..MoveData::default()
    };
    engine.buffer_line(&target(0.0, 0.0, 0.0), &rapid).unwrap();

    engine.cycle_start().unwrap();
    run_to_idle(&mut engine, &handle);

    // Out and back: every commanded step must appear on the pins, twice.
    assert_eq!(sim.step.pulse_count(0), 5000);
    assert_eq!(sim.step.pulse_count(1), 2000);
    assert_eq!(sim.step.pulse_count(2), 0);
    assert_eq!(engine.position_snapshot(), [0; MAX_AXES]);
    assert!(!handle.is_running());
}

#[test]
fn zero_length_move_queues_nothing() {
    let (mut engine, _sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let queued = engine.buffer_line(&target(0.0, 0.0, 0.0), &feed_move(600.0)).unwrap();
    assert!(!queued);
    assert!(!engine.status_snapshot().queued_blocks);
}

// ─── Holds and resumes ──────────────────────────────────────────────

#[test]
fn feed_hold_parks_and_resume_conserves_steps() {
    let (mut engine, sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let handle = engine.isr_handle();

    engine.buffer_line(&target(-40.0, 0.0, 0.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();
    run_until(&mut engine, &handle, "motion underway", |e| {
        e.state() == MachineState::Cycle && sim.step.pulse_count(0) > 2000
    });

    assert!(engine.rt_request(b'!'));
    engine.exec_rt_system();
    assert_eq!(engine.state(), MachineState::Hold);
    assert_eq!(engine.status_snapshot().substate, Some(1));

    // A start during the deceleration must be dropped, not queued.
    engine.rt_request(b'~');
    engine.exec_rt_system();
    assert_eq!(engine.state(), MachineState::Hold);
    assert_eq!(engine.status_snapshot().substate, Some(1));

    run_until(&mut engine, &handle, "hold parked", |e| {
        e.status_snapshot().substate == Some(0)
    });
    assert!(!handle.is_running());
    let parked = sim.step.pulse_count(0);
    assert!(parked > 2000 && parked < 10000);

    engine.rt_request(b'~');
    run_to_idle(&mut engine, &handle);
    assert_eq!(sim.step.pulse_count(0), 10000);
    assert_eq!(engine.position_snapshot()[0], -10000);
}

#[test]
fn feed_override_change_keeps_step_totals_exact() {
    let (mut engine, sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let handle = engine.isr_handle();

    engine.buffer_line(&target(-40.0, 0.0, 0.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();
    run_until(&mut engine, &handle, "motion underway", |_| {
        sim.step.pulse_count(0) > 1000
    });

    // Drop the feed to 80% mid-move; the profile replans, the step count
    // must not change.
    engine.rt_request(0x92);
    engine.rt_request(0x92);
    engine.exec_rt_system();
    assert_eq!(engine.status_snapshot().feed_override, 80);

    run_to_idle(&mut engine, &handle);
    assert_eq!(sim.step.pulse_count(0), 10000);
    assert_eq!(engine.position_snapshot()[0], -10000);
}

#[test]
fn jog_cancel_flushes_queue_and_keeps_position() {
    let (mut engine, sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let handle = engine.isr_handle();

    engine.buffer_line(&target(-40.0, 0.0, 0.0), &jog_move(600.0)).unwrap();
    engine.buffer_line(&target(0.0, 0.0, 0.0), &jog_move(600.0)).unwrap();
    engine.cycle_start().unwrap();
    run_until(&mut engine, &handle, "jog underway", |e| {
        e.state() == MachineState::Jog && sim.step.pulse_count(0) > 1000
    });

    engine.rt_request(0x85);
    run_until(&mut engine, &handle, "jog cancelled", |e| {
        e.state() == MachineState::Idle
    });

    // Both queued jogs are gone; position still matches the pulses that
    // actually went out during the deceleration.
    assert!(!engine.status_snapshot().queued_blocks);
    let pulses = sim.step.pulse_count(0);
    assert!(pulses < 10000);
    assert_eq!(engine.position_snapshot()[0], -(pulses as i32));
}

// ─── Reset and alarms ───────────────────────────────────────────────

#[test]
fn reset_mid_cycle_latches_abort_alarm() {
    let (mut engine, sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let handle = engine.isr_handle();

    engine.buffer_line(&target(-40.0, 0.0, 0.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();
    run_until(&mut engine, &handle, "motion underway", |_| {
        sim.step.pulse_count(0) > 1000
    });

    engine.rt_request(0x18);
    assert!(!engine.main_loop_iteration());
    engine.reset();

    // Motion was killed in flight, so position is declared lost.
    assert_eq!(engine.state(), MachineState::Alarm);
    assert_eq!(engine.last_alarm(), Some(Alarm::AbortCycle));
    assert!(!handle.is_running());
    assert!(!engine.status_snapshot().queued_blocks);

    engine.unlock();
    assert_eq!(engine.state(), MachineState::Idle);
    engine.buffer_line(&target(-1.0, 0.0, 0.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();
    run_to_idle(&mut engine, &handle);
}

#[test]
fn status_snapshot_is_internally_consistent_during_motion() {
    let (mut engine, sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let handle = engine.isr_handle();

    engine.buffer_line(&target(-20.0, 0.0, 0.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();
    run_until(&mut engine, &handle, "motion underway", |_| {
        sim.step.pulse_count(0) > 500
    });

    let snap = engine.status_snapshot();
    assert_eq!(snap.state, "Run");
    assert!(snap.feed_rate > 0.0);
    assert!(snap.queued_blocks);
    for axis in 0..3 {
        let mm = snap.position[axis] as f32 / STEPS_PER_MM;
        assert!((snap.mpos[axis] - mm).abs() < 1e-3);
    }
    assert!(snap.render(3).starts_with("<Run|MPos:"));

    run_to_idle(&mut engine, &handle);
}

// ─── Safety door ────────────────────────────────────────────────────

#[test]
fn safety_door_parks_restores_and_resumes() {
    let mut config = MachineConfig::default_xyz();
    config.parking.enable = true;
    let (mut engine, sim) = MotionEngine::with_sim(config).unwrap();
    let handle = engine.isr_handle();
    let signals = engine.signals();
    let done = Arc::new(AtomicBool::new(false));

    // No spindle or coolant on the move, so the restore sequence skips the
    // long power-up delays and the test stays fast.
    engine.buffer_line(&target(-10.0, 0.0, -20.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();

    std::thread::scope(|scope| {
        // Paced tick thread; the hot engine loops outrun it comfortably.
        {
            let handle = handle.clone();
            let done = done.clone();
            scope.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    handle.tick();
                    std::thread::sleep(Duration::from_micros(20));
                }
            });
        }

        // Operator: open the door mid-move, wait for the retract to park,
        // close the door and resume.
        {
            let handle = handle.clone();
            let signals = signals.clone();
            scope.spawn(move || {
                assert!(
                    wait_for(Duration::from_secs(10), || handle.position()[2] < -2500),
                    "move never reached the door point"
                );
                signals.set_door_ajar(true);
                signals.push_realtime(0x84);

                // Parked at the configured -5mm target once the retract is
                // done.
                assert!(
                    wait_for(Duration::from_secs(10), || {
                        signals.state() == MachineState::SafetyDoor
                            && handle.position()[2] == -1250
                    }),
                    "retract never parked"
                );

                signals.set_door_ajar(false);
                assert!(
                    wait_for(Duration::from_secs(10), || {
                        signals.push_realtime(b'~');
                        signals.state() != MachineState::SafetyDoor
                    }),
                    "restore never resumed"
                );
            });
        }

        while engine.main_loop_iteration() {
            if engine.state() == MachineState::Idle && !engine.status_snapshot().queued_blocks {
                break;
            }
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(engine.state(), MachineState::Idle);
    let position = engine.position_snapshot();
    assert_eq!(&position[..3], &[-2500, 0, -5000]);
    // The retract, return and plunge all ran on Z on top of the programmed
    // 20mm, so Z saw strictly more pulses than the direct path needs.
    assert!(sim.step.pulse_count(2) > 5000);
    assert_eq!(sim.spindle.snapshot().state, SpindleState::Disable);
}

#[test]
fn reset_during_parking_retract_aborts_cleanly() {
    let mut config = MachineConfig::default_xyz();
    config.parking.enable = true;
    let (mut engine, _sim) = MotionEngine::with_sim(config).unwrap();
    let handle = engine.isr_handle();
    let signals = engine.signals();
    let done = Arc::new(AtomicBool::new(false));

    engine.buffer_line(&target(0.0, 0.0, -20.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();

    std::thread::scope(|scope| {
        {
            let handle = handle.clone();
            let done = done.clone();
            scope.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    handle.tick();
                    std::thread::sleep(Duration::from_micros(20));
                }
            });
        }

        // Operator: open the door mid-move, then pull the plug as soon as
        // the retract starts moving Z back up.
        {
            let handle = handle.clone();
            let signals = signals.clone();
            scope.spawn(move || {
                assert!(
                    wait_for(Duration::from_secs(10), || handle.position()[2] < -2500),
                    "move never reached the door point"
                );
                signals.set_door_ajar(true);
                signals.push_realtime(0x84);

                let mut low = i32::MAX;
                assert!(
                    wait_for(Duration::from_secs(10), || {
                        let z = handle.position()[2];
                        low = low.min(z);
                        z > low + 100
                    }),
                    "retract never started"
                );
                signals.push_realtime(0x18);
            });
        }

        while engine.main_loop_iteration() {}
        done.store(true, Ordering::Release);
    });

    engine.reset();

    // The retract was killed in flight: alarm latched, pulse timer dead,
    // queue flushed, and the planner re-synced to wherever the steps
    // actually stopped.
    assert_eq!(engine.state(), MachineState::Alarm);
    assert_eq!(engine.last_alarm(), Some(Alarm::AbortCycle));
    assert!(!handle.is_running());
    assert!(!engine.status_snapshot().queued_blocks);
    let snap = engine.status_snapshot();
    let z = snap.position[2];
    assert!(z > -5000 && z < 0, "stopped at {z}");
    assert!((snap.mpos[2] - z as f32 / STEPS_PER_MM).abs() < 1e-3);
}

#[test]
fn sleep_de_energizes_and_locks_until_reset() {
    let (mut engine, sim) = MotionEngine::with_sim(MachineConfig::default_xyz()).unwrap();
    let signals = engine.signals();

    engine.sleep();
    std::thread::scope(|scope| {
        {
            let signals = signals.clone();
            scope.spawn(move || {
                assert!(
                    wait_for(Duration::from_secs(10), || {
                        signals.state() == MachineState::Sleep
                    }),
                    "sleep never entered"
                );
                signals.push_realtime(0x18);
            });
        }
        // Blocks inside the sleep loop until the reset lands.
        while engine.main_loop_iteration() {}
    });
    engine.reset();

    // Nothing was moving, so sleep ends in a clean Idle, drivers released.
    assert_eq!(engine.state(), MachineState::Idle);
    assert!(!sim.step.is_enabled());
}

// ─── Homing ─────────────────────────────────────────────────────────

fn homing_config() -> MachineConfig {
    let mut config = MachineConfig::default_xyz();
    for axis in &mut config.axes {
        axis.max_travel = 20.0;
    }
    config.homing.debounce_ms = 1;
    config.homing.dir_invert_mask = 0b011;
    config.homing.cycles = vec!["XY".to_string()];
    config
}

#[test]
fn homing_two_axis_cycle_commits_positions() {
    let (mut engine, sim) = MotionEngine::with_sim(homing_config()).unwrap();
    let handle = engine.isr_handle();
    let done = Arc::new(AtomicBool::new(false));

    // Switches sit just past the phase origin; Y a little farther out so
    // X is released from the step stream first.
    {
        let handle = handle.clone();
        sim.limits.set_rule(move || {
            let position = handle.position();
            let mut mask = kerf_common::axis::AxisMask::empty();
            mask.set_axis(0, position[0] <= -250);
            mask.set_axis(1, position[1] <= -300);
            mask
        });
    }

    std::thread::scope(|scope| {
        {
            let handle = handle.clone();
            let done = done.clone();
            scope.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    handle.tick();
                    std::thread::sleep(Duration::from_micros(20));
                }
            });
        }
        engine.home().unwrap();
        done.store(true, Ordering::Release);
    });

    assert_eq!(engine.state(), MachineState::Idle);
    // Negative approach: home is -max_travel plus the pull-off clearance.
    let expected = ((-20.0_f32 + 1.0) * STEPS_PER_MM).round() as i32;
    let position = engine.position_snapshot();
    assert_eq!(position[0], expected);
    assert_eq!(position[1], expected);
    assert_eq!(engine.status_snapshot().homed, 0b011);
}

#[test]
fn homing_without_switch_fails_with_approach_alarm() {
    let (mut engine, _sim) = MotionEngine::with_sim(homing_config()).unwrap();
    let handle = engine.isr_handle();
    let done = Arc::new(AtomicBool::new(false));

    // No limit rule installed: the approach runs out of travel.
    std::thread::scope(|scope| {
        {
            let handle = handle.clone();
            let done = done.clone();
            scope.spawn(move || {
                while !done.load(Ordering::Acquire) {
                    handle.tick();
                    std::thread::sleep(Duration::from_micros(20));
                }
            });
        }
        engine.home().unwrap();
        done.store(true, Ordering::Release);
    });

    assert_eq!(engine.state(), MachineState::Alarm);
    assert_eq!(engine.last_alarm(), Some(Alarm::HomingFailApproach));
    assert!(engine.signals().abort());
    engine.reset();
    assert_eq!(engine.state(), MachineState::Alarm);
    assert_eq!(engine.last_alarm(), Some(Alarm::HomingFailApproach));
}

#[test]
fn homing_rejected_outside_idle_and_alarm() {
    let (mut engine, sim) = MotionEngine::with_sim(homing_config()).unwrap();
    let handle = engine.isr_handle();

    engine.buffer_line(&target(-5.0, 0.0, 0.0), &feed_move(600.0)).unwrap();
    engine.cycle_start().unwrap();
    run_until(&mut engine, &handle, "motion underway", |_| {
        sim.step.pulse_count(0) > 100
    });
    assert!(engine.home().is_err());
    run_to_idle(&mut engine, &handle);
}
