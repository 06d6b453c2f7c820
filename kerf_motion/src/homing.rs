//! Homing cycles.
//!
//! Each configured cycle seeks its switches fast, pulls off, then re-locates
//! slowly one or more times. Axes are released from the step stream one by
//! one as their switches trigger; a coupled (squared) pair is only released
//! once both of its switches have triggered so the gantry stays square.

use std::time::Duration;

use tracing::{info, warn};

use kerf_common::alarm::Alarm;
use kerf_common::axis::AxisMask;
use kerf_common::consts::{HOMING_LOCATE_SCALAR, HOMING_SEARCH_SCALAR};
use kerf_common::error::CommandError;
use kerf_common::flags::{ExecState, StepControlFlags, SuspendFlags};
use kerf_common::state::MachineState;

use crate::engine::MotionEngine;
use crate::planner::{MotionFlags, MoveData, Planner, steps_to_mpos};

impl MotionEngine {
    /// Run the full homing sequence. Gating failures are returned as
    /// command errors; a failure during the cycle latches an alarm and
    /// aborts the system instead (inspect [`Self::state`]).
    pub fn home(&mut self) -> Result<(), CommandError> {
        if !self.config.homing.enable {
            return Err(CommandError::HomingNotEnabled);
        }
        if self.signals.abort() {
            return Err(CommandError::SystemAbort);
        }
        if !matches!(self.sys.state, MachineState::Idle | MachineState::Alarm) {
            return Err(CommandError::IdleStateRequired);
        }
        if self.signals.door_ajar() {
            return Err(CommandError::CheckDoor);
        }

        info!("homing start");
        self.sys.last_alarm = None;
        self.sys.suspend = SuspendFlags::empty();
        self.sys.step_control = StepControlFlags::empty();
        self.set_state(MachineState::Homing);

        let mut homed = AxisMask::empty();
        for n in 0..self.config.homing.cycles.len() {
            let mask = self.config.homing_cycle_mask(n).unwrap_or(AxisMask::empty());
            if mask.is_empty() {
                continue;
            }
            self.home_cycle(mask)?;
            if self.sys.state == MachineState::Alarm {
                // Failure already latched; the abort path re-initializes.
                return Ok(());
            }
            homed |= mask;
        }

        self.sys.homed = homed;
        let position = self.position_snapshot();
        self.planner.reset();
        self.planner.sync_position(&position);
        self.prep.reset();
        self.sys.step_control = StepControlFlags::empty();
        self.set_state(MachineState::Idle);
        info!(axes = homed.bits(), "homing complete");
        Ok(())
    }

    /// Home one group of axes: approach, pull off, then locate slowly
    /// `locate_cycles` times.
    fn home_cycle(&mut self, cycle_mask: AxisMask) -> Result<(), CommandError> {
        if self.signals.abort() {
            return Err(CommandError::SystemAbort);
        }
        let homing = self.config.homing.clone();
        let dir_mask = self.config.homing_dir_mask();
        let rate_scalar = (cycle_mask.axis_count() as f32).sqrt();

        // First approach sweeps past the full travel to guarantee a hit.
        let mut approach = true;
        let mut phase_rate = homing.seek_rate;
        let mut max_travel = 0.0_f32;
        for idx in 0..self.config.axis_count() {
            if cycle_mask.has_axis(idx) {
                max_travel = max_travel.max(HOMING_SEARCH_SCALAR * self.config.axes[idx].max_travel);
            }
        }

        let phases = 2 * usize::from(homing.locate_cycles) + 2;
        for _ in 0..phases {
            // Plan each phase from a zeroed origin on the cycle axes so the
            // travel budget is absolute, not cumulative.
            let position = self.isr.with(|shared| {
                for idx in 0..self.config.axes.len() {
                    if cycle_mask.has_axis(idx) {
                        shared.set_axis_position(idx, 0);
                    }
                }
                shared.position()
            });
            let mut target = steps_to_mpos(&position, &self.config.axes);
            let mut axislock = AxisMask::empty();
            for idx in 0..self.config.axis_count() {
                if cycle_mask.has_axis(idx) {
                    let toward_negative = dir_mask.has_axis(idx);
                    target[idx] = if approach == toward_negative {
                        -max_travel
                    } else {
                        max_travel
                    };
                    axislock.set_axis(idx, true);
                }
            }

            let data = MoveData {
                // All active axes move the same distance together, so the
                // per-axis rate is the vector rate divided by sqrt(N).
                feed_rate: phase_rate * rate_scalar,
                motion: MotionFlags {
                    system_motion: true,
                    no_feed_override: true,
                    ..MotionFlags::default()
                },
                ..MoveData::default()
            };
            self.planner
                .set_system_block(&self.config.axes, &position, &target, &data);
            self.sys.step_control = StepControlFlags::EXECUTE_SYS_MOTION;
            self.isr.with(|shared| shared.set_homing_lock(axislock));
            self.prep_segments();
            self.wake_up();

            let mut pair_triggered = AxisMask::empty();
            loop {
                if approach {
                    // Release each axis from the step stream as its switch
                    // triggers; coupled pairs are released together.
                    let limit_state = self.ports.limits.state();
                    for idx in 0..self.config.axis_count() {
                        if axislock.has_axis(idx) && limit_state.has_axis(idx) {
                            match self.config.coupled_partner(idx) {
                                Some(partner)
                                    if self.config.axes[idx].square
                                        || self.config.axes[partner].square =>
                                {
                                    pair_triggered.set_axis(idx, true);
                                    if pair_triggered.has_axis(partner) {
                                        axislock.set_axis(idx, false);
                                        axislock.set_axis(partner, false);
                                    }
                                }
                                Some(partner) => {
                                    axislock.set_axis(idx, false);
                                    axislock.set_axis(partner, false);
                                }
                                None => axislock.set_axis(idx, false),
                            }
                        }
                    }
                    self.isr.with(|shared| shared.set_homing_lock(axislock));
                    if axislock.is_empty() {
                        break;
                    }
                }

                self.prep_segments();

                let exec = self.signals.exec_state();
                if exec.intersects(
                    ExecState::SAFETY_DOOR | ExecState::RESET | ExecState::CYCLE_STOP,
                ) || self.signals.door_ajar()
                {
                    let failure = if exec.contains(ExecState::RESET) {
                        Some(Alarm::HomingFailReset)
                    } else if exec.contains(ExecState::SAFETY_DOOR) || self.signals.door_ajar() {
                        Some(Alarm::HomingFailDoor)
                    } else if !approach && !(self.ports.limits.state() & cycle_mask).is_empty() {
                        Some(Alarm::HomingFailPulloff)
                    } else if approach && exec.contains(ExecState::CYCLE_STOP) {
                        Some(Alarm::HomingFailApproach)
                    } else {
                        None
                    };
                    if let Some(alarm) = failure {
                        warn!(code = alarm as u8, "homing failed");
                        self.signals.raise_alarm(alarm);
                        self.mc_reset();
                        self.exec_rt_system();
                        return Ok(());
                    }
                    // Pull-off ran to completion with the switch released.
                    self.signals.clear_exec(ExecState::CYCLE_STOP);
                    break;
                }
                std::thread::yield_now();
            }

            // Phase over: kill the remaining motion and let the switches
            // settle before reversing.
            self.stepper_reset();
            self.planner.clear_system_block();
            // A ring drain racing the kill must not read as motion complete.
            self.signals.clear_exec(ExecState::CYCLE_STOP);
            std::thread::sleep(Duration::from_millis(homing.debounce_ms));

            approach = !approach;
            if approach {
                max_travel = HOMING_LOCATE_SCALAR * homing.pulloff_mm;
                phase_rate = homing.feed_rate;
            } else {
                max_travel = homing.pulloff_mm;
                phase_rate = homing.seek_rate;
            }
        }

        // Switches located: commit machine positions. Machine space is all
        // negative; the pull-off clearance is included.
        self.isr.with(|shared| {
            for idx in 0..self.config.axes.len() {
                if cycle_mask.has_axis(idx) {
                    let axis = &self.config.axes[idx];
                    let mpos = if dir_mask.has_axis(idx) {
                        -axis.max_travel + homing.pulloff_mm
                    } else {
                        -homing.pulloff_mm
                    };
                    shared.set_axis_position(idx, (mpos * axis.steps_per_mm).round() as i32);
                }
            }
            shared.clear_homing_lock();
        });
        self.sys.step_control = StepControlFlags::empty();
        Ok(())
    }
}
