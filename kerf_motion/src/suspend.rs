//! Suspend manager: feed holds, safety-door parking and sleep.
//!
//! Entered by the executor once a hold-class event sets any suspend bit and
//! not left until every bit is clear or the system aborts. The pulse tick
//! keeps running concurrently; every blocking wait in here keeps servicing
//! `exec_rt_system` so resumes, overrides and resets stay live.

use std::time::Duration;

use tracing::{debug, info};

use kerf_common::axis::MAX_AXES;
use kerf_common::consts::{
    SAFETY_DOOR_COOLANT_DELAY, SAFETY_DOOR_SPINDLE_DELAY, SUSPEND_DELAY_STEP,
};
use kerf_common::flags::{ExecState, SpindleStopFlags, StepControlFlags, SuspendFlags};
use kerf_common::state::MachineState;

use crate::engine::MotionEngine;
use crate::planner::{CoolantState, MotionFlags, MoveData, Planner, SpindleState, steps_to_mpos};

impl MotionEngine {
    /// Blocking suspend loop. Handles hold parking, the safety-door retract
    /// and restore sequences, sleep, and the spindle-stop override.
    pub(crate) fn exec_rt_suspend(&mut self) {
        let parking = self.config.parking.clone();
        let axis = parking.axis;
        let mut retract_waypoint = parking.pullout_increment_mm;

        // Accessory state to restore on resume: the interrupted block's if
        // one is in flight, the modal state otherwise.
        let (restore_spindle, restore_speed, restore_coolant) =
            match self.planner.current_block() {
                Some(block) => (block.spindle, block.spindle_speed, block.coolant),
                None => (self.sys.spindle, self.sys.spindle_speed, self.sys.coolant),
            };

        // A laser must not keep burning through a stationary hold.
        if self.config.laser_mode && restore_spindle != SpindleState::Disable {
            self.sys.spindle_stop = SpindleStopFlags::INITIATE;
        }

        let mut restore_target: Option<[f32; MAX_AXES]> = None;
        let mut parking_target = [0.0_f32; MAX_AXES];
        let can_park = parking.enable
            && self.config.homing.enable
            && !self.config.laser_mode;

        while self.sys.suspend.is_suspended() {
            if self.signals.abort() {
                return;
            }
            if self.sys.suspend.contains(SuspendFlags::HOLD_COMPLETE) {
                if matches!(self.sys.state, MachineState::SafetyDoor | MachineState::Sleep) {
                    if !self.sys.suspend.contains(SuspendFlags::RETRACT_COMPLETE) {
                        // Retract phase: pull out slowly with accessories
                        // still on, de-energize, then park fast.
                        self.sys.spindle_stop = SpindleStopFlags::empty();
                        let position = self.position_snapshot();
                        parking_target = steps_to_mpos(&position, &self.config.axes);
                        if !self.sys.suspend.contains(SuspendFlags::RESTART_RETRACT) {
                            restore_target = Some(parking_target);
                            retract_waypoint = (parking.pullout_increment_mm
                                + parking_target[axis])
                                .min(parking.target_mm);
                        }
                        if can_park && parking_target[axis] < parking.target_mm {
                            if parking_target[axis] < retract_waypoint {
                                parking_target[axis] = retract_waypoint;
                                debug!(to = retract_waypoint, "parking pull-out");
                                self.parking_motion(
                                    &parking_target,
                                    parking.pullout_rate,
                                    restore_spindle,
                                    restore_speed,
                                    restore_coolant,
                                );
                            }
                            self.ports.spindle.set_state(SpindleState::Disable, 0.0);
                            self.ports.coolant.set_state(CoolantState::default());
                            if parking_target[axis] < parking.target_mm {
                                parking_target[axis] = parking.target_mm;
                                debug!(to = parking.target_mm, "parking retract");
                                self.parking_motion(
                                    &parking_target,
                                    parking.rate,
                                    SpindleState::Disable,
                                    0.0,
                                    CoolantState::default(),
                                );
                            }
                        } else {
                            // No safe parking motion; just de-energize.
                            self.ports.spindle.set_state(SpindleState::Disable, 0.0);
                            self.ports.coolant.set_state(CoolantState::default());
                        }
                        self.sys.suspend.remove(SuspendFlags::RESTART_RETRACT);
                        self.sys.suspend.insert(SuspendFlags::RETRACT_COMPLETE);
                    } else {
                        if self.sys.state == MachineState::Sleep {
                            info!("sleep mode, reset to continue");
                            self.ports.spindle.set_state(SpindleState::Disable, 0.0);
                            self.ports.coolant.set_state(CoolantState::default());
                            self.ports.timer.stop();
                            self.ports.step.set_enabled(false);
                            while !self.signals.abort() {
                                self.exec_rt_system();
                                std::thread::sleep(Duration::from_millis(1));
                            }
                            return;
                        }
                        // Door switch closed: ready to accept a resume.
                        if self.sys.state == MachineState::SafetyDoor
                            && !self.signals.door_ajar()
                        {
                            self.sys.suspend.remove(SuspendFlags::SAFETY_DOOR_AJAR);
                        }
                        if self.sys.suspend.contains(SuspendFlags::INITIATE_RESTORE) {
                            // Fast return to the pull-out position.
                            if can_park && parking_target[axis] <= parking.target_mm {
                                parking_target[axis] = retract_waypoint;
                                debug!(to = retract_waypoint, "parking return");
                                self.parking_motion(
                                    &parking_target,
                                    parking.rate,
                                    SpindleState::Disable,
                                    0.0,
                                    CoolantState::default(),
                                );
                            }
                            // Re-energize with power-up delays, each one
                            // abandoned if the door re-opens.
                            if restore_spindle != SpindleState::Disable
                                && !self.sys.suspend.contains(SuspendFlags::RESTART_RETRACT)
                            {
                                if self.config.laser_mode {
                                    // Laser power returns with motion.
                                    self.sys
                                        .step_control
                                        .insert(StepControlFlags::UPDATE_SPINDLE_RPM);
                                } else {
                                    self.ports.spindle.set_state(
                                        restore_spindle,
                                        restore_speed * 0.01 * f32::from(self.sys.s_override),
                                    );
                                    self.suspend_delay(SAFETY_DOOR_SPINDLE_DELAY);
                                }
                            }
                            if (restore_coolant.flood || restore_coolant.mist)
                                && !self.sys.suspend.contains(SuspendFlags::RESTART_RETRACT)
                            {
                                self.ports.coolant.set_state(restore_coolant);
                                self.suspend_delay(SAFETY_DOOR_COOLANT_DELAY);
                            }
                            // Slow plunge back to the hold point.
                            if can_park
                                && !self.sys.suspend.contains(SuspendFlags::RESTART_RETRACT)
                            {
                                if let Some(target) = restore_target {
                                    debug!("parking plunge");
                                    self.parking_motion(
                                        &target,
                                        parking.pullout_rate,
                                        restore_spindle,
                                        restore_speed,
                                        restore_coolant,
                                    );
                                }
                            }
                            if !self.sys.suspend.contains(SuspendFlags::RESTART_RETRACT) {
                                self.sys.suspend.insert(SuspendFlags::RESTORE_COMPLETE);
                                self.signals.set_exec(ExecState::CYCLE_START);
                            }
                        }
                    }
                } else {
                    // Plain feed hold: manage the spindle-stop override.
                    if !self.sys.spindle_stop.is_empty() {
                        if self.sys.spindle_stop.contains(SpindleStopFlags::INITIATE) {
                            if restore_spindle != SpindleState::Disable {
                                self.ports.spindle.set_state(SpindleState::Disable, 0.0);
                                self.sys.spindle_stop = SpindleStopFlags::ENABLED;
                            } else {
                                self.sys.spindle_stop = SpindleStopFlags::empty();
                            }
                        } else if self
                            .sys
                            .spindle_stop
                            .intersects(SpindleStopFlags::RESTORE | SpindleStopFlags::RESTORE_CYCLE)
                        {
                            if restore_spindle != SpindleState::Disable {
                                info!("restoring spindle");
                                if self.config.laser_mode {
                                    self.sys
                                        .step_control
                                        .insert(StepControlFlags::UPDATE_SPINDLE_RPM);
                                } else {
                                    self.ports.spindle.set_state(
                                        restore_spindle,
                                        restore_speed * 0.01 * f32::from(self.sys.s_override),
                                    );
                                }
                            }
                            if self.sys.spindle_stop.contains(SpindleStopFlags::RESTORE_CYCLE) {
                                self.signals.set_exec(ExecState::CYCLE_START);
                            }
                            self.sys.spindle_stop = SpindleStopFlags::empty();
                        }
                    } else if self.sys.step_control.contains(StepControlFlags::UPDATE_SPINDLE_RPM)
                    {
                        // Spindle override changed while parked.
                        self.ports.spindle.set_state(
                            self.sys.spindle,
                            self.sys.spindle_speed * 0.01 * f32::from(self.sys.s_override),
                        );
                        self.sys.step_control.remove(StepControlFlags::UPDATE_SPINDLE_RPM);
                    }
                }
            }
            self.exec_rt_system();
            if self.sys.suspend.contains(SuspendFlags::HOLD_COMPLETE) {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                // Still decelerating: stay hot so the preparer keeps the
                // segment ring fed all the way down the ramp.
                std::thread::yield_now();
            }
        }
    }

    /// Execute one parking system motion to `target_mm` and block until it
    /// finishes. The interrupted block's segment state is shelved around it.
    fn parking_motion(
        &mut self,
        target_mm: &[f32; MAX_AXES],
        feed_rate: f32,
        spindle: SpindleState,
        spindle_speed: f32,
        coolant: CoolantState,
    ) {
        if self.signals.abort() {
            return;
        }
        let start = self.position_snapshot();
        let data = MoveData {
            feed_rate,
            spindle,
            spindle_speed,
            coolant,
            motion: MotionFlags {
                system_motion: true,
                no_feed_override: true,
                ..MotionFlags::default()
            },
        };
        let planned = self
            .planner
            .set_system_block(&self.config.axes, &start, target_mm, &data);
        if !planned {
            // Zero-length motion; nothing to execute.
            self.sys.step_control.remove(StepControlFlags::END_MOTION);
            self.exec_rt_system();
            return;
        }
        self.sys.step_control.insert(StepControlFlags::EXECUTE_SYS_MOTION);
        self.sys.step_control.remove(StepControlFlags::END_MOTION);
        self.prep.setup_parking_buffer();
        self.prep_segments();
        self.wake_up();
        while self.sys.step_control.contains(StepControlFlags::EXECUTE_SYS_MOTION) {
            self.exec_rt_system();
            if self.signals.abort() {
                return;
            }
            std::thread::yield_now();
        }
        self.planner.clear_system_block();
        self.prep.restore_parking_buffer();
    }

    /// Sleep in short steps while keeping the executor serviced; cut short
    /// by an abort or a door re-open.
    fn suspend_delay(&mut self, total: Duration) {
        let mut elapsed = Duration::ZERO;
        while elapsed < total {
            self.exec_rt_system();
            if self.signals.abort() || self.sys.suspend.contains(SuspendFlags::RESTART_RETRACT) {
                return;
            }
            let step = SUSPEND_DELAY_STEP.min(total - elapsed);
            std::thread::sleep(step);
            elapsed += step;
        }
    }
}
