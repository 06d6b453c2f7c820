//! Realtime executor.
//!
//! `exec_rt_system` consumes the pending signal bits and drives every state
//! transition of the machine. It is the only writer of
//! [`crate::engine::SysState`] and must be called often: from the main loop,
//! from every blocking wait, and from the suspend and homing loops.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use kerf_common::alarm::Alarm;
use kerf_common::flags::{AccessoryOverride, ExecState, SpindleStopFlags, StepControlFlags, SuspendFlags};
use kerf_common::state::MachineState;

use crate::engine::MotionEngine;
use crate::planner::{Planner, SpindleState};

impl MotionEngine {
    /// Service all pending realtime requests, then the segment preparer.
    /// Enters the blocking suspend loop when a hold-class event left the
    /// machine suspended.
    pub fn exec_realtime(&mut self) {
        self.exec_rt_system();
        if self.sys.suspend.is_suspended() && !self.signals.abort() {
            self.exec_rt_suspend();
        }
    }

    /// One non-blocking executor pass.
    pub fn exec_rt_system(&mut self) {
        if let Some(alarm) = self.signals.take_alarm() {
            self.enter_alarm(alarm);
            if alarm.is_critical() {
                // A limit alarm means position is in doubt; block everything
                // except status until the operator resets.
                error!("critical alarm, waiting for reset");
                loop {
                    let exec = self.signals.exec_state();
                    if exec.contains(ExecState::RESET) || self.signals.abort() {
                        break;
                    }
                    if exec.contains(ExecState::STATUS_REPORT) {
                        self.emit_status();
                        self.signals.clear_exec(ExecState::STATUS_REPORT);
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }

        let exec = self.signals.exec_state();
        if !exec.is_empty() {
            if exec.contains(ExecState::RESET) {
                self.kill_motion_for_reset();
                self.signals.set_abort();
                return;
            }
            if exec.contains(ExecState::STATUS_REPORT) {
                self.emit_status();
                self.signals.clear_exec(ExecState::STATUS_REPORT);
            }
            if exec.intersects(ExecState::HOLD_CLASS) {
                self.handle_hold_class(exec);
            }
            if exec.contains(ExecState::CYCLE_START) {
                self.handle_cycle_start(exec);
            }
            if exec.contains(ExecState::CYCLE_STOP) {
                self.handle_cycle_stop();
            }
        }

        self.apply_motion_overrides();
        self.apply_accessory_overrides();

        if self.sys.state.needs_segment_service() {
            self.prep_segments();
        }
    }

    fn enter_alarm(&mut self, alarm: Alarm) {
        error!(code = alarm as u8, "{alarm}");
        self.sys.last_alarm = Some(alarm);
        self.set_state(MachineState::Alarm);
        // Alarms always leave the accessories de-energized.
        self.ports.spindle.set_state(SpindleState::Disable, 0.0);
        self.ports.coolant.set_state(crate::planner::CoolantState::default());
    }

    /// Hold-class requests: feed hold, motion cancel, safety door, sleep.
    fn handle_hold_class(&mut self, exec: ExecState) {
        if self.sys.state.accepts_hold() {
            // A running motion decelerates to a controlled stop first.
            if matches!(self.sys.state, MachineState::Cycle | MachineState::Jog)
                && !self
                    .sys
                    .suspend
                    .intersects(SuspendFlags::MOTION_CANCEL | SuspendFlags::JOG_CANCEL)
            {
                self.update_plan_parameters();
                self.sys.step_control = StepControlFlags::EXECUTE_HOLD;
                if self.sys.state == MachineState::Jog && !exec.contains(ExecState::SLEEP) {
                    self.sys.suspend.insert(SuspendFlags::JOG_CANCEL);
                }
            }
            if self.sys.state == MachineState::Idle {
                self.sys.suspend = SuspendFlags::HOLD_COMPLETE;
            }

            // Motion cancel stops the single in-flight block; only valid
            // from a cycle since jog cancel handles the jog case.
            if exec.contains(ExecState::MOTION_CANCEL) && self.sys.state != MachineState::Jog {
                self.sys.suspend.insert(SuspendFlags::MOTION_CANCEL);
            }

            if exec.contains(ExecState::FEED_HOLD)
                && !matches!(
                    self.sys.state,
                    MachineState::SafetyDoor | MachineState::Jog | MachineState::Sleep
                )
            {
                self.set_state(MachineState::Hold);
            }

            if exec.contains(ExecState::SAFETY_DOOR) {
                warn!("safety door ajar");
                // During a jog cancel the door is only flagged; the state
                // change waits for the jog to stop.
                if !self.sys.suspend.contains(SuspendFlags::JOG_CANCEL) {
                    if self.sys.state == MachineState::SafetyDoor
                        && self.sys.suspend.contains(SuspendFlags::INITIATE_RESTORE)
                    {
                        // Door re-opened mid-restore: hold the restore motion
                        // and restart the retract once it stops.
                        if self.sys.step_control.contains(StepControlFlags::EXECUTE_SYS_MOTION) {
                            self.update_plan_parameters();
                            self.sys.step_control = StepControlFlags::EXECUTE_HOLD
                                | StepControlFlags::EXECUTE_SYS_MOTION;
                            self.sys.suspend.remove(SuspendFlags::HOLD_COMPLETE);
                        }
                        self.sys.suspend.remove(
                            SuspendFlags::RETRACT_COMPLETE
                                | SuspendFlags::INITIATE_RESTORE
                                | SuspendFlags::RESTORE_COMPLETE,
                        );
                        self.sys.suspend.insert(SuspendFlags::RESTART_RETRACT);
                    }
                    if self.sys.state != MachineState::Sleep {
                        self.set_state(MachineState::SafetyDoor);
                    }
                }
                // Stays set until the door switch closes, independent of
                // the state above; keeps parking armed through a jog.
                self.sys.suspend.insert(SuspendFlags::SAFETY_DOOR_AJAR);
            }
        }
        if exec.contains(ExecState::SLEEP) {
            if self.sys.state == MachineState::Alarm {
                self.sys
                    .suspend
                    .insert(SuspendFlags::RETRACT_COMPLETE | SuspendFlags::HOLD_COMPLETE);
            }
            self.set_state(MachineState::Sleep);
        }
        self.signals.clear_exec(
            ExecState::MOTION_CANCEL
                | ExecState::FEED_HOLD
                | ExecState::SAFETY_DOOR
                | ExecState::SLEEP,
        );
    }

    fn handle_cycle_start(&mut self, exec: ExecState) {
        // A start arriving together with a hold request never resumes; the
        // hold wins and the start is dropped.
        if !exec.intersects(
            ExecState::FEED_HOLD | ExecState::MOTION_CANCEL | ExecState::SAFETY_DOOR,
        ) {
            if self.sys.state == MachineState::SafetyDoor
                && !self.sys.suspend.contains(SuspendFlags::SAFETY_DOOR_AJAR)
            {
                if self.sys.suspend.contains(SuspendFlags::RESTORE_COMPLETE) {
                    self.set_state(MachineState::Idle);
                } else if self.sys.suspend.contains(SuspendFlags::RETRACT_COMPLETE) {
                    // Door closed and the retract is parked: arm the restore
                    // sequence; it re-issues the start when complete.
                    self.sys.suspend.insert(SuspendFlags::INITIATE_RESTORE);
                }
            }

            let hold_ready = self.sys.state == MachineState::Hold
                && self.sys.suspend.contains(SuspendFlags::HOLD_COMPLETE);
            if self.sys.state == MachineState::Idle || hold_ready {
                if self.sys.state == MachineState::Hold && !self.sys.spindle_stop.is_empty() {
                    // Resume the spindle first; the suspend routine restores
                    // it and re-issues the start.
                    self.sys.spindle_stop.insert(SpindleStopFlags::RESTORE_CYCLE);
                } else {
                    self.sys.step_control = StepControlFlags::empty();
                    let head_is_jog = self
                        .planner
                        .current_block()
                        .map(|block| block.motion.jog)
                        .unwrap_or(false);
                    let motion_ready = !self.planner.is_empty()
                        && !self.sys.suspend.contains(SuspendFlags::MOTION_CANCEL);
                    self.sys.suspend = SuspendFlags::empty();
                    if motion_ready {
                        self.set_state(if head_is_jog {
                            MachineState::Jog
                        } else {
                            MachineState::Cycle
                        });
                        self.prep_segments();
                        self.wake_up();
                    } else {
                        self.set_state(MachineState::Idle);
                    }
                }
            }
        }
        self.signals.clear_exec(ExecState::CYCLE_START);
    }

    /// The pulse tick drained its ring: either a hold finished decelerating
    /// or the motion ran to completion.
    fn handle_cycle_stop(&mut self) {
        let held_state = matches!(
            self.sys.state,
            MachineState::Hold | MachineState::SafetyDoor | MachineState::Sleep
        );
        if held_state && !self.sys.soft_limit && !self.sys.suspend.contains(SuspendFlags::JOG_CANCEL)
        {
            // Controlled stop reached; stay suspended until a start resumes.
            self.plan_cycle_reinitialize();
            if self.sys.step_control.contains(StepControlFlags::EXECUTE_HOLD) {
                self.sys.suspend.insert(SuspendFlags::HOLD_COMPLETE);
            }
            self.sys
                .step_control
                .remove(StepControlFlags::EXECUTE_HOLD | StepControlFlags::EXECUTE_SYS_MOTION);
        } else {
            // Motion complete, including jog/motion cancels and the
            // soft-limit forced hold.
            if self.sys.suspend.contains(SuspendFlags::JOG_CANCEL) {
                // Jogs are cancelled as a group: flush everything queued.
                self.sys.step_control = StepControlFlags::empty();
                self.stepper_reset();
                let position = self.position_snapshot();
                self.planner.reset();
                self.planner.sync_position(&position);
            }
            if self.sys.suspend.contains(SuspendFlags::SAFETY_DOOR_AJAR) {
                // Door opened mid-jog: enter the door suspend now that the
                // jog has stopped.
                self.sys.suspend.remove(SuspendFlags::JOG_CANCEL);
                self.sys.suspend.insert(SuspendFlags::HOLD_COMPLETE);
                self.set_state(MachineState::SafetyDoor);
            } else {
                self.sys.suspend = SuspendFlags::empty();
                self.set_state(MachineState::Idle);
            }
        }
        self.signals.clear_exec(ExecState::CYCLE_STOP);
    }

    fn apply_motion_overrides(&mut self) {
        let feed = self.signals.feed_override();
        let rapid = self.signals.rapid_override();
        if feed != self.sys.f_override || rapid != self.sys.r_override {
            self.sys.f_override = feed;
            self.sys.r_override = rapid;
            self.plan_cycle_reinitialize();
            debug!(feed, rapid, "motion override");
        }

        let spindle = self.signals.spindle_override();
        if spindle != self.sys.s_override {
            self.sys.s_override = spindle;
            self.sys.step_control.insert(StepControlFlags::UPDATE_SPINDLE_RPM);
            if self.sys.spindle != SpindleState::Disable {
                self.ports
                    .spindle
                    .set_rpm(self.sys.spindle_speed * 0.01 * f32::from(spindle));
            }
            debug!(spindle, "spindle override");
        }
    }

    fn apply_accessory_overrides(&mut self) {
        let acc = self.signals.take_accessory();
        if acc.is_empty() {
            return;
        }
        if acc.contains(AccessoryOverride::SPINDLE_STOP) {
            // Spindle stop toggling is only meaningful while parked in a
            // feed hold.
            if self.sys.state == MachineState::Hold {
                if self.sys.spindle_stop.is_empty() {
                    self.sys.spindle_stop = SpindleStopFlags::INITIATE;
                } else if self.sys.spindle_stop.contains(SpindleStopFlags::ENABLED) {
                    self.sys.spindle_stop.insert(SpindleStopFlags::RESTORE);
                }
            }
        }
        if acc.intersects(
            AccessoryOverride::COOLANT_FLOOD_TOGGLE | AccessoryOverride::COOLANT_MIST_TOGGLE,
        ) && matches!(
            self.sys.state,
            MachineState::Idle | MachineState::Cycle | MachineState::Hold
        ) {
            if acc.contains(AccessoryOverride::COOLANT_FLOOD_TOGGLE) {
                self.sys.coolant.flood = !self.sys.coolant.flood;
            }
            if acc.contains(AccessoryOverride::COOLANT_MIST_TOGGLE) {
                self.sys.coolant.mist = !self.sys.coolant.mist;
            }
            self.ports.coolant.set_state(self.sys.coolant);
            info!(
                flood = self.sys.coolant.flood,
                mist = self.sys.coolant.mist,
                "coolant override"
            );
        }
    }

    pub(crate) fn emit_status(&mut self) {
        let snapshot = self.status_snapshot();
        info!(target: "status", "{}", snapshot.render(self.config.axis_count()));
    }
}
