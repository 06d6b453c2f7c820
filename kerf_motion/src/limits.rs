//! Limit handling and the motion-killing reset path.

use tracing::{error, warn};

use kerf_common::alarm::Alarm;
use kerf_common::axis::MAX_AXES;
use kerf_common::error::CommandError;
use kerf_common::flags::{ExecState, StepControlFlags};
use kerf_common::state::MachineState;

use crate::engine::MotionEngine;

impl MotionEngine {
    /// Request a motion-killing system reset. Only this path may set the
    /// RESET flag with steppers live: if any motion is in progress the
    /// steppers are force-killed and position is declared lost.
    pub fn mc_reset(&mut self) {
        if self.signals.exec_state().contains(ExecState::RESET) {
            return;
        }
        self.signals.set_exec(ExecState::RESET);
        self.kill_motion_for_reset();
    }

    /// The kill half of a reset, idempotent: de-energize and, if any motion
    /// is in flight, stop the timer dead and latch the matching alarm
    /// because position can no longer be trusted.
    pub(crate) fn kill_motion_for_reset(&mut self) {
        self.ports.spindle.set_state(crate::planner::SpindleState::Disable, 0.0);
        self.ports.coolant.set_state(crate::planner::CoolantState::default());
        let in_motion = self.sys.state.is_moving()
            || self
                .sys
                .step_control
                .intersects(StepControlFlags::EXECUTE_HOLD | StepControlFlags::EXECUTE_SYS_MOTION);
        if in_motion {
            if !self.signals.alarm_pending() && self.sys.state != MachineState::Alarm {
                if self.sys.state == MachineState::Homing {
                    self.signals.raise_alarm(Alarm::HomingFailReset);
                } else {
                    self.signals.raise_alarm(Alarm::AbortCycle);
                }
            }
            // Force kill; steps already in flight are abandoned.
            self.ports.timer.stop();
        }
    }

    /// A hard limit switch closed during motion. Position is lost: kill
    /// everything and latch the critical alarm.
    pub fn hard_limit_event(&mut self) {
        if !self.config.hard_limits {
            return;
        }
        // Homing rides the switches on purpose; alarm state is already dead.
        if matches!(self.sys.state, MachineState::Alarm | MachineState::Homing) {
            return;
        }
        if self.signals.alarm_pending() {
            return;
        }
        let triggered = self.ports.limits.state();
        if triggered.is_empty() {
            return;
        }
        error!(axes = triggered.bits(), "hard limit");
        self.mc_reset();
        self.signals.raise_alarm(Alarm::HardLimit);
    }

    /// Check a queued target against machine travel. On violation the
    /// running cycle is brought to a controlled stop first so position
    /// survives, then the system aborts with a soft-limit alarm.
    pub(crate) fn soft_limit_check(
        &mut self,
        target_mm: &[f32; MAX_AXES],
    ) -> Result<(), CommandError> {
        if !self.travel_exceeded(target_mm) {
            return Ok(());
        }
        warn!("soft limit: target outside travel");
        self.sys.soft_limit = true;
        if self.sys.state == MachineState::Cycle {
            self.signals.set_exec(ExecState::FEED_HOLD);
            while self.sys.state != MachineState::Idle {
                self.exec_realtime();
                if self.signals.abort() {
                    return Err(CommandError::SystemAbort);
                }
                std::thread::yield_now();
            }
        }
        self.mc_reset();
        self.signals.raise_alarm(Alarm::SoftLimit);
        // Enters the critical blocking loop until the operator resets.
        self.exec_rt_system();
        Err(CommandError::SystemAbort)
    }

    fn travel_exceeded(&self, target_mm: &[f32; MAX_AXES]) -> bool {
        self.config.axes.iter().enumerate().any(|(idx, axis)| {
            target_mm[idx] > 0.0 || target_mm[idx] < -axis.max_travel
        })
    }
}
