//! The motion engine: owns the planner, the segment preparer and the
//! executor-side system state, and drives them against the hardware ports.
//!
//! Everything here runs on the cooperative (non-interrupt) side. The pulse
//! tick runs concurrently through an [`IsrHandle`] and communicates back
//! through the shared state cell and the realtime signal block.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use kerf_common::alarm::Alarm;
use kerf_common::axis::{AxisMask, MAX_AXES};
use kerf_common::error::CommandError;
use kerf_common::flags::{ExecState, SpindleStopFlags, StepControlFlags, SuspendFlags};
use kerf_common::state::MachineState;

use crate::config::{ConfigError, MachineConfig};
use crate::isr_cell::IsrCell;
use crate::planner::{
    BlockQueue, CoolantState, MoveData, Planner, SpindleState, steps_to_mpos,
};
use crate::port::{Ports, SimPorts};
use crate::prep::{Overrides, SegmentPrep};
use crate::signals::RtSignals;
use crate::stepper::{IsrHandle, SharedIsrState, TickConfig};

// ─── System State ───────────────────────────────────────────────────

/// Executor-side system state. Only the realtime executor writes it; the
/// primary mode is mirrored into [`RtSignals`] after every transition.
#[derive(Debug)]
pub struct SysState {
    pub state: MachineState,
    pub suspend: SuspendFlags,
    pub step_control: StepControlFlags,
    pub spindle_stop: SpindleStopFlags,
    /// A queued target violated the soft limits; changes how the resulting
    /// hold completes.
    pub soft_limit: bool,
    /// Override percentages last applied to the profile math.
    pub f_override: u8,
    pub r_override: u8,
    pub s_override: u8,
    /// Modal accessory state, restored after holds and parking retracts.
    pub spindle: SpindleState,
    pub spindle_speed: f32,
    pub coolant: CoolantState,
    pub last_alarm: Option<Alarm>,
    /// Axes with a committed home position.
    pub homed: AxisMask,
}

impl Default for SysState {
    fn default() -> Self {
        Self {
            state: MachineState::Idle,
            suspend: SuspendFlags::empty(),
            step_control: StepControlFlags::empty(),
            spindle_stop: SpindleStopFlags::empty(),
            soft_limit: false,
            f_override: 100,
            r_override: 100,
            s_override: 100,
            spindle: SpindleState::Disable,
            spindle_speed: 0.0,
            coolant: CoolantState::default(),
            last_alarm: None,
            homed: AxisMask::empty(),
        }
    }
}

// ─── Engine ─────────────────────────────────────────────────────────

pub struct MotionEngine {
    pub(crate) config: MachineConfig,
    pub(crate) planner: BlockQueue,
    pub(crate) prep: SegmentPrep,
    pub(crate) ports: Ports,
    pub(crate) signals: Arc<RtSignals>,
    pub(crate) isr: Arc<IsrCell<SharedIsrState>>,
    pub(crate) sys: SysState,
    /// Set when the pulse tick reported end of motion; the idle-lock policy
    /// releases the drivers after the configured delay.
    pub(crate) idle_since: Option<Instant>,
}

impl MotionEngine {
    /// Build an engine over the given hardware ports. The configuration is
    /// validated here; an invalid one never produces an engine.
    pub fn new(config: MachineConfig, ports: Ports) -> Result<Self, ConfigError> {
        config.validate()?;
        let signals = Arc::new(RtSignals::new());
        signals.publish_state(MachineState::Idle);
        Ok(Self {
            config,
            planner: BlockQueue::new(),
            prep: SegmentPrep::new(),
            ports,
            signals,
            isr: Arc::new(IsrCell::new(SharedIsrState::new())),
            sys: SysState::default(),
            idle_since: None,
        })
    }

    /// Engine over simulation ports, handing back the concrete sim handles.
    pub fn with_sim(config: MachineConfig) -> Result<(Self, SimPorts), ConfigError> {
        let (ports, sim) = Ports::sim();
        Ok((Self::new(config, ports)?, sim))
    }

    // ── Accessors ──

    #[inline]
    pub fn state(&self) -> MachineState {
        self.sys.state
    }

    #[inline]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[inline]
    pub fn last_alarm(&self) -> Option<Alarm> {
        self.sys.last_alarm
    }

    /// The shared signal block, for input threads and ctrl-c handlers.
    pub fn signals(&self) -> Arc<RtSignals> {
        self.signals.clone()
    }

    /// Handle the pulse-tick driver runs the step generator through.
    pub fn isr_handle(&self) -> IsrHandle {
        IsrHandle::new(
            self.isr.clone(),
            self.signals.clone(),
            self.ports.clone(),
            TickConfig::from_config(&self.config),
        )
    }

    /// Actual machine position in steps.
    pub fn position_snapshot(&self) -> [i32; MAX_AXES] {
        self.isr.with(|shared| shared.position())
    }

    /// Actual machine position in millimeters.
    pub fn position_mpos(&self) -> [f32; MAX_AXES] {
        steps_to_mpos(&self.position_snapshot(), &self.config.axes)
    }

    // ── Command intake ──

    /// Feed one input byte to the realtime layer. Returns false when the
    /// byte is not a realtime command and belongs to line input instead.
    pub fn rt_request(&self, byte: u8) -> bool {
        self.signals.push_realtime(byte)
    }

    /// Queue a straight-line move to `target_mm` (machine coordinates).
    /// Returns `Ok(false)` when the target rounds to zero steps.
    pub fn buffer_line(
        &mut self,
        target_mm: &[f32; MAX_AXES],
        data: &MoveData,
    ) -> Result<bool, CommandError> {
        if self.signals.abort() {
            return Err(CommandError::SystemAbort);
        }
        match self.sys.state {
            MachineState::Alarm | MachineState::Sleep => return Err(CommandError::AlarmLock),
            _ => {}
        }
        if self.config.soft_limits && !data.motion.system_motion {
            self.soft_limit_check(target_mm)?;
        }
        let queued = self.planner.plan_move(&self.config.axes, target_mm, data)?;
        // Accessory state is modal; remember it for hold restores even when
        // the move itself queued nothing.
        self.sys.spindle = data.spindle;
        self.sys.spindle_speed = data.spindle_speed;
        self.sys.coolant = data.coolant;
        Ok(queued)
    }

    /// Request a cycle start, as the `~` byte would.
    pub fn cycle_start(&mut self) -> Result<(), CommandError> {
        if self.signals.abort() {
            return Err(CommandError::SystemAbort);
        }
        if self.sys.state == MachineState::SafetyDoor && self.signals.door_ajar() {
            return Err(CommandError::CheckDoor);
        }
        self.signals.set_exec(ExecState::CYCLE_START);
        Ok(())
    }

    /// Request sleep mode: park any running motion, de-energize everything
    /// and stay locked until a reset.
    pub fn sleep(&mut self) {
        self.signals.set_exec(ExecState::SLEEP);
    }

    /// Set the cycle-start request whenever queued motion is waiting.
    pub fn auto_cycle_start(&mut self) {
        if !self.planner.is_empty() {
            self.signals.set_exec(ExecState::CYCLE_START);
        }
    }

    /// Clear an alarm lock without homing. Machine position may be stale
    /// after a motion-killing reset; homing re-establishes it.
    pub fn unlock(&mut self) {
        if self.sys.state != MachineState::Alarm {
            return;
        }
        warn!("alarm unlocked, position may be inaccurate");
        self.sys.last_alarm = None;
        self.set_state(MachineState::Idle);
    }

    // ── Main loop ──

    /// One pass of the cooperative main loop. Returns false once a system
    /// abort is pending and the caller must run [`Self::reset`].
    pub fn main_loop_iteration(&mut self) -> bool {
        self.auto_cycle_start();
        self.exec_realtime();
        if self.signals.abort() {
            return false;
        }
        self.apply_idle_lock_policy();
        true
    }

    /// Block until every queued motion has finished executing.
    pub fn synchronize(&mut self) {
        self.auto_cycle_start();
        while !self.signals.abort() {
            self.exec_realtime();
            if self.planner.is_empty() && !self.sys.state.is_moving() {
                break;
            }
            std::thread::yield_now();
        }
    }

    /// Re-initialize after a system abort: flush all motion, sync the
    /// planned position from the step counters and shut the accessories off.
    pub fn reset(&mut self) {
        info!("system reset");
        self.stepper_reset();
        let position = self.position_snapshot();
        self.planner.reset();
        self.planner.sync_position(&position);
        self.ports.spindle.set_state(SpindleState::Disable, 0.0);
        self.ports.coolant.set_state(CoolantState::default());
        self.sys.suspend = SuspendFlags::empty();
        self.sys.step_control = StepControlFlags::empty();
        self.sys.spindle_stop = SpindleStopFlags::empty();
        self.sys.soft_limit = false;
        self.sys.spindle = SpindleState::Disable;
        self.sys.spindle_speed = 0.0;
        self.sys.coolant = CoolantState::default();
        self.idle_since = None;
        // An alarm latched before or during the abort keeps the machine
        // locked out; a reset that killed live motion lands here.
        let alarmed = match self.signals.take_alarm() {
            Some(alarm) => {
                self.sys.last_alarm = Some(alarm);
                true
            }
            None => self.sys.state == MachineState::Alarm,
        };
        let next = if alarmed {
            MachineState::Alarm
        } else {
            MachineState::Idle
        };
        self.set_state(next);
        self.signals.clear_exec(ExecState::all());
        self.signals.clear_abort();
    }

    // ── Internal helpers shared by the executor modules ──

    pub(crate) fn set_state(&mut self, state: MachineState) {
        if self.sys.state != state {
            debug!(from = self.sys.state.name(), to = state.name(), "state");
        }
        self.sys.state = state;
        self.signals.publish_state(state);
    }

    /// Run one preparer pass under the current overrides.
    pub(crate) fn prep_segments(&mut self) {
        let ovr = Overrides {
            feed: self.sys.f_override,
            rapid: self.sys.r_override,
            spindle: self.sys.s_override,
        };
        self.prep.fill(
            &mut self.planner,
            &self.config,
            &mut self.sys.step_control,
            ovr,
            &self.isr,
        );
    }

    /// Persist the preparer's running speed into the active block and force
    /// a profile recompute on the next pass.
    pub(crate) fn update_plan_parameters(&mut self) {
        self.prep
            .update_plan_parameters(&mut self.planner, self.sys.step_control);
    }

    /// Replan from a standstill after a hold or an override change.
    pub(crate) fn plan_cycle_reinitialize(&mut self) {
        self.update_plan_parameters();
        self.planner
            .update_velocity_profile_parameters(self.sys.f_override, self.sys.r_override);
        self.planner.cycle_reinitialize();
    }

    /// Energize the drivers and start the pulse timer. The preparer must
    /// have been serviced first so the tick finds a segment to load.
    pub(crate) fn wake_up(&mut self) {
        self.ports.step.set_enabled(true);
        self.isr.with(|shared| shared.clear_idle_pending());
        self.idle_since = None;
        self.ports.timer.start();
    }

    /// Kill the pulse timer and forget all segment and preparer state.
    /// Block progress is lost; callers re-sync the planner afterwards.
    pub(crate) fn stepper_reset(&mut self) {
        self.ports.timer.stop();
        self.isr.with(|shared| shared.reset());
        self.prep.reset();
    }

    /// Profile speed for status reports, zero outside motion states.
    pub(crate) fn realtime_rate(&self) -> f32 {
        if self.sys.state.needs_segment_service() {
            self.prep.current_speed()
        } else {
            0.0
        }
    }

    fn apply_idle_lock_policy(&mut self) {
        if self.isr.with(|shared| shared.take_idle_pending()) {
            self.idle_since = Some(Instant::now());
        }
        let Some(since) = self.idle_since else {
            return;
        };
        if self.config.pulse.idle_hold {
            self.idle_since = None;
        } else if since.elapsed() >= Duration::from_millis(self.config.pulse.idle_lock_ms) {
            self.ports.step.set_enabled(false);
            self.idle_since = None;
        }
    }
}
