//! Flag bitsets shared between the realtime executor, the segment preparer
//! and the pulse generator.
//!
//! Each set is a collection of independent boolean facts; the primary
//! operating mode stays in [`crate::state::MachineState`]. `ExecState` and
//! `AccessoryOverride` are written from any input context (serial byte,
//! limit interrupt, pulse generator) and consumed by the executor;
//! `SuspendFlags`, `StepControlFlags` and `SpindleStopFlags` are owned by
//! the cooperative side. Feed/rapid/spindle override *values* are not
//! flags; the input side adjusts the shared percent registers directly.

use bitflags::bitflags;

bitflags! {
    /// Asynchronous realtime request flags. Any context may OR bits in;
    /// only the realtime executor clears them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecState: u8 {
        /// Status report requested.
        const STATUS_REPORT = 1 << 0;
        /// Resume / start queued motion.
        const CYCLE_START   = 1 << 1;
        /// Pulse generator drained its segment ring. **Set from ISR context.**
        const CYCLE_STOP    = 1 << 2;
        /// Decelerate to a controlled stop.
        const FEED_HOLD     = 1 << 3;
        /// Abort everything; terminal until the main loop re-initializes.
        const RESET         = 1 << 4;
        /// Safety door opened.
        const SAFETY_DOOR   = 1 << 5;
        /// Cancel the in-flight motion (hold that discards instead of resuming).
        const MOTION_CANCEL = 1 << 6;
        /// Enter sleep: park, de-energize, wait for reset.
        const SLEEP         = 1 << 7;
    }
}

impl ExecState {
    /// Requests that suspend motion before being resolved.
    pub const HOLD_CLASS: Self = Self::from_bits_truncate(
        Self::FEED_HOLD.bits()
            | Self::SAFETY_DOOR.bits()
            | Self::MOTION_CANCEL.bits()
            | Self::SLEEP.bits(),
    );
}

impl Default for ExecState {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Spindle and coolant accessory requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessoryOverride: u8 {
        /// Toggle spindle stop; only honored during Hold.
        const SPINDLE_STOP         = 1 << 0;
        const COOLANT_FLOOD_TOGGLE = 1 << 1;
        const COOLANT_MIST_TOGGLE  = 1 << 2;
    }
}

impl Default for AccessoryOverride {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Suspend progress facts, valid while the machine is held, parked or
    /// cancelling motion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SuspendFlags: u8 {
        /// Deceleration finished; the machine is at a controlled stop.
        const HOLD_COMPLETE    = 1 << 0;
        /// Door re-opened mid-restore; retract must run again.
        const RESTART_RETRACT  = 1 << 1;
        /// Parking retract (or its skip) finished.
        const RETRACT_COMPLETE = 1 << 2;
        /// Operator asked to resume; restore sequence may run.
        const INITIATE_RESTORE = 1 << 3;
        /// Restore sequence finished; cycle start will be issued.
        const RESTORE_COMPLETE = 1 << 4;
        /// Door is physically open.
        const SAFETY_DOOR_AJAR = 1 << 5;
        /// Suspension ends by discarding the remaining motion.
        const MOTION_CANCEL    = 1 << 6;
        /// Jog is being cancelled; queue is flushed when motion stops.
        const JOG_CANCEL       = 1 << 7;
    }
}

impl SuspendFlags {
    /// The machine is suspended in any form.
    #[inline]
    pub const fn is_suspended(&self) -> bool {
        !self.is_empty()
    }
}

impl Default for SuspendFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Overrides applied to the segment preparer's view of the planner.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StepControlFlags: u8 {
        /// Stop producing segments for the current block.
        const END_MOTION         = 1 << 0;
        /// Force the profile into controlled deceleration to zero.
        const EXECUTE_HOLD       = 1 << 1;
        /// Current motion is a system motion (homing/parking), not planner
        /// queue content.
        const EXECUTE_SYS_MOTION = 1 << 2;
        /// Spindle RPM must be refreshed on the next segment even if motion
        /// is complete.
        const UPDATE_SPINDLE_RPM = 1 << 3;
    }
}

impl StepControlFlags {
    /// Normal operation: no hold, no system motion, nothing pending.
    #[inline]
    pub const fn is_normal_op(&self) -> bool {
        self.is_empty()
    }
}

impl Default for StepControlFlags {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Spindle-stop override sequencing, active only while held.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SpindleStopFlags: u8 {
        /// Spindle is currently stopped by the override.
        const ENABLED       = 1 << 0;
        /// Stop requested, not yet applied.
        const INITIATE      = 1 << 1;
        /// Restore requested, spindle re-energizes in place.
        const RESTORE       = 1 << 2;
        /// Restore requested together with a cycle resume.
        const RESTORE_CYCLE = 1 << 3;
    }
}

impl Default for SpindleStopFlags {
    fn default() -> Self {
        Self::empty()
    }
}
