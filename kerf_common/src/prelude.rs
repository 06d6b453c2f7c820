//! Prelude module for common re-exports.
//!
//! `use kerf_common::prelude::*;` pulls in the types nearly every engine
//! module touches.

// ─── Axes ───────────────────────────────────────────────────────────
pub use crate::axis::{AXIS_LETTERS, AxisMask, MAX_AXES};

// ─── State & flags ──────────────────────────────────────────────────
pub use crate::flags::{
    AccessoryOverride, ExecState, SpindleStopFlags, StepControlFlags, SuspendFlags,
};
pub use crate::state::MachineState;

// ─── Codes ──────────────────────────────────────────────────────────
pub use crate::alarm::Alarm;
pub use crate::error::CommandError;

// ─── Timing ─────────────────────────────────────────────────────────
pub use crate::consts::{
    ACCELERATION_TICKS_PER_SECOND, CYCLES_PER_TICK_MAX, DT_SEGMENT, MAX_AMASS_LEVEL,
    SEGMENT_RING_SLOTS, STEP_TIMER_HZ, TICKS_PER_MICROSECOND,
};
