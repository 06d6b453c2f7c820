//! Top-level machine state.
//!
//! `MachineState` is the single primary mode; independent boolean facts
//! (suspend progress, step-control overrides) live in the bitsets in
//! [`crate::flags`] instead of being folded into this enum.

use serde::{Deserialize, Serialize};

/// Top-level operating state, exactly one active at a time.
///
/// Transitions are owned by the real-time executor; every other subsystem
/// treats the value as read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MachineState {
    /// Ready, no motion queued or executing.
    Idle = 0,
    /// Locked out after an alarm; only reset/status are honored.
    Alarm = 1,
    /// Dry-run mode, motion is parsed but never executed.
    CheckMode = 2,
    /// Homing cycle in progress.
    Homing = 3,
    /// Executing queued motion.
    Cycle = 4,
    /// Feed hold, decelerating to or parked at a controlled stop.
    Hold = 5,
    /// Executing a jog motion.
    Jog = 6,
    /// Safety door open, suspended with optional parking retract.
    SafetyDoor = 7,
    /// De-energized, only a reset leaves this state.
    Sleep = 8,
}

impl MachineState {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Idle),
            1 => Some(Self::Alarm),
            2 => Some(Self::CheckMode),
            3 => Some(Self::Homing),
            4 => Some(Self::Cycle),
            5 => Some(Self::Hold),
            6 => Some(Self::Jog),
            7 => Some(Self::SafetyDoor),
            8 => Some(Self::Sleep),
            _ => None,
        }
    }

    /// States in which the segment preparer must be serviced.
    #[inline]
    pub const fn needs_segment_service(&self) -> bool {
        matches!(
            self,
            Self::Cycle | Self::Hold | Self::SafetyDoor | Self::Homing | Self::Sleep | Self::Jog
        )
    }

    /// States from which a hold-class request is honored.
    #[inline]
    pub const fn accepts_hold(&self) -> bool {
        !matches!(self, Self::Alarm | Self::CheckMode)
    }

    /// Motion is actively being generated in this state.
    #[inline]
    pub const fn is_moving(&self) -> bool {
        matches!(self, Self::Cycle | Self::Jog | Self::Homing)
    }

    /// Short uppercase name for status reports.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Alarm => "Alarm",
            Self::CheckMode => "Check",
            Self::Homing => "Home",
            Self::Cycle => "Run",
            Self::Hold => "Hold",
            Self::Jog => "Jog",
            Self::SafetyDoor => "Door",
            Self::Sleep => "Sleep",
        }
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::Idle
    }
}
