//! Alarm codes. An alarm is fatal until reset: the executor parks the
//! machine in [`crate::state::MachineState::Alarm`] and, for the limit
//! alarms, blocks everything except reset and status reports.

use serde::{Deserialize, Serialize};

/// Alarm code reported once when the executor enters the Alarm state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Alarm {
    /// Hard limit switch tripped during motion. Position is lost.
    HardLimit = 1,
    /// Commanded target outside machine travel. Position is kept if the
    /// motion was stopped by a controlled hold first.
    SoftLimit = 2,
    /// Reset issued while motion was in progress. Position is lost.
    AbortCycle = 3,
    /// Probe did not report the expected initial state.
    ProbeFailInitial = 4,
    /// Probe never made (or broke) contact within the programmed travel.
    ProbeFailContact = 5,
    /// Reset issued during a homing cycle.
    HomingFailReset = 6,
    /// Safety door opened during a homing cycle.
    HomingFailDoor = 7,
    /// Limit switch still engaged after the homing pull-off move.
    HomingFailPulloff = 8,
    /// Limit switch not found within the homing search distance.
    HomingFailApproach = 9,
    /// Spindle failed to respond to a control command.
    SpindleControl = 10,
}

impl Alarm {
    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::HardLimit),
            2 => Some(Self::SoftLimit),
            3 => Some(Self::AbortCycle),
            4 => Some(Self::ProbeFailInitial),
            5 => Some(Self::ProbeFailContact),
            6 => Some(Self::HomingFailReset),
            7 => Some(Self::HomingFailDoor),
            8 => Some(Self::HomingFailPulloff),
            9 => Some(Self::HomingFailApproach),
            10 => Some(Self::SpindleControl),
            _ => None,
        }
    }

    /// Limit alarms enter the blocking critical-event path; everything else
    /// leaves the main loop serviceable.
    #[inline]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::HardLimit | Self::SoftLimit)
    }

    /// Alarms raised by a failed homing cycle.
    #[inline]
    pub const fn is_homing_failure(&self) -> bool {
        matches!(
            self,
            Self::HomingFailReset
                | Self::HomingFailDoor
                | Self::HomingFailPulloff
                | Self::HomingFailApproach
        )
    }
}

impl std::fmt::Display for Alarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::HardLimit => "hard limit triggered",
            Self::SoftLimit => "soft limit exceeded",
            Self::AbortCycle => "reset during motion",
            Self::ProbeFailInitial => "probe in unexpected initial state",
            Self::ProbeFailContact => "probe contact not found",
            Self::HomingFailReset => "reset during homing",
            Self::HomingFailDoor => "safety door opened during homing",
            Self::HomingFailPulloff => "limit still engaged after pull-off",
            Self::HomingFailApproach => "limit not found during approach",
            Self::SpindleControl => "spindle control failure",
        };
        write!(f, "ALARM:{} ({msg})", *self as u8)
    }
}
