//! Status reporting.
//!
//! A status snapshot is assembled from one consistent read of the shared
//! step state plus the executor's own fields, so the reported position and
//! rate always belong to the same instant.

use serde::Serialize;

use kerf_common::axis::MAX_AXES;
use kerf_common::flags::SuspendFlags;
use kerf_common::state::MachineState;

use crate::engine::MotionEngine;
use crate::planner::steps_to_mpos;

/// One consistent view of the machine for the `?` status request.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Primary state name ("Run", "Hold", ...).
    pub state: &'static str,
    /// Hold/door progress qualifier, when the state carries one.
    pub substate: Option<u8>,
    /// Machine position [mm].
    pub mpos: [f32; MAX_AXES],
    /// Machine position in raw steps.
    pub position: [i32; MAX_AXES],
    /// Instantaneous profile rate [mm/min].
    pub feed_rate: f32,
    pub feed_override: u8,
    pub rapid_override: u8,
    pub spindle_override: u8,
    /// Latched alarm code, if any.
    pub alarm: Option<u8>,
    /// Axes with a committed home position, as a bitmask.
    pub homed: u8,
    /// Blocks waiting in the motion queue.
    pub queued_blocks: bool,
    /// Segments executed since power-up.
    pub segments_completed: u64,
}

impl StatusSnapshot {
    /// Compact single-line rendering, e.g.
    /// `<Hold:0|MPos:-5.000,0.000,-1.250|F:0|Ov:100,100,100>`.
    pub fn render(&self, axis_count: usize) -> String {
        use std::fmt::Write;
        let mut line = String::with_capacity(96);
        line.push('<');
        line.push_str(self.state);
        if let Some(sub) = self.substate {
            let _ = write!(line, ":{sub}");
        }
        line.push_str("|MPos:");
        for (idx, mpos) in self.mpos.iter().take(axis_count).enumerate() {
            if idx > 0 {
                line.push(',');
            }
            let _ = write!(line, "{mpos:.3}");
        }
        let _ = write!(
            line,
            "|F:{:.0}|Ov:{},{},{}",
            self.feed_rate, self.feed_override, self.rapid_override, self.spindle_override
        );
        if let Some(alarm) = self.alarm {
            let _ = write!(line, "|A:{alarm}");
        }
        line.push('>');
        line
    }
}

impl MotionEngine {
    /// Assemble a status snapshot.
    pub fn status_snapshot(&self) -> StatusSnapshot {
        let (position, segments_completed) = self
            .isr
            .with(|shared| (shared.position(), shared.segments_completed()));
        StatusSnapshot {
            state: self.sys.state.name(),
            substate: self.report_substate(),
            mpos: steps_to_mpos(&position, &self.config.axes),
            position,
            feed_rate: self.realtime_rate(),
            feed_override: self.sys.f_override,
            rapid_override: self.sys.r_override,
            spindle_override: self.sys.s_override,
            alarm: self.sys.last_alarm.map(|alarm| alarm as u8),
            homed: self.sys.homed.bits(),
            queued_blocks: !self.planner.is_empty(),
            segments_completed,
        }
    }

    /// Hold: 0 parked and ready to resume, 1 still decelerating.
    /// Door: 0 closed and ready, 1 ajar, 2 retracting, 3 restoring.
    fn report_substate(&self) -> Option<u8> {
        match self.sys.state {
            MachineState::Hold => {
                if self.sys.suspend.contains(SuspendFlags::JOG_CANCEL) {
                    None
                } else if self.sys.suspend.contains(SuspendFlags::HOLD_COMPLETE) {
                    Some(0)
                } else {
                    Some(1)
                }
            }
            MachineState::SafetyDoor => {
                if self.sys.suspend.contains(SuspendFlags::RETRACT_COMPLETE) {
                    if self.sys.suspend.contains(SuspendFlags::INITIATE_RESTORE) {
                        Some(3)
                    } else if self.sys.suspend.contains(SuspendFlags::SAFETY_DOOR_AJAR) {
                        Some(1)
                    } else {
                        Some(0)
                    }
                } else {
                    Some(2)
                }
            }
            _ => None,
        }
    }
}
